use std::{
    io::{self, Write as _},
    num::ParseIntError,
};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, LevelFilter};
use miette::Result;
use vmedude::{
    config::ConfigDb,
    connection::{
        Connection, DeviceFilter, UsbConnection, DEFAULT_MANUFACTURER, DEFAULT_PRODUCT,
    },
    error::Error,
    flasher::{Flasher, CMD_ENTER},
    logging::initialize_logger,
    progress::ProgressCallbacks,
    session::{MemOp, Session},
};

/// Program AVR devices running the vmeiosis USB bootloader
#[derive(Debug, Parser)]
#[command(about, disable_version_flag = true)]
struct Cli {
    /// Index of device among the matches
    #[arg(short = 'i', long, default_value_t = 0)]
    index: usize,

    /// USB bus index
    #[arg(short = 'b', long)]
    bus: Option<u8>,

    /// USB device address
    #[arg(short = 'a', long)]
    address: Option<u8>,

    /// USB device manufacturer name
    #[arg(short = 'M', long, default_value = DEFAULT_MANUFACTURER)]
    manufacturer: String,

    /// USB device product name
    #[arg(short = 'N', long, default_value = DEFAULT_PRODUCT)]
    product: String,

    /// USB device vendor ID
    #[arg(short = 'V', long, value_parser = parse_hex16, default_value = "16c0")]
    id_vendor: u16,

    /// USB device product ID
    #[arg(short = 'P', long, value_parser = parse_hex16, default_value = "05dc")]
    id_product: u16,

    /// List matching devices and exit
    #[arg(short = 'l', long)]
    list: bool,

    /// Enter the bootloader
    #[arg(short = 'E', long)]
    enter: bool,

    /// Exit the bootloader at the end of the session
    #[arg(short = 'r', long)]
    run: bool,

    /// Configuration file; prefix additional files with `+` to layer
    /// them on top of the base file
    #[arg(short = 'C', long = "config-file", value_name = "PATH")]
    config_file: Vec<String>,

    /// Erase flash before the first write
    #[arg(short = 'e', long)]
    erase: bool,

    /// Memory operation specification
    #[arg(short = 'U', long = "mem-op", value_name = "regions:op:target[:format]")]
    mem_op: Vec<String>,

    /// Do not write anything to the device
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Program a non-vmeiosis user program (do not patch the interrupt
    /// vector)
    #[arg(short = 'R', long)]
    raw: bool,
}

fn parse_hex16(input: &str) -> Result<u16, ParseIntError> {
    u16::from_str_radix(input.trim_start_matches("0x"), 16)
}

/// Renders progress callbacks with indicatif
#[derive(Default)]
struct CliProgress {
    bar: Option<ProgressBar>,
}

impl ProgressCallbacks for CliProgress {
    fn init(&mut self, label: &str, total: usize) {
        let bar = if total == 0 {
            ProgressBar::new_spinner()
        } else {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg:>24} [{bar:40}] {pos}/{len}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar
        };
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }

    fn update(&mut self, current: usize) {
        if let Some(bar) = &self.bar {
            bar.set_position(current as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    let cli = Cli::parse();
    debug!("{:#?}", cli);

    // One base configuration file, any number of `+` overlays
    let mut base = None;
    let mut overlays = Vec::new();
    for path in &cli.config_file {
        if let Some(overlay) = path.strip_prefix('+') {
            overlays.push(overlay.to_string());
        } else if base.is_none() {
            base = Some(path.clone());
        } else {
            return Err(Error::MultipleBaseConfigs.into());
        }
    }
    let mut db = ConfigDb::new();
    db.load(base.as_deref().unwrap_or("/etc/avrdude.conf"))?;
    for overlay in &overlays {
        db.load(overlay)?;
    }

    let filter = DeviceFilter {
        vid: cli.id_vendor,
        pid: cli.id_product,
        manufacturer: cli.manufacturer.clone(),
        product: cli.product.clone(),
        bus: cli.bus,
        address: cli.address,
    };
    let mut devices = UsbConnection::find_devices(&filter)?;
    if devices.is_empty() {
        println!("No devices found");
        return Ok(());
    }
    if cli.list {
        for device in &devices {
            println!("{device}");
        }
        return Ok(());
    }
    if cli.index >= devices.len() {
        return Err(Error::InvalidDeviceIndex {
            index: cli.index,
            count: devices.len(),
        }
        .into());
    }
    let mut connection = devices.remove(cli.index);

    let mut progress = CliProgress::default();
    if cli.enter {
        println!("{connection}");
        connection.control_out(CMD_ENTER, 0, 0)?;
        progress.init("Entering bootloader mode", 0);
        connection.reenumerate(&mut progress)?;
        progress.finish();
    }

    let mut flasher = Flasher::probe(connection, &db, cli.dry_run)?;
    println!("{}", flasher.describe());
    println!("  User size {}", flasher.layout().user_size);
    println!("  Page size {}", flasher.layout().page_size);
    println!(
        "  Write/erase sleep {:.1}ms/{:.1}ms",
        flasher.write_sleep().as_secs_f64() * 1000.0,
        flasher.erase_sleep().as_secs_f64() * 1000.0
    );
    println!(
        "  Device signature 0x{}, part {}",
        flasher.signature(),
        flasher.part_desc()
    );

    let mut ops = Vec::with_capacity(cli.mem_op.len());
    for spec in &cli.mem_op {
        ops.push(MemOp::parse(spec)?);
    }
    let mut session = Session::new(&mut flasher, &db, cli.erase, cli.raw);
    session.run(&ops, &mut progress)?;

    if cli.run {
        print!("  Running app ... ");
        io::stdout().flush().ok();
        flasher.run_app()?;
        println!("Done");
    }
    Ok(())
}
