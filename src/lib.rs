//! Host-side programmer for AVR devices running the vmeiosis USB
//! bootloader.
//!
//! The bootloader stays resident in the last pages of flash and enumerates
//! as a USB device driven entirely through vendor control transfers. This
//! library parses the part configuration database, reads and writes memory
//! images in several file formats, rewrites the reset and USB interrupt
//! vectors so that user firmware chains through the bootloader, and
//! sequences the actual erase/write/verify traffic.

pub mod config;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod format;
pub mod image;
pub mod progress;
pub mod session;

pub use self::error::Error;

pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
