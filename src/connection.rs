//! USB connection to the vmeiosis bootloader
//!
//! The bootloader is driven entirely through vendor control transfers:
//! commands are OUT transfers with no data stage and reads are IN
//! transfers served at most eight bytes at a time. Switching between
//! bootloader and application mode makes the device drop off the bus, so
//! the connection can re-acquire it by watching for the same physical
//! port to reappear.

use std::{fmt, thread::sleep, time::Duration};

use log::debug;
use rusb::{Context, Device, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use crate::{error::Error, progress::ProgressCallbacks};

/// Default USB identity of the bootloader
pub const DEFAULT_VID: u16 = 0x16c0;
pub const DEFAULT_PID: u16 = 0x05dc;
pub const DEFAULT_MANUFACTURER: &str = "russd@asu.edu";
pub const DEFAULT_PRODUCT: &str = "vme";

const USB_TIMEOUT: Duration = Duration::from_millis(1000);
/// Largest read the bootloader serves in one control transfer
const READ_CHUNK: usize = 8;

const REENUMERATE_POLL: Duration = Duration::from_millis(100);
/// Do not even look for the device before this much time has passed
const REENUMERATE_GRACE: Duration = Duration::from_millis(1500);
const REENUMERATE_TIMEOUT: Duration = Duration::from_secs(5);

/// The transport a [`crate::flasher::Flasher`] drives
pub trait Connection {
    /// Vendor OUT transfer with no data stage
    fn control_out(&mut self, request: u8, value: u16, index: u16) -> Result<(), Error>;
    /// Vendor IN transfer of exactly `len` bytes, read in chunks
    fn control_in(&mut self, request: u8, index: u16, len: usize) -> Result<Vec<u8>, Error>;
    /// `bcdDevice` of the connected device as (major, minor)
    fn device_version(&self) -> (u8, u8);
    /// Waits for the device to drop off the bus and come back on the same
    /// port after a mode-switch command.
    fn reenumerate(&mut self, progress: &mut dyn ProgressCallbacks) -> Result<(), Error>;
    /// Human-readable device summary
    fn describe(&self) -> String;
}

/// Filter used to select devices during discovery
#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: String,
    pub product: String,
    pub bus: Option<u8>,
    pub address: Option<u8>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        DeviceFilter {
            vid: DEFAULT_VID,
            pid: DEFAULT_PID,
            manufacturer: DEFAULT_MANUFACTURER.into(),
            product: DEFAULT_PRODUCT.into(),
            bus: None,
            address: None,
        }
    }
}

/// A USB connection to one bootloader device
pub struct UsbConnection {
    context: Context,
    handle: Option<DeviceHandle<Context>>,
    vid: u16,
    pid: u16,
    bus: u8,
    address: u8,
    port_numbers: Vec<u8>,
    version: (u8, u8),
    manufacturer: String,
    product: String,
}

impl UsbConnection {
    /// Enumerates all devices matching the filter
    pub fn find_devices(filter: &DeviceFilter) -> Result<Vec<UsbConnection>, Error> {
        let context = Context::new()?;
        let mut found = Vec::new();
        for device in context.devices()?.iter() {
            match Self::open_matching(&context, &device, filter) {
                Ok(Some(connection)) => found.push(connection),
                Ok(None) => {}
                // Devices we cannot open or read strings from do not match
                Err(err) => debug!(
                    "skipping device {:03}:{:03}: {err}",
                    device.bus_number(),
                    device.address()
                ),
            }
        }
        Ok(found)
    }

    fn open_matching(
        context: &Context,
        device: &Device<Context>,
        filter: &DeviceFilter,
    ) -> Result<Option<UsbConnection>, Error> {
        let descriptor = device.device_descriptor()?;
        if descriptor.vendor_id() != filter.vid || descriptor.product_id() != filter.pid {
            return Ok(None);
        }
        if filter.bus.is_some_and(|bus| bus != device.bus_number()) {
            return Ok(None);
        }
        if filter.address.is_some_and(|address| address != device.address()) {
            return Ok(None);
        }
        let handle = device.open()?;
        let manufacturer = handle.read_manufacturer_string_ascii(&descriptor)?;
        let product = handle.read_product_string_ascii(&descriptor)?;
        if manufacturer != filter.manufacturer || product != filter.product {
            return Ok(None);
        }
        let version = descriptor.device_version();
        Ok(Some(UsbConnection {
            context: context.clone(),
            handle: Some(handle),
            vid: descriptor.vendor_id(),
            pid: descriptor.product_id(),
            bus: device.bus_number(),
            address: device.address(),
            port_numbers: device.port_numbers()?,
            version: (version.major(), version.minor()),
            manufacturer,
            product,
        }))
    }

    fn handle(&mut self) -> Result<&mut DeviceHandle<Context>, Error> {
        self.handle.as_mut().ok_or(Error::NotConnected)
    }

    /// Finds the device again after re-enumeration by bus and port path
    fn reacquire(&mut self) -> Result<bool, Error> {
        for device in self.context.devices()?.iter() {
            if device.bus_number() != self.bus {
                continue;
            }
            if device.port_numbers().unwrap_or_default() != self.port_numbers {
                continue;
            }
            let descriptor = device.device_descriptor()?;
            let handle = device.open()?;
            let version = descriptor.device_version();
            self.vid = descriptor.vendor_id();
            self.pid = descriptor.product_id();
            self.address = device.address();
            self.version = (version.major(), version.minor());
            self.handle = Some(handle);
            return Ok(true);
        }
        Ok(false)
    }
}

impl Connection for UsbConnection {
    fn control_out(&mut self, request: u8, value: u16, index: u16) -> Result<(), Error> {
        debug!("control out: req={request:#04x} value={value:#06x} index={index:#06x}");
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle()?
            .write_control(request_type, request, value, index, &[], USB_TIMEOUT)?;
        Ok(())
    }

    fn control_in(&mut self, request: u8, index: u16, len: usize) -> Result<Vec<u8>, Error> {
        debug!("control in: req={request:#04x} index={index:#06x} len={len:#x}");
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let handle = self.handle()?;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let want = (len - out.len()).min(READ_CHUNK);
            let mut buf = [0u8; READ_CHUNK];
            let read = handle.read_control(
                request_type,
                request,
                0,
                index + out.len() as u16,
                &mut buf[..want],
                USB_TIMEOUT,
            )?;
            if read != want {
                return Err(Error::ShortUsbRead);
            }
            out.extend_from_slice(&buf[..read]);
        }
        Ok(out)
    }

    fn device_version(&self) -> (u8, u8) {
        self.version
    }

    fn reenumerate(&mut self, progress: &mut dyn ProgressCallbacks) -> Result<(), Error> {
        self.handle = None;
        let mut slept = Duration::ZERO;
        let mut ticks = 0;
        loop {
            sleep(REENUMERATE_POLL);
            slept += REENUMERATE_POLL;
            if slept >= REENUMERATE_GRACE && self.reacquire()? {
                break;
            }
            if slept >= REENUMERATE_TIMEOUT {
                return Err(Error::DeviceReenumerateTimeout);
            }
            ticks += 1;
            progress.update(ticks);
        }
        // Give the device a moment to settle before the first request
        sleep(REENUMERATE_POLL);
        debug!("device back as {}", self.describe());
        Ok(())
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for UsbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} {}/{} v{}.{}",
            self.bus,
            self.address,
            self.vid,
            self.pid,
            self.manufacturer,
            self.product,
            self.version.0,
            self.version.1,
        )
    }
}
