//! Library and application errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

/// All possible errors returned by vmedude
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("{path}:{line}:{col}: {message}")]
    #[diagnostic(code(vmedude::config_parse))]
    ConfigParse {
        path: String,
        line: usize,
        col: usize,
        message: String,
    },

    #[error("Invalid value for '{key}': \"{value}\"")]
    #[diagnostic(code(vmedude::config_value))]
    ConfigValue { key: String, value: String },

    #[error("Device signature 0x{0} does not match any part in the configuration database")]
    #[diagnostic(
        code(vmedude::unknown_part),
        help("Load an additional configuration file with `-C +PATH`")
    )]
    UnknownPart(String),

    #[error("Unsupported bootloader version {major}.{minor}")]
    #[diagnostic(
        code(vmedude::unsupported_bootloader),
        help("Only major version 2 bootloaders are supported")
    )]
    UnsupportedBootloaderVersion { major: u8, minor: u8 },

    #[error("Device signature in {source_name} does not match the connected device")]
    #[diagnostic(code(vmedude::signature_mismatch))]
    SignatureMismatch { source_name: String },

    #[error("User signature in {source_name} does not match the bootloader")]
    #[diagnostic(code(vmedude::user_signature_mismatch))]
    UserSignatureMismatch { source_name: String },

    #[error("Read past the end of region {region}")]
    #[diagnostic(code(vmedude::read_too_large))]
    ReadTooLarge { region: String },

    #[error("Short read from USB device")]
    #[diagnostic(code(vmedude::short_usb_read))]
    ShortUsbRead,

    #[error("rjmp from {base:#06x} to {dest:#06x} is out of range")]
    #[diagnostic(code(vmedude::rjmp_out_of_range))]
    RjmpOutOfRange { dest: u32, base: u32 },

    #[error("Vector table reset does not contain an rjmp")]
    #[diagnostic(code(vmedude::vector_not_rjmp))]
    VectorNotRjmp,

    #[error("User vector target {target:#06x} outside given memory area")]
    #[diagnostic(code(vmedude::user_vector_out_of_range))]
    UserVectorOutOfRange { target: u32 },

    #[error("Image end {end:#06x} does not fit within user flash area of {user_size:#06x} bytes")]
    #[diagnostic(code(vmedude::image_too_large))]
    ImageTooLargeForUserFlash { end: u32, user_size: u32 },

    #[error("{0}")]
    #[diagnostic(code(vmedude::vector_page_order))]
    VectorPageOrderViolation(String),

    #[error("EEPROM must be written before flash")]
    #[diagnostic(code(vmedude::eeprom_before_flash))]
    EepromBeforeFlash,

    #[error("Unable to write EEPROM without erasing device")]
    #[diagnostic(
        code(vmedude::eeprom_without_erase),
        help("Pass `-e` or write flash in the same invocation")
    )]
    EepromWithoutErase,

    #[error("Unable to write EEPROM without EEPROM writer code")]
    #[diagnostic(
        code(vmedude::eeprom_without_shim),
        help("The input must carry the EEPROM writer stub in its userrow segment")
    )]
    EepromWithoutShim,

    #[error("Cannot write to region {region} and existing data does not match")]
    #[diagnostic(code(vmedude::read_only_region_mismatch))]
    ReadOnlyRegionMismatch { region: String },

    #[error("Readback mismatch when verifying {region}")]
    #[diagnostic(code(vmedude::verify_mismatch))]
    VerifyMismatch { region: String },

    #[error("Unsupported memory region \"{0}\"")]
    #[diagnostic(code(vmedude::unknown_region))]
    UnknownRegion(String),

    #[error("Unknown format for {target}, \"{format}\"")]
    #[diagnostic(code(vmedude::unknown_format))]
    UnknownFormat { target: String, format: String },

    #[error("Could not auto-detect format for {target}")]
    #[diagnostic(code(vmedude::format_auto_detect))]
    FormatAutoDetectFailed { target: String },

    #[error("Device did not return after re-enumeration")]
    #[diagnostic(code(vmedude::reenumerate_timeout))]
    DeviceReenumerateTimeout,

    #[error("{0}")]
    #[diagnostic(code(vmedude::format))]
    Format(String),

    #[error("No part family known for \"{part}\", cannot process ELF files")]
    #[diagnostic(code(vmedude::unknown_family))]
    UnknownPartFamily { part: String },

    #[error("Invalid memory operation specification \"{0}\"")]
    #[diagnostic(
        code(vmedude::mem_op_syntax),
        help("The expected form is regions:op:target[:format]")
    )]
    MemOpSyntax(String),

    #[error("Unknown operation \"{0}\"")]
    #[diagnostic(code(vmedude::unknown_operation))]
    UnknownOperation(String),

    #[error("Part \"{part}\" has no {memory} memory definition")]
    #[diagnostic(code(vmedude::missing_memory))]
    MissingMemory { part: String, memory: String },

    #[error("Device index {index} out of range, {count} device(s) found")]
    #[diagnostic(code(vmedude::device_index))]
    InvalidDeviceIndex { index: usize, count: usize },

    #[error("More than one base configuration file specified")]
    #[diagnostic(
        code(vmedude::multiple_configs),
        help("Additional configuration files must be prefixed with `+`")
    )]
    MultipleBaseConfigs,

    #[error("USB device is not connected")]
    #[diagnostic(code(vmedude::not_connected))]
    NotConnected,

    #[error(transparent)]
    #[diagnostic(code(vmedude::io))]
    Io(#[from] io::Error),

    #[error(transparent)]
    #[diagnostic(code(vmedude::usb))]
    Usb(#[from] rusb::Error),

    #[error("Supplied ELF image is not valid")]
    #[diagnostic(code(vmedude::invalid_elf))]
    InvalidElf(#[from] object::Error),
}
