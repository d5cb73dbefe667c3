//! Memory image file formats
//!
//! Every format is identified by the single character used in `-U`
//! specifications and supports some subset of detect, decode and encode.
//! Auto-detection runs every format's detector over the input and picks
//! the highest confidence; a detector failure simply scores zero.

use std::str;

use strum::Display;

use crate::{config::Section, error::Error, image::Segment};

pub mod elf;
pub mod ihex;
pub mod num;
pub mod rbin;
pub mod srec;

/// All supported file formats, plus auto-detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum FormatKind {
    /// AVR ELF executable (`e`)
    Elf,
    /// Intel HEX (`i`)
    IntelHex,
    /// Motorola S-Record (`s`)
    SRecord,
    /// Raw binary (`r`)
    RawBinary,
    /// Immediate literal expression (`m`)
    Immediate,
    /// Binary number text (`b`)
    Binary,
    /// Octal number text (`o`)
    Octal,
    /// Decimal number text (`d`)
    Decimal,
    /// Hexadecimal number text (`h`)
    Hex,
    /// Pick the highest scoring format (`a`, write/verify only)
    Auto,
}

impl FormatKind {
    pub fn from_id(id: char) -> Option<Self> {
        Some(match id {
            'e' => FormatKind::Elf,
            'i' => FormatKind::IntelHex,
            's' => FormatKind::SRecord,
            'r' => FormatKind::RawBinary,
            'm' => FormatKind::Immediate,
            'b' => FormatKind::Binary,
            'o' => FormatKind::Octal,
            'd' => FormatKind::Decimal,
            'h' => FormatKind::Hex,
            'a' => FormatKind::Auto,
            _ => return None,
        })
    }

    pub fn id(self) -> char {
        match self {
            FormatKind::Elf => 'e',
            FormatKind::IntelHex => 'i',
            FormatKind::SRecord => 's',
            FormatKind::RawBinary => 'r',
            FormatKind::Immediate => 'm',
            FormatKind::Binary => 'b',
            FormatKind::Octal => 'o',
            FormatKind::Decimal => 'd',
            FormatKind::Hex => 'h',
            FormatKind::Auto => 'a',
        }
    }
}

/// Input handed to a format for detection or decoding
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// Contents of a file or of stdin
    Bytes(&'a [u8]),
    /// The raw operand string itself
    Literal(&'a str),
}

impl<'a> Input<'a> {
    pub fn bytes(&self) -> Result<&'a [u8], Error> {
        match *self {
            Input::Bytes(bytes) => Ok(bytes),
            Input::Literal(_) => Err(Error::Format(
                "format reads file contents, not a literal".into(),
            )),
        }
    }

    pub fn text(&self) -> Result<&'a str, Error> {
        str::from_utf8(self.bytes()?).map_err(|_| Error::Format("input is not valid text".into()))
    }

    pub fn literal(&self) -> Result<&'a str, Error> {
        match *self {
            Input::Literal(s) => Ok(s),
            Input::Bytes(_) => Err(Error::Format(
                "format reads a literal, not file contents".into(),
            )),
        }
    }
}

/// A format instance bound to the probed part
#[derive(Debug, Clone)]
pub enum Format {
    Elf(elf::ElfFormat),
    IntelHex(ihex::IntelHexFormat),
    SRecord(srec::SRecordFormat),
    RawBinary(rbin::RawBinaryFormat),
    Immediate(num::ImmediateFormat),
    Number(num::NumberFormat),
}

impl Format {
    /// Whether this format consumes the operand string itself rather than
    /// file contents
    pub fn takes_literal(&self) -> bool {
        matches!(self, Format::Immediate(_))
    }

    /// Detection confidence from 0 to 100. Any failure scores zero.
    pub fn detect(&self, input: &Input) -> u8 {
        let score = match self {
            Format::Elf(f) => f.detect(input),
            Format::IntelHex(f) => f.detect(input),
            Format::SRecord(f) => f.detect(input),
            Format::RawBinary(f) => f.detect(input),
            Format::Immediate(f) => f.detect(input),
            Format::Number(f) => f.detect(input),
        };
        score.unwrap_or(0)
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        match self {
            Format::Elf(f) => f.decode(input),
            Format::IntelHex(f) => f.decode(input),
            Format::SRecord(f) => f.decode(input),
            Format::RawBinary(f) => f.decode(input),
            Format::Immediate(f) => f.decode(input),
            Format::Number(f) => f.decode(input),
        }
    }

    pub fn encode(&self, segments: &[Segment]) -> Result<Vec<u8>, Error> {
        match self {
            Format::Elf(f) => f.encode(segments),
            Format::IntelHex(f) => f.encode(segments),
            Format::SRecord(f) => f.encode(segments),
            Format::RawBinary(f) => f.encode(segments),
            Format::Immediate(f) => f.encode(segments),
            Format::Number(f) => f.encode(segments),
        }
    }
}

/// All formats available for one part
#[derive(Debug, Clone)]
pub struct FormatTable {
    entries: Vec<(FormatKind, Format)>,
}

impl FormatTable {
    pub fn new(part: &Section) -> Self {
        let entries = vec![
            (FormatKind::Elf, Format::Elf(elf::ElfFormat::new(part))),
            (FormatKind::IntelHex, Format::IntelHex(ihex::IntelHexFormat)),
            (FormatKind::Immediate, Format::Immediate(num::ImmediateFormat)),
            (FormatKind::Binary, Format::Number(num::NumberFormat::new(2))),
            (FormatKind::Decimal, Format::Number(num::NumberFormat::new(10))),
            (FormatKind::Hex, Format::Number(num::NumberFormat::new(16))),
            (FormatKind::Octal, Format::Number(num::NumberFormat::new(8))),
            (FormatKind::RawBinary, Format::RawBinary(rbin::RawBinaryFormat)),
            (FormatKind::SRecord, Format::SRecord(srec::SRecordFormat)),
        ];
        FormatTable { entries }
    }

    pub fn get(&self, kind: FormatKind) -> Option<&Format> {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, format)| format)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FormatKind, &Format)> {
        self.entries.iter().map(|(kind, format)| (*kind, format))
    }
}
