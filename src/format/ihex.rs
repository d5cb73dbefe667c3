//! Intel HEX files

use std::{collections::BTreeMap, fmt::Write};

use crate::{error::Error, format::Input, image::Segment};

/// Data bytes per record
const RECORD_LEN: usize = 16;

const TYPE_DATA: u8 = 0x00;
const TYPE_EOF: u8 = 0x01;
const TYPE_EXT_SEGMENT: u8 = 0x02;
const TYPE_START_SEGMENT: u8 = 0x03;
const TYPE_EXT_LINEAR: u8 = 0x04;
const TYPE_START_LINEAR: u8 = 0x05;

#[derive(Debug, Clone, Copy)]
pub struct IntelHexFormat;

impl IntelHexFormat {
    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        let segments = self.decode(input)?;
        Ok(if segments.is_empty() { 0 } else { 100 })
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let mut image: BTreeMap<u32, u8> = BTreeMap::new();
        let mut base: u32 = 0;
        for (lineno, line) in input.text()?.lines().enumerate() {
            let lineno = lineno + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let invalid =
                || Error::Format(format!("Invalid Intel HEX record on line {lineno}"));
            let digits = line.strip_prefix(':').ok_or_else(invalid)?;
            if digits.len() % 2 != 0 || digits.len() < 10 {
                return Err(invalid());
            }
            let mut bytes = Vec::with_capacity(digits.len() / 2);
            for pair in digits.as_bytes().chunks(2) {
                let hi = (pair[0] as char).to_digit(16).ok_or_else(invalid)?;
                let lo = (pair[1] as char).to_digit(16).ok_or_else(invalid)?;
                bytes.push(((hi << 4) | lo) as u8);
            }
            let count = bytes[0] as usize;
            if bytes.len() != count + 5 {
                return Err(invalid());
            }
            let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
            if sum & 0xff != 0 {
                return Err(Error::Format(format!(
                    "Checksum mismatch in record on line {lineno}"
                )));
            }
            let addr = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            let rec_type = bytes[3];
            let payload = &bytes[4..4 + count];
            match rec_type {
                TYPE_DATA => {
                    for (offset, &byte) in payload.iter().enumerate() {
                        image.insert(base + addr + offset as u32, byte);
                    }
                }
                TYPE_EOF => break,
                TYPE_EXT_SEGMENT => {
                    if count != 2 {
                        return Err(invalid());
                    }
                    base = (u16::from_be_bytes([payload[0], payload[1]]) as u32) << 4;
                }
                TYPE_EXT_LINEAR => {
                    if count != 2 {
                        return Err(invalid());
                    }
                    base = (u16::from_be_bytes([payload[0], payload[1]]) as u32) << 16;
                }
                TYPE_START_SEGMENT | TYPE_START_LINEAR => {}
                _ => return Err(invalid()),
            }
        }

        let mut segments: Vec<Segment> = Vec::new();
        for (addr, byte) in image {
            match segments.last_mut() {
                Some(last) if last.end() == addr => last.data.push(byte),
                _ => segments.push(Segment::new(addr, vec![byte])),
            }
        }
        Ok(segments)
    }

    pub fn encode(&self, segments: &[Segment]) -> Result<Vec<u8>, Error> {
        let mut out = String::new();
        let mut high: u32 = 0;
        for segment in segments {
            let mut addr = segment.addr;
            let mut data = &segment.data[..];
            while !data.is_empty() {
                if addr >> 16 != high {
                    high = addr >> 16;
                    write_record(&mut out, 0, TYPE_EXT_LINEAR, &(high as u16).to_be_bytes());
                }
                // Keep each record within one 64 KiB page
                let take = data
                    .len()
                    .min(RECORD_LEN)
                    .min((0x10000 - (addr & 0xffff)) as usize);
                write_record(&mut out, (addr & 0xffff) as u16, TYPE_DATA, &data[..take]);
                addr += take as u32;
                data = &data[take..];
            }
        }
        write_record(&mut out, 0, TYPE_EOF, &[]);
        Ok(out.into_bytes())
    }
}

fn write_record(out: &mut String, addr: u16, rec_type: u8, data: &[u8]) {
    let mut sum = data.len() as u32 + (addr >> 8) as u32 + (addr & 0xff) as u32 + rec_type as u32;
    let _ = write!(out, ":{:02X}{addr:04X}{rec_type:02X}", data.len());
    for &b in data {
        sum += b as u32;
        let _ = write!(out, "{b:02X}");
    }
    let checksum = (0x100 - (sum & 0xff)) & 0xff;
    let _ = writeln!(out, "{checksum:02X}");
}
