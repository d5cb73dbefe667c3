//! Motorola S-Record files
//!
//! Data lives in S1/S2/S3 records; the writer picks the narrowest address
//! form that fits each record and terminates with an S5/S6 record-count
//! record, which the reader verifies.

use std::{collections::BTreeMap, fmt::Write, sync::OnceLock};

use regex::Regex;

use crate::{error::Error, format::Input, image::Segment};

/// Data bytes per record
const RECORD_LEN: usize = 16;

fn record_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^S([0-9])([0-9A-Fa-f]{2})((?:[0-9A-Fa-f]{2})+)$").unwrap())
}

/// Address width in bytes for each record type
const ADDR_LEN: [usize; 10] = [2, 2, 3, 4, 0, 2, 3, 4, 3, 2];

fn from_hex(s: &str) -> Vec<u8> {
    // The record regex only admits an even run of hex digits
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (hi << 4) | lo
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct SRecordFormat;

impl SRecordFormat {
    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        let mut lines = 0;
        for line in input.text()?.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !record_re().is_match(line) {
                return Ok(0);
            }
            lines += 1;
        }
        Ok(if lines > 1 { 100 } else { 0 })
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let mut image: BTreeMap<u32, u8> = BTreeMap::new();
        let mut rec_count: u32 = 0;
        for (lineno, line) in input.text()?.lines().enumerate() {
            let lineno = lineno + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(caps) = record_re().captures(line) else {
                continue;
            };
            let rec_type: usize = caps[1].parse().map_err(|_| {
                Error::Format(format!("Invalid record type field in record on line {lineno}"))
            })?;
            if rec_type == 4 {
                return Err(Error::Format(format!(
                    "Invalid record type field in record on line {lineno}"
                )));
            }
            let count = usize::from_str_radix(&caps[2], 16)
                .map_err(|_| Error::Format(format!("Invalid count field in record on line {lineno}")))?;
            let mut data = from_hex(&caps[3]);
            if count != data.len() || count < 3 {
                return Err(Error::Format(format!(
                    "Invalid count field in record on line {lineno}"
                )));
            }
            let crc = data.pop().unwrap_or(0);
            let sum: u32 = count as u32 + data.iter().map(|&b| b as u32).sum::<u32>();
            if crc != 0xff - (sum & 0xff) as u8 {
                return Err(Error::Format(format!(
                    "CRC mismatch in record on line {lineno}"
                )));
            }
            let addr_len = ADDR_LEN[rec_type].min(data.len());
            let mut addr: u32 = 0;
            for &b in &data[..addr_len] {
                addr = (addr << 8) | b as u32;
            }
            match rec_type {
                1 | 2 | 3 => {
                    rec_count += 1;
                    for (offset, &byte) in data[addr_len..].iter().enumerate() {
                        image.insert(addr + offset as u32, byte);
                    }
                }
                5 | 6 => {
                    if rec_count != addr {
                        return Err(Error::Format("File contains missing records".into()));
                    }
                }
                _ => {}
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
        let mut rec_count: u32 = 0;
        for segment in segments {
            for (offset, chunk) in segment.data.chunks(RECORD_LEN).enumerate() {
                let addr = segment.addr + (offset * RECORD_LEN) as u32;
                let (addr_bytes, rec_type): (Vec<u8>, u8) = if addr < 0x10000 {
                    (addr.to_be_bytes()[2..].to_vec(), 1)
                } else if addr < 0x1000000 {
                    (addr.to_be_bytes()[1..].to_vec(), 2)
                } else {
                    (addr.to_be_bytes().to_vec(), 3)
                };
                write_record(&mut out, rec_type, &addr_bytes, chunk);
                rec_count += 1;
            }
        }
        let (count_bytes, rec_type): (Vec<u8>, u8) = if rec_count < 0x10000 {
            (rec_count.to_be_bytes()[2..].to_vec(), 5)
        } else {
            (rec_count.to_be_bytes()[1..].to_vec(), 6)
        };
        write_record(&mut out, rec_type, &count_bytes, &[]);
        Ok(out.into_bytes())
    }
}

fn write_record(out: &mut String, rec_type: u8, addr: &[u8], data: &[u8]) {
    let count = addr.len() + data.len() + 1;
    let sum: u32 = count as u32
        + addr.iter().map(|&b| b as u32).sum::<u32>()
        + data.iter().map(|&b| b as u32).sum::<u32>();
    let crc = 0xff - (sum & 0xff) as u8;
    let _ = write!(out, "S{rec_type}{count:02X}");
    for &b in addr {
        let _ = write!(out, "{b:02X}");
    }
    for &b in data {
        let _ = write!(out, "{b:02X}");
    }
    let _ = writeln!(out, "{crc:02X}");
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn decode(text: &str) -> Result<Vec<Segment>, Error> {
        SRecordFormat.decode(&Input::Bytes(text.as_bytes()))
    }

    #[test]
    fn encode_small_segment() {
        let encoded = SRecordFormat
            .encode(&[Segment::new(0, vec![1, 2, 3, 4])])
            .unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert_eq!(text, "S107000001020304EE\nS5030001FB\n");
    }

    #[test]
    fn round_trip() {
        let segments = vec![Segment::new(0, vec![1, 2, 3, 4])];
        let encoded = SRecordFormat.encode(&segments).unwrap();
        let decoded = SRecordFormat.decode(&Input::Bytes(&encoded)).unwrap();
        assert_eq!(decoded, segments);
    }

    #[test]
    fn wide_addresses_pick_wider_records() {
        let segments = vec![
            Segment::new(0x820000, vec![0xaa]),
            Segment::new(0x1000000, vec![0xbb]),
        ];
        let encoded = SRecordFormat.encode(&segments).unwrap();
        let text = String::from_utf8(encoded.clone()).unwrap();
        assert!(text.lines().next().unwrap().starts_with("S2"));
        assert!(text.lines().nth(1).unwrap().starts_with("S3"));
        let decoded = SRecordFormat.decode(&Input::Bytes(&encoded)).unwrap();
        assert_eq!(decoded, segments);
    }

    #[test]
    fn long_segment_splits_into_records() {
        let segments = vec![Segment::new(0x100, vec![0xab; 40])];
        let encoded = SRecordFormat.encode(&segments).unwrap();
        let text = String::from_utf8(encoded.clone()).unwrap();
        // 3 data records plus the terminator
        assert_eq!(text.lines().count(), 4);
        assert_eq!(decode(&text).unwrap(), segments);
    }

    #[test]
    fn rejects_s4() {
        let err = decode("S4030000FC\n").unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let err = decode("S107000001020304EF\nS5030001FB\n").unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn rejects_count_mismatch() {
        let err = decode("S108000001020304EE\nS5030001FB\n").unwrap_err();
        assert!(err.to_string().contains("count field"));
    }

    #[test]
    fn rejects_missing_records() {
        let err = decode("S107000001020304EE\nS5030002FA\n").unwrap_err();
        assert!(err.to_string().contains("missing records"));
    }

    #[test]
    fn detect_scores() {
        let fmt = SRecordFormat;
        let good = "S107000001020304EE\nS5030001FB\n";
        assert_eq!(fmt.detect(&Input::Bytes(good.as_bytes())).unwrap(), 100);
        // A single record is not convincing enough
        assert_eq!(
            fmt.detect(&Input::Bytes(b"S107000001020304EE\n")).unwrap(),
            0
        );
        assert_eq!(fmt.detect(&Input::Bytes(b"not srec\n")).unwrap(), 0);
    }
}
