//! Raw binary files
//!
//! A raw file is a single segment at address zero. Detection only claims
//! a token score: any byte that could not appear in the textual formats
//! (NUL or high-bit set) makes this a possible fallback.

use crate::{error::Error, format::Input, image::Segment};

#[derive(Debug, Clone, Copy)]
pub struct RawBinaryFormat;

impl RawBinaryFormat {
    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        let bytes = input.bytes()?;
        Ok(if bytes.iter().any(|&b| b > 0x7f || b == 0) {
            1
        } else {
            0
        })
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let bytes = input.bytes()?;
        if bytes.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![Segment::new(0, bytes.to_vec())])
        }
    }

    pub fn encode(&self, segments: &[Segment]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for segment in segments {
            out.extend_from_slice(&segment.data);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn detect_scores() {
        let fmt = RawBinaryFormat;
        assert_eq!(fmt.detect(&Input::Bytes(&[0x12, 0x95])).unwrap(), 1);
        assert_eq!(fmt.detect(&Input::Bytes(&[0x00])).unwrap(), 1);
        assert_eq!(fmt.detect(&Input::Bytes(b"0x12,0x34")).unwrap(), 0);
        assert_eq!(fmt.detect(&Input::Bytes(&[])).unwrap(), 0);
    }

    #[test]
    fn decode_places_at_zero() {
        let segments = RawBinaryFormat
            .decode(&Input::Bytes(&[1, 2, 3]))
            .unwrap();
        assert_eq!(segments, vec![Segment::new(0, vec![1, 2, 3])]);
    }

    #[test]
    fn encode_concatenates() {
        let out = RawBinaryFormat
            .encode(&[Segment::new(0, vec![1]), Segment::new(8, vec![2])])
            .unwrap();
        assert_eq!(out, vec![1, 2]);
    }
}
