//! Immediate values and number text
//!
//! Both formats share one literal expression language: a comma-separated
//! list of C-style integers (with optional width suffix `HH`/`H`/`S`/`L`/
//! `LL` and `U`), plain integers in a selected radix, floats (decimal,
//! scientific, hex, `Inf`, `NaN` with an optional explicit mantissa),
//! character and string literals. All values encode little-endian.
//!
//! The immediate format (`m`) encodes the operand string itself; the
//! number text formats (`b`/`o`/`d`/`h`) read the same expressions from a
//! file, allow `#` comments, and print each byte back with the radix
//! prefix on output.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::{
    error::Error,
    format::Input,
    image::Segment,
};

const WIDTHS: &str = "HH|H|S|L|LL|";

type Encoder = fn(&Captures, u32) -> Result<Vec<u8>, ()>;

struct Pattern {
    re: Regex,
    /// Radix the user must have selected for this entry, zero for entries
    /// available in auto mode
    auto_radix: u32,
    /// Radix the digits are interpreted in, zero for non-integer entries
    radix: u32,
    encode: Encoder,
}

fn patterns(comments: bool) -> &'static [Pattern] {
    static PLAIN: OnceLock<Vec<Pattern>> = OnceLock::new();
    static COMMENT: OnceLock<Vec<Pattern>> = OnceLock::new();
    let cell = if comments { &COMMENT } else { &PLAIN };
    cell.get_or_init(|| {
        let terminator = if comments {
            r"\s*(?:,\s*#.*|,\s*|#.*|$)"
        } else {
            r"\s*(?:,\s*|$)"
        };
        let entries: Vec<(String, u32, u32, Encoder)> = vec![
            (
                format!(r"(?P<s>[-+]?)0[xX](?P<v>[0-9A-Fa-f]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                0,
                16,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)0(?P<v>[0-7]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                0,
                8,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)0[bB](?P<v>[01]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                0,
                2,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)(?P<v>[1-9][0-9]*|0)(?P<w>{WIDTHS})(?P<u>U?)"),
                0,
                10,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)(?P<v>[0-9A-Fa-f]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                16,
                16,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)(?P<v>[0-7]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                8,
                8,
                encode_int,
            ),
            (
                format!(r"(?P<s>[-+]?)(?P<v>[01]+)(?P<w>{WIDTHS})(?P<u>U?)"),
                2,
                2,
                encode_int,
            ),
            (
                r"(?P<s>[-+]?)(?i:NAN)(?P<m>0[0-7]+|[1-9][0-9]*|0)?(?P<w>[DF]?)".into(),
                0,
                0,
                encode_nan,
            ),
            (
                r"(?P<s>[-+]?)(?i:NAN)(?P<m>0[xX][0-9A-Fa-f]+)?".into(),
                0,
                0,
                encode_nan,
            ),
            (
                r"(?P<s>[-+]?)(?i:INF(?:INITY)?)(?P<w>[DF]?)".into(),
                0,
                0,
                encode_inf,
            ),
            (
                r"(?P<s>[-+]?)(?P<v>[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)(?P<w>[DF]?)".into(),
                0,
                0,
                encode_float,
            ),
            (
                r"(?P<s>[-+]?)(?P<v>0[xX][0-9a-fA-F]+(?:\.[0-9A-Fa-f]+)?)(?:(?P<e>[pP][-+]?[0-9]+)(?P<w>[DF])?)?"
                    .into(),
                0,
                0,
                encode_hexfloat,
            ),
            (r"'(?P<ch>.*)'".into(), 0, 0, encode_char),
            (r#""(?P<str>.*)""#.into(), 0, 0, encode_string),
            ("".into(), 0, 0, encode_nothing),
        ];
        entries
            .into_iter()
            .map(|(body, auto_radix, radix, encode)| Pattern {
                re: Regex::new(&format!(r"^\s*{body}{terminator}")).unwrap(),
                auto_radix,
                radix,
                encode,
            })
            .collect()
    })
}

fn group<'t>(caps: &'t Captures, name: &str) -> &'t str {
    caps.name(name).map_or("", |m| m.as_str())
}

/// Encodes one line of comma-separated literals. A `radix` of zero means
/// C-style prefixes select the radix; otherwise only plain integers in
/// the given radix (and prefixed integers of the same radix) are
/// accepted.
pub(crate) fn encode_line(line: &str, radix: u32, comments: bool) -> Result<Vec<u8>, Error> {
    let invalid = || Error::Format(format!("Invalid data: \"{line}\""));
    let mut rest = line;
    let mut data = Vec::new();
    while !rest.is_empty() {
        let mut matched = None;
        for pattern in patterns(comments) {
            if radix != 0 && pattern.radix != radix {
                continue;
            }
            if radix == 0 && pattern.auto_radix != 0 {
                continue;
            }
            if let Some(caps) = pattern.re.captures(rest) {
                matched = Some((pattern, caps));
                break;
            }
        }
        let Some((pattern, caps)) = matched else {
            return Err(invalid());
        };
        let consumed = caps.get(0).map_or(0, |m| m.end());
        if consumed == 0 {
            return Err(invalid());
        }
        data.extend((pattern.encode)(&caps, pattern.radix).map_err(|_| invalid())?);
        rest = &rest[consumed..];
    }
    Ok(data)
}

/// Smallest unsigned width in bytes that holds `v`
fn uwidth(v: u128) -> Result<usize, ()> {
    [8u32, 16, 32, 64]
        .iter()
        .find(|&&bits| v < 1 << bits)
        .map(|&bits| bits as usize / 8)
        .ok_or(())
}

/// Smallest signed width in bytes that holds `v`
fn swidth(v: i128) -> Result<usize, ()> {
    [8u32, 16, 32, 64]
        .iter()
        .find(|&&bits| v >= -(1 << (bits - 1)) && v < 1 << (bits - 1))
        .map(|&bits| bits as usize / 8)
        .ok_or(())
}

/// Width for an unsuffixed binary or hex literal: its digit count in
/// bits, rounded up to the next power-of-two byte count
fn digit_width(bits: usize) -> usize {
    let mut width = 1;
    while width * 8 < bits {
        width *= 2;
    }
    width
}

fn encode_int(caps: &Captures, radix: u32) -> Result<Vec<u8>, ()> {
    let negative = group(caps, "s") == "-";
    let magnitude = u128::from_str_radix(group(caps, "v"), radix).map_err(|_| ())?;
    if magnitude > i128::MAX as u128 {
        return Err(());
    }
    let value = if negative {
        -(magnitude as i128)
    } else {
        magnitude as i128
    };
    let signed = (group(caps, "u").is_empty() && (radix == 10 || radix == 8)) || value < 0;
    let width = match group(caps, "w") {
        "HH" => 1,
        "H" | "S" => 2,
        "L" => 4,
        "LL" => 8,
        _ if radix == 10 || radix == 8 => {
            if signed {
                swidth(value)?
            } else {
                uwidth(magnitude)?
            }
        }
        _ => digit_width(group(caps, "v").len() * if radix == 2 { 1 } else { 4 }),
    };
    if width < 16 {
        let bits = width as u32 * 8;
        let in_range = if signed {
            value >= -(1 << (bits - 1)) && value < 1 << (bits - 1)
        } else {
            value >= 0 && value < 1 << bits
        };
        if !in_range {
            return Err(());
        }
    }
    Ok((value as u128).to_le_bytes()[..width].to_vec())
}

fn encode_nan(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    let negative = group(caps, "s") == "-";
    let mantissa = match group(caps, "m") {
        "" => None,
        m => Some(parse_c_u64(m).ok_or(())?),
    };
    match group(caps, "w") {
        "D" => {
            if mantissa.is_some_and(|m| m >= 1 << 52) {
                return Err(());
            }
            let mut bits: u64 = 0x7ff0_0000_0000_0000 | mantissa.unwrap_or(1 << 51);
            if negative {
                bits |= 1 << 63;
            }
            Ok(bits.to_le_bytes().to_vec())
        }
        _ => {
            if mantissa.is_some_and(|m| m >= 1 << 23) {
                return Err(());
            }
            let mut bits: u32 = 0x7f80_0000 | mantissa.unwrap_or(1 << 22) as u32;
            if negative {
                bits |= 1 << 31;
            }
            Ok(bits.to_le_bytes().to_vec())
        }
    }
}

fn encode_inf(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    let negative = group(caps, "s") == "-";
    match group(caps, "w") {
        "D" => {
            let v = if negative {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            };
            Ok(v.to_le_bytes().to_vec())
        }
        _ => {
            let v = if negative {
                f32::NEG_INFINITY
            } else {
                f32::INFINITY
            };
            Ok(v.to_le_bytes().to_vec())
        }
    }
}

fn encode_float(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    let text = format!("{}{}", group(caps, "s"), group(caps, "v"));
    let value: f64 = text.parse().map_err(|_| ())?;
    Ok(float_bytes(value, group(caps, "w")))
}

fn encode_hexfloat(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    let negative = group(caps, "s") == "-";
    let digits = group(caps, "v");
    let digits = &digits[2..]; // strip 0x
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    let mut value = u128::from_str_radix(int_part, 16).map_err(|_| ())? as f64;
    if !frac_part.is_empty() {
        let frac = u128::from_str_radix(frac_part, 16).map_err(|_| ())? as f64;
        value += frac / 16f64.powi(frac_part.len() as i32);
    }
    let exp = match group(caps, "e") {
        "" => 0,
        e => e[1..].parse::<i32>().map_err(|_| ())?,
    };
    value *= 2f64.powi(exp);
    if negative {
        value = -value;
    }
    Ok(float_bytes(value, group(caps, "w")))
}

fn float_bytes(value: f64, width: &str) -> Vec<u8> {
    match width {
        "D" => value.to_le_bytes().to_vec(),
        _ => (value as f32).to_le_bytes().to_vec(),
    }
}

fn encode_char(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    let bytes = encode_text(group(caps, "ch"))?;
    if bytes.len() == 1 {
        Ok(bytes)
    } else {
        Err(())
    }
}

fn encode_string(caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    encode_text(group(caps, "str"))
}

fn encode_nothing(_caps: &Captures, _radix: u32) -> Result<Vec<u8>, ()> {
    Ok(Vec::new())
}

/// C-style integer used for NaN mantissas
fn parse_c_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Decodes standard string escapes, then encodes each character as its
/// Latin-1 byte where possible and as UTF-8 otherwise. Characters above
/// U+00FF may only enter through `\u`/`\U` escapes.
fn encode_text(s: &str) -> Result<Vec<u8>, ()> {
    if s.chars().any(|c| c as u32 > 0xff) {
        return Err(());
    }
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        let decoded = if c == '\\' {
            match chars.next().ok_or(())? {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                'v' => '\x0b',
                'f' => '\x0c',
                'a' => '\x07',
                'b' => '\x08',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                'x' => {
                    let hi = chars.next().ok_or(())?;
                    let lo = chars.next().ok_or(())?;
                    let code = u32::from_str_radix(&format!("{hi}{lo}"), 16).map_err(|_| ())?;
                    char::from_u32(code).ok_or(())?
                }
                e @ ('u' | 'U') => {
                    let mut code = String::new();
                    for _ in 0..if e == 'u' { 4 } else { 8 } {
                        code.push(chars.next().ok_or(())?);
                    }
                    let code = u32::from_str_radix(&code, 16).map_err(|_| ())?;
                    char::from_u32(code).ok_or(())?
                }
                d @ '0'..='7' => {
                    let mut code = d as u32 - '0' as u32;
                    for _ in 0..2 {
                        match chars.peek() {
                            Some(&c @ '0'..='7') => {
                                code = code * 8 + (c as u32 - '0' as u32);
                                chars.next();
                            }
                            _ => break,
                        }
                    }
                    char::from_u32(code).ok_or(())?
                }
                other => {
                    // Unknown escapes keep the backslash
                    out.push(b'\\');
                    other
                }
            }
        } else {
            c
        };
        let code = decoded as u32;
        if code < 0x100 {
            out.push(code as u8);
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(decoded.encode_utf8(&mut buf).as_bytes());
        }
    }
    Ok(out)
}

/// The immediate format: the operand itself is the data
#[derive(Debug, Clone, Copy)]
pub struct ImmediateFormat;

impl ImmediateFormat {
    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        let data = encode_line(input.literal()?, 0, false)?;
        Ok(if data.is_empty() { 0 } else { 10 })
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let data = encode_line(input.literal()?, 0, false)?;
        if data.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![Segment::new(0, data)])
        }
    }

    pub fn encode(&self, _segments: &[Segment]) -> Result<Vec<u8>, Error> {
        Err(Error::Format(
            "Immediate format not supported for output".into(),
        ))
    }
}

/// Number text in one radix per format id
#[derive(Debug, Clone, Copy)]
pub struct NumberFormat {
    radix: u32,
}

impl NumberFormat {
    pub fn new(radix: u32) -> Self {
        NumberFormat { radix }
    }

    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        let segments = self.decode(input)?;
        Ok(if segments.is_empty() { 0 } else { 20 })
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let mut data = Vec::new();
        for line in input.text()?.lines() {
            data.extend(encode_line(line.trim(), 0, true)?);
        }
        if data.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![Segment::new(0, data)])
        }
    }

    pub fn encode(&self, segments: &[Segment]) -> Result<Vec<u8>, Error> {
        let mut out = String::new();
        for segment in segments {
            for &byte in &segment.data {
                if !out.is_empty() {
                    out.push(',');
                }
                let formatted = match self.radix {
                    2 => format!("0b{byte:b}"),
                    8 if byte < 8 => format!("{byte}"),
                    8 => format!("0{byte:o}"),
                    16 => format!("0x{byte:x}"),
                    _ => format!("{byte}"),
                };
                out.push_str(&formatted);
            }
        }
        out.push('\n');
        Ok(out.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn imm(s: &str) -> Vec<u8> {
        encode_line(s, 0, false).unwrap()
    }

    #[test]
    fn integers_use_smallest_width() {
        assert_eq!(imm("0"), vec![0]);
        // Decimal without `U` is signed, so 255 needs two bytes
        assert_eq!(imm("255"), vec![0xff, 0x00]);
        assert_eq!(imm("255U"), vec![0xff]);
        assert_eq!(imm("127"), vec![0x7f]);
        assert_eq!(imm("-1"), vec![0xff]);
        assert_eq!(imm("-129"), vec![0x7f, 0xff]);
        assert_eq!(imm("65536"), vec![0, 0, 1, 0]);
    }

    #[test]
    fn hex_width_follows_digit_count() {
        assert_eq!(imm("0x12"), vec![0x12]);
        assert_eq!(imm("0x0012"), vec![0x12, 0x00]);
        assert_eq!(imm("0x12345"), vec![0x45, 0x23, 0x01, 0x00]);
        assert_eq!(imm("0b101"), vec![5]);
        assert_eq!(imm("0b100000001"), vec![0x01, 0x01]);
    }

    #[test]
    fn width_suffixes() {
        assert_eq!(imm("1HH"), vec![1]);
        assert_eq!(imm("1H"), vec![1, 0]);
        assert_eq!(imm("1S"), vec![1, 0]);
        assert_eq!(imm("1L"), vec![1, 0, 0, 0]);
        assert_eq!(imm("1LL"), vec![1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(imm("255HHU"), vec![0xff]);
    }

    #[test]
    fn suffixed_overflow_fails() {
        assert!(encode_line("128HH", 0, false).is_err());
        assert!(encode_line("256HHU", 0, false).is_err());
    }

    #[test]
    fn octal_is_signed_by_default() {
        assert_eq!(imm("017"), vec![15]);
        assert_eq!(imm("0377"), vec![0xff, 0x00]);
    }

    #[test]
    fn floats() {
        assert_eq!(imm("1.5"), 1.5f32.to_le_bytes().to_vec());
        assert_eq!(imm("1.5D"), 1.5f64.to_le_bytes().to_vec());
        assert_eq!(imm("1e3"), 1000f32.to_le_bytes().to_vec());
        assert_eq!(imm("-2.5"), (-2.5f32).to_le_bytes().to_vec());
        assert_eq!(imm("Inf"), f32::INFINITY.to_le_bytes().to_vec());
        assert_eq!(imm("-InfD"), f64::NEG_INFINITY.to_le_bytes().to_vec());
    }

    #[test]
    fn hex_floats() {
        assert_eq!(imm("0x1.8p1"), 3.0f32.to_le_bytes().to_vec());
        assert_eq!(imm("0x1.8p1D"), 3.0f64.to_le_bytes().to_vec());
    }

    #[test]
    fn nan_mantissa() {
        assert_eq!(imm("NaN"), 0x7fc00000u32.to_le_bytes().to_vec());
        assert_eq!(imm("NaN5"), 0x7f800005u32.to_le_bytes().to_vec());
        assert_eq!(imm("NaN0x7fffff"), 0x7fffffffu32.to_le_bytes().to_vec());
        assert_eq!(
            imm("NaND"),
            0x7ff8_0000_0000_0000u64.to_le_bytes().to_vec()
        );
        assert!(encode_line("NaN0x800000", 0, false).is_err());
    }

    #[test]
    fn characters_and_strings() {
        assert_eq!(imm("'a'"), vec![b'a']);
        assert_eq!(imm(r"'\n'"), vec![b'\n']);
        assert_eq!(imm(r#""hi\0""#), vec![b'h', b'i', 0]);
        assert!(encode_line(r#"'ab'"#, 0, false).is_err());
    }

    #[test]
    fn lists_and_separators() {
        assert_eq!(imm("1, 2,3"), vec![1, 2, 3]);
        assert_eq!(imm("1,"), vec![1]);
        assert!(encode_line("1 2", 0, false).is_err());
        assert!(encode_line("junk", 0, false).is_err());
    }

    #[test]
    fn comment_terminator() {
        assert_eq!(encode_line("1, 2 # rest", 0, true).unwrap(), vec![1, 2]);
        assert!(encode_line("1 # rest", 0, false).is_err());
    }

    #[test]
    fn selected_radix() {
        assert_eq!(encode_line("ff", 16, false).unwrap(), vec![0xff]);
        assert_eq!(encode_line("101", 2, false).unwrap(), vec![5]);
        assert!(encode_line("1.5", 16, false).is_err());
    }

    #[test]
    fn number_format_output() {
        let segments = vec![Segment::new(0, vec![0, 5, 255])];
        let hex = NumberFormat::new(16).encode(&segments).unwrap();
        assert_eq!(String::from_utf8(hex).unwrap(), "0x0,0x5,0xff\n");
        let oct = NumberFormat::new(8).encode(&segments).unwrap();
        assert_eq!(String::from_utf8(oct).unwrap(), "0,5,0377\n");
        let bin = NumberFormat::new(2).encode(&segments).unwrap();
        assert_eq!(String::from_utf8(bin).unwrap(), "0b0,0b101,0b11111111\n");
        let dec = NumberFormat::new(10).encode(&segments).unwrap();
        assert_eq!(String::from_utf8(dec).unwrap(), "0,5,255\n");
    }

    #[test]
    fn number_format_roundtrip() {
        let format = NumberFormat::new(16);
        let segments = vec![Segment::new(0, vec![1, 2, 0xaa])];
        let encoded = format.encode(&segments).unwrap();
        let decoded = format.decode(&Input::Bytes(&encoded)).unwrap();
        assert_eq!(decoded, segments);
    }

    #[test]
    fn immediate_detect_scores() {
        let fmt = ImmediateFormat;
        assert_eq!(fmt.detect(&Input::Literal("0x12,0x34")).unwrap(), 10);
        assert_eq!(fmt.detect(&Input::Literal("")).unwrap(), 0);
        assert!(fmt.detect(&Input::Literal("a.hex")).is_err());
    }
}
