//! Part and programmer configuration database
//!
//! The database uses the avrdude configuration file syntax: `#` comments,
//! bare-word and quoted-string tokens, `key = value … ;` statements, and
//! `programmer`/`serialadapter`/`part` sections with `parent` inheritance.
//! Parts additionally carry nested `memory` blocks which support `alias`.
//! Several files can be layered on top of each other; later files extend
//! and override the tree built by earlier ones.

use std::{collections::BTreeMap, fmt, fs, path::Path};

use log::debug;

use crate::error::Error;

/// A `programmer`, `serialadapter` or `part` definition.
///
/// All attribute values are stored as the space-joined token list that
/// followed `=`; typed accessors parse them on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    attrs: BTreeMap<String, String>,
    memory: BTreeMap<String, Memory>,
}

/// One `memory <name>` block of a part
pub type Memory = BTreeMap<String, String>;

impl Section {
    /// Raw attribute value
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Attribute parsed as an integer with C radix prefixes
    pub fn int_attr(&self, key: &str) -> Result<Option<u32>, Error> {
        parse_attr(&self.attrs, key)
    }

    /// Attribute parsed as an integer, with a default when absent
    pub fn int_attr_or(&self, key: &str, default: u32) -> Result<u32, Error> {
        Ok(self.int_attr(key)?.unwrap_or(default))
    }

    /// Memory block by name
    pub fn memory(&self, name: &str) -> Option<&Memory> {
        self.memory.get(name)
    }

    /// All memory blocks, in name order
    pub fn memories(&self) -> impl Iterator<Item = (&str, &Memory)> {
        self.memory.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Integer accessor for a memory block attribute
pub fn memory_int(memory: &Memory, key: &str) -> Result<Option<u32>, Error> {
    parse_attr(memory, key)
}

/// Integer accessor for a memory block attribute, with a default
pub fn memory_int_or(memory: &Memory, key: &str, default: u32) -> Result<u32, Error> {
    Ok(memory_int(memory, key)?.unwrap_or(default))
}

fn parse_attr(attrs: &BTreeMap<String, String>, key: &str) -> Result<Option<u32>, Error> {
    match attrs.get(key) {
        None => Ok(None),
        Some(value) => parse_int(value).map(Some).ok_or_else(|| Error::ConfigValue {
            key: key.into(),
            value: value.clone(),
        }),
    }
}

/// Parses an integer with an optional C radix prefix (`0x`, `0o`, `0b`)
pub fn parse_int(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u32::from_str_radix(bin, 2).ok()
    } else if let Some(oct) = s.strip_prefix("0o").or_else(|| s.strip_prefix("0O")) {
        u32::from_str_radix(oct, 8).ok()
    } else {
        s.parse().ok()
    }
}

/// The parsed configuration database
#[derive(Debug, Clone, Default)]
pub struct ConfigDb {
    /// Top-level `key = value ;` entries
    pub settings: BTreeMap<String, String>,
    /// `programmer` sections by id
    pub programmers: BTreeMap<String, Section>,
    /// `serialadapter` sections by id
    pub serial_adapters: BTreeMap<String, Section>,
    /// `part` sections by id
    pub parts: BTreeMap<String, Section>,
}

impl ConfigDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration file into the database, layering on top of
    /// whatever is already present.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        debug!("loading configuration from {}", path.display());
        let text = fs::read_to_string(path)?;
        self.parse(&text, &path.display().to_string())
    }

    /// Parses configuration text into the database. `path` is only used
    /// for diagnostics.
    pub fn parse(&mut self, text: &str, path: &str) -> Result<(), Error> {
        Parser::new(text, path).parse_into(self)
    }

    pub fn part(&self, id: &str) -> Option<&Section> {
        self.parts.get(id)
    }

    /// Builds the signature index: lowercase six-hex-digit signature
    /// string to canonical part identifier.
    pub fn signatures(&self) -> BTreeMap<String, String> {
        let mut sigs = BTreeMap::new();
        for (id, part) in &self.parts {
            let Some(sig) = part.attr("signature") else {
                continue;
            };
            let Some(key) = signature_key(sig) else {
                continue;
            };
            sigs.insert(key, id.clone());
        }
        sigs
    }
}

/// Normalises a `signature` attribute (whitespace-separated hex tokens)
/// into the six-hex-digit index key.
fn signature_key(attr: &str) -> Option<String> {
    let mut key = String::new();
    for token in attr.split_whitespace() {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        let byte = u8::from_str_radix(token, 16).ok()?;
        key.push_str(&format!("{byte:02x}"));
    }
    Some(key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    Equals,
    End,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Word(w) => write!(f, "\"{w}\""),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Equals => f.write_str("\"=\""),
            Token::End => f.write_str("\";\""),
            Token::Eof => f.write_str("end of file"),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    col: usize,
}

struct Parser<'a> {
    tokens: Vec<Spanned>,
    pos: usize,
    path: &'a str,
}

impl<'a> Parser<'a> {
    fn new(text: &str, path: &'a str) -> Self {
        let mut tokens = Vec::new();
        let mut last_line = 0;
        for (line_no, line) in text.lines().enumerate() {
            last_line = line_no + 1;
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            tokenize_line(line, line_no + 1, &mut tokens);
        }
        tokens.push(Spanned {
            token: Token::Eof,
            line: last_line,
            col: 0,
        });
        Self {
            tokens,
            pos: 0,
            path,
        }
    }

    fn next(&mut self) -> Spanned {
        let spanned = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        spanned
    }

    fn error(&self, spanned: &Spanned, message: String) -> Error {
        Error::ConfigParse {
            path: self.path.into(),
            line: spanned.line,
            col: spanned.col,
            message,
        }
    }

    fn unexpected(&self, spanned: &Spanned) -> Error {
        self.error(spanned, format!("Unexpected token {}", spanned.token))
    }

    /// Next token, which must be a bare word or a string
    fn expect_name(&mut self) -> Result<(String, Spanned), Error> {
        let spanned = self.next();
        match &spanned.token {
            Token::Word(w) => Ok((w.clone(), spanned)),
            Token::Str(s) => Ok((s.clone(), spanned)),
            _ => Err(self.unexpected(&spanned)),
        }
    }

    fn expect_end(&mut self) -> Result<(), Error> {
        let spanned = self.next();
        match spanned.token {
            Token::End => Ok(()),
            _ => Err(self.unexpected(&spanned)),
        }
    }

    /// Parses `= token … ;` into a space-joined value
    fn parse_value(&mut self) -> Result<String, Error> {
        let spanned = self.next();
        if spanned.token != Token::Equals {
            return Err(self.unexpected(&spanned));
        }
        let mut parts: Vec<String> = Vec::new();
        loop {
            let spanned = self.next();
            match &spanned.token {
                Token::Word(w) => parts.push(w.clone()),
                Token::Str(s) => parts.push(s.clone()),
                Token::End => break,
                _ => return Err(self.unexpected(&spanned)),
            }
        }
        Ok(parts.join(" "))
    }

    fn parse_into(mut self, db: &mut ConfigDb) -> Result<(), Error> {
        loop {
            let spanned = self.next();
            let word = match &spanned.token {
                Token::Eof => break,
                Token::Word(w) => w.clone(),
                _ => return Err(self.unexpected(&spanned)),
            };
            match word.as_str() {
                "programmer" => self.parse_section(&mut db.programmers, false)?,
                "serialadapter" => self.parse_section(&mut db.serial_adapters, false)?,
                "part" => self.parse_section(&mut db.parts, true)?,
                _ => {
                    let value = self.parse_value()?;
                    db.settings.insert(word, value);
                }
            }
        }
        Ok(())
    }

    fn parse_section(
        &mut self,
        sections: &mut BTreeMap<String, Section>,
        is_part: bool,
    ) -> Result<(), Error> {
        let mut obj = Section::default();
        let mut last;
        loop {
            let spanned = self.next();
            last = spanned.clone();
            let key = match &spanned.token {
                Token::End => break,
                Token::Word(w) => w.clone(),
                _ => return Err(self.unexpected(&spanned)),
            };
            match key.as_str() {
                "parent" => {
                    let (name, spanned) = self.expect_name()?;
                    obj = sections
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| self.error(&spanned, format!("Unknown parent \"{name}\"")))?;
                }
                "memory" if is_part => {
                    let (name, _) = self.expect_name()?;
                    let mut mem = Memory::new();
                    loop {
                        let spanned = self.next();
                        let sub = match &spanned.token {
                            Token::End => break,
                            Token::Word(w) => w.clone(),
                            _ => return Err(self.unexpected(&spanned)),
                        };
                        if sub == "alias" {
                            let (alias, spanned) = self.expect_name()?;
                            mem = obj.memory.get(&alias).cloned().ok_or_else(|| {
                                self.error(&spanned, format!("Unknown memory alias \"{alias}\""))
                            })?;
                            self.expect_end()?;
                        } else {
                            let value = self.parse_value()?;
                            mem.insert(sub, value);
                        }
                    }
                    obj.memory.insert(name, mem);
                }
                _ => {
                    let value = self.parse_value()?;
                    obj.attrs.insert(key, value);
                }
            }
        }
        let ids = obj
            .attrs
            .get("id")
            .cloned()
            .ok_or_else(|| self.error(&last, "Section has no id".into()))?;
        for id in ids.split(',').map(str::trim) {
            sections.insert(id.into(), obj.clone());
        }
        Ok(())
    }
}

fn tokenize_line(line: &str, line_no: usize, out: &mut Vec<Spanned>) {
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let col = i;
        match c {
            ';' => {
                out.push(Spanned {
                    token: Token::End,
                    line: line_no,
                    col,
                });
                i += 1;
            }
            '=' => {
                out.push(Spanned {
                    token: Token::Equals,
                    line: line_no,
                    col,
                });
                i += 1;
            }
            '"' => {
                let rest = &line[i + 1..];
                let (value, consumed) = match rest.find('"') {
                    Some(end) => (&rest[..end], end + 2),
                    // An unterminated string runs to end of line
                    None => (rest, rest.len() + 1),
                };
                out.push(Spanned {
                    token: Token::Str(value.into()),
                    line: line_no,
                    col,
                });
                i += consumed;
            }
            _ => {
                let start = i;
                while i < bytes.len() {
                    let c = bytes[i] as char;
                    if c.is_whitespace() || c == ';' {
                        break;
                    }
                    i += 1;
                }
                out.push(Spanned {
                    token: Token::Word(line[start..i].into()),
                    line: line_no,
                    col,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(text: &str) -> ConfigDb {
        let mut db = ConfigDb::new();
        db.parse(text, "test.conf").unwrap();
        db
    }

    #[test]
    fn parses_part_with_memory() {
        let db = parse(
            r#"
            part
                id = "t85" ;
                desc = "ATtiny85" ;
                signature = 0x1e 0x93 0x0b ;
                chip_erase_delay = 4500 ;
                memory "flash"
                    size = 0x2000 ;
                    num_pages = 128 ;
                    max_write_delay = 4500 ;
                ;
            ;
            "#,
        );
        let part = db.part("t85").unwrap();
        assert_eq!(part.attr("desc"), Some("ATtiny85"));
        assert_eq!(part.attr("signature"), Some("0x1e 0x93 0x0b"));
        let flash = part.memory("flash").unwrap();
        assert_eq!(memory_int(flash, "size").unwrap(), Some(0x2000));
        assert_eq!(memory_int(flash, "num_pages").unwrap(), Some(128));
    }

    #[test]
    fn parent_inherits_and_overrides() {
        let db = parse(
            r#"
            part
                id = "m328p" ;
                desc = "ATmega328P" ;
                signature = 0x1e 0x95 0x0f ;
                chip_erase_delay = 9000 ;
                memory "flash"
                    size = 0x8000 ;
                    num_pages = 256 ;
                    max_write_delay = 4500 ;
                ;
            ;
            part parent "m328p"
                id = "m328pb" ;
                signature = 0x1e 0x95 0x16 ;
                memory "flash"
                    size = 0x8000 ;
                    num_pages = 256 ;
                ;
            ;
            "#,
        );
        let part = db.part("m328pb").unwrap();
        assert_eq!(part.attr("desc"), Some("ATmega328P"));
        assert_eq!(part.attr("signature"), Some("0x1e 0x95 0x16"));
        assert_eq!(part.int_attr("chip_erase_delay").unwrap(), Some(9000));
        let flash = part.memory("flash").unwrap();
        assert_eq!(memory_int(flash, "size").unwrap(), Some(0x8000));
        // The nested memory block was redefined without max_write_delay
        assert_eq!(memory_int(flash, "max_write_delay").unwrap(), None);
        let sigs = db.signatures();
        assert_eq!(sigs.get("1e9516").map(String::as_str), Some("m328pb"));
        assert_eq!(sigs.get("1e950f").map(String::as_str), Some("m328p"));
    }

    #[test]
    fn memory_alias_copies_sibling() {
        let db = parse(
            r#"
            part
                id = "t1" ;
                memory "flash"
                    size = 4096 ;
                ;
                memory "application"
                    alias "flash" ;
                ;
            ;
            "#,
        );
        let part = db.part("t1").unwrap();
        assert_eq!(part.memory("application"), part.memory("flash"));
    }

    #[test]
    fn multiple_ids_share_one_section() {
        let db = parse("part id = \"a, b\" ; desc = \"shared\" ;\n");
        assert_eq!(db.part("a"), db.part("b"));
        assert_eq!(db.part("a").unwrap().attr("desc"), Some("shared"));
    }

    #[test]
    fn layered_files_override() {
        let mut db = ConfigDb::new();
        db.parse("default_serial = /dev/ttyS0 ;\n", "base.conf")
            .unwrap();
        db.parse("default_serial = /dev/ttyUSB0 ;\n", "site.conf")
            .unwrap();
        assert_eq!(
            db.settings.get("default_serial").map(String::as_str),
            Some("/dev/ttyUSB0")
        );
    }

    #[test]
    fn unknown_parent_fails() {
        let mut db = ConfigDb::new();
        let err = db
            .parse("part parent \"nope\" id = \"x\" ;\n", "test.conf")
            .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { line: 1, .. }));
    }

    #[test]
    fn unknown_alias_fails() {
        let mut db = ConfigDb::new();
        let err = db
            .parse(
                "part id = \"x\" ; memory \"a\" alias \"nope\" ; ; ;\n",
                "test.conf",
            )
            .unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn eof_mid_definition_fails() {
        let mut db = ConfigDb::new();
        let err = db.parse("part id = \"x\"", "test.conf").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn comments_and_settings() {
        let db = parse("# a comment\ndefault_bitclock = 2.5 ; # trailing\n");
        assert_eq!(
            db.settings.get("default_bitclock").map(String::as_str),
            Some("2.5")
        );
    }

    #[test]
    fn parse_int_radixes() {
        assert_eq!(parse_int("0x8000"), Some(0x8000));
        assert_eq!(parse_int("256"), Some(256));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("0o17"), Some(15));
        assert_eq!(parse_int("junk"), None);
    }
}
