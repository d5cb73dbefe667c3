//! Memory operation sequencing
//!
//! A session executes an ordered list of memory operations against a
//! probed device. Inputs are decoded, split over the file address space
//! and bucketed per device region; the session then enforces the global
//! ordering rules (EEPROM before flash, vector page first, one erase per
//! session), runs the EEPROM writer shim when needed, patches vectors and
//! streams the result to the device.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read as _, Write as _},
};

use log::debug;
use strum::Display;

use crate::{
    config::ConfigDb,
    connection::Connection,
    error::Error,
    flasher::{vectors, Flasher, CMD_EXIT},
    format::{Format, FormatKind, FormatTable, Input},
    image::{self, region_by_addr, region_by_name, Segment},
    progress::ProgressCallbacks,
};

/// What to do with the named regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Operation {
    #[strum(serialize = "r")]
    Read,
    #[strum(serialize = "w")]
    Write,
    #[strum(serialize = "v")]
    Verify,
}

/// One `-U` memory operation
#[derive(Debug, Clone)]
pub struct MemOp {
    pub regions: Vec<String>,
    pub operation: Operation,
    pub target: String,
    pub format: FormatKind,
}

impl MemOp {
    /// Parses `regions:op:target[:format]`. A bare target is shorthand
    /// for auto-detected flash write.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        if !spec.contains(':') {
            return Ok(MemOp {
                regions: vec!["flash".into()],
                operation: Operation::Write,
                target: spec.into(),
                format: FormatKind::Auto,
            });
        }
        let mut tokens: Vec<&str> = spec.split(':').collect();
        if tokens.len() < 3 {
            return Err(Error::MemOpSyntax(spec.into()));
        }
        let mut format = FormatKind::Auto;
        if tokens.len() > 3 {
            if let Some(&last) = tokens.last() {
                if last.len() == 1 {
                    tokens.pop();
                    format = FormatKind::from_id(last.chars().next().unwrap_or(' '))
                        .ok_or_else(|| Error::UnknownFormat {
                            target: tokens[2..].join(":"),
                            format: last.into(),
                        })?;
                }
            }
        }
        let regions = tokens[0].split(',').map(str::to_string).collect();
        let operation = match tokens[1] {
            "r" => Operation::Read,
            "w" => Operation::Write,
            "v" => Operation::Verify,
            other => return Err(Error::UnknownOperation(other.into())),
        };
        let target = tokens[2..].join(":");
        Ok(MemOp {
            regions,
            operation,
            target,
            format,
        })
    }
}

/// `(file region name, offset within it)` for each device region name.
/// The outer `None` marks an unknown region; the inner `None` marks
/// regions with no place in the file address space.
fn file_region_for(region: &str) -> Option<Option<(&'static str, u32)>> {
    Some(match region {
        "eeprom" => Some(("EEPROM", 0)),
        "flash" => Some(("flash", 0)),
        "fuse" | "lfuse" => Some(("fuses", 0)),
        "hfuse" => Some(("fuses", 1)),
        "efuse" => Some(("fuses", 2)),
        "lock" | "lockbits" => Some(("lock", 0)),
        "signature" => Some(("sigrow", 0)),
        "io" | "sram" => None,
        _ => return None,
    })
}

fn read_target(target: &str) -> Result<Vec<u8>, io::Error> {
    if target == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        fs::read(target)
    }
}

fn write_target(target: &str, data: &[u8]) -> Result<(), io::Error> {
    if target == "-" {
        io::stdout().write_all(data)
    } else {
        fs::write(target, data)
    }
}

/// Trims leading and trailing erased bytes off a flash segment, keeping
/// the result and its start address word aligned.
fn trim_segment(segment: &Segment) -> (u32, Vec<u8>) {
    let mut data = segment.data.clone();
    while data.last() == Some(&0xff) {
        data.pop();
    }
    if data.len() % 2 != 0 {
        data.push(0xff);
    }
    let mut keep = data.len() - data.iter().take_while(|&&b| b == 0xff).count();
    if keep % 2 != 0 {
        keep += 1;
    }
    let shift = data.len() - keep;
    (segment.addr + shift as u32, data.split_off(shift))
}

/// Builds the compressed stream the EEPROM writer shim consumes: a
/// `(gap, length)` header before each chunk, with `(254, 0)` no-ops
/// filling gaps too wide for one header and 256-byte chunks encoding
/// their length as zero.
fn eeprom_stream(segments: &[Segment]) -> Result<Vec<u8>, Error> {
    let mut stream = Vec::new();
    let mut offset: u32 = 0;
    for segment in segments {
        let mut start = segment.addr;
        let mut data = &segment.data[..];
        let mut gap = start.checked_sub(offset).ok_or_else(|| {
            Error::Format("EEPROM segments out of order".into())
        })?;
        while gap > 254 {
            stream.extend_from_slice(&[254, 0]);
            offset += 254;
            gap -= 254;
        }
        while !data.is_empty() {
            let take = data.len().min(256);
            stream.push((start - offset) as u8);
            stream.push((take & 0xff) as u8);
            stream.extend_from_slice(&data[..take]);
            offset = start + take as u32;
            start += take as u32;
            data = &data[take..];
        }
    }
    Ok(stream)
}

/// A fully resolved memory operation, ready to execute
struct PreparedOp {
    operation: Operation,
    regions: Vec<String>,
    target: String,
    format: FormatKind,
    /// Input segments bucketed by device region, with region-relative
    /// addresses
    segments: BTreeMap<String, Vec<Segment>>,
}

struct ExecState {
    erased: bool,
    vectors_programmed: bool,
    write_end: bool,
    verify_end: bool,
}

/// Sequences memory operations against one probed device
pub struct Session<'a, C> {
    flasher: &'a mut Flasher<C>,
    db: &'a ConfigDb,
    formats: FormatTable,
    erase_requested: bool,
    raw: bool,
}

impl<'a, C: Connection> Session<'a, C> {
    pub fn new(flasher: &'a mut Flasher<C>, db: &'a ConfigDb, erase: bool, raw: bool) -> Self {
        let formats = FormatTable::new(flasher.part());
        Session {
            flasher,
            db,
            formats,
            erase_requested: erase,
            raw,
        }
    }

    /// Runs the full operation list
    pub fn run(
        &mut self,
        ops: &[MemOp],
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let mut state = ExecState {
            erased: false,
            vectors_programmed: false,
            write_end: false,
            verify_end: false,
        };
        if self.erase_requested {
            self.flasher.erase_device(progress)?;
            state.erased = true;
        }

        let mut prepared = Vec::with_capacity(ops.len());
        let mut flash_written = false;
        let mut eeprom_written = false;
        let mut eeprom_writer: Option<Vec<u8>> = None;
        for op in ops {
            let p = self.prepare(op, &mut eeprom_writer)?;
            if p.segments.contains_key("eeprom") {
                if flash_written {
                    return Err(Error::EepromBeforeFlash);
                }
                eeprom_written = true;
            }
            if p.segments.contains_key("flash") {
                flash_written = true;
            }
            prepared.push(p);
        }
        if eeprom_written && !flash_written && !self.erase_requested {
            return Err(Error::EepromWithoutErase);
        }
        if eeprom_written && eeprom_writer.is_none() {
            return Err(Error::EepromWithoutShim);
        }

        for p in &prepared {
            match p.operation {
                Operation::Read => self.execute_read(p, progress)?,
                _ => self.execute_write(p, &eeprom_writer, &mut state, progress)?,
            }
        }

        if state.write_end {
            let staged = self.flasher.write_flash_end(progress)?;
            if state.verify_end {
                let layout = *self.flasher.layout();
                let end = self.flasher.read_region(
                    "flash",
                    layout.user_size,
                    Some(layout.bootloader_start - layout.user_size),
                    "Verifying",
                    progress,
                )?;
                if end != staged {
                    return Err(Error::VerifyMismatch {
                        region: "flash".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Expands region set algebra against the part's memories. `all` and
    /// `etc` add every writable memory, `ALL` also includes fuses and
    /// the signature; a `-` or `\` prefix removes instead of adding.
    fn resolve_regions(&self, tokens: &[String]) -> Result<Vec<String>, Error> {
        fn apply(out: &mut Vec<String>, name: &str, remove: bool) {
            if remove {
                out.retain(|n| n != name);
            } else if !out.iter().any(|n| n == name) {
                out.push(name.into());
            }
        }

        let mut out = Vec::new();
        for token in tokens {
            let (remove, name) = match token.strip_prefix(['-', '\\']) {
                Some(rest) => (true, rest),
                None => (false, token.as_str()),
            };
            if name.eq_ignore_ascii_case("all") || name == "etc" {
                let writable_only = name != "ALL";
                for (memory, _) in self.flasher.part().memories() {
                    if memory == "io" || memory == "sram" || file_region_for(memory).is_none() {
                        continue;
                    }
                    if writable_only && (memory == "signature" || memory.contains("fuse")) {
                        continue;
                    }
                    apply(&mut out, memory, remove);
                }
            } else if name == "none" {
            } else if file_region_for(name).is_none() {
                return Err(Error::UnknownRegion(name.into()));
            } else {
                apply(&mut out, name, remove);
            }
        }
        Ok(out)
    }

    fn resolve_format(&self, op: &MemOp) -> Result<(FormatKind, &Format), Error> {
        if op.format != FormatKind::Auto {
            let format = self.formats.get(op.format).ok_or_else(|| Error::UnknownFormat {
                target: op.target.clone(),
                format: op.format.id().to_string(),
            })?;
            return Ok((op.format, format));
        }
        if op.operation == Operation::Read {
            return Err(Error::UnknownFormat {
                target: op.target.clone(),
                format: "a".into(),
            });
        }
        let contents = read_target(&op.target).ok();
        let mut best: Option<(u8, FormatKind, &Format)> = None;
        for (kind, format) in self.formats.iter() {
            let score = if format.takes_literal() {
                format.detect(&Input::Literal(&op.target))
            } else {
                match &contents {
                    Some(bytes) => format.detect(&Input::Bytes(bytes)),
                    None => 0,
                }
            };
            if best.as_ref().is_none_or(|(s, _, _)| score >= *s) {
                best = Some((score, kind, format));
            }
        }
        match best {
            Some((score, kind, format)) if score > 0 => {
                debug!("auto-detected format {kind} for {}", op.target);
                Ok((kind, format))
            }
            _ => Err(Error::FormatAutoDetectFailed {
                target: op.target.clone(),
            }),
        }
    }

    fn decode_input(&self, format: &Format, target: &str) -> Result<Vec<Segment>, Error> {
        if format.takes_literal() {
            format.decode(&Input::Literal(target))
        } else {
            let bytes = read_target(target)?;
            format.decode(&Input::Bytes(&bytes))
        }
    }

    /// Decodes one operation's input and buckets it per device region,
    /// performing the userrow shim scan, data fusion and the device
    /// signature cross-check along the way.
    fn prepare(
        &self,
        op: &MemOp,
        eeprom_writer: &mut Option<Vec<u8>>,
    ) -> Result<PreparedOp, Error> {
        let regions = self.resolve_regions(&op.regions)?;
        let (format_kind, format) = self.resolve_format(op)?;
        let mut segments_by_region: BTreeMap<String, Vec<Segment>> = BTreeMap::new();

        if op.operation != Operation::Read {
            let mut file_segments = Vec::new();
            for segment in self.decode_input(format, &op.target)? {
                file_segments.extend(image::split_by_region(segment)?);
            }

            // An image carrying the EEPROM writer stub announces itself
            // with the bootloader's configuration words right after the
            // first page of its userrow segment.
            let layout = *self.flasher.layout();
            for segment in &file_segments {
                let Some(region) = region_by_addr(segment.addr) else {
                    continue;
                };
                if region.name != "userrow"
                    || segment.addr != region.base
                    || segment.data.len() <= (layout.page_size + 4) as usize
                {
                    continue;
                }
                let at = layout.page_size as usize;
                let word_0 = u16::from_le_bytes([segment.data[at], segment.data[at + 1]]);
                let word_1 = u16::from_le_bytes([segment.data[at + 2], segment.data[at + 3]]);
                if word_0 != layout.cfg_word_0 || word_1 != layout.cfg_word_1 {
                    return Err(Error::UserSignatureMismatch {
                        source_name: op.target.clone(),
                    });
                }
                *eeprom_writer = Some(segment.data.clone());
            }

            // The largest address seen decides whether the input is
            // region-addressed; data segments count at their original
            // addresses even though fusion relocates them.
            let pre_fusion_end = file_segments.iter().map(Segment::end).max().unwrap_or(0);
            let file_segments = image::fuse_data_segments(file_segments);
            let end_address = file_segments
                .iter()
                .map(Segment::end)
                .max()
                .unwrap_or(0)
                .max(pre_fusion_end);

            if end_address <= image::FILE_REGIONS[1].base {
                // No region-specific addresses: the whole input belongs
                // to the single requested region
                let mut regions = regions.clone();
                if regions.len() > 1 {
                    regions.retain(|r| r == "flash");
                }
                if let Some(first) = regions.first() {
                    segments_by_region.insert(first.clone(), file_segments);
                }
            } else {
                for region in &regions {
                    let Some(Some((file_region_name, offset))) = file_region_for(region) else {
                        continue;
                    };
                    let Some(file_region) = region_by_name(file_region_name) else {
                        continue;
                    };
                    let matched: Vec<Segment> = file_segments
                        .iter()
                        .filter(|seg| {
                            region_by_addr(seg.addr).map(|r| r.name) == Some(file_region_name)
                        })
                        .map(|seg| {
                            Segment::new(seg.addr - file_region.base + offset, seg.data.clone())
                        })
                        .collect();
                    if !matched.is_empty() {
                        segments_by_region.insert(region.clone(), matched);
                    }
                }
            }

            if let Some(first) = segments_by_region
                .get("signature")
                .and_then(|segs| segs.first())
            {
                if first.addr == 0
                    && first.data.len() >= 3
                    && first.data[..3] != self.flasher.signature_bytes()
                {
                    return Err(Error::SignatureMismatch {
                        source_name: op.target.clone(),
                    });
                }
            }
        }

        Ok(PreparedOp {
            operation: op.operation,
            regions,
            target: op.target.clone(),
            format: format_kind,
            segments: segments_by_region,
        })
    }

    fn execute_write(
        &mut self,
        op: &PreparedOp,
        eeprom_writer: &Option<Vec<u8>>,
        state: &mut ExecState,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let layout = *self.flasher.layout();
        let eeprom_segments: &[Segment] =
            op.segments.get("eeprom").map_or(&[], |v| v.as_slice());

        let stream = eeprom_stream(eeprom_segments)?;
        if !stream.is_empty() {
            let writer = eeprom_writer.as_ref().ok_or(Error::EepromWithoutShim)?;
            let mut blob = writer.clone();
            blob.extend_from_slice(&stream);
            if !state.erased {
                self.flasher.erase_device(progress)?;
                state.erased = true;
            }
            let mut flash_mem = blob.clone();
            flash_mem.resize(layout.bootloader_start as usize, 0xff);
            vectors::patch_firmware(&layout, &mut flash_mem, 0..blob.len() as u32, false)?;
            self.flasher
                .write_flash("Flashing EEPROM writer", 0, &flash_mem, false, progress)?;
            self.flasher.write_flash_end(progress)?;
            // Running the shim consumes the erase
            state.erased = false;
            self.flasher
                .reenumerate(CMD_EXIT, "EEPROM writer running", progress)?;
            self.flasher.reprobe(self.db)?;
        }

        if op.operation == Operation::Verify {
            for segment in eeprom_segments {
                let readback = self.flasher.read_region(
                    "eeprom",
                    segment.addr,
                    Some(segment.data.len() as u32),
                    "Verifying EEPROM",
                    progress,
                )?;
                if readback != segment.data {
                    return Err(Error::VerifyMismatch {
                        region: "eeprom".into(),
                    });
                }
            }
        }

        let flash_segments: &[Segment] = op.segments.get("flash").map_or(&[], |v| v.as_slice());
        let mut flash_mem = vec![0xffu8; layout.bootloader_start as usize];
        let mut flash_start = u32::MAX;
        let mut flash_end: u32 = 0;
        for segment in flash_segments {
            let (start, data) = trim_segment(segment);
            if data.is_empty() {
                continue;
            }
            let end = start + data.len() as u32;
            if end > layout.user_size {
                return Err(Error::ImageTooLargeForUserFlash {
                    end,
                    user_size: layout.user_size,
                });
            }
            flash_start = flash_start.min(start);
            flash_end = flash_end.max(end);
            flash_mem[start as usize..end as usize].copy_from_slice(&data);
        }

        if flash_end > 0 {
            if flash_start != 0 && !state.vectors_programmed {
                return Err(Error::VectorPageOrderViolation(
                    "Vector page of flash must be programmed first".into(),
                ));
            }
            if flash_start == 0 && state.vectors_programmed {
                return Err(Error::VectorPageOrderViolation(
                    "Vector page of flash cannot be programmed twice".into(),
                ));
            }
            state.vectors_programmed = true;

            vectors::patch_firmware(&layout, &mut flash_mem, flash_start..flash_end, !self.raw)?;
            if !state.erased {
                self.flasher.erase_device(progress)?;
                state.erased = true;
            }
            self.flasher.write_flash(
                "Flashing",
                flash_start,
                &flash_mem[flash_start as usize..],
                false,
                progress,
            )?;
            state.write_end = true;
            if op.operation == Operation::Verify {
                state.verify_end = true;
                let readback = self.flasher.read_region(
                    "flash",
                    flash_start,
                    Some(flash_end - flash_start),
                    "Verifying",
                    progress,
                )?;
                if readback.as_slice() != &flash_mem[flash_start as usize..flash_end as usize] {
                    return Err(Error::VerifyMismatch {
                        region: "flash".into(),
                    });
                }
            }
        }

        // Writes to the remaining regions degrade to a readback compare
        for (region, segments) in &op.segments {
            if matches!(region.as_str(), "eeprom" | "flash" | "io" | "sram") {
                continue;
            }
            for segment in segments {
                let readback = self.flasher.read_region(
                    region,
                    segment.addr,
                    Some(segment.data.len() as u32),
                    "Reading",
                    progress,
                )?;
                if readback != segment.data {
                    return Err(Error::ReadOnlyRegionMismatch {
                        region: region.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn execute_read(
        &mut self,
        op: &PreparedOp,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        let layout = *self.flasher.layout();
        let mut file_segments = Vec::new();
        for region in &op.regions {
            let length = if region == "flash" {
                Some(layout.bootloader_start)
            } else {
                None
            };
            let mut data = self.flasher.read_region(
                region,
                0,
                length,
                &format!("Reading {region}"),
                progress,
            )?;
            if region == "flash" {
                vectors::unpatch_firmware(&layout, &mut data)?;
                while data.last() == Some(&0xff) {
                    data.pop();
                }
            }
            let (file_region_name, offset) = file_region_for(region)
                .flatten()
                .ok_or_else(|| Error::UnknownRegion(region.clone()))?;
            let file_region = region_by_name(file_region_name)
                .ok_or_else(|| Error::UnknownRegion(file_region_name.into()))?;
            file_segments.push(Segment::new(file_region.base + offset, data));
        }
        let file_segments = image::merge_segments(file_segments);
        let format = self.formats.get(op.format).ok_or_else(|| Error::UnknownFormat {
            target: op.target.clone(),
            format: op.format.id().to_string(),
        })?;
        let encoded = format.encode(&file_segments)?;
        write_target(&op.target, &encoded)?;
        Ok(())
    }
}
