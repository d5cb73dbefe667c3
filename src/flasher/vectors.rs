//! Reset and interrupt vector patching
//!
//! The device has a single hardware reset vector and one interrupt vector
//! shared with the bootloader's USB stack. To let user firmware and the
//! bootloader coexist, the user's reset and USB vectors are rewritten to
//! chain through the bootloader, and the original targets move into the
//! tinyvectortable: two rjmp slots in the last four bytes of user flash.
//! Reading firmware back reverses the transform.

use std::ops::Range;

use crate::{error::Error, flasher::FlashLayout};

const RJMP_OP: u16 = 0xc000;
const RJMP_OP_MASK: u16 = 0xf000;
const RJMP_OFFSET_MASK: u16 = 0x0fff;
const JMP_OP: u16 = 0x940c;
const RETI_OP: u16 = 0x9518;

/// Absolute target of the rjmp at `base`, or `None` when the word there
/// is not an rjmp. Targets wrap modulo 8 KiB.
pub fn rjmp_target(data: &[u8], base: u32) -> Option<u32> {
    let i = base as usize;
    if i + 2 > data.len() {
        return None;
    }
    let opcode = u16::from_le_bytes([data[i], data[i + 1]]);
    if opcode & RJMP_OP_MASK != RJMP_OP {
        return None;
    }
    let offset = ((opcode & RJMP_OFFSET_MASK) as u32 + 1) * 2;
    Some((offset + base) & 0x1fff)
}

/// Writes an rjmp at `base` jumping to `dest`, wrapping modulo 8 KiB in
/// either direction when that brings the target in reach.
pub fn patch_rjmp(data: &mut [u8], dest: u32, base: u32) -> Result<(), Error> {
    let mut target = dest;
    let mut rbase = base + 2;
    if target + 4096 < rbase {
        target += 8192;
    }
    if target > rbase + 4094 {
        rbase += 8192;
    }
    if target + 4096 < rbase || target > rbase + 4094 {
        return Err(Error::RjmpOutOfRange { dest, base });
    }
    let offset = (target as i32 - rbase as i32) / 2;
    let opcode = RJMP_OP | (offset as u16 & RJMP_OFFSET_MASK);
    data[base as usize..base as usize + 2].copy_from_slice(&opcode.to_le_bytes());
    Ok(())
}

/// Writes a 4-byte absolute jmp at `base`
pub fn patch_jmp(data: &mut [u8], dest: u32, base: u32) {
    let i = base as usize;
    data[i..i + 2].copy_from_slice(&JMP_OP.to_le_bytes());
    data[i + 2..i + 4].copy_from_slice(&((dest / 2) as u16).to_le_bytes());
}

/// Writes a reti at `base`
pub fn patch_reti(data: &mut [u8], base: u32) {
    let i = base as usize;
    data[i..i + 2].copy_from_slice(&RETI_OP.to_le_bytes());
}

/// Rewrites the vectors of a user image so it chains through the
/// bootloader. `data` covers `[0, bootloader_start)` and `flash_range` is
/// the byte range the user image actually populates.
pub fn patch_firmware(
    layout: &FlashLayout,
    data: &mut [u8],
    flash_range: Range<u32>,
    patch_irq: bool,
) -> Result<(), Error> {
    if flash_range.contains(&0) || flash_range.contains(&1) {
        // The reset slot must hold an rjmp we can relocate
        let user_reset = rjmp_target(data, 0).ok_or(Error::VectorNotRjmp)?;
        patch_rjmp(data, layout.bootloader_start, 0)?;
        // The reset vector is always the first tinyvectortable slot
        patch_rjmp(data, user_reset, layout.bootloader_start - 4)?;
    }

    let vector_addr = layout.vector * 2;
    if patch_irq
        && layout.vector != 0
        && (flash_range.contains(&vector_addr) || flash_range.contains(&(vector_addr + 1)))
    {
        let mut user_vector = rjmp_target(data, vector_addr).filter(|&target| target != 0);
        if let Some(target) = user_vector {
            if flash_range.start >= target + 2 || flash_range.end < target {
                return Err(Error::UserVectorOutOfRange { target });
            }
            let next = rjmp_target(data, target);
            if next == Some(0) || next == Some(target) {
                // Jumps to reset or to itself: a bad-interrupt loop
                user_vector = None;
            }
        }
        // Chain the shared interrupt through the bootloader's trampoline
        patch_rjmp(data, layout.flash_size - 10, vector_addr)?;
        match user_vector {
            Some(target) => patch_rjmp(data, target, layout.bootloader_start - 2)?,
            None => patch_reti(data, layout.bootloader_start - 2),
        }
    }
    Ok(())
}

/// Reverses [`patch_firmware`] on a flash image read back from the
/// device: re-plants the tinyvectortable targets into the real vector
/// slots and clears the table itself.
pub fn unpatch_firmware(layout: &FlashLayout, data: &mut [u8]) -> Result<(), Error> {
    if data.len() != layout.bootloader_start as usize {
        return Err(Error::Format(
            "flash image length does not match the user area".into(),
        ));
    }
    if let Some(target) = rjmp_target(data, layout.user_size) {
        patch_rjmp(data, target, 0)?;
    }
    if layout.vector != 0 {
        if let Some(target) = rjmp_target(data, layout.user_size + 2) {
            patch_rjmp(data, target, layout.vector * 2)?;
        }
    }
    for byte in &mut data[layout.user_size as usize..] {
        *byte = 0xff;
    }
    Ok(())
}
