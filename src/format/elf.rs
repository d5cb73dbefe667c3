//! AVR ELF executables
//!
//! The writer produces a minimal ELF32 LSB executable with one `PT_LOAD`
//! segment and one matching `SHT_PROGBITS` section per image segment,
//! named and flagged by the file region the segment lives in. The low
//! seven bits of `e_flags` carry the AVR family id of the part, which the
//! reader checks along with the machine type.

use bytemuck::{bytes_of, Pod, Zeroable};
use object::{
    elf::{
        EM_AVR, ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE,
        SHT_NULL, SHT_PROGBITS, SHT_STRTAB,
    },
    read::elf::ElfFile32 as ElfFile,
    Endianness,
};

use crate::{
    config::Section,
    error::Error,
    format::Input,
    image::{region_by_addr, Segment},
};

/// `e_flags` family ids, and the parts belonging to each family
const AVR_FAMILIES: &[(&str, u8, &[&str])] = &[
    ("avr1", 1, &["1200", "t11", "t12", "t15", "t28"]),
    (
        "avr25",
        25,
        &[
            "at86rf401", "ata5272", "ata6616c", "t13", "t13a", "t2313", "t2313a", "t24", "t24a",
            "t25", "t261", "t261a", "t4313", "t43u", "t44", "t441", "t44a", "t45", "t461", "t461a",
            "t48", "t828", "t84", "t841", "t84a", "t85", "t861", "t861a", "t87", "t88",
        ],
    ),
    (
        "avr2",
        2,
        &[
            "c8534", "2313", "2323", "2333", "2343", "4414", "4433", "4434", "8515", "8535",
            "t22", "t26",
        ],
    ),
    ("avr31", 31, &["at43usb320", "m103"]),
    (
        "avr35",
        35,
        &[
            "usb162", "usb82", "ata5505", "ata6617c", "ata664251", "m16u2", "m32u2", "m8u2",
            "t1634", "t167",
        ],
    ),
    ("avr3", 3, &["at43usb355", "at76c711"]),
    (
        "avr4",
        4,
        &[
            "pwm1", "pwm2", "pwm2b", "pwm3", "pwm3b", "pwm81", "ata6285", "ata6286", "ata6289",
            "ata6612c", "m48", "m48a", "m48p", "m48pa", "m48pb", "m8", "m8515", "m8535", "m88",
            "m88a", "m88p", "m88pa", "m88pb", "m8a", "m8hva",
        ],
    ),
    (
        "avr51",
        51,
        &[
            "c128", "usb1286", "usb1287", "m128", "m1280", "m1281", "m1284", "m1284p",
            "m1284rfr2", "m128a", "m128rfa1", "m128rfr2",
        ],
    ),
    (
        "avr5",
        5,
        &[
            "c32", "c64", "pwm161", "pwm216", "pwm316", "cr100", "usb646", "usb647", "at94k",
            "ata5702m322", "ata5782", "ata5790", "ata5790n", "ata5791", "ata5795", "ata5831",
            "ata6613c", "ata6614q", "ata8210", "ata8510", "m16", "m161", "m162", "m163", "m164a",
            "m164p", "m164pa", "m165", "m165a", "m165p", "m165pa", "m168", "m168a", "m168p",
            "m168pa", "m168pb", "m169", "m169a", "m169p", "m169pa", "m16a", "m16hva", "m16hva2",
            "m16hvb", "m16hvbrevb", "m16m1", "m16u4", "m32", "m323", "m324a", "m324p", "m324pa",
            "m325", "m3250", "m3250a", "m3250p", "m3250pa", "m325a", "m325p", "m325pa", "m328",
            "m328p", "m328pb", "m329", "m3290", "m3290a", "m3290p", "m3290pa", "m329a", "m329p",
            "m329pa", "m32a", "m32c1", "m32hvb", "m32hvbrevb", "m32m1", "m32u4", "m32u6", "m406",
            "m64", "m640", "m644", "m644a", "m644p", "m644pa", "m644rfr2", "m645", "m6450",
            "m6450a", "m6450p", "m645a", "m645p", "m649", "m6490", "m6490a", "m6490p", "m649a",
            "m649p", "m64a", "m64c1", "m64hve", "m64hve2", "m64m1", "m64rfr2", "m3000",
        ],
    ),
    ("avr6", 6, &["m2560", "m2561", "m2564rfr2", "m256rfr2"]),
    ("avrtiny", 100, &["t10", "t20", "t4", "t40", "t5", "t9"]),
    (
        "avrxmega2",
        102,
        &[
            "x16a4", "x16a4u", "x16c4", "x16d4", "x16e5", "x32a4", "x32a4u", "x32c3", "x32c4",
            "x32d3", "x32d4", "x32e5", "x8e5",
        ],
    ),
    (
        "avrxmega3",
        103,
        &[
            "t1614", "t1616", "t1617", "t212", "t214", "t3216", "t3217", "t412", "t414", "t416",
            "t417", "t814", "t816", "t817",
        ],
    ),
    (
        "avrxmega4",
        104,
        &[
            "x64a3", "x64a3u", "x64a4u", "x64b1", "x64b3", "x64c3", "x64d3", "x64d4",
        ],
    ),
    ("avrxmega5", 105, &["x64a1", "x64a1u"]),
    (
        "avrxmega6",
        106,
        &[
            "x128a3", "x128a3u", "x128b1", "x128b3", "x128c3", "x128d3", "x128d4", "x192a3",
            "x192a3u", "x192c3", "x192d3", "x256a3", "x256a3b", "x256a3bu", "x256a3u", "x256c3",
            "x256d3", "x384c3", "x384d3",
        ],
    ),
    ("avrxmega7", 107, &["x128a1", "x128a1u", "x128a4u"]),
];

fn family_for_part(id: &str) -> Option<u8> {
    AVR_FAMILIES
        .iter()
        .find(|(_, _, parts)| parts.contains(&id))
        .map(|&(_, family, _)| family)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_paddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u32,
    sh_addr: u32,
    sh_offset: u32,
    sh_size: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
}

const EHDR_SIZE: u32 = 52;
const PHDR_SIZE: u32 = 32;
const SHDR_SIZE: u32 = 40;

/// Section name, flags and alignment for each file region
fn section_info(region: &str) -> (&'static str, u32, u32) {
    match region {
        "flash" => (".text", SHF_ALLOC | SHF_EXECINSTR, 2),
        "data" => (".data", SHF_ALLOC | SHF_WRITE, 1),
        "EEPROM" => (".eeprom", SHF_ALLOC, 1),
        "fuses" => (".fuse", SHF_ALLOC, 1),
        "lock" => (".lock", SHF_ALLOC, 1),
        "sigrow" => (".signature", SHF_ALLOC, 1),
        "userrow" => (".user_signatures", SHF_ALLOC, 1),
        _ => (".boot", SHF_ALLOC | SHF_EXECINSTR, 2),
    }
}

/// Program header flags and alignment for each file region
fn program_info(region: &str) -> (u32, u32) {
    match region {
        "flash" => (PF_R | PF_X, 2),
        "data" => (PF_R | PF_W, 1),
        "bootrow" => (PF_R, 2),
        _ => (PF_R, 1),
    }
}

/// AVR ELF executables bound to one part's family id
#[derive(Debug, Clone)]
pub struct ElfFormat {
    family: Option<u8>,
    part: String,
}

impl ElfFormat {
    pub fn new(part: &Section) -> Self {
        let ids = part.attr("id").unwrap_or("");
        let family = ids
            .split(',')
            .map(str::trim)
            .find_map(family_for_part);
        let part = part
            .attr("desc")
            .or(part.attr("id"))
            .unwrap_or("unknown")
            .to_string();
        ElfFormat { family, part }
    }

    fn family(&self) -> Result<u8, Error> {
        self.family.ok_or_else(|| Error::UnknownPartFamily {
            part: self.part.clone(),
        })
    }

    pub fn detect(&self, input: &Input) -> Result<u8, Error> {
        ElfFile::<Endianness>::parse(input.bytes()?)?;
        Ok(100)
    }

    pub fn decode(&self, input: &Input) -> Result<Vec<Segment>, Error> {
        let family = self.family()?;
        let bytes = input.bytes()?;
        let elf = ElfFile::parse(bytes)?;
        let endian = Endianness::Little;
        let header = elf.elf_header();
        if header.e_machine.get(endian) != EM_AVR {
            return Err(Error::Format(format!(
                "Unexpected architecture: {:#x}",
                header.e_machine.get(endian)
            )));
        }
        if header.e_flags.get(endian) & 0x7f != family as u32 {
            return Err(Error::Format(format!(
                "Unexpected part family in ELF header: {}",
                header.e_flags.get(endian) & 0x7f
            )));
        }
        let mut segments = Vec::new();
        for phdr in elf.elf_program_headers() {
            if phdr.p_type.get(endian) != PT_LOAD || phdr.p_filesz.get(endian) == 0 {
                continue;
            }
            let offset = phdr.p_offset.get(endian) as usize;
            let size = phdr.p_filesz.get(endian) as usize;
            let data = bytes
                .get(offset..offset + size)
                .ok_or_else(|| Error::Format("ELF segment data out of bounds".into()))?;
            segments.push(Segment::new(phdr.p_paddr.get(endian), data.to_vec()));
        }
        Ok(segments)
    }

    pub fn encode(&self, segments: &[Segment]) -> Result<Vec<u8>, Error> {
        let family = self.family()?;
        let mut regions = Vec::with_capacity(segments.len());
        for segment in segments {
            let region = region_by_addr(segment.addr)
                .ok_or_else(|| Error::UnknownRegion(format!("{:#x}", segment.addr)))?;
            regions.push(region.name);
        }

        let phnum = segments.len() as u32;
        let shnum = segments.len() as u32 + 2;
        let phoff = EHDR_SIZE;
        let shoff = phoff + phnum * PHDR_SIZE;
        let mut offset = shoff + shnum * SHDR_SIZE;

        let mut phdrs = Vec::with_capacity(segments.len());
        let mut shdrs = Vec::with_capacity(segments.len() + 2);
        let mut names: Vec<&str> = Vec::with_capacity(segments.len() + 2);

        shdrs.push(Shdr {
            sh_type: SHT_NULL,
            ..Zeroable::zeroed()
        });
        names.push("");

        for (segment, region) in segments.iter().zip(regions.iter().copied()) {
            let size = segment.data.len() as u32;
            let (p_flags, p_align) = demote(program_info(region), size, PF_X);
            phdrs.push(Phdr {
                p_type: PT_LOAD,
                p_offset: offset,
                p_vaddr: segment.addr,
                p_paddr: segment.addr,
                p_filesz: size,
                p_memsz: size,
                p_flags,
                p_align,
            });
            let (name, sh_flags, sh_align) = section_info(region);
            let (sh_flags, sh_addralign) = demote((sh_flags, sh_align), size, SHF_EXECINSTR);
            shdrs.push(Shdr {
                sh_type: SHT_PROGBITS,
                sh_flags,
                sh_addr: segment.addr,
                sh_offset: offset,
                sh_size: size,
                sh_addralign,
                ..Zeroable::zeroed()
            });
            names.push(name);
            offset += size;
        }

        names.push(".shstrtab");
        let strtab_offset = offset;
        let mut name_offsets = Vec::with_capacity(names.len());
        let mut strtab = Vec::new();
        for name in &names {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        shdrs.push(Shdr {
            sh_type: SHT_STRTAB,
            sh_flags: SHF_ALLOC,
            sh_offset: strtab_offset,
            sh_size: strtab.len() as u32,
            sh_addralign: 1,
            ..Zeroable::zeroed()
        });
        for (shdr, name_offset) in shdrs.iter_mut().zip(&name_offsets) {
            shdr.sh_name = *name_offset;
        }

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        e_ident[4] = 1; // ELFCLASS32
        e_ident[5] = 1; // ELFDATA2LSB
        e_ident[6] = 1; // EV_CURRENT
        let ehdr = Ehdr {
            e_ident,
            e_type: ET_EXEC,
            e_machine: EM_AVR,
            e_version: 1,
            e_entry: 0,
            e_phoff: phoff,
            e_shoff: shoff,
            e_flags: family as u32,
            e_ehsize: EHDR_SIZE as u16,
            e_phentsize: PHDR_SIZE as u16,
            e_phnum: phnum as u16,
            e_shentsize: SHDR_SIZE as u16,
            e_shnum: shnum as u16,
            e_shstrndx: (shnum - 1) as u16,
        };

        let mut out = Vec::with_capacity((strtab_offset + strtab.len() as u32) as usize);
        out.extend_from_slice(bytes_of(&ehdr));
        for phdr in &phdrs {
            out.extend_from_slice(bytes_of(phdr));
        }
        for shdr in &shdrs {
            out.extend_from_slice(bytes_of(shdr));
        }
        for segment in segments {
            out.extend_from_slice(&segment.data);
        }
        out.extend_from_slice(&strtab);
        Ok(out)
    }
}

/// Odd-length segments cannot be word aligned; drop to byte alignment and
/// clear the executable flag.
fn demote((flags, align): (u32, u32), size: u32, exec_flag: u32) -> (u32, u32) {
    if align == 2 && size % 2 != 0 {
        (flags & !exec_flag, 1)
    } else {
        (flags, align)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ConfigDb;

    fn t85_format() -> ElfFormat {
        let mut db = ConfigDb::new();
        db.parse("part id = \"t85\" ; desc = \"ATtiny85\" ;\n", "test.conf")
            .unwrap();
        ElfFormat::new(db.part("t85").unwrap())
    }

    #[test]
    fn family_lookup() {
        assert_eq!(family_for_part("t85"), Some(25));
        assert_eq!(family_for_part("m328p"), Some(5));
        assert_eq!(family_for_part("x128a1"), Some(107));
        assert_eq!(family_for_part("nope"), None);
    }

    #[test]
    fn round_trip() {
        let format = t85_format();
        let segments = vec![
            Segment::new(0, vec![0x0c, 0xc0, 0x18, 0x95]),
            Segment::new(0x810000, vec![0xaa, 0xbb, 0xcc]),
        ];
        let encoded = format.encode(&segments).unwrap();
        assert_eq!(format.detect(&Input::Bytes(&encoded)).unwrap(), 100);
        let decoded = format.decode(&Input::Bytes(&encoded)).unwrap();
        assert_eq!(decoded, segments);
    }

    #[test]
    fn odd_length_flash_demotes_alignment() {
        let format = t85_format();
        let encoded = format
            .encode(&[Segment::new(0, vec![0x0c, 0xc0, 0x00])])
            .unwrap();
        let elf = ElfFile::parse(&encoded[..]).unwrap();
        let endian = Endianness::Little;
        let phdr = &elf.elf_program_headers()[0];
        assert_eq!(phdr.p_align.get(endian), 1);
        assert_eq!(phdr.p_flags.get(endian) & PF_X, 0);
    }

    fn read_u16(data: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([data[at], data[at + 1]])
    }

    fn read_u32(data: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
    }

    #[test]
    fn region_tables_cover_the_address_space() {
        let format = t85_format();
        let segments = vec![
            Segment::new(0x000000, vec![0x0c, 0xc0]),
            Segment::new(0x800010, vec![1, 2]),
            Segment::new(0x810000, vec![3, 4]),
            Segment::new(0x820000, vec![5, 6]),
            Segment::new(0x830000, vec![7, 8]),
            Segment::new(0x840000, vec![9, 10]),
            Segment::new(0x850000, vec![11, 12]),
            Segment::new(0x860000, vec![13, 14]),
        ];
        let encoded = format.encode(&segments).unwrap();

        let expected: [(&str, u32, u32, u32); 8] = [
            (".text", PF_R | PF_X, 2, SHF_ALLOC | SHF_EXECINSTR),
            (".data", PF_R | PF_W, 1, SHF_ALLOC | SHF_WRITE),
            (".eeprom", PF_R, 1, SHF_ALLOC),
            (".fuse", PF_R, 1, SHF_ALLOC),
            (".lock", PF_R, 1, SHF_ALLOC),
            (".signature", PF_R, 1, SHF_ALLOC),
            (".user_signatures", PF_R, 1, SHF_ALLOC),
            (".boot", PF_R, 2, SHF_ALLOC | SHF_EXECINSTR),
        ];

        let elf = ElfFile::parse(&encoded[..]).unwrap();
        let endian = Endianness::Little;
        let phdrs = elf.elf_program_headers();
        assert_eq!(phdrs.len(), expected.len());
        for (phdr, (_, p_flags, align, _)) in phdrs.iter().zip(expected.iter()) {
            assert_eq!(phdr.p_flags.get(endian), *p_flags);
            assert_eq!(phdr.p_align.get(endian), *align);
        }

        // Section headers, walked straight off the encoded bytes
        let shoff = read_u32(&encoded, 32) as usize;
        let shnum = read_u16(&encoded, 48) as usize;
        let shstrndx = read_u16(&encoded, 50) as usize;
        assert_eq!(shnum, expected.len() + 2);
        let strtab = read_u32(&encoded, shoff + shstrndx * 40 + 16) as usize;
        for (i, (name, _, align, sh_flags)) in expected.iter().enumerate() {
            let shdr = shoff + (i + 1) * 40;
            let name_at = strtab + read_u32(&encoded, shdr) as usize;
            assert_eq!(&encoded[name_at..name_at + name.len()], name.as_bytes());
            assert_eq!(encoded[name_at + name.len()], 0);
            assert_eq!(read_u32(&encoded, shdr + 8), *sh_flags);
            assert_eq!(read_u32(&encoded, shdr + 32), *align);
        }
    }

    #[test]
    fn rejects_wrong_family() {
        let mut db = ConfigDb::new();
        db.parse(
            "part id = \"t85\" ;\npart id = \"m328p\" ;\n",
            "test.conf",
        )
        .unwrap();
        let t85 = ElfFormat::new(db.part("t85").unwrap());
        let m328p = ElfFormat::new(db.part("m328p").unwrap());
        let encoded = t85.encode(&[Segment::new(0, vec![1, 2])]).unwrap();
        assert!(m328p.decode(&Input::Bytes(&encoded)).is_err());
    }

    #[test]
    fn unknown_family_fails_on_use() {
        let mut db = ConfigDb::new();
        db.parse("part id = \"mystery\" ;\n", "test.conf").unwrap();
        let format = ElfFormat::new(db.part("mystery").unwrap());
        let err = format.encode(&[Segment::new(0, vec![1, 2])]).unwrap_err();
        assert!(matches!(err, Error::UnknownPartFamily { .. }));
    }
}
