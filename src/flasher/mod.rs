//! Program a device through the resident bootloader
//!
//! The [Flasher] struct owns the USB connection and the per-part state
//! derived during probing, and provides the erase, buffered write and
//! region read primitives the session layer sequences.

use std::{thread::sleep, time::Duration};

use log::debug;

use crate::{
    config::{memory_int, memory_int_or, ConfigDb, Memory, Section},
    connection::Connection,
    error::Error,
    progress::{NoProgress, ProgressCallbacks},
};

pub mod vectors;

/// Bootloader control requests
pub const CMD_ENTER: u8 = 0;
pub const CMD_BUF_WRITE: u8 = 1;
pub const CMD_PAGE_ERASE: u8 = 3;
pub const CMD_PAGE_WRITE: u8 = 5;
pub const CMD_EXIT: u8 = 128;

/// Read requests select the memory being read
pub const DEV_READ_MEM: u8 = 0;
pub const DEV_READ_FLASH: u8 = 1 << 0;
pub const DEV_READ_FUSE: u8 = (1 << 3) | (1 << 0);
pub const DEV_READ_SIG: u8 = (1 << 5) | (1 << 0);
pub const DEV_READ_EEPROM: u8 = 1 << 6;

/// Supported `bcdDevice` major version range
const MEIOSIS_MIN_MAJOR: u8 = 2;
const MEIOSIS_MAX_MAJOR: u8 = 2;

/// Bytes reserved for the tinyvectortable at the end of user flash
const END_SIZE: u32 = 4;

/// Region reads happen in chunks this large so progress stays responsive
const READ_CHUNK: u32 = 64;

/// Flash geometry and bootloader configuration derived during probing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashLayout {
    pub flash_size: u32,
    pub page_size: u32,
    pub num_pages: u32,
    pub n_page_erase: u32,
    pub num_bl_pages: u32,
    pub num_user_pages: u32,
    /// First byte of bootloader-reserved flash
    pub bootloader_start: u32,
    /// User flash excluding the tinyvectortable
    pub user_size: u32,
    /// USB interrupt vector index, zero when unused
    pub vector: u32,
    pub cfg_word_0: u16,
    pub cfg_word_1: u16,
}

/// `(read request, device offset)` for each region name
fn region_reader(region: &str) -> Option<(u8, u32)> {
    Some(match region {
        "flash" => (DEV_READ_FLASH, 0),
        "eeprom" => (DEV_READ_EEPROM, 0),
        "fuse" | "lfuse" => (DEV_READ_FUSE, 0),
        "hfuse" => (DEV_READ_FUSE, 3),
        "efuse" => (DEV_READ_FUSE, 2),
        "lock" | "lockbits" => (DEV_READ_FUSE, 1),
        "signature" => (DEV_READ_SIG, 0),
        "sram" | "io" => (DEV_READ_MEM, 0),
        _ => return None,
    })
}

fn require(memory: &Memory, key: &str) -> Result<u32, Error> {
    memory_int(memory, key)?.ok_or_else(|| Error::ConfigValue {
        key: key.into(),
        value: "<missing>".into(),
    })
}

/// A probed device in bootloader mode
#[derive(Debug)]
pub struct Flasher<C> {
    connection: C,
    dry_run: bool,
    part: Section,
    part_id: String,
    part_desc: String,
    signature: String,
    signature_bytes: [u8; 3],
    layout: FlashLayout,
    write_sleep: Duration,
    erase_sleep: Duration,
    /// Staging buffer for the tinyvectortable, written as a separate pass
    end_data: Vec<u8>,
}

impl<C: Connection> Flasher<C> {
    /// Probes the connected device: checks the bootloader version, reads
    /// the signature and the configuration words, and derives the flash
    /// layout from the part database.
    pub fn probe(connection: C, db: &ConfigDb, dry_run: bool) -> Result<Self, Error> {
        let mut flasher = Flasher {
            connection,
            dry_run,
            part: Section::default(),
            part_id: String::new(),
            part_desc: String::new(),
            signature: String::new(),
            signature_bytes: [0; 3],
            layout: FlashLayout::default(),
            write_sleep: Duration::ZERO,
            erase_sleep: Duration::ZERO,
            end_data: Vec::new(),
        };
        flasher.reprobe(db)?;
        Ok(flasher)
    }

    /// Probes again after a re-enumeration
    pub fn reprobe(&mut self, db: &ConfigDb) -> Result<(), Error> {
        let (major, minor) = self.connection.device_version();
        if !(MEIOSIS_MIN_MAJOR..=MEIOSIS_MAX_MAJOR).contains(&major) {
            return Err(Error::UnsupportedBootloaderVersion { major, minor });
        }

        let info = self.connection.control_in(DEV_READ_SIG, 0, 5)?;
        self.signature_bytes = [info[0], info[2], info[4]];
        self.signature = self
            .signature_bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        let signatures = db.signatures();
        let part_id = signatures
            .get(&self.signature)
            .ok_or_else(|| Error::UnknownPart(self.signature.clone()))?
            .clone();
        let part = db
            .part(&part_id)
            .ok_or_else(|| Error::UnknownPart(self.signature.clone()))?
            .clone();
        self.part_desc = part.attr("desc").unwrap_or(&part_id).to_string();

        let flash = part.memory("flash").ok_or_else(|| Error::MissingMemory {
            part: part_id.clone(),
            memory: "flash".into(),
        })?;
        let flash_size = require(flash, "size")?;
        let num_pages = require(flash, "num_pages")?;
        let max_write_delay = require(flash, "max_write_delay")?;
        let n_page_erase = part.int_attr_or("n_page_erase", 1)?;
        let chip_erase_delay = part.int_attr("chip_erase_delay")?.ok_or_else(|| {
            Error::ConfigValue {
                key: "chip_erase_delay".into(),
                value: "<missing>".into(),
            }
        })?;
        let page_size = n_page_erase * flash_size / num_pages;
        self.write_sleep = Duration::from_micros(max_write_delay as u64);
        self.erase_sleep = Duration::from_micros((chip_erase_delay * n_page_erase) as u64);

        let info = self
            .connection
            .control_in(DEV_READ_FLASH, (flash_size - 4) as u16, 4)?;
        let mut cfg_word_0 = u16::from_le_bytes([info[0], info[1]]);
        let cfg_word_1 = u16::from_le_bytes([info[2], info[3]]);
        let num_bl_pages = (cfg_word_0 & 0xff) as u32;
        cfg_word_0 &= !0xff;
        let vector = ((cfg_word_0 >> 8) & 0x1f) as u32;

        let num_user_pages = num_pages - num_bl_pages;
        let bootloader_start = num_user_pages * page_size;
        self.layout = FlashLayout {
            flash_size,
            page_size,
            num_pages,
            n_page_erase,
            num_bl_pages,
            num_user_pages,
            bootloader_start,
            user_size: bootloader_start - END_SIZE,
            vector,
            cfg_word_0,
            cfg_word_1,
        };
        self.end_data = vec![0xff; END_SIZE as usize];
        self.part = part;
        self.part_id = part_id;
        debug!(
            "probed {} ({}), layout {:?}",
            self.part_id, self.signature, self.layout
        );
        Ok(())
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    pub fn part(&self) -> &Section {
        &self.part
    }

    pub fn part_id(&self) -> &str {
        &self.part_id
    }

    pub fn part_desc(&self) -> &str {
        &self.part_desc
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn signature_bytes(&self) -> [u8; 3] {
        self.signature_bytes
    }

    pub fn write_sleep(&self) -> Duration {
        self.write_sleep
    }

    pub fn erase_sleep(&self) -> Duration {
        self.erase_sleep
    }

    pub fn describe(&self) -> String {
        self.connection.describe()
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Sends a command, unless this is a dry run. Mode switches go
    /// through even then so dry runs can exercise the full flow.
    fn cmd(&mut self, request: u8, value: u16, index: u16) -> Result<(), Error> {
        if !self.dry_run || request == CMD_ENTER || request == CMD_EXIT {
            self.connection.control_out(request, value, index)?;
        }
        Ok(())
    }

    /// Erases all user pages, highest first
    pub fn erase_device(&mut self, progress: &mut dyn ProgressCallbacks) -> Result<(), Error> {
        progress.init("Erasing", self.layout.num_user_pages as usize);
        for page in (1..=self.layout.num_user_pages).rev() {
            self.cmd(CMD_PAGE_ERASE, 0, ((page - 1) * self.layout.page_size) as u16)?;
            sleep(self.erase_sleep);
            progress.update((self.layout.num_user_pages - page + 1) as usize);
        }
        progress.finish();
        Ok(())
    }

    /// Streams an image into flash starting at `start`, one 16-bit word
    /// at a time, committing the page buffer at page boundaries and at
    /// the end of the data. Words past `user_size` are diverted into the
    /// tinyvectortable staging buffer unless `finish` is set.
    pub fn write_flash(
        &mut self,
        label: &str,
        start: u32,
        data: &[u8],
        finish: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        if !finish && start + data.len() as u32 > self.layout.user_size {
            let end_start = start.saturating_sub(self.layout.user_size) as usize;
            let from = (end_start as u32 + self.layout.user_size - start) as usize;
            let copy = (data.len() - from).min(self.end_data.len().saturating_sub(end_start));
            self.end_data[end_start..end_start + copy].copy_from_slice(&data[from..from + copy]);
        }
        // First pass counts the pages so progress has a total
        let total = self.write_words(start, data, finish, true, &mut NoProgress)?;
        progress.init(label, total);
        self.write_words(start, data, finish, false, progress)?;
        progress.finish();
        Ok(())
    }

    fn write_words(
        &mut self,
        start: u32,
        data: &[u8],
        finish: bool,
        just_count: bool,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<usize, Error> {
        let wps = self.layout.page_size / self.layout.n_page_erase;
        let words = data.len() / 2;
        let mut count = 0;
        let mut empty = true;
        for (k, pair) in data.chunks_exact(2).enumerate() {
            let mut word = u16::from_le_bytes([pair[0], pair[1]]);
            let last = k + 1 == words;
            let addr = start + k as u32 * 2;
            if addr >= self.layout.user_size && !finish {
                word = 0xffff;
            }
            if word != 0xffff {
                empty = false;
                if !just_count {
                    self.cmd(CMD_BUF_WRITE, word, addr as u16)?;
                }
            }
            let next = addr + 2;
            if (next % wps == 0 || last) && !empty {
                if !just_count {
                    let page = (next - 1) & !(wps - 1);
                    self.cmd(CMD_PAGE_WRITE, 0, page as u16)?;
                    sleep(self.write_sleep);
                }
                empty = true;
                count += 1;
                if !just_count {
                    progress.update(count);
                }
            }
        }
        Ok(count)
    }

    /// Writes the staged tinyvectortable and resets the staging buffer.
    /// Returns what was written so callers can verify it.
    pub fn write_flash_end(
        &mut self,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<Vec<u8>, Error> {
        let end_data = std::mem::take(&mut self.end_data);
        self.write_flash("Flashing", self.layout.user_size, &end_data, true, progress)?;
        self.end_data =
            vec![0xff; (self.layout.bootloader_start - self.layout.user_size) as usize];
        Ok(end_data)
    }

    /// Reads part of a device memory region. A `length` of `None` means
    /// "to the end of the region".
    pub fn read_region(
        &mut self,
        region: &str,
        start: u32,
        length: Option<u32>,
        label: &str,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<Vec<u8>, Error> {
        let (request, reader_offset) =
            region_reader(region).ok_or_else(|| Error::UnknownRegion(region.into()))?;
        let reader_offset = reader_offset + start;
        let memory = self.part.memory(region).ok_or_else(|| Error::MissingMemory {
            part: self.part_id.clone(),
            memory: region.into(),
        })?;
        let memory_offset = memory_int_or(memory, "offset", 0)?;

        let (read_offset, read_len, length) = if region == "signature" {
            let length = length.unwrap_or(3);
            if reader_offset + length > 3 {
                return Err(Error::ReadTooLarge {
                    region: region.into(),
                });
            }
            // Always read the whole block for simplicity
            (memory_offset, 5, length)
        } else {
            let region_size = memory_int_or(memory, "size", 0)?;
            let read_len = match length {
                None => region_size.saturating_sub(start),
                Some(len) => {
                    if start + len > region_size {
                        return Err(Error::ReadTooLarge {
                            region: region.into(),
                        });
                    }
                    len
                }
            };
            (reader_offset + memory_offset, read_len, read_len)
        };

        progress.init(label, length.div_ceil(READ_CHUNK) as usize);
        let mut data = Vec::with_capacity(read_len as usize);
        let mut offset = read_offset;
        let mut chunks = 0;
        while offset < read_offset + read_len {
            let n = (read_offset + read_len - offset).min(READ_CHUNK);
            data.extend(self.connection.control_in(request, offset as u16, n as usize)?);
            chunks += 1;
            progress.update(chunks);
            offset += n;
        }
        progress.finish();

        if region == "signature" {
            let sig: Vec<u8> = data.iter().rev().step_by(2).copied().collect();
            let start = start as usize;
            let end = (start + length as usize).min(sig.len());
            return Ok(sig[start.min(end)..end].to_vec());
        }
        Ok(data)
    }

    /// Sends a mode-switch command and waits for the device to come back
    pub fn reenumerate(
        &mut self,
        request: u8,
        label: &str,
        progress: &mut dyn ProgressCallbacks,
    ) -> Result<(), Error> {
        self.cmd(request, 0, 0)?;
        progress.init(label, 0);
        self.connection.reenumerate(progress)?;
        progress.finish();
        Ok(())
    }

    /// Leaves the bootloader and starts the application
    pub fn run_app(&mut self) -> Result<(), Error> {
        self.cmd(CMD_EXIT, 0, 0)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Records all traffic and serves reads from in-memory buffers
    #[derive(Debug)]
    pub(crate) struct MockConnection {
        pub version: (u8, u8),
        pub flash: Vec<u8>,
        pub eeprom: Vec<u8>,
        pub fuses: [u8; 4],
        pub sig_raw: [u8; 5],
        pub commands: Vec<(u8, u16, u16)>,
        pub reenumerations: usize,
    }

    impl MockConnection {
        pub fn new(flash_size: usize, signature: [u8; 3], cfg_word_0: u16, cfg_word_1: u16) -> Self {
            let mut flash = vec![0xff; flash_size];
            flash[flash_size - 4..flash_size - 2].copy_from_slice(&cfg_word_0.to_le_bytes());
            flash[flash_size - 2..].copy_from_slice(&cfg_word_1.to_le_bytes());
            MockConnection {
                version: (2, 0),
                flash,
                eeprom: vec![0xff; 512],
                fuses: [0x62, 0xff, 0xdf, 0xff],
                sig_raw: [signature[0], 0, signature[1], 0, signature[2]],
                commands: Vec::new(),
                reenumerations: 0,
            }
        }

        pub fn page_writes(&self) -> Vec<u16> {
            self.commands
                .iter()
                .filter(|(req, _, _)| *req == CMD_PAGE_WRITE)
                .map(|(_, _, index)| *index)
                .collect()
        }

        pub fn page_erases(&self) -> Vec<u16> {
            self.commands
                .iter()
                .filter(|(req, _, _)| *req == CMD_PAGE_ERASE)
                .map(|(_, _, index)| *index)
                .collect()
        }
    }

    impl Connection for MockConnection {
        fn control_out(&mut self, request: u8, value: u16, index: u16) -> Result<(), Error> {
            self.commands.push((request, value, index));
            if request == CMD_BUF_WRITE {
                let i = index as usize;
                self.flash[i..i + 2].copy_from_slice(&value.to_le_bytes());
            }
            Ok(())
        }

        fn control_in(&mut self, request: u8, index: u16, len: usize) -> Result<Vec<u8>, Error> {
            let index = index as usize;
            let source: &[u8] = match request {
                DEV_READ_SIG => &self.sig_raw,
                DEV_READ_FLASH => &self.flash,
                DEV_READ_EEPROM => &self.eeprom,
                DEV_READ_FUSE => &self.fuses,
                _ => return Err(Error::ShortUsbRead),
            };
            if index + len > source.len() {
                return Err(Error::ShortUsbRead);
            }
            Ok(source[index..index + len].to_vec())
        }

        fn device_version(&self) -> (u8, u8) {
            self.version
        }

        fn reenumerate(&mut self, _progress: &mut dyn ProgressCallbacks) -> Result<(), Error> {
            self.reenumerations += 1;
            Ok(())
        }

        fn describe(&self) -> String {
            "mock device".into()
        }
    }

    pub(crate) const TEST_CONFIG: &str = r#"
part
    id = "t85" ;
    desc = "ATtiny85" ;
    signature = 0x1e 0x93 0x0b ;
    chip_erase_delay = 400 ;
    memory "flash"
        size = 0x2000 ;
        num_pages = 128 ;
        max_write_delay = 450 ;
    ;
    memory "eeprom"
        size = 0x200 ;
        max_write_delay = 450 ;
    ;
    memory "signature"
        size = 3 ;
    ;
    memory "lfuse"
        size = 1 ;
    ;
    memory "hfuse"
        size = 1 ;
    ;
    memory "efuse"
        size = 1 ;
    ;
    memory "lock"
        size = 1 ;
    ;
;
"#;

    /// cfg_word_0: 32 bootloader pages, USB vector 4
    pub(crate) const TEST_CFG_WORD_0: u16 = 0x0420;
    pub(crate) const TEST_CFG_WORD_1: u16 = 0xbeef;

    pub(crate) fn test_db() -> ConfigDb {
        let mut db = ConfigDb::new();
        db.parse(TEST_CONFIG, "test.conf")
            .expect("test configuration parses");
        db
    }

    pub(crate) fn test_flasher() -> Flasher<MockConnection> {
        let connection =
            MockConnection::new(0x2000, [0x1e, 0x93, 0x0b], TEST_CFG_WORD_0, TEST_CFG_WORD_1);
        Flasher::probe(connection, &test_db(), false).expect("probe succeeds")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{
        mock::{test_db, test_flasher, MockConnection, TEST_CFG_WORD_1},
        *,
    };
    use crate::progress::NoProgress;

    #[test]
    fn probe_derives_layout() {
        let flasher = test_flasher();
        let layout = flasher.layout();
        assert_eq!(flasher.signature(), "1e930b");
        assert_eq!(flasher.part_id(), "t85");
        assert_eq!(flasher.part_desc(), "ATtiny85");
        assert_eq!(layout.flash_size, 0x2000);
        assert_eq!(layout.page_size, 64);
        assert_eq!(layout.num_bl_pages, 32);
        assert_eq!(layout.num_user_pages, 96);
        assert_eq!(layout.bootloader_start, 0x1800);
        assert_eq!(layout.user_size, 0x17fc);
        assert_eq!(layout.vector, 4);
        // The bootloader page count is masked out of the first word
        assert_eq!(layout.cfg_word_0, 0x0400);
        assert_eq!(layout.cfg_word_1, TEST_CFG_WORD_1);
    }

    #[test]
    fn probe_rejects_unknown_signature() {
        let connection = MockConnection::new(0x2000, [0xaa, 0xbb, 0xcc], 0x0420, 0);
        let err = Flasher::probe(connection, &test_db(), false).unwrap_err();
        assert!(matches!(err, Error::UnknownPart(sig) if sig == "aabbcc"));
    }

    #[test]
    fn probe_rejects_wrong_version() {
        let mut connection = MockConnection::new(0x2000, [0x1e, 0x93, 0x0b], 0x0420, 0);
        connection.version = (3, 1);
        let err = Flasher::probe(connection, &test_db(), false).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedBootloaderVersion { major: 3, minor: 1 }
        ));
    }

    #[test]
    fn erase_walks_pages_downward() {
        let mut flasher = test_flasher();
        flasher.erase_device(&mut NoProgress).unwrap();
        let erases = flasher.connection.page_erases();
        assert_eq!(erases.len(), 96);
        assert_eq!(erases[0], 95 * 64);
        assert_eq!(*erases.last().unwrap(), 0);
    }

    #[test]
    fn write_flash_commits_one_page_per_dirty_page() {
        let mut flasher = test_flasher();
        // Page 0 dirty, page 1 clean, page 2 dirty
        let mut data = vec![0xff; 192];
        data[0] = 0x12;
        data[1] = 0x34;
        data[130] = 0x56;
        flasher
            .write_flash("Flashing", 0, &data, false, &mut NoProgress)
            .unwrap();
        assert_eq!(flasher.connection.page_writes(), vec![0, 128]);
        let words: Vec<(u16, u16)> = flasher
            .connection
            .commands
            .iter()
            .filter(|(req, _, _)| *req == CMD_BUF_WRITE)
            .map(|(_, value, index)| (*value, *index))
            .collect();
        assert_eq!(words, vec![(0x3412, 0), (0xff56, 130)]);
    }

    #[test]
    fn short_tail_commits_partial_page() {
        let mut flasher = test_flasher();
        flasher
            .write_flash("Flashing", 0x100, &[0x01, 0x02, 0x03, 0x04], false, &mut NoProgress)
            .unwrap();
        // The last word of the data forces a commit mid-page
        assert_eq!(flasher.connection.page_writes(), vec![0x100]);
    }

    #[test]
    fn words_past_user_size_are_staged() {
        let mut flasher = test_flasher();
        let user_size = flasher.layout().user_size;
        let mut data = vec![0xff; 0x1800];
        data[0] = 0x0c;
        data[1] = 0xc0;
        data[user_size as usize..].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        flasher
            .write_flash("Flashing", 0, &data, false, &mut NoProgress)
            .unwrap();
        // Nothing past user_size was written yet
        assert!(flasher
            .connection
            .commands
            .iter()
            .all(|(req, _, index)| *req != CMD_BUF_WRITE || (*index as u32) < user_size));

        let staged = flasher.write_flash_end(&mut NoProgress).unwrap();
        assert_eq!(staged, vec![0x11, 0x22, 0x33, 0x44]);
        let words: Vec<(u16, u16)> = flasher
            .connection
            .commands
            .iter()
            .filter(|(req, _, index)| *req == CMD_BUF_WRITE && (*index as u32) >= user_size)
            .map(|(_, value, index)| (*value, *index))
            .collect();
        assert_eq!(
            words,
            vec![(0x2211, user_size as u16), (0x4433, user_size as u16 + 2)]
        );
    }

    #[test]
    fn read_region_chunks_and_slices_signature() {
        let mut flasher = test_flasher();
        let sig = flasher
            .read_region("signature", 0, None, "Reading", &mut NoProgress)
            .unwrap();
        // The raw block is sliced backwards every other byte
        assert_eq!(sig, vec![0x0b, 0x93, 0x1e]);
    }

    #[test]
    fn read_region_to_end() {
        let mut flasher = test_flasher();
        let data = flasher
            .read_region("eeprom", 0x1f0, None, "Reading", &mut NoProgress)
            .unwrap();
        assert_eq!(data.len(), 0x10);
    }

    #[test]
    fn read_region_rejects_overrun() {
        let mut flasher = test_flasher();
        let err = flasher
            .read_region("eeprom", 0x1f0, Some(0x20), "Reading", &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, Error::ReadTooLarge { .. }));
    }

    #[test]
    fn fuse_reads_use_device_offsets() {
        let mut flasher = test_flasher();
        let hfuse = flasher
            .read_region("hfuse", 0, None, "Reading", &mut NoProgress)
            .unwrap();
        assert_eq!(hfuse, vec![0xff]);
        let lfuse = flasher
            .read_region("lfuse", 0, None, "Reading", &mut NoProgress)
            .unwrap();
        assert_eq!(lfuse, vec![0x62]);
    }

    #[test]
    fn dry_run_gates_writes_but_not_mode_switches() {
        let connection = MockConnection::new(0x2000, [0x1e, 0x93, 0x0b], 0x0420, 0);
        let mut flasher = Flasher::probe(connection, &test_db(), true).unwrap();
        flasher.erase_device(&mut NoProgress).unwrap();
        flasher
            .write_flash("Flashing", 0, &[0x12, 0x34], false, &mut NoProgress)
            .unwrap();
        assert!(flasher.connection.commands.is_empty());
        flasher.run_app().unwrap();
        assert_eq!(flasher.connection.commands, vec![(CMD_EXIT, 0, 0)]);
    }
}
