//! Drag-and-drop firmware update.
//!
//! The host copies a firmware file onto the virtual volume.  Writes to the root directory are
//! scanned for a file with a known extension.  Once one is accepted, the data blocks starting at
//! its first cluster are streamed to the target: the chip is erased on the first data block, then
//! every 512 bytes received are programmed as a page.  When the whole file has been programmed, or
//! as soon as anything goes wrong, the session ends and the outcome is published for the
//! foreground loop, which disconnects USB so the host re-reads the volume.

use crate::fat::{DirEntry, Geometry, DIR_ENTRY_SIZE, SECTOR_SIZE};
use crate::fmt::{debug, error, info, trace, warn};
use crate::target::{TargetFlash, TargetState};
use core::fmt;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

/// Flash programming granularity.
pub const PAGE_SIZE: usize = 512;

/// Why a firmware update was abandoned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AbortReason {
    SwdError,
    BadExtensionFile,
    NotConsecutiveSectors,
    SwdPortInUse,
    ReservedBits,
    BadStartSector,
    Timeout,
}

impl AbortReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AbortReason::SwdError => "SWD ERROR",
            AbortReason::BadExtensionFile => "BAD EXTENSION FILE",
            AbortReason::NotConsecutiveSectors => "NOT CONSECUTIVE SECTORS",
            AbortReason::SwdPortInUse => "SWD PORT IN USE",
            AbortReason::ReservedBits => "RESERVED BITS",
            AbortReason::BadStartSector => "BAD START SECTOR",
            AbortReason::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session ended.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionEnd {
    /// The whole file was programmed.  Disconnect.
    Flashed,
    /// The update was abandoned.  Disconnect.
    Failed(AbortReason),
    /// A `~AUTORST` file was programmed and the target released from reset.  Stay connected.
    ResetTarget,
    /// A `~AUTOCRP` file was programmed.  Disconnect and enter the bootloader.
    EnterBootloader,
}

pub type SessionSignal = Signal<CriticalSectionRawMutex, SessionEnd>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FileKind {
    Bin,
    Par,
    Dow,
    Crd,
}

/// A file extension accepted as firmware, and where in target flash that firmware goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExtensionMapping {
    pub kind: FileKind,
    pub extension: [u8; 3],
    pub flash_offset: u32,
}

impl ExtensionMapping {
    const fn new(kind: FileKind, extension: &[u8; 3]) -> Self {
        Self {
            kind,
            extension: *extension,
            flash_offset: 0,
        }
    }
}

pub const DEFAULT_EXTENSIONS: [ExtensionMapping; 5] = [
    ExtensionMapping::new(FileKind::Bin, b"BIN"),
    ExtensionMapping::new(FileKind::Bin, b"bin"),
    ExtensionMapping::new(FileKind::Par, b"PAR"),
    ExtensionMapping::new(FileKind::Dow, b"DOW"),
    ExtensionMapping::new(FileKind::Crd, b"CRD"),
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SequencerConfig {
    /// Target core clock passed to the flash algorithm.
    pub flash_clock_hz: u32,
    pub extensions: &'static [ExtensionMapping],
    /// Honour the `~AUTORST` and `~AUTOCRP` file names.
    pub board_actions: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            flash_clock_hz: 50_000_000,
            extensions: &DEFAULT_EXTENSIONS,
            board_actions: false,
        }
    }
}

/// What a directory entry looks like to the scanner.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Classification {
    Firmware(ExtensionMapping),
    /// A plausible 8.3 name whose extension is not firmware.
    Unsupported,
    /// Free, deleted, long-name or label entries and anything else that is not a file name.
    Skip,
}

pub fn classify(entry: &DirEntry, extensions: &[ExtensionMapping]) -> Classification {
    if let Some(mapping) = extensions.iter().find(|m| m.extension == entry.ext) {
        return Classification::Firmware(*mapping);
    }
    let letter = |c: u8| c.is_ascii_alphabetic();
    let letter_or_space = |c: u8| c.is_ascii_alphabetic() || c == b' ';
    let [e0, e1, e2] = entry.ext;
    if letter(e0) && letter_or_space(e1) && letter_or_space(e2) && letter(entry.name[0]) {
        Classification::Unsupported
    } else {
        Classification::Skip
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum BoardAction {
    AutoReset,
    EnterBootloader,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct AcceptedFile {
    kind: FileKind,
    action: Option<BoardAction>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// No firmware file seen yet.
    Idle,
    /// A file was accepted; waiting for its first data block.
    Accepted,
    /// The chip has been erased and pages are being programmed.
    Programming,
}

/// State of one update attempt.  A fresh `Session` is exactly the state after connect or after
/// any session ends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Session {
    reason: Option<AbortReason>,
    size: u32,
    begin_sector: u32,
    nb_sector: u32,
    good_file: Option<AcceptedFile>,
    flash_addr_offset: u32,
    sector_received_first: bool,
    root_dir_received_first: bool,
    erase_pending: bool,
    programming: bool,
    page: [u8; PAGE_SIZE],
    page_len: usize,
    flash_offset: u32,
}

impl Session {
    pub const fn new() -> Self {
        Self {
            reason: None,
            size: 0,
            begin_sector: 0,
            nb_sector: 0,
            good_file: None,
            flash_addr_offset: 0,
            sector_received_first: false,
            root_dir_received_first: false,
            erase_pending: false,
            programming: false,
            page: [0; PAGE_SIZE],
            page_len: 0,
            flash_offset: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        match (self.good_file, self.programming) {
            (None, _) => Phase::Idle,
            (Some(_), false) => Phase::Accepted,
            (Some(_), true) => Phase::Programming,
        }
    }

    pub fn reason(&self) -> Option<AbortReason> {
        self.reason
    }

    /// Size in bytes of the accepted file.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// First volume block of the accepted file.
    pub fn begin_sector(&self) -> u32 {
        self.begin_sector
    }

    pub fn sector_count(&self) -> u32 {
        self.nb_sector
    }

    pub fn file_kind(&self) -> Option<FileKind> {
        self.good_file.map(|f| f.kind)
    }

    /// Bytes programmed so far.
    pub fn flash_offset(&self) -> u32 {
        self.flash_offset
    }

    // Volume byte address the next data write must start at.
    fn cursor(&self) -> u32 {
        self.begin_sector * SECTOR_SIZE as u32 + self.flash_offset + self.page_len as u32
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns host writes to the virtual volume into target flash operations.
pub struct Sequencer<'d, F: TargetFlash> {
    geometry: Geometry,
    config: SequencerConfig,
    session: Session,
    flash: F,
    signal: &'d SessionSignal,
}

impl<'d, F: TargetFlash> Sequencer<'d, F> {
    pub fn new(
        geometry: Geometry,
        config: SequencerConfig,
        flash: F,
        signal: &'d SessionSignal,
    ) -> Self {
        Self {
            geometry,
            config,
            session: Session::new(),
            flash,
            signal,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Start over with a fresh session, as on USB connect.
    pub fn connect(&mut self) {
        self.session = Session::new();
    }

    /// Handle `data` written by the host at volume byte address `addr`.
    ///
    /// Never fails: problems end the session and are reported through the signal.
    pub fn write(&mut self, addr: u32, data: &[u8]) {
        let block = addr / SECTOR_SIZE as u32;
        if self.geometry.is_root_dir_block(block) {
            self.root_dir_write(addr, data);
        } else if block >= self.geometry.first_file_block() {
            self.data_write(addr, data);
        }
    }

    fn root_dir_write(&mut self, addr: u32, data: &[u8]) {
        if self.session.good_file.is_some() {
            // begin_sector and size are fixed for the rest of the session.
            return;
        }
        if addr as usize % DIR_ENTRY_SIZE != 0 {
            trace!("unaligned root directory write at {:#x}", addr);
            return;
        }
        match self.scan_root_dir(data) {
            Ok(Some(_)) => {
                if !self.session.sector_received_first {
                    self.session.root_dir_received_first = true;
                    self.session.erase_pending = true;
                }
            }
            Ok(None) => {}
            Err(reason) => self.abort(reason),
        }
    }

    /// Look for a firmware file in the first two directory entries of `data`.
    ///
    /// Returns the index of the accepted entry.  On success the session records the file's size,
    /// first block and block count.  An unsupported 8.3 name or a directory rejects the write.
    pub fn scan_root_dir(&mut self, data: &[u8]) -> Result<Option<usize>, AbortReason> {
        let mut entries = [None; 2];
        for (slot, raw) in entries.iter_mut().zip(data.chunks_exact(DIR_ENTRY_SIZE)) {
            let mut bytes = [0u8; DIR_ENTRY_SIZE];
            bytes.copy_from_slice(raw);
            *slot = Some(DirEntry::parse(&bytes));
        }
        if entries.iter().flatten().any(|e| e.is_directory()) {
            warn!("directory in root directory write");
            return Err(AbortReason::BadExtensionFile);
        }

        for (i, entry) in entries.iter().flatten().enumerate() {
            let mapping = match classify(entry, self.config.extensions) {
                Classification::Firmware(mapping) => mapping,
                Classification::Unsupported => {
                    warn!("unsupported file extension {:?}", entry.ext);
                    return Err(AbortReason::BadExtensionFile);
                }
                Classification::Skip => continue,
            };
            if entry.size == 0 {
                // The host creates the entry first and fills in the size later.
                continue;
            }

            let begin = match self.geometry.cluster_to_block(entry.first_cluster_lo) {
                Some(b) if b < self.geometry.total_sectors => b,
                _ => {
                    warn!("firmware file at invalid cluster {}", entry.first_cluster_lo);
                    return Err(AbortReason::BadStartSector);
                }
            };

            let action = self.board_action(entry);
            let s = &mut self.session;
            s.size = entry.size;
            s.begin_sector = begin;
            s.nb_sector = (entry.size + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
            s.flash_addr_offset = mapping.flash_offset;
            s.good_file = Some(AcceptedFile {
                kind: mapping.kind,
                action,
            });
            info!(
                "accepted {:?} file: {} bytes at block {}",
                mapping.kind,
                entry.size,
                begin
            );
            return Ok(Some(i));
        }
        Ok(None)
    }

    fn board_action(&self, entry: &DirEntry) -> Option<BoardAction> {
        if !self.config.board_actions {
            return None;
        }
        match &entry.name {
            b"~AUTORST" => Some(BoardAction::AutoReset),
            b"~AUTOCRP" => Some(BoardAction::EnterBootloader),
            _ => None,
        }
    }

    fn data_write(&mut self, addr: u32, data: &[u8]) {
        if !self.session.root_dir_received_first {
            self.session.sector_received_first = true;
        }
        if self.session.good_file.is_none() {
            return;
        }
        let block = addr / SECTOR_SIZE as u32;
        if block < self.session.begin_sector {
            return;
        }

        if !self.session.programming {
            if addr != self.session.begin_sector * SECTOR_SIZE as u32 {
                warn!("first data write at {:#x}, not at the start of the file", addr);
                return self.abort(AbortReason::BadStartSector);
            }
            if !self.session.erase_pending {
                // Data arrived before the directory entry, so part of the file was missed.
                warn!("file data preceded its directory entry");
                return self.abort(AbortReason::BadStartSector);
            }
            if self.erase().is_err() {
                return self.abort(AbortReason::SwdError);
            }
            self.session.erase_pending = false;
            self.session.programming = true;
        }

        let cursor = self.session.cursor();
        if addr < cursor {
            trace!("ignoring rewrite at {:#x}", addr);
            return;
        }
        if addr > cursor {
            warn!("gap in file data: expected {:#x}, got {:#x}", cursor, addr);
            return self.abort(AbortReason::NotConsecutiveSectors);
        }

        let mut rest = data;
        while !rest.is_empty() {
            let s = &mut self.session;
            let n = (PAGE_SIZE - s.page_len).min(rest.len());
            s.page[s.page_len..s.page_len + n].copy_from_slice(&rest[..n]);
            s.page_len += n;
            rest = &rest[n..];
            if s.page_len == PAGE_SIZE {
                let address = s.flash_addr_offset + s.flash_offset;
                debug!("program page at {:#x}", address);
                if self.flash.program_page(address, &s.page).is_err() {
                    error!("programming page at {:#x} failed", address);
                    return self.abort(AbortReason::SwdError);
                }
                let s = &mut self.session;
                s.flash_offset += PAGE_SIZE as u32;
                s.page_len = 0;
            }
        }

        let end_block = (addr + data.len() as u32) / SECTOR_SIZE as u32;
        let s = &self.session;
        if end_block >= s.begin_sector + s.nb_sector && s.flash_offset >= s.size {
            info!("firmware programmed: {} bytes", s.flash_offset);
            self.finish(true);
        }
    }

    fn erase(&mut self) -> Result<(), crate::target::FlashError> {
        info!("erasing target flash");
        self.flash.set_target_state(TargetState::ResetProgram)?;
        self.flash.init(self.config.flash_clock_hz)?;
        self.flash.erase_chip()
    }

    fn abort(&mut self, reason: AbortReason) {
        error!("update aborted: {}", reason.as_str());
        self.session.reason = Some(reason);
        self.finish(false);
    }

    /// End the session, publish the outcome and reset to a fresh session.
    fn finish(&mut self, success: bool) {
        let action = self.session.good_file.and_then(|f| f.action);
        let end = match (success, action) {
            (false, _) => SessionEnd::Failed(self.session.reason.unwrap_or(AbortReason::SwdError)),
            (true, None) => SessionEnd::Flashed,
            (true, Some(BoardAction::AutoReset)) => {
                match self.flash.set_target_state(TargetState::ResetRun) {
                    Ok(()) => SessionEnd::ResetTarget,
                    Err(_) => SessionEnd::Failed(AbortReason::SwdError),
                }
            }
            (true, Some(BoardAction::EnterBootloader)) => SessionEnd::EnterBootloader,
        };
        self.session = Session::new();
        self.signal.signal(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::{ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_LONG_NAME, LPC1768};
    use crate::mock::{FlashCall, RecordingFlash};
    use std::vec::Vec;

    const ROOT: u32 = 3 * 512;

    fn entry(name: &[u8; 8], ext: &[u8; 3], cluster: u16, size: u32) -> DirEntry {
        DirEntry {
            name: *name,
            ext: *ext,
            attributes: ATTR_ARCHIVE,
            first_cluster_lo: cluster,
            size,
            ..DirEntry::default()
        }
    }

    fn dir_write(entries: [DirEntry; 2]) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&entries[0].to_bytes());
        v.extend_from_slice(&entries[1].to_bytes());
        v
    }

    fn label() -> DirEntry {
        DirEntry::volume_label(*b"MBED       ")
    }

    fn sequencer(flash: RecordingFlash, signal: &SessionSignal) -> Sequencer<'_, RecordingFlash> {
        Sequencer::new(LPC1768, SequencerConfig::default(), flash, signal)
    }

    // Write `data` from byte `start` in 64-byte packets, the way the mass storage class does.
    fn write_packets(seq: &mut Sequencer<'_, RecordingFlash>, start: u32, data: &[u8]) {
        for (i, chunk) in data.chunks(64).enumerate() {
            seq.write(start + (i * 64) as u32, chunk);
        }
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn accepts_firmware_file() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        let dir = dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1000)]);
        assert_eq!(seq.scan_root_dir(&dir), Ok(Some(1)));

        let s = seq.session();
        assert_eq!(s.phase(), Phase::Accepted);
        assert_eq!(s.size(), 1000);
        assert_eq!(s.begin_sector(), 5);
        assert_eq!(s.sector_count(), 2);
        assert_eq!(s.file_kind(), Some(FileKind::Bin));
    }

    #[test]
    fn classification() {
        let ext = &DEFAULT_EXTENSIONS;
        assert!(matches!(
            classify(&entry(b"A       ", b"bin", 2, 1), ext),
            Classification::Firmware(_)
        ));
        assert_eq!(classify(&entry(b"README  ", b"TXT", 2, 1), ext), Classification::Unsupported);
        assert_eq!(classify(&entry(b"README  ", b"C  ", 2, 1), ext), Classification::Unsupported);
        assert_eq!(classify(&label(), ext), Classification::Skip);
        assert_eq!(classify(&entry(b"_ABC    ", b"TXT", 2, 1), ext), Classification::Skip);
        assert_eq!(classify(&entry(b"\xe5BC     ", b"TXT", 2, 1), ext), Classification::Skip);
        assert_eq!(classify(&DirEntry::default(), ext), Classification::Skip);
        assert_eq!(classify(&entry(b"FILE1   ", b"T1 ", 2, 1), ext), Classification::Skip);
    }

    #[test]
    fn long_name_entries_are_skipped() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        // Long-name slots carry UTF-16 fragments where the extension would be.
        let mut lfn = entry(b"Af\0i\0r\0m", b"\0w\0", 0, 0);
        lfn.attributes = ATTR_LONG_NAME;
        let dir = dir_write([lfn, entry(b"FIRMWA~1", b"BIN", 4, 512)]);
        assert_eq!(seq.scan_root_dir(&dir), Ok(Some(1)));
        assert_eq!(seq.session().begin_sector(), 5 + 2 * 8);
    }

    #[test]
    fn unsupported_extension_rejects_and_resets() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        let dir = dir_write([label(), entry(b"NOTES   ", b"TXT", 2, 10)]);
        seq.write(ROOT, &dir);

        assert_eq!(signal.try_take(), Some(SessionEnd::Failed(AbortReason::BadExtensionFile)));
        assert_eq!(seq.session(), &Session::new());
    }

    #[test]
    fn directory_rejects() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        let mut dir = entry(b"SYSTEM~1", b"   ", 2, 0);
        dir.attributes = ATTR_DIRECTORY;
        assert_eq!(
            seq.scan_root_dir(&dir_write([label(), dir])),
            Err(AbortReason::BadExtensionFile)
        );
        // Checked before anything is accepted.
        assert_eq!(
            seq.scan_root_dir(&dir_write([entry(b"FIRMWARE", b"BIN", 2, 512), dir])),
            Err(AbortReason::BadExtensionFile)
        );
        assert_eq!(seq.session().phase(), Phase::Idle);
    }

    #[test]
    fn empty_file_and_bad_cluster() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        let dir = dir_write([entry(b"FIRMWARE", b"BIN", 2, 0), label()]);
        assert_eq!(seq.scan_root_dir(&dir), Ok(None));
        assert_eq!(seq.session().phase(), Phase::Idle);

        let dir = dir_write([entry(b"FIRMWARE", b"BIN", 1, 100), label()]);
        assert_eq!(seq.scan_root_dir(&dir), Err(AbortReason::BadStartSector));
        let dir = dir_write([entry(b"FIRMWARE", b"BIN", 0xfff0, 100), label()]);
        assert_eq!(seq.scan_root_dir(&dir), Err(AbortReason::BadStartSector));
    }

    #[test]
    fn erase_then_program_in_order() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        let fw = image(1536);

        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1536)]));
        write_packets(&mut seq, 5 * 512, &fw);

        let calls = flash.calls();
        assert_eq!(
            &calls[..3],
            &[
                FlashCall::State(TargetState::ResetProgram),
                FlashCall::Init(50_000_000),
                FlashCall::Erase
            ]
        );
        assert_eq!(calls.iter().filter(|c| **c == FlashCall::Erase).count(), 1);
        let pages = flash.programmed();
        assert_eq!(pages.len(), 3);
        for (i, (address, data)) in pages.iter().enumerate() {
            assert_eq!(*address, (i * 512) as u32);
            assert_eq!(&data[..], &fw[i * 512..(i + 1) * 512]);
        }
        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
        assert_eq!(seq.session(), &Session::new());
    }

    #[test]
    fn odd_sized_chunks_accumulate() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        let fw = image(1024);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1024)]));

        let mut addr = 5 * 512;
        for chunk in fw.chunks(100) {
            seq.write(addr, chunk);
            addr += chunk.len() as u32;
        }
        let pages = flash.programmed();
        assert_eq!(pages.len(), 2);
        assert_eq!(&pages[1].1[..], &fw[512..]);
        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
    }

    #[test]
    fn last_partial_sector_completes() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 700)]));

        // The host always writes whole sectors, padding the tail.
        let mut fw = image(700);
        fw.resize(1024, 0);
        write_packets(&mut seq, 5 * 512, &fw[..512]);
        assert!(!signal.signaled());
        write_packets(&mut seq, 6 * 512, &fw[512..]);
        assert_eq!(flash.programmed().len(), 2);
        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
    }

    #[test]
    fn short_data_never_completes() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 2048)]));
        write_packets(&mut seq, 5 * 512, &image(1536));

        assert!(!signal.signaled());
        assert_eq!(seq.session().phase(), Phase::Programming);
        assert_eq!(seq.session().flash_offset(), 1536);
    }

    #[test]
    fn writes_outside_the_file_are_ignored() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        // FAT sectors and the boot sector are never interpreted.
        seq.write(0, &[0u8; 64]);
        seq.write(512, &[0xf0, 0xff, 0xff]);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 3, 512)]));
        // Blocks below the file's first cluster.
        write_packets(&mut seq, 5 * 512, &[0u8; 512]);

        assert!(flash.calls().is_empty());
        assert_eq!(seq.session().phase(), Phase::Accepted);
        assert!(!signal.signaled());
    }

    #[test]
    fn later_directory_writes_do_not_move_the_file() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 512)]));
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 9, 4096)]));
        assert_eq!(seq.session().begin_sector(), 5);
        assert_eq!(seq.session().size(), 512);
    }

    #[test]
    fn data_before_directory_aborts() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut seq = sequencer(flash.clone(), &signal);
        write_packets(&mut seq, 5 * 512, &image(512));
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1024)]));
        assert_eq!(seq.session().phase(), Phase::Accepted);

        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(signal.try_take(), Some(SessionEnd::Failed(AbortReason::BadStartSector)));
        assert!(flash.calls().is_empty());
    }

    #[test]
    fn first_data_past_start_aborts() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1024)]));
        seq.write(6 * 512, &[0u8; 64]);
        assert_eq!(signal.try_take(), Some(SessionEnd::Failed(AbortReason::BadStartSector)));
    }

    #[test]
    fn gap_aborts() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 2048)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        write_packets(&mut seq, 7 * 512, &image(512));
        assert_eq!(
            signal.try_take(),
            Some(SessionEnd::Failed(AbortReason::NotConsecutiveSectors))
        );
        // The rest of the host's write lands in a fresh session and is ignored.
        assert_eq!(seq.session().phase(), Phase::Idle);
        assert!(!signal.signaled());
    }

    #[test]
    fn flash_failures_abort_with_swd_error() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash {
            fail_erase: true,
            ..RecordingFlash::default()
        };
        let mut seq = sequencer(flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 512)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(signal.try_take(), Some(SessionEnd::Failed(AbortReason::SwdError)));
        assert!(flash.programmed().is_empty());

        let flash = RecordingFlash {
            fail_program_at: Some(512),
            ..RecordingFlash::default()
        };
        let mut seq = sequencer(flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"FIRMWARE", b"BIN", 2, 1536)]));
        write_packets(&mut seq, 5 * 512, &image(1536));
        assert_eq!(signal.try_take(), Some(SessionEnd::Failed(AbortReason::SwdError)));
        assert_eq!(flash.programmed().len(), 2);
        assert_eq!(seq.session().phase(), Phase::Idle);
    }

    #[test]
    fn flash_offset_from_extension_table() {
        static EXTENSIONS: [ExtensionMapping; 1] = [ExtensionMapping {
            kind: FileKind::Par,
            extension: *b"PAR",
            flash_offset: 0x1000,
        }];
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let config = SequencerConfig {
            extensions: &EXTENSIONS,
            ..SequencerConfig::default()
        };
        let mut seq = Sequencer::new(LPC1768, config, flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"PARAMS  ", b"PAR", 2, 512)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(flash.programmed()[0].0, 0x1000);
        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
    }

    #[test]
    fn board_actions() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let config = SequencerConfig {
            board_actions: true,
            ..SequencerConfig::default()
        };
        let mut seq = Sequencer::new(LPC1768, config, flash.clone(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"~AUTORST", b"BIN", 2, 512)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(signal.try_take(), Some(SessionEnd::ResetTarget));
        assert_eq!(flash.calls().last(), Some(&FlashCall::State(TargetState::ResetRun)));

        seq.write(ROOT, &dir_write([label(), entry(b"~AUTOCRP", b"BIN", 2, 512)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(signal.try_take(), Some(SessionEnd::EnterBootloader));
    }

    #[test]
    fn board_actions_disabled_by_default() {
        let signal = SessionSignal::new();
        let mut seq = sequencer(RecordingFlash::default(), &signal);
        seq.write(ROOT, &dir_write([label(), entry(b"~AUTORST", b"BIN", 2, 512)]));
        write_packets(&mut seq, 5 * 512, &image(512));
        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
    }

    #[test]
    fn reason_strings() {
        assert_eq!(AbortReason::SwdError.as_str(), "SWD ERROR");
        assert_eq!(AbortReason::BadExtensionFile.as_str(), "BAD EXTENSION FILE");
        assert_eq!(AbortReason::NotConsecutiveSectors.as_str(), "NOT CONSECUTIVE SECTORS");
        assert_eq!(std::format!("{}", AbortReason::Timeout), "TIMEOUT");
    }
}
