//! The drive the host sees: reads come from the virtual FAT image, writes feed the update
//! sequencer.

use crate::fat::{Geometry, VirtualFat};
use crate::msc::BlockDevice;
use crate::sequencer::{Sequencer, SequencerConfig, SessionSignal};
use crate::target::TargetFlash;

pub struct FlashDisk<'d, F: TargetFlash> {
    fat: VirtualFat,
    sequencer: Sequencer<'d, F>,
}

impl<'d, F: TargetFlash> FlashDisk<'d, F> {
    pub fn new(
        geometry: Geometry,
        config: SequencerConfig,
        flash: F,
        signal: &'d SessionSignal,
    ) -> Self {
        Self {
            fat: VirtualFat::new(geometry),
            sequencer: Sequencer::new(geometry, config, flash, signal),
        }
    }

    /// Call when USB (re)connects: the host will see an empty volume again.
    pub fn connect(&mut self) {
        self.sequencer.connect();
    }

    pub fn fat(&self) -> &VirtualFat {
        &self.fat
    }

    pub fn sequencer(&self) -> &Sequencer<'d, F> {
        &self.sequencer
    }
}

impl<'d, F: TargetFlash> BlockDevice for FlashDisk<'d, F> {
    fn block_count(&self) -> u32 {
        self.fat.block_count()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) {
        self.fat.read(addr, buf);
    }

    fn write(&mut self, addr: u32, data: &[u8]) {
        self.sequencer.write(addr, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::{DirEntry, ATTR_ARCHIVE, LPC1768};
    use crate::mock::RecordingFlash;
    use crate::sequencer::{Phase, SessionEnd};

    #[test]
    fn written_files_do_not_show_up_in_reads() {
        let signal = SessionSignal::new();
        let mut disk = FlashDisk::new(
            LPC1768,
            SequencerConfig::default(),
            RecordingFlash::default(),
            &signal,
        );
        assert_eq!(disk.block_count(), 1072);

        let entry = DirEntry {
            name: *b"FIRMWARE",
            ext: *b"BIN",
            attributes: ATTR_ARCHIVE,
            first_cluster_lo: 2,
            size: 512,
            ..DirEntry::default()
        };
        disk.write(3 * 512 + 32, &entry.to_bytes());
        assert_eq!(disk.sequencer().session().phase(), Phase::Accepted);

        let mut b = [0u8; 64];
        disk.read(3 * 512, &mut b);
        assert_eq!(&b[..11], b"MBED       ");
        assert!(b[32..].iter().all(|&x| x == 0));

        disk.connect();
        assert_eq!(disk.sequencer().session().phase(), Phase::Idle);
        assert!(!signal.signaled());
    }

    #[test]
    fn whole_update_through_the_disk() {
        let signal = SessionSignal::new();
        let flash = RecordingFlash::default();
        let mut disk = FlashDisk::new(LPC1768, SequencerConfig::default(), flash.clone(), &signal);
        let entry = DirEntry {
            name: *b"FIRMWARE",
            ext: *b"BIN",
            attributes: ATTR_ARCHIVE,
            first_cluster_lo: 2,
            size: 512,
            ..DirEntry::default()
        };
        let mut dir = [0u8; 64];
        dir[..32].copy_from_slice(&DirEntry::volume_label(*b"MBED       ").to_bytes());
        dir[32..].copy_from_slice(&entry.to_bytes());
        disk.write(3 * 512, &dir);
        disk.write(5 * 512, &[0x5a; 512]);

        assert_eq!(signal.try_take(), Some(SessionEnd::Flashed));
        assert_eq!(flash.programmed(), [(0, std::vec![0x5a; 512])]);
    }
}
