//! The read-only FAT12 volume presented to the host.
//!
//! Only the first few sectors hold anything: the boot sector, the two FAT copies, the root
//! directory with a volume label, and one empty data sector.  Every other sector reads as zeros.
//! Files the host writes are never stored here; their data goes to the update sequencer instead.

use static_assertions::const_assert;

pub const SECTOR_SIZE: usize = 512;
pub const NUM_FATS: u32 = 2;
pub const ROOT_DIR_ENTRIES: u16 = 32;
pub const DIR_ENTRY_SIZE: usize = 32;
pub const MEDIA_DESCRIPTOR: u8 = 0xf0;
/// The most clusters a FAT12 volume can have.
pub const MAX_FAT12_CLUSTERS: u32 = 4084;
const MAX_CLUSTER_BYTES: u32 = 32 * 1024;
const ROOT_DIR_SECTORS: u32 = (ROOT_DIR_ENTRIES as u32 * DIR_ENTRY_SIZE as u32) / SECTOR_SIZE as u32;
// Extra room reported beyond the target flash so the host never runs out of space.
const SLACK_KB: u32 = 16 + 8;

pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;
pub const ATTR_LONG_NAME: u8 = 0x0f;

/// Volume layout, fixed when the firmware is built.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub sectors_per_fat: u16,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
}

impl Geometry {
    /// Geometry for a target with `flash_kb` KiB of flash.
    ///
    /// Panics (at compile time when used in a const) if the result is not a valid FAT12 volume.
    pub const fn new(flash_kb: u32, sectors_per_cluster: u8) -> Self {
        assert!(
            sectors_per_cluster.is_power_of_two(),
            "sectors per cluster must be a power of two"
        );
        assert!(
            sectors_per_cluster as u32 * SECTOR_SIZE as u32 <= MAX_CLUSTER_BYTES,
            "cluster larger than 32 KiB"
        );
        let total_sectors = (flash_kb + SLACK_KB) * 1024 / SECTOR_SIZE as u32;
        let clusters = total_sectors / sectors_per_cluster as u32;
        assert!(clusters <= MAX_FAT12_CLUSTERS, "too many clusters for FAT12");
        // 12 bits per entry, plus the two reserved entries.
        let fat_bytes = (clusters + 2) * 3 / 2;
        let sectors_per_fat = (fat_bytes + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
        Self {
            total_sectors,
            sectors_per_cluster,
            sectors_per_fat: sectors_per_fat as u16,
            volume_id: 0x2702_1974,
            volume_label: *b"MBED       ",
        }
    }

    pub const fn with_volume_label(mut self, label: [u8; 11]) -> Self {
        self.volume_label = label;
        self
    }

    pub const fn cluster_count(&self) -> u32 {
        self.total_sectors / self.sectors_per_cluster as u32
    }

    pub const fn first_fat_block(&self) -> u32 {
        1
    }

    pub const fn root_dir_block(&self) -> u32 {
        1 + NUM_FATS * self.sectors_per_fat as u32
    }

    pub const fn first_file_block(&self) -> u32 {
        self.root_dir_block() + ROOT_DIR_SECTORS
    }

    pub const fn is_root_dir_block(&self, block: u32) -> bool {
        block >= self.root_dir_block() && block < self.first_file_block()
    }

    /// First block of a data cluster.  Clusters 0 and 1 do not exist on disk.
    pub const fn cluster_to_block(&self, cluster: u16) -> Option<u32> {
        if cluster < 2 {
            return None;
        }
        Some((cluster as u32 - 2) * self.sectors_per_cluster as u32 + self.first_file_block())
    }

    pub const fn capacity_bytes(&self) -> u64 {
        self.total_sectors as u64 * SECTOR_SIZE as u64
    }
}

/// The LPC1768 target: 512 KiB of flash.
pub const LPC1768: Geometry = Geometry::new(512, 8);

const_assert!(LPC1768.cluster_count() <= MAX_FAT12_CLUSTERS);
const_assert!(LPC1768.sectors_per_fat == 1);

impl Default for Geometry {
    fn default() -> Self {
        LPC1768
    }
}

/// The boot sector / BIOS parameter block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media_type: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub drive_number: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

impl BootSector {
    pub fn new(geometry: &Geometry) -> Self {
        // Volumes above this size put the count in the 32-bit field instead.
        let (total_16, total_32) = if geometry.total_sectors > 32768 {
            (0, geometry.total_sectors)
        } else {
            (geometry.total_sectors as u16, 0)
        };
        Self {
            jump: [0xeb, 0x3c, 0x90],
            oem_name: *b"MSWIN4.1",
            bytes_per_sector: SECTOR_SIZE as u16,
            sectors_per_cluster: geometry.sectors_per_cluster,
            reserved_sectors: 1,
            num_fats: NUM_FATS as u8,
            root_entry_count: ROOT_DIR_ENTRIES,
            total_sectors_16: total_16,
            media_type: MEDIA_DESCRIPTOR,
            fat_size_16: geometry.sectors_per_fat,
            sectors_per_track: 1,
            num_heads: 1,
            hidden_sectors: 0,
            total_sectors_32: total_32,
            drive_number: 0,
            boot_signature: 0x29,
            volume_id: geometry.volume_id,
            volume_label: geometry.volume_label,
            fs_type: *b"FAT12   ",
        }
    }

    pub fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut b = [0u8; SECTOR_SIZE];
        b[0..3].copy_from_slice(&self.jump);
        b[3..11].copy_from_slice(&self.oem_name);
        b[11..13].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        b[13] = self.sectors_per_cluster;
        b[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        b[16] = self.num_fats;
        b[17..19].copy_from_slice(&self.root_entry_count.to_le_bytes());
        b[19..21].copy_from_slice(&self.total_sectors_16.to_le_bytes());
        b[21] = self.media_type;
        b[22..24].copy_from_slice(&self.fat_size_16.to_le_bytes());
        b[24..26].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        b[26..28].copy_from_slice(&self.num_heads.to_le_bytes());
        b[28..32].copy_from_slice(&self.hidden_sectors.to_le_bytes());
        b[32..36].copy_from_slice(&self.total_sectors_32.to_le_bytes());
        b[36] = self.drive_number;
        // b[37] reserved
        b[38] = self.boot_signature;
        b[39..43].copy_from_slice(&self.volume_id.to_le_bytes());
        b[43..54].copy_from_slice(&self.volume_label);
        b[54..62].copy_from_slice(&self.fs_type);
        // 448 bytes of boot code, all zero
        b[510] = 0x55;
        b[511] = 0xaa;
        b
    }
}

/// A 32-byte short-name directory entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DirEntry {
    pub name: [u8; 8],
    pub ext: [u8; 3],
    pub attributes: u8,
    pub create_time_tenth: u8,
    pub create_time: u16,
    pub create_date: u16,
    pub access_date: u16,
    pub first_cluster_hi: u16,
    pub write_time: u16,
    pub write_date: u16,
    pub first_cluster_lo: u16,
    pub size: u32,
}

impl DirEntry {
    pub fn parse(b: &[u8; DIR_ENTRY_SIZE]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        let mut name = [0u8; 8];
        name.copy_from_slice(&b[0..8]);
        let mut ext = [0u8; 3];
        ext.copy_from_slice(&b[8..11]);
        Self {
            name,
            ext,
            attributes: b[11],
            create_time_tenth: b[13],
            create_time: u16_at(14),
            create_date: u16_at(16),
            access_date: u16_at(18),
            first_cluster_hi: u16_at(20),
            write_time: u16_at(22),
            write_date: u16_at(24),
            first_cluster_lo: u16_at(26),
            size: u32::from_le_bytes([b[28], b[29], b[30], b[31]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DIR_ENTRY_SIZE] {
        let mut b = [0u8; DIR_ENTRY_SIZE];
        b[0..8].copy_from_slice(&self.name);
        b[8..11].copy_from_slice(&self.ext);
        b[11] = self.attributes;
        b[13] = self.create_time_tenth;
        b[14..16].copy_from_slice(&self.create_time.to_le_bytes());
        b[16..18].copy_from_slice(&self.create_date.to_le_bytes());
        b[18..20].copy_from_slice(&self.access_date.to_le_bytes());
        b[20..22].copy_from_slice(&self.first_cluster_hi.to_le_bytes());
        b[22..24].copy_from_slice(&self.write_time.to_le_bytes());
        b[24..26].copy_from_slice(&self.write_date.to_le_bytes());
        b[26..28].copy_from_slice(&self.first_cluster_lo.to_le_bytes());
        b[28..32].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    pub fn volume_label(label: [u8; 11]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&label[..8]);
        let mut ext = [0u8; 3];
        ext.copy_from_slice(&label[8..]);
        Self {
            name,
            ext,
            attributes: ATTR_VOLUME_ID | ATTR_ARCHIVE,
            // 14:44:10, 2012-12-14
            write_time: 0x7585,
            write_date: 0x418e,
            ..Self::default()
        }
    }
}

// Media descriptor followed by the end-of-chain markers for the two reserved clusters.
const FAT_HEAD: [u8; 16] = [
    MEDIA_DESCRIPTOR, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0,
];

/// The stored prefix of one sector.  Bytes past `data` read as zero.
#[derive(Copy, Clone, Debug)]
pub struct Sector<'a> {
    pub data: &'a [u8],
}

pub struct VirtualFat {
    geometry: Geometry,
    boot: [u8; SECTOR_SIZE],
    root: [u8; DIR_ENTRY_SIZE],
}

impl VirtualFat {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            boot: BootSector::new(&geometry).to_bytes(),
            root: DirEntry::volume_label(geometry.volume_label).to_bytes(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn block_count(&self) -> u32 {
        self.geometry.total_sectors
    }

    /// Number of sectors with a table entry: boot, both FATs, root directory and one filler
    /// data sector.
    pub fn table_len(&self) -> u32 {
        self.geometry.first_file_block() + 1
    }

    /// The table entry for `block`, or None for sectors past the table.
    pub fn sector(&self, block: u32) -> Option<Sector<'_>> {
        let g = &self.geometry;
        let spf = g.sectors_per_fat as u32;
        let data: &[u8] = if block == 0 {
            &self.boot
        } else if block < g.root_dir_block() {
            // Both FAT copies carry the same head in their first sector.
            if (block - g.first_fat_block()) % spf == 0 {
                &FAT_HEAD
            } else {
                &[]
            }
        } else if block == g.root_dir_block() {
            &self.root
        } else if block < self.table_len() {
            &[]
        } else {
            return None;
        };
        Some(Sector { data })
    }

    /// Fill `buf` with the image contents starting at byte `addr`.
    pub fn read(&self, addr: u32, buf: &mut [u8]) {
        buf.fill(0);
        let mut pos = 0;
        while pos < buf.len() {
            let at = addr as usize + pos;
            let block = (at / SECTOR_SIZE) as u32;
            let offset = at % SECTOR_SIZE;
            let n = (SECTOR_SIZE - offset).min(buf.len() - pos);
            if let Some(sector) = self.sector(block) {
                if offset < sector.data.len() {
                    let m = n.min(sector.data.len() - offset);
                    buf[pos..pos + m].copy_from_slice(&sector.data[offset..offset + m]);
                }
            }
            pos += n;
        }
    }
}
