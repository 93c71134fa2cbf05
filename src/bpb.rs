//! BIOS Parameter Block (BPB) and FSInfo
//!
//! The BPB is located in the first sector of the volume in the Reserved
//! Region. This sector is sometimes called the "boot sector" or the "0th
//! sector", but the important fact is simply that it is the first sector
//! of the volume. On a partitioned disk the MBR at absolute sector 0
//! points at it; an unpartitioned medium starts straight with the boot
//! sector, recognizable by the `0xEB` x86 short-jump in its first byte.
//!
//! Only the handful of fields the driver needs are lifted out; everything
//! is read at its documented byte offset rather than through an overlay
//! struct, so a torn or vendor-padded boot sector cannot misalign us.
//!
//! The FSInfo sector (volume-relative LBA 1) carries two hints: the last
//! known free cluster count and the cluster number at which the driver
//! should start looking for free clusters. If a value is 0xFFFFFFFF it is
//! unknown and must be computed. Any other value can be used, but is not
//! necessarily correct; it is range checked and rebuilt from the FAT when
//! stale. The lead/struct/trail signatures are not validated on read but
//! are preserved on write, because every update patches the loaded sector
//! in place.

use crate::{read_le_u16, read_le_u32, Error, Result, FSI_NO_VALUE, SECTOR_SIZE};

use log::error;

pub(crate) const MBR_SECTOR: u32 = 0;
pub(crate) const BOOT_SECTOR: u32 = 0;
pub(crate) const FSINFO_SECTOR: u32 = 1;

/// Starting-LBA field of the first primary partition entry in an MBR.
pub(crate) const PARTITION_TABLE_1: usize = 0x1C6;

pub(crate) const BPB_BYTES_PER_SECTOR: usize = 0x0B;
pub(crate) const BPB_SECTORS_PER_CLUSTER: usize = 0x0D;
pub(crate) const BPB_RESERVED_SECTORS: usize = 0x0E;
pub(crate) const BPB_NUMBER_OF_FATS: usize = 0x10;
pub(crate) const BPB_TOTAL_SECTORS_16: usize = 0x13;
pub(crate) const BPB_TOTAL_SECTORS: usize = 0x20;
pub(crate) const BPB_FAT_SIZE_SECTORS: usize = 0x24;
pub(crate) const BPB_ROOT_DIR_CLUSTER: usize = 0x2C;

pub(crate) const FSI_FREE_COUNT: usize = 0x1E8;
pub(crate) const FSI_NEXT_FREE: usize = 0x1EC;

/// Volume geometry lifted from the BPB at mount. Read-only afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub(crate) bytes_per_sector: u16,
    pub(crate) sectors_per_cluster: u8,
    pub(crate) reserved_sectors: u16,
    pub(crate) number_of_fats: u8,
    pub(crate) total_sectors: u32,
    pub(crate) fat_size_sectors: u32,
    pub(crate) root_dir_cluster: u32,
}

impl BiosParameterBlock {
    /// Parse and validate the boot sector already sitting in `sector`.
    ///
    /// The checks mirror what distinguishes FAT32 from its siblings: the
    /// 16-bit total-sector and FAT-size fields must be zero and their
    /// 32-bit successors non-zero. Everything else on the sector is boot
    /// code we do not care about.
    pub fn parse(sector: &[u8; SECTOR_SIZE]) -> Result<Self> {
        let bytes_per_sector = read_le_u16(&sector[BPB_BYTES_PER_SECTOR..]);
        if bytes_per_sector as usize != SECTOR_SIZE {
            error!("bpb: {} bytes per sector, only 512 supported", bytes_per_sector);
            return Err(Error::BytesPerSectorNot512);
        }

        let total_sectors_16 = read_le_u16(&sector[BPB_TOTAL_SECTORS_16..]);
        let total_sectors = read_le_u32(&sector[BPB_TOTAL_SECTORS..]);
        if total_sectors_16 != 0 || total_sectors == 0 {
            error!("bpb: 16-bit sector count in use, volume is not FAT32");
            return Err(Error::NotFat32);
        }

        let sectors_per_cluster = sector[BPB_SECTORS_PER_CLUSTER];
        if sectors_per_cluster == 0 {
            error!("bpb: zero sectors per cluster");
            return Err(Error::NotFat32);
        }

        let fat_size_sectors = read_le_u32(&sector[BPB_FAT_SIZE_SECTORS..]);
        if fat_size_sectors == 0 {
            error!("bpb: zero FAT size, volume is not FAT32");
            return Err(Error::NotFat32);
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors: read_le_u16(&sector[BPB_RESERVED_SECTORS..]),
            number_of_fats: sector[BPB_NUMBER_OF_FATS],
            total_sectors,
            fat_size_sectors,
            root_dir_cluster: read_le_u32(&sector[BPB_ROOT_DIR_CLUSTER..]),
        })
    }

    /// First sector of the primary FAT, relative to the partition.
    #[inline(always)]
    pub fn fat_start_lba(&self) -> u32 {
        self.reserved_sectors as u32
    }

    /// First sector of cluster 2, the first data cluster.
    ///
    /// On a FAT32 volume the legacy root-directory region has zero
    /// sectors, so the data region follows the FAT mirrors directly.
    #[inline(always)]
    pub fn data_start_lba(&self) -> u32 {
        self.fat_start_lba() + self.number_of_fats as u32 * self.fat_size_sectors
    }

    /// Given any valid data cluster number, the partition-relative sector
    /// number of the first sector of that cluster.
    #[inline(always)]
    pub fn first_sector_of_cluster(&self, cluster: u32) -> u32 {
        self.data_start_lba() + (cluster - 2) * self.sectors_per_cluster as u32
    }

    /// Locate the FAT slot for `cluster`: the partition-relative sector
    /// of the primary FAT holding it, and the byte offset inside that
    /// sector. The slot is four bytes and never straddles sectors.
    #[inline(always)]
    pub fn fat_slot_of(&self, cluster: u32) -> (u32, usize) {
        let offset = cluster * 4;
        (
            self.fat_start_lba() + offset / SECTOR_SIZE as u32,
            (offset % SECTOR_SIZE as u32) as usize,
        )
    }

    /// Total sectors of the data region.
    #[inline(always)]
    pub fn data_sector_cnt(&self) -> u32 {
        self.total_sectors
            - self.reserved_sectors as u32
            - self.number_of_fats as u32 * self.fat_size_sectors
    }

    /// The count of data clusters, rounding down.
    #[inline(always)]
    pub fn data_cluster_cnt(&self) -> u32 {
        self.data_sector_cnt() / self.sectors_per_cluster as u32
    }

    /// The highest valid cluster number. Clusters start at 2, so this is
    /// the data cluster count plus one. FAT sectors usually carry slots
    /// past this number; they are never allocated or counted.
    #[inline(always)]
    pub fn max_cluster(&self) -> u32 {
        self.data_cluster_cnt() + 1
    }

    pub fn sectors_per_cluster(&self) -> u16 {
        self.sectors_per_cluster as u16
    }

    pub fn fat_cnt(&self) -> u8 {
        self.number_of_fats
    }

    pub fn fat_size_sectors(&self) -> u32 {
        self.fat_size_sectors
    }

    pub fn root_cluster(&self) -> u32 {
        self.root_dir_cluster
    }
}

/// The FSInfo hint pair. Hints, never truth: consulted to avoid a full
/// FAT scan, validated, and rebuilt from the FAT when stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_cluster_count: u32,
    pub next_free_cluster: u32,
}

impl FsInfo {
    pub fn knows_free_count(&self) -> bool {
        self.free_cluster_count != FSI_NO_VALUE
    }

    pub fn knows_next_free(&self) -> bool {
        self.next_free_cluster != FSI_NO_VALUE
    }
}
