//! The mounted volume
//!
//! Layout of a FAT32 volume:
//!     Boot Sector - Reserved Sectors - FAT1 - FAT2 - Data Region
//! 1. The reserved sectors include the boot sector (BPB) and the FSInfo
//!    sector.
//! 2. FAT1 starts at `reserved_sector_count`; the mirrors follow at
//!    strides of the FAT size and are kept byte-identical on every write.
//! 3. Cluster 2 is the first data cluster and usually holds the root
//!    directory.
//!
//! [`Volume`] binds all driver state to one value: the device, the
//! geometry, the
//! single shared sector buffer, the current-directory cluster, the open
//! handle table and the caller-visible register file. All driver code
//! runs on `&mut self`; a host that cannot thread a mutable reference
//! (shared statics, interrupt-driven callers) serializes through
//! [`SharedVolume`] instead.

use crate::bpb::{BiosParameterBlock, BOOT_SECTOR, MBR_SECTOR, PARTITION_TABLE_1};
use crate::device::BlockDevice;
use crate::file::{FileHandle, DIR_SLOT};
use crate::{read_le_u32, Error, Result, Status, FSI_NO_VALUE, MAX_OPEN_FILES, SECTOR_SIZE};

use log::debug;
use spin::Mutex;

/// Caller-visible state kept outside the shared buffer.
///
/// `sector_bytes` is the valid-prefix length of the sector returned by
/// the last `Read`/`Seek`; for `Append` the caller loads it with the
/// payload length instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub last_result: Status,
    pub file_handle: u8,
    pub sector_bytes: u16,
}

pub struct Volume<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) bpb: BiosParameterBlock,
    /// Absolute sector of the volume's boot sector; 0 on an
    /// unpartitioned medium.
    pub(crate) partition_start_lba: u32,
    /// The one sector's worth of working memory the whole driver gets.
    pub(crate) buffer: [u8; SECTOR_SIZE],
    pub(crate) current_dir_cluster: u32,
    /// Open-file slots plus one reserved slot for directory streaming.
    pub(crate) handles: [FileHandle; MAX_OPEN_FILES + 1],
    pub(crate) regs: Registers,
    pub(crate) mounted: bool,
}

impl<D: BlockDevice> Volume<D> {
    /// Wrap a device. Nothing touches the disk until `Init` is
    /// dispatched (or [`Volume::mount`] is called directly).
    pub fn new(device: D) -> Self {
        Self {
            device,
            bpb: BiosParameterBlock::default(),
            partition_start_lba: 0,
            buffer: [0; SECTOR_SIZE],
            current_dir_cluster: 0,
            handles: [FileHandle::IDLE; MAX_OPEN_FILES + 1],
            regs: Registers::default(),
            mounted: false,
        }
    }

    /// Mount the volume: locate the boot sector, parse the BPB, reset
    /// per-volume state, and rebuild the FSInfo hints if the on-disk
    /// free count is the "unknown" sentinel.
    ///
    /// Absolute sector 0 either *is* the boot sector (first byte `0xEB`,
    /// the x86 short jump every FAT boot sector starts with) or an MBR
    /// whose first primary partition entry points at it.
    pub fn mount(&mut self) -> Result<()> {
        self.mounted = false;
        self.partition_start_lba = 0;
        self.device
            .read_sector(MBR_SECTOR, &mut self.buffer)
            .map_err(|_| Error::Io)?;

        if self.buffer[0] != 0xEB {
            self.partition_start_lba = read_le_u32(&self.buffer[PARTITION_TABLE_1..]);
            self.load_sector(BOOT_SECTOR)?;
        }

        self.bpb = BiosParameterBlock::parse(&self.buffer)?;
        self.current_dir_cluster = self.bpb.root_cluster();
        self.handles = [FileHandle::IDLE; MAX_OPEN_FILES + 1];
        self.mounted = true;

        debug!(
            "mounted fat32 volume at lba {}: {} sectors/cluster, {} FATs of {} sectors, root at cluster {}",
            self.partition_start_lba,
            self.bpb.sectors_per_cluster(),
            self.bpb.fat_cnt(),
            self.bpb.fat_size_sectors(),
            self.bpb.root_cluster(),
        );

        let fsinfo = self.fsinfo_read()?;
        if fsinfo.free_cluster_count == FSI_NO_VALUE {
            self.fsinfo_recalculate()?;
        }

        Ok(())
    }

    /// Drop the geometry and all open handles. The buffer contents are
    /// left as-is.
    pub fn unmount(&mut self) {
        self.mounted = false;
        self.handles = [FileHandle::IDLE; MAX_OPEN_FILES + 1];
        self.current_dir_cluster = 0;
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// The shared sector buffer: request parameters go in, replies come
    /// out. Clobbered by every operation.
    pub fn buffer(&self) -> &[u8; SECTOR_SIZE] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.buffer
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub fn current_dir_cluster(&self) -> u32 {
        self.current_dir_cluster
    }

    pub fn geometry(&self) -> &BiosParameterBlock {
        &self.bpb
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Read a volume-relative sector into the shared buffer.
    pub(crate) fn load_sector(&mut self, lba: u32) -> Result<()> {
        self.device
            .read_sector(lba + self.partition_start_lba, &mut self.buffer)
            .map_err(|_| Error::Io)
    }

    /// Write the shared buffer to a volume-relative sector.
    pub(crate) fn write_current_sector(&mut self, lba: u32) -> Result<()> {
        self.device
            .write_sector(lba + self.partition_start_lba, &self.buffer)
            .map_err(|_| Error::Io)
    }

    pub(crate) fn load_data_sector(&mut self, cluster: u32, sector: u16) -> Result<()> {
        let lba = self.bpb.first_sector_of_cluster(cluster) + sector as u32;
        self.load_sector(lba)
    }

    pub(crate) fn write_data_sector(&mut self, cluster: u32, sector: u16) -> Result<()> {
        let lba = self.bpb.first_sector_of_cluster(cluster) + sector as u32;
        self.write_current_sector(lba)
    }

    /// Zero every sector of a freshly reserved cluster. Leaves the
    /// buffer zeroed, which directory creation relies on.
    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<()> {
        self.buffer.fill(0);
        for sector in 0..self.bpb.sectors_per_cluster() {
            self.write_data_sector(cluster, sector)?;
        }
        Ok(())
    }

    pub(crate) fn dir_stream_slot(&mut self) -> &mut FileHandle {
        &mut self.handles[DIR_SLOT]
    }
}

/// A volume behind a spinlock, for hosts that must reach the driver
/// through a shared reference (a static, an interrupt context). One
/// operation holds the lock from parameter marshaling to reply, which
/// preserves the single-owner discipline over the shared buffer.
pub struct SharedVolume<D: BlockDevice> {
    inner: Mutex<Volume<D>>,
}

impl<D: BlockDevice> SharedVolume<D> {
    pub fn new(volume: Volume<D>) -> Self {
        Self {
            inner: Mutex::new(volume),
        }
    }

    /// Run one closure under the lock, typically to stage parameters in
    /// the buffer and fire `operate` in the same critical section.
    pub fn with<R>(&self, f: impl FnOnce(&mut Volume<D>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn operate(&self, opcode: u8, fat_datetime: u32) -> Status {
        self.inner.lock().operate(opcode, fat_datetime)
    }

    pub fn into_inner(self) -> Volume<D> {
        self.inner.into_inner()
    }
}
