//! Shared test fixtures: an in-memory sector device and a minimal FAT32
//! formatter. The driver itself never formats, so the tests lay the
//! on-disk structures out by hand and then talk to the volume through
//! the same opcode surface a host would use.

#![allow(dead_code)]

use fat32_core::{BlockDevice, DeviceError, Operation, Status, Volume, SECTOR_SIZE};

/// A fixed FAT date/time used wherever the tests need a stamp:
/// 2023-11-03 17:01:00.
pub const DT: u32 = 0x5763_8820;

pub const RESERVED_SECTORS: u16 = 32;
pub const FAT_COUNT: u8 = 2;

// ---------------------------------------------------------------------
// sector devices

pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: vec![[0u8; SECTOR_SIZE]; sector_count as usize],
        }
    }

    pub fn sector(&self, lba: u32) -> &[u8; SECTOR_SIZE] {
        &self.sectors[lba as usize]
    }

    pub fn sector_mut(&mut self, lba: u32) -> &mut [u8; SECTOR_SIZE] {
        &mut self.sectors[lba as usize]
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&mut self, lba: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        let sector = self
            .sectors
            .get(lba as usize)
            .ok_or(DeviceError::ReadError)?;
        buf.copy_from_slice(sector);
        Ok(())
    }

    fn write_sector(&mut self, lba: u32, buf: &[u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        let sector = self
            .sectors
            .get_mut(lba as usize)
            .ok_or(DeviceError::WriteError)?;
        sector.copy_from_slice(buf);
        Ok(())
    }
}

/// A device that fails every transfer; for exercising the IoError path.
pub struct DeadDisk;

impl BlockDevice for DeadDisk {
    fn read_sector(&mut self, _: u32, _: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        Err(DeviceError::ReadError)
    }

    fn write_sector(&mut self, _: u32, _: &[u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        Err(DeviceError::WriteError)
    }
}

// ---------------------------------------------------------------------
// image layout

/// Geometry of a test image, mirrored independently of the driver so the
/// tests can audit raw sectors.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub total_sectors: u32,
    pub sectors_per_cluster: u8,
    pub fat_size: u32,
    /// Absolute LBA where the volume starts (non-zero for MBR images).
    pub partition_start: u32,
}

impl Layout {
    pub fn new(total_sectors: u32, sectors_per_cluster: u8) -> Self {
        // Oversized on purpose; FAT sectors past the last real cluster
        // are legal and the driver must ignore them.
        let fat_size = (total_sectors / sectors_per_cluster as u32) * 4 / SECTOR_SIZE as u32 + 2;
        Self {
            total_sectors,
            sectors_per_cluster,
            fat_size,
            partition_start: 0,
        }
    }

    pub fn fat_start(&self) -> u32 {
        self.partition_start + RESERVED_SECTORS as u32
    }

    pub fn data_start(&self) -> u32 {
        self.fat_start() + FAT_COUNT as u32 * self.fat_size
    }

    pub fn cluster_count(&self) -> u32 {
        (self.partition_start + self.total_sectors - self.data_start())
            / self.sectors_per_cluster as u32
    }

    pub fn max_cluster(&self) -> u32 {
        self.cluster_count() + 1
    }

    pub fn cluster_lba(&self, cluster: u32) -> u32 {
        self.data_start() + (cluster - 2) * self.sectors_per_cluster as u32
    }

    /// Raw slot value of `cluster` in the FAT copy `fat` (0 = primary).
    pub fn fat_value(&self, disk: &RamDisk, fat: u8, cluster: u32) -> u32 {
        let lba = self.fat_start() + fat as u32 * self.fat_size + cluster * 4 / SECTOR_SIZE as u32;
        let offset = (cluster * 4) as usize % SECTOR_SIZE;
        let sector = disk.sector(lba);
        u32::from_le_bytes(sector[offset..offset + 4].try_into().unwrap())
    }

    /// Follow a chain through the raw primary FAT.
    pub fn chain(&self, disk: &RamDisk, start: u32) -> Vec<u32> {
        let mut clusters = vec![start];
        let mut current = start;
        loop {
            let next = self.fat_value(disk, 0, current) & 0x0FFF_FFFF;
            if next >= 0x0FFF_FFF8 || next == 0 {
                return clusters;
            }
            clusters.push(next);
            current = next;
        }
    }

    /// Free clusters counted straight off the primary FAT; the ground
    /// truth any hint must agree with.
    pub fn free_by_scan(&self, disk: &RamDisk) -> u32 {
        (2..=self.max_cluster())
            .filter(|&cluster| self.fat_value(disk, 0, cluster) & 0x0FFF_FFFF == 0)
            .count() as u32
    }

    /// Invariant: every mirror is byte-identical with the primary FAT.
    pub fn mirrors_identical(&self, disk: &RamDisk) -> bool {
        (0..self.fat_size).all(|sector| {
            let primary = disk.sector(self.fat_start() + sector);
            (1..FAT_COUNT as u32).all(|fat| {
                disk.sector(self.fat_start() + fat * self.fat_size + sector) == primary
            })
        })
    }

    pub fn fsinfo_hints(&self, disk: &RamDisk) -> (u32, u32) {
        let sector = disk.sector(self.partition_start + 1);
        (
            u32::from_le_bytes(sector[0x1E8..0x1EC].try_into().unwrap()),
            u32::from_le_bytes(sector[0x1EC..0x1F0].try_into().unwrap()),
        )
    }
}

fn put16(sector: &mut [u8; SECTOR_SIZE], offset: usize, value: u16) {
    sector[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(sector: &mut [u8; SECTOR_SIZE], offset: usize, value: u32) {
    sector[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write boot sector, FSInfo and empty FAT copies for `layout` onto a
/// fresh disk. The root directory is cluster 2, already terminated in
/// the FAT. FSInfo hints start at the given values.
pub fn format_with_hints(layout: &Layout, free_count: u32, next_free: u32) -> RamDisk {
    let mut disk = RamDisk::new(layout.partition_start + layout.total_sectors);

    if layout.partition_start != 0 {
        // a minimal MBR: anything but 0xEB first, partition 1 start LBA
        let mbr = disk.sector_mut(0);
        mbr[0] = 0x33;
        put32(mbr, 0x1C6, layout.partition_start);
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
    }

    let boot = disk.sector_mut(layout.partition_start);
    boot[0] = 0xEB;
    boot[1] = 0x58;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"MSWIN4.1");
    put16(boot, 0x0B, SECTOR_SIZE as u16);
    boot[0x0D] = layout.sectors_per_cluster;
    put16(boot, 0x0E, RESERVED_SECTORS);
    boot[0x10] = FAT_COUNT;
    boot[0x15] = 0xF8;
    put32(boot, 0x20, layout.total_sectors);
    put32(boot, 0x24, layout.fat_size);
    put32(boot, 0x2C, 2); // root directory cluster
    put16(boot, 0x30, 1); // FSInfo sector
    boot[510] = 0x55;
    boot[511] = 0xAA;

    let fsinfo = disk.sector_mut(layout.partition_start + 1);
    put32(fsinfo, 0, 0x41615252);
    put32(fsinfo, 484, 0x61417272);
    put32(fsinfo, 0x1E8, free_count);
    put32(fsinfo, 0x1EC, next_free);
    put32(fsinfo, 508, 0xAA550000);

    for fat in 0..FAT_COUNT as u32 {
        let head = disk.sector_mut(layout.fat_start() + fat * layout.fat_size);
        put32(head, 0, 0x0FFF_FFF8); // FAT[0]: media byte, rest ones
        put32(head, 4, 0x0FFF_FFFF); // FAT[1]: EOC
        put32(head, 8, 0x0FFF_FFFF); // root directory chain
    }

    disk
}

/// Format with unknown FSInfo hints; mounting recalculates them.
pub fn format(layout: &Layout) -> RamDisk {
    format_with_hints(layout, 0xFFFF_FFFF, 0xFFFF_FFFF)
}

// ---------------------------------------------------------------------
// driving the volume

/// A formatted, mounted volume plus its layout. 2 MiB with 1-sector
/// clusters unless a test asks otherwise.
pub fn mounted(total_sectors: u32, sectors_per_cluster: u8) -> (Layout, Volume<RamDisk>) {
    let layout = Layout::new(total_sectors, sectors_per_cluster);
    let mut volume = Volume::new(format(&layout));
    assert_eq!(volume.operate(Operation::Init as u8, DT), Status::Ok);
    (layout, volume)
}

pub fn small_volume() -> (Layout, Volume<RamDisk>) {
    mounted(4096, 1)
}

pub fn set_path(volume: &mut Volume<RamDisk>, path: &str) {
    let buffer = volume.buffer_mut();
    buffer.fill(0);
    buffer[..path.len()].copy_from_slice(path.as_bytes());
}

/// Stage two NUL-terminated paths for `Mv`.
pub fn set_paths(volume: &mut Volume<RamDisk>, source: &str, target: &str) {
    let buffer = volume.buffer_mut();
    buffer.fill(0);
    buffer[..source.len()].copy_from_slice(source.as_bytes());
    let tail = source.len() + 1;
    buffer[tail..tail + target.len()].copy_from_slice(target.as_bytes());
}

pub fn path_op(volume: &mut Volume<RamDisk>, operation: Operation, path: &str) -> Status {
    set_path(volume, path);
    volume.operate(operation as u8, DT)
}

pub fn mkdir(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Mkdir, path)
}

pub fn rmdir(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Rmdir, path)
}

pub fn cd(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Cd, path)
}

pub fn create(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Create, path)
}

pub fn rm(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Rm, path)
}

pub fn stat(volume: &mut Volume<RamDisk>, path: &str) -> Status {
    path_op(volume, Operation::Stat, path)
}

pub fn mv(volume: &mut Volume<RamDisk>, source: &str, target: &str) -> Status {
    set_paths(volume, source, target);
    volume.operate(Operation::Mv as u8, DT)
}

/// Open a file and hand back its handle index.
pub fn open(volume: &mut Volume<RamDisk>, path: &str) -> (Status, u8) {
    let status = path_op(volume, Operation::Open, path);
    (status, volume.registers().file_handle)
}

pub fn close(volume: &mut Volume<RamDisk>, handle: u8) -> Status {
    volume.registers_mut().file_handle = handle;
    volume.operate(Operation::Close as u8, DT)
}

pub fn seek(volume: &mut Volume<RamDisk>, handle: u8, sectors: u32) -> Status {
    volume.registers_mut().file_handle = handle;
    volume.buffer_mut()[..4].copy_from_slice(&sectors.to_le_bytes());
    volume.operate(Operation::Seek as u8, DT)
}

/// Read one page; returns the status, valid byte count and buffer copy.
pub fn read_page(volume: &mut Volume<RamDisk>, handle: u8) -> (Status, u16, [u8; SECTOR_SIZE]) {
    volume.registers_mut().file_handle = handle;
    let status = volume.operate(Operation::Read as u8, DT);
    (status, volume.registers().sector_bytes, *volume.buffer())
}

/// Append arbitrary data through as many 512-byte payloads as needed.
pub fn append(volume: &mut Volume<RamDisk>, handle: u8, data: &[u8]) -> Status {
    for chunk in data.chunks(SECTOR_SIZE) {
        volume.registers_mut().file_handle = handle;
        volume.registers_mut().sector_bytes = chunk.len() as u16;
        let buffer = volume.buffer_mut();
        buffer[..chunk.len()].copy_from_slice(chunk);
        let status = volume.operate(Operation::Append as u8, DT);
        if status != Status::Ok {
            return status;
        }
    }
    Status::Ok
}

/// Create a file at `path` carrying `data`, through the public ops only.
pub fn write_file(volume: &mut Volume<RamDisk>, path: &str, data: &[u8]) {
    assert_eq!(create(volume, path), Status::Ok);
    let (status, handle) = open(volume, path);
    assert_eq!(status, Status::Ok);
    assert_eq!(append(volume, handle, data), Status::Ok);
    assert_eq!(close(volume, handle), Status::Ok);
}

/// Read a whole file back through the streaming interface.
pub fn read_file(volume: &mut Volume<RamDisk>, path: &str) -> (Status, Vec<u8>) {
    let (status, handle) = open(volume, path);
    if status != Status::Ok {
        return (status, Vec::new());
    }

    let mut data = Vec::new();
    loop {
        let (status, bytes, page) = read_page(volume, handle);
        match status {
            Status::Ok | Status::MoreData => data.extend_from_slice(&page[..bytes as usize]),
            other => return (other, data),
        }
        if status == Status::Ok {
            break;
        }
    }
    close(volume, handle);
    (Status::Ok, data)
}

/// One parsed directory entry out of a `Dir` page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub cluster: u32,
    pub size: u32,
}

/// Stream the current directory from the top and parse every live
/// entry, dot entries included.
pub fn list_dir(volume: &mut Volume<RamDisk>) -> Vec<ListedEntry> {
    let mut entries = Vec::new();
    let mut continuation = 0u8;

    loop {
        volume.buffer_mut()[0] = continuation;
        let status = volume.operate(Operation::Dir as u8, DT);
        assert!(status == Status::Ok || status == Status::MoreData);

        let page = *volume.buffer();
        for slot in page.chunks_exact(32) {
            match slot[0] {
                0x00 => return entries,
                0xE5 => continue,
                _ => entries.push(ListedEntry {
                    name: slot[..11].try_into().unwrap(),
                    attr: slot[11],
                    cluster: (u16::from_le_bytes(slot[0x14..0x16].try_into().unwrap()) as u32)
                        << 16
                        | u16::from_le_bytes(slot[0x1A..0x1C].try_into().unwrap()) as u32,
                    size: u32::from_le_bytes(slot[0x1C..0x20].try_into().unwrap()),
                }),
            }
        }

        if status == Status::Ok {
            return entries;
        }
        continuation = 1;
    }
}

/// The 32-byte record `Stat` left at buffer offset 0, parsed.
pub fn stat_entry(volume: &mut Volume<RamDisk>, path: &str) -> Option<ListedEntry> {
    if stat(volume, path) != Status::Ok {
        return None;
    }
    let page = volume.buffer();
    Some(ListedEntry {
        name: page[..11].try_into().unwrap(),
        attr: page[11],
        cluster: (u16::from_le_bytes(page[0x14..0x16].try_into().unwrap()) as u32) << 16
            | u16::from_le_bytes(page[0x1A..0x1C].try_into().unwrap()) as u32,
        size: u32::from_le_bytes(page[0x1C..0x20].try_into().unwrap()),
    })
}
