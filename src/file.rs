//! Open-file handles
//!
//! A fixed table of a few concurrent handles plus one reserved slot that
//! the `Dir` opcode uses for its streaming cursor. A handle is a cursor
//! over a file's cluster chain: the cluster and sector about to be read,
//! and how many payload bytes remain. Reading streams one sector per
//! call; the final sector's tail past end-of-file comes back zeroed.
//!
//! Appending shares the state machine and additionally tracks the chain
//! tail: a write that crosses a sector boundary bumps the sector, one
//! that crosses a cluster boundary extends the chain through the FAT
//! append primitive. The directory entry is only rewritten (size and
//! write stamp) when the handle is closed.

use crate::device::BlockDevice;
use crate::entry::ShortDirEntry;
use crate::fs::Volume;
use crate::{is_eoc, Error, Result, Stream, DIRENT_SIZE, FREE_CLUSTER, MAX_OPEN_FILES, SECTOR_SIZE};

/// Index of the reserved directory-streaming slot.
pub(crate) const DIR_SLOT: usize = MAX_OPEN_FILES;

#[derive(Debug, Clone, Copy)]
pub struct FileHandle {
    pub(crate) in_use: bool,
    pub(crate) start_cluster: u32,
    /// Read cursor: the sector returned by the next `Read`.
    pub(crate) current_cluster: u32,
    pub(crate) current_sector: u16,
    pub(crate) bytes_remaining: u32,
    pub(crate) file_size: u32,
    /// Location of the directory entry, for the close-time update.
    pub(crate) entry_dir_cluster: u32,
    pub(crate) entry_dir_sector: u16,
    pub(crate) entry_index: u16,
    /// Append cursor; cluster 0 until the first append walks the chain.
    pub(crate) tail_cluster: u32,
    pub(crate) tail_sector: u16,
    pub(crate) dirty: bool,
}

impl FileHandle {
    pub(crate) const IDLE: FileHandle = FileHandle {
        in_use: false,
        start_cluster: 0,
        current_cluster: 0,
        current_sector: 0,
        bytes_remaining: 0,
        file_size: 0,
        entry_dir_cluster: 0,
        entry_dir_sector: 0,
        entry_index: 0,
        tail_cluster: 0,
        tail_sector: 0,
        dirty: false,
    };
}

impl<D: BlockDevice> Volume<D> {
    /// Copy out a user handle after the index checks. Handles are small
    /// `Copy` records; mutations are written back explicitly, which
    /// keeps the borrow on `self` free for sector I/O in between.
    fn checked_handle(&self, index: u8) -> Result<FileHandle> {
        let slot = index as usize;
        if slot >= MAX_OPEN_FILES {
            return Err(Error::InvalidFileIndex);
        }
        let handle = self.handles[slot];
        if !handle.in_use {
            return Err(Error::FileNotOpen);
        }
        Ok(handle)
    }

    /// Bind a resolved file to a free slot and return its index.
    pub(crate) fn file_open(
        &mut self,
        start_cluster: u32,
        file_size: u32,
        entry_dir_cluster: u32,
        entry_dir_sector: u16,
        entry_index: u16,
    ) -> Result<u8> {
        let slot = self.handles[..MAX_OPEN_FILES]
            .iter()
            .position(|handle| !handle.in_use)
            .ok_or(Error::TooManyFilesOpen)?;

        self.handles[slot] = FileHandle {
            in_use: true,
            start_cluster,
            current_cluster: start_cluster,
            current_sector: 0,
            bytes_remaining: file_size,
            file_size,
            entry_dir_cluster,
            entry_dir_sector,
            entry_index,
            tail_cluster: 0,
            tail_sector: 0,
            dirty: false,
        };

        self.regs.file_handle = slot as u8;
        Ok(slot as u8)
    }

    /// Stream the next sector of an open file into the buffer.
    ///
    /// Returns the number of valid bytes and whether more sectors
    /// follow. The cursor is advanced before the data sector is loaded
    /// (the FAT lookup shares the buffer); the tail past the valid
    /// prefix is zero-filled. A drained handle keeps answering `Done`
    /// with zero bytes and a zeroed buffer.
    pub(crate) fn file_read(&mut self, index: u8) -> Result<(u16, Stream)> {
        let mut handle = self.checked_handle(index)?;

        if handle.bytes_remaining == 0 || handle.current_cluster < 2 {
            self.buffer.fill(0);
            self.regs.sector_bytes = 0;
            return Ok((0, Stream::Done));
        }

        let cluster = handle.current_cluster;
        let sector = handle.current_sector;

        let mut chain_ended = false;
        if handle.current_sector + 1 < self.bpb.sectors_per_cluster() {
            handle.current_sector += 1;
        } else {
            let next = self.fat_next(cluster)?;
            if is_eoc(next) || next == FREE_CLUSTER {
                chain_ended = true;
            } else {
                handle.current_cluster = next;
                handle.current_sector = 0;
            }
        }

        self.load_data_sector(cluster, sector)?;

        let bytes = handle.bytes_remaining.min(SECTOR_SIZE as u32) as u16;
        if (bytes as usize) < SECTOR_SIZE {
            self.buffer[bytes as usize..].fill(0);
        }
        handle.bytes_remaining -= bytes as u32;

        let stream = if handle.bytes_remaining == 0 || chain_ended {
            Stream::Done
        } else {
            Stream::More
        };

        self.handles[index as usize] = handle;
        self.regs.sector_bytes = bytes;
        Ok((bytes, stream))
    }

    /// Skip the read cursor forward by whole sectors. The sentinel
    /// `0xFFFFFFFF` lands on the file's last sector. Seeking past the
    /// end fails without moving the cursor.
    pub(crate) fn file_seek(&mut self, index: u8, sector_count: u32) -> Result<()> {
        let mut handle = self.checked_handle(index)?;

        let count = if sector_count == u32::MAX {
            if handle.bytes_remaining == 0 {
                0
            } else {
                (handle.bytes_remaining - 1) / SECTOR_SIZE as u32
            }
        } else {
            sector_count
        };

        let mut cluster = handle.current_cluster;
        let mut sector = handle.current_sector;
        let mut remaining = handle.bytes_remaining;

        for _ in 0..count {
            if remaining <= SECTOR_SIZE as u32 {
                return Err(Error::SeekPastEof);
            }
            if sector + 1 < self.bpb.sectors_per_cluster() {
                sector += 1;
            } else {
                let next = self.fat_next(cluster)?;
                if is_eoc(next) || next == FREE_CLUSTER {
                    return Err(Error::SeekPastEof);
                }
                cluster = next;
                sector = 0;
            }
            remaining -= SECTOR_SIZE as u32;
        }

        handle.current_cluster = cluster;
        handle.current_sector = sector;
        handle.bytes_remaining = remaining;
        self.handles[index as usize] = handle;
        self.regs.sector_bytes = remaining.min(SECTOR_SIZE as u32) as u16;
        Ok(())
    }

    /// Append `length` buffer bytes at end-of-file.
    ///
    /// The payload is staged on the stack because filling the tail
    /// sector reuses the shared buffer. At most two sectors are touched:
    /// the partial tail and, when the payload spills over, its
    /// successor, freshly allocated if the spill crosses the cluster
    /// boundary. Sizes only grow here; the entry update waits for close.
    pub(crate) fn file_append(&mut self, index: u8, length: u16) -> Result<()> {
        let mut handle = self.checked_handle(index)?;

        if length == 0 {
            return Ok(());
        }
        if length as usize > SECTOR_SIZE {
            return Err(Error::IncorrectOperation);
        }
        if handle.start_cluster < 2 {
            return Err(Error::IncorrectOperation);
        }

        let mut payload = [0u8; SECTOR_SIZE];
        let length = length as usize;
        payload[..length].copy_from_slice(&self.buffer[..length]);

        if handle.tail_cluster < 2 {
            let mut cluster = handle.start_cluster;
            loop {
                let next = self.fat_next(cluster)?;
                if is_eoc(next) || next == FREE_CLUSTER {
                    break;
                }
                cluster = next;
            }
            handle.tail_cluster = cluster;
            handle.tail_sector = if handle.file_size == 0 {
                0
            } else {
                (((handle.file_size - 1) / SECTOR_SIZE as u32)
                    % self.bpb.sectors_per_cluster() as u32) as u16
            };
        }

        let mut written = 0usize;
        while written < length {
            let offset = (handle.file_size % SECTOR_SIZE as u32) as usize;

            if offset == 0 && handle.file_size > 0 {
                // the previous sector is full; move onto a fresh one
                if handle.tail_sector + 1 < self.bpb.sectors_per_cluster() {
                    handle.tail_sector += 1;
                } else {
                    handle.tail_cluster = self.fat_append_cluster(handle.tail_cluster)?;
                    handle.tail_sector = 0;
                }
                self.buffer.fill(0);
            } else if offset == 0 {
                self.buffer.fill(0);
            } else {
                self.load_data_sector(handle.tail_cluster, handle.tail_sector)?;
            }

            let chunk = (SECTOR_SIZE - offset).min(length - written);
            self.buffer[offset..offset + chunk].copy_from_slice(&payload[written..written + chunk]);
            self.write_data_sector(handle.tail_cluster, handle.tail_sector)?;

            handle.file_size += chunk as u32;
            handle.bytes_remaining = handle.bytes_remaining.saturating_add(chunk as u32);
            written += chunk;
        }

        handle.dirty = true;
        self.handles[index as usize] = handle;
        Ok(())
    }

    /// Release a handle. A dirty handle first rewrites its directory
    /// entry with the grown size and the caller's write stamp; the FAT
    /// already reflects any chain growth, so ordering stays FAT-first.
    pub(crate) fn file_close(&mut self, index: u8, fat_datetime: u32) -> Result<()> {
        let handle = self.checked_handle(index)?;

        if handle.dirty {
            self.load_data_sector(handle.entry_dir_cluster, handle.entry_dir_sector)?;
            let offset = handle.entry_index as usize * DIRENT_SIZE;
            let mut entry =
                ShortDirEntry::from_bytes(&self.buffer[offset..offset + DIRENT_SIZE]);
            entry.set_file_size(handle.file_size);
            entry.set_write_datetime(fat_datetime);
            self.buffer[offset..offset + DIRENT_SIZE].copy_from_slice(entry.as_bytes());
            self.write_data_sector(handle.entry_dir_cluster, handle.entry_dir_sector)?;
        }

        self.handles[index as usize] = FileHandle::IDLE;
        Ok(())
    }
}
