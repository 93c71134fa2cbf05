//! Operation dispatch
//!
//! The host drives the driver through one entry point,
//! [`Volume::operate`], parameterized by an opcode byte. Variable
//! parameters (paths, counts, payloads) travel in the shared sector
//! buffer; small fixed parameters (handle index, payload length) and
//! every reply's status live in the register file. `IncorrectOperation`
//! is the dispatch fallback for unknown opcodes and the only result
//! produced without touching the disk.
//!
//! Opcode numbering groups by layer: `0x0x` initialization, `0x1x` disk
//! queries, `0x2x` directories, `0x3x` files, `0x4x` generic entry
//! operations.

use crate::bpb::BOOT_SECTOR;
use crate::device::BlockDevice;
use crate::dir::{split_path, DirCursor};
use crate::entry::ShortDirEntry;
use crate::file::FileHandle;
use crate::fs::Volume;
use crate::{
    is_illegal_name, read_le_u32, short_name_from, write_le_u32, Continuation, Error, Result,
    Status, Stream, ATTR_ANY, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_UNUSED, DOT,
    MAX_PATH, SECTOR_SIZE, SHORT_NAME_LEN, SPACE,
};

/// The closed operation set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    // initialization
    Init = 0x00,
    FsInfoRecalc = 0x01,

    // disk operations
    Free = 0x10,
    Boot = 0x11,

    // directory operations
    Dir = 0x20,
    Mkdir = 0x21,
    Rmdir = 0x22,
    Cd = 0x23,

    // file operations
    Open = 0x30,
    Create = 0x31,
    Close = 0x32,
    Seek = 0x33,
    Read = 0x34,
    Append = 0x36,

    // dir/file operations
    Stat = 0x40,
    Rm = 0x41,
    Mv = 0x42,
}

impl Operation {
    pub fn from_opcode(opcode: u8) -> Option<Operation> {
        Some(match opcode {
            0x00 => Operation::Init,
            0x01 => Operation::FsInfoRecalc,
            0x10 => Operation::Free,
            0x11 => Operation::Boot,
            0x20 => Operation::Dir,
            0x21 => Operation::Mkdir,
            0x22 => Operation::Rmdir,
            0x23 => Operation::Cd,
            0x30 => Operation::Open,
            0x31 => Operation::Create,
            0x32 => Operation::Close,
            0x33 => Operation::Seek,
            0x34 => Operation::Read,
            0x36 => Operation::Append,
            0x40 => Operation::Stat,
            0x41 => Operation::Rm,
            0x42 => Operation::Mv,
            _ => return None,
        })
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Execute one operation to completion and record its status in the
    /// register file. `fat_datetime` packs the host clock's 16-bit FAT
    /// time (low half) and date (high half) and stamps whatever the
    /// operation creates or closes.
    pub fn operate(&mut self, opcode: u8, fat_datetime: u32) -> Status {
        let status = match self.dispatch(opcode, fat_datetime) {
            Ok(Stream::Done) => Status::Ok,
            Ok(Stream::More) => Status::MoreData,
            Err(err) => err.into(),
        };
        self.regs.last_result = status;
        status
    }

    fn dispatch(&mut self, opcode: u8, fat_datetime: u32) -> Result<Stream> {
        let operation = Operation::from_opcode(opcode).ok_or(Error::IncorrectOperation)?;

        if !self.mounted && operation != Operation::Init {
            return Err(Error::IncorrectOperation);
        }

        match operation {
            Operation::Init => self.mount().map(done),
            Operation::FsInfoRecalc => self.fsinfo_recalculate().map(done),
            Operation::Free => self.op_free().map(done),
            Operation::Boot => self.load_sector(BOOT_SECTOR).map(done),
            Operation::Dir => self.op_dir(),
            Operation::Mkdir => self.op_mkdir(fat_datetime).map(done),
            Operation::Rmdir => self.op_rmdir().map(done),
            Operation::Cd => self.op_cd().map(done),
            Operation::Open => self.op_open().map(done),
            Operation::Create => self.op_create(fat_datetime).map(done),
            Operation::Close => self.op_close(fat_datetime).map(done),
            Operation::Seek => self.op_seek().map(done),
            Operation::Read => self.op_read(),
            Operation::Append => self.op_append().map(done),
            Operation::Stat => self.op_stat().map(done),
            Operation::Rm => self.op_rm().map(done),
            Operation::Mv => self.op_mv().map(done),
        }
    }

    /// Copy a NUL-terminated path out of the shared buffer before the
    /// operation starts clobbering it. Paths are bounded to 127 bytes
    /// plus the terminator.
    fn take_path(&self, start: usize) -> Result<([u8; MAX_PATH], usize)> {
        let mut path = [0u8; MAX_PATH];
        let end = (start + MAX_PATH).min(SECTOR_SIZE);
        let source = &self.buffer[start..end];

        let length = source
            .iter()
            .position(|&byte| byte == 0)
            .ok_or(Error::FilePathTooLong)?;
        path[..length].copy_from_slice(&source[..length]);
        Ok((path, length))
    }

    /// Report free space from the FSInfo hint, recalculating when the
    /// hint is unknown. The count lands as a little-endian u32 at buffer
    /// offset 0.
    fn op_free(&mut self) -> Result<()> {
        let fsinfo = self.fsinfo_read()?;
        let count = if fsinfo.knows_free_count() {
            fsinfo.free_cluster_count
        } else {
            self.fsinfo_recalculate()?.free_cluster_count
        };

        self.buffer.fill(0);
        write_le_u32(&mut self.buffer[..4], count);
        Ok(())
    }

    /// Stream the current directory one sector page per call. Buffer
    /// byte 0 selects start-over or continuation; the cursor lives in
    /// the handle table's reserved slot. Once the listing is exhausted,
    /// further continuations answer `Ok` with a zeroed page.
    fn op_dir(&mut self) -> Result<Stream> {
        if Continuation::from_byte(self.buffer[0]) == Continuation::StartOver {
            let mut slot = FileHandle::IDLE;
            slot.in_use = true;
            slot.current_cluster = self.current_dir_cluster;
            slot.current_sector = 0;
            *self.dir_stream_slot() = slot;
        }

        let slot = *self.dir_stream_slot();
        if !slot.in_use {
            self.buffer.fill(0);
            return Ok(Stream::Done);
        }

        let mut cursor = DirCursor::start(slot.current_cluster);
        cursor.sector = slot.current_sector;

        match self.dir_advance(&mut cursor)? {
            None => {
                self.buffer.fill(0);
                self.dir_stream_slot().in_use = false;
                Ok(Stream::Done)
            }
            Some(_) => {
                if cursor.finished {
                    self.dir_stream_slot().in_use = false;
                    Ok(Stream::Done)
                } else {
                    let slot = self.dir_stream_slot();
                    slot.current_cluster = cursor.cluster;
                    slot.current_sector = cursor.sector;
                    Ok(Stream::More)
                }
            }
        }
    }

    fn op_cd(&mut self) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        let location = self.resolve_path(&path[..length], ATTR_DIRECTORY)?;
        self.current_dir_cluster = location.data_cluster;
        Ok(())
    }

    fn op_mkdir(&mut self, fat_datetime: u32) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        self.create_node(&path[..length], ATTR_DIRECTORY, fat_datetime)?;
        Ok(())
    }

    fn op_create(&mut self, fat_datetime: u32) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        self.create_node(&path[..length], ATTR_ARCHIVE, fat_datetime)?;
        Ok(())
    }

    fn op_rmdir(&mut self) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        let location = self.resolve_path(&path[..length], ATTR_ANY)?;
        let entry = location.entry.ok_or(Error::PathNotFound)?;

        if entry.attr & ATTR_DIRECTORY == 0 {
            return Err(Error::NotADirectory);
        }

        // Refuse to remove a directory through its own dot entry.
        self.load_data_sector(entry.dir_cluster, entry.dir_sector)?;
        if self.buffer[entry.index as usize * DIRENT_SIZE] == DOT {
            return Err(Error::InvalidFilename);
        }

        if self.dir_entry_count(location.data_cluster)? != 2 {
            return Err(Error::DirNotEmpty);
        }

        self.remove_entry(&entry, location.data_cluster)
    }

    fn op_rm(&mut self) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        let location = self.resolve_path(&path[..length], ATTR_ARCHIVE)?;
        let entry = location.entry.ok_or(Error::PathNotFound)?;
        self.remove_entry(&entry, location.data_cluster)
    }

    /// Return the path's 32-byte directory entry at buffer offset 0 with
    /// the rest zeroed. The root has no entry of its own; it reports a
    /// synthesized blank-named directory record instead.
    fn op_stat(&mut self) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        let location = self.resolve_path(&path[..length], ATTR_ANY)?;

        match location.entry {
            Some(entry) => {
                self.load_data_sector(entry.dir_cluster, entry.dir_sector)?;
                let offset = entry.index as usize * DIRENT_SIZE;
                self.buffer.copy_within(offset..offset + DIRENT_SIZE, 0);
                self.buffer[DIRENT_SIZE..].fill(0);
            }
            None => {
                let root = ShortDirEntry::new(
                    &[SPACE; SHORT_NAME_LEN],
                    ATTR_DIRECTORY,
                    0,
                    self.bpb.root_cluster(),
                    0,
                );
                self.buffer.fill(0);
                self.buffer[..DIRENT_SIZE].copy_from_slice(root.as_bytes());
            }
        }
        Ok(())
    }

    /// Rename: two NUL-terminated paths in the buffer, source first.
    /// The entry record moves verbatim (cluster, size, stamps) under its
    /// new name; the source slot is only marked deleted after the new
    /// entry is on disk. A directory moved under a different parent gets
    /// its dotdot entry repointed.
    fn op_mv(&mut self) -> Result<()> {
        let (source, source_length) = self.take_path(0)?;
        let (target, target_length) = self.take_path(source_length + 1)?;

        let location = self.resolve_path(&source[..source_length], ATTR_ANY)?;
        let entry = location.entry.ok_or(Error::PathNotFound)?;

        self.load_data_sector(entry.dir_cluster, entry.dir_sector)?;
        let offset = entry.index as usize * DIRENT_SIZE;
        let mut moved = ShortDirEntry::from_bytes(&self.buffer[offset..offset + DIRENT_SIZE]);
        if moved.name_bytes()[0] == DOT {
            return Err(Error::InvalidFilename);
        }

        let (parent_path, base) = split_path(&target[..target_length]);
        let name = short_name_from(base);
        if is_illegal_name(&name) || name[0] == DOT {
            return Err(Error::InvalidFilename);
        }

        let parent = self.resolve_path(parent_path, ATTR_DIRECTORY)?.data_cluster;
        match self.find_in_dir(parent, &name, ATTR_ANY) {
            Ok(_) => return Err(Error::FileAlreadyExists),
            Err(Error::PathNotFound) => {}
            Err(err) => return Err(err),
        }

        moved.set_name(&name);
        self.insert_entry(parent, &moved)?;

        self.load_data_sector(entry.dir_cluster, entry.dir_sector)?;
        self.buffer[offset] = DIR_ENTRY_UNUSED;
        self.write_data_sector(entry.dir_cluster, entry.dir_sector)?;

        if moved.is_dir() {
            let parent_link = if parent == self.bpb.root_cluster() {
                0
            } else {
                parent
            };
            self.load_data_sector(moved.first_cluster(), 0)?;
            let mut dotdot =
                ShortDirEntry::from_bytes(&self.buffer[DIRENT_SIZE..2 * DIRENT_SIZE]);
            if dotdot.name_bytes()[..2] == *b".." {
                dotdot.set_first_cluster(parent_link);
                self.buffer[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.as_bytes());
                self.write_data_sector(moved.first_cluster(), 0)?;
            }
        }

        Ok(())
    }

    fn op_open(&mut self) -> Result<()> {
        let (path, length) = self.take_path(0)?;
        let location = self.resolve_path(&path[..length], ATTR_ARCHIVE)?;
        let entry = location.entry.ok_or(Error::PathNotFound)?;

        self.file_open(
            location.data_cluster,
            entry.file_size,
            entry.dir_cluster,
            entry.dir_sector,
            entry.index,
        )?;
        Ok(())
    }

    fn op_close(&mut self, fat_datetime: u32) -> Result<()> {
        let handle = self.regs.file_handle;
        self.file_close(handle, fat_datetime)
    }

    fn op_seek(&mut self) -> Result<()> {
        let handle = self.regs.file_handle;
        let count = read_le_u32(&self.buffer[..4]);
        self.file_seek(handle, count)
    }

    fn op_read(&mut self) -> Result<Stream> {
        let handle = self.regs.file_handle;
        let (_, stream) = self.file_read(handle)?;
        Ok(stream)
    }

    fn op_append(&mut self) -> Result<()> {
        let handle = self.regs.file_handle;
        let length = self.regs.sector_bytes;
        self.file_append(handle, length)
    }
}

/// Collapse a unit-returning operation into the streaming shape.
fn done<T>(_: T) -> Stream {
    Stream::Done
}
