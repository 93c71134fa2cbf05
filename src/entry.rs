//! FAT 32-byte directory entry
//!
//! A directory is nothing but a regular file whose contents are a series
//! of these records, sixteen per sector. Special notes about the first
//! byte (`DIR_Name[0]`):
//! - `0xE5`: the entry is free and may be reused.
//! - `0x00`: the entry is free, and no allocated entries follow it in
//!   this directory. The rest of the entries do not need to be examined.
//!
//! The name field is broken into the 8-character main part and the
//! 3-character extension, both trailing-space padded with `0x20`. There
//! is an implied `.` between them that is not stored. Lower case is not
//! allowed on disk; names are normalized to ASCII upper case on the way
//! in.
//!
//! When a directory is created, its `DIR_FileSize` is set to 0 and stays
//! 0; directories are sized by following their cluster chains to the EOC
//! mark. Every directory except the root begins with the dot entry (a
//! directory that points to itself) and the dotdot entry (pointing to
//! the starting cluster of the parent, which is stored as 0 when the
//! parent is the root).
//!
//! All multi-byte fields are little endian, like everything else on a
//! FAT volume.

use crate::{
    ATTR_DIRECTORY, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED, DIRENT_SIZE, SHORT_NAME_LEN,
    SPACE,
};

/// FAT 32 Byte Directory Entry Structure
//
//  8 + 3 + 1 + 1 + 1 + 2 + 2 + 2 + 2 + 2 + 2 + 2 + 4 = 32 bytes
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct ShortDirEntry {
    /// Short name, 8 bytes main part.
    ///
    /// size: (8+3) bytes    offset: 0x00
    name: [u8; 8],
    /// Short name extension.
    extension: [u8; 3],
    /// Attributes: bit 4 marks a directory, bit 5 a file (archive).
    ///
    /// size: 1 byte    offset: 0x0B
    attr: u8,
    /// Reserved for Windows NT; left zero.
    nt_res: u8,
    /// Count of tenths of a second of the creation time, 0-199.
    crt_time_tenth: u8,
    /// Time file was created, 2-second granularity.
    ///
    /// size: 2 bytes    offset: 0x0E
    crt_time: u16,
    /// Date file was created.
    ///
    /// size: 2 bytes    offset: 0x10
    crt_date: u16,
    /// Last access date; the date of last read or write.
    ///
    /// size: 2 bytes    offset: 0x12
    lst_acc_date: u16,
    /// High word of this entry's first cluster number.
    ///
    /// size: 2 bytes    offset: 0x14
    fst_clus_hi: u16,
    /// Time of last write. File creation is considered a write.
    ///
    /// size: 2 bytes    offset: 0x16
    wrt_time: u16,
    /// Date of last write.
    ///
    /// size: 2 bytes    offset: 0x18
    wrt_date: u16,
    /// Low word of this entry's first cluster number.
    ///
    /// size: 2 bytes    offset: 0x1A
    fst_clus_lo: u16,
    /// File size in bytes; always 0 for a directory.
    ///
    /// size: 4 bytes    offset: 0x1C
    file_size: u32,
}

impl Default for ShortDirEntry {
    fn default() -> Self {
        Self::empty()
    }
}

impl ShortDirEntry {
    pub fn empty() -> Self {
        Self {
            name: [0; 8],
            extension: [0; 3],
            attr: 0,
            nt_res: 0,
            crt_time_tenth: 0,
            crt_time: 0,
            crt_date: 0,
            lst_acc_date: 0,
            fst_clus_hi: 0,
            wrt_time: 0,
            wrt_date: 0,
            fst_clus_lo: 0,
            file_size: 0,
        }
    }

    /// Build a fresh entry from an 11-byte normalized name.
    ///
    /// `fat_datetime` packs the 16-bit FAT time in its low half and the
    /// 16-bit FAT date in its high half; creation, write and access
    /// stamps all start out equal.
    pub fn new(
        name: &[u8; SHORT_NAME_LEN],
        attr: u8,
        fat_datetime: u32,
        first_cluster: u32,
        file_size: u32,
    ) -> Self {
        let time = (fat_datetime & 0xFFFF) as u16;
        let date = (fat_datetime >> 16) as u16;

        let mut item = Self::empty();
        item.name.copy_from_slice(&name[..8]);
        item.extension.copy_from_slice(&name[8..]);
        item.attr = attr;
        item.crt_time = time;
        item.crt_date = date;
        item.lst_acc_date = date;
        item.wrt_time = time;
        item.wrt_date = date;
        item.set_first_cluster(first_cluster);
        item.file_size = file_size;
        item
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const ShortDirEntry) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const ShortDirEntry as *const u8, DIRENT_SIZE) }
    }

    /// Get the start cluster number of the file.
    pub fn first_cluster(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | (self.fst_clus_lo as u32)
    }

    /// Set the start cluster number of the file.
    pub fn set_first_cluster(&mut self, cluster: u32) {
        self.fst_clus_hi = (cluster >> 16) as u16;
        self.fst_clus_lo = (cluster & 0xFFFF) as u16;
    }

    /// The full 11-byte name slot, for slot-for-slot comparison.
    pub fn name_bytes(&self) -> [u8; SHORT_NAME_LEN] {
        let mut full = [SPACE; SHORT_NAME_LEN];
        full[..8].copy_from_slice(&self.name);
        full[8..].copy_from_slice(&self.extension);
        full
    }

    pub fn set_name(&mut self, name: &[u8; SHORT_NAME_LEN]) {
        self.name.copy_from_slice(&name[..8]);
        self.extension.copy_from_slice(&name[8..]);
    }

    pub fn name_matches(&self, name: &[u8; SHORT_NAME_LEN]) -> bool {
        self.name_bytes() == *name
    }

    pub fn attr(&self) -> u8 {
        self.attr
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    /// The entry has been deleted and the slot may be reused.
    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// The end-of-directory marker; nothing allocated follows.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_free(&self) -> bool {
        self.is_deleted() || self.is_end()
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn set_file_size(&mut self, file_size: u32) {
        self.file_size = file_size;
    }

    pub fn set_write_datetime(&mut self, fat_datetime: u32) {
        self.wrt_time = (fat_datetime & 0xFFFF) as u16;
        self.wrt_date = (fat_datetime >> 16) as u16;
        self.lst_acc_date = self.wrt_date;
    }

    pub fn delete(&mut self) {
        self.name[0] = DIR_ENTRY_UNUSED;
    }
}
