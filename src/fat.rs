//! FAT chain primitives and FSInfo management
//!
//! The FAT is a flat array of 32-bit little-endian cluster pointers that
//! defines a singly linked list of the clusters of every file. Given any
//! valid cluster number N, the slot for it lives at FAT byte offset
//! `N * 4`, i.e. sector `fat_start + (N * 4) / 512`, byte
//! `(N * 4) % 512`. Because 512 is divisible by 4, a slot never spans a
//! sector boundary.
//!
//! A FAT32 slot is really a 28-bit value: the high 4 bits are reserved
//! and must be preserved when writing. `0x10000000`, `0xF0000000` and
//! `0x00000000` all mean the cluster is free, because the high bits are
//! ignored on read.
//!
//! Every mutation goes through [`Volume::fat_set`], which patches the
//! slot and writes the sector to the primary FAT and every mirror in
//! order, keeping the mirrors byte-identical. [`Volume::fat_free_chain`]
//! is the one exception for throughput: it batches slot clears per FAT
//! sector and flushes each sector (again to all mirrors) when the chain
//! crosses into the next one.
//!
//! Clusters 0 and 1 are reserved; none of these primitives may be called
//! with them.

use crate::bpb::{FsInfo, FSINFO_SECTOR, FSI_FREE_COUNT, FSI_NEXT_FREE};
use crate::device::BlockDevice;
use crate::fs::Volume;
use crate::{
    is_eoc, read_le_u32, write_le_u32, Error, Result, CLUSTER_MASK, END_OF_CLUSTER,
    FAT_ENTRIES_PER_SECTOR, FREE_CLUSTER, FSI_NO_VALUE,
};

use log::{debug, trace};

impl<D: BlockDevice> Volume<D> {
    /// Follow one link: return the pointer stored in `cluster`'s slot,
    /// masked to its significant 28 bits. Callers compare against the
    /// EOC range via [`is_eoc`].
    pub(crate) fn fat_next(&mut self, cluster: u32) -> Result<u32> {
        let (lba, offset) = self.bpb.fat_slot_of(cluster);
        self.load_sector(lba)?;
        Ok(read_le_u32(&self.buffer[offset..]) & CLUSTER_MASK)
    }

    /// The atomic update primitive: patch `cluster`'s slot to `value`
    /// and write the containing sector to the primary FAT and every
    /// mirror at strides of the FAT size. All allocation changes pass
    /// through here, so the mirrors stay byte-identical.
    pub(crate) fn fat_set(&mut self, cluster: u32, value: u32) -> Result<()> {
        let (lba, offset) = self.bpb.fat_slot_of(cluster);
        self.load_sector(lba)?;

        let old = read_le_u32(&self.buffer[offset..]);
        write_le_u32(
            &mut self.buffer[offset..],
            (old & !CLUSTER_MASK) | (value & CLUSTER_MASK),
        );

        self.flush_fat_sector(lba)
    }

    /// Write the FAT sector sitting in the buffer to the primary FAT
    /// and all mirrors, primary first.
    fn flush_fat_sector(&mut self, lba: u32) -> Result<()> {
        let mut mirror_lba = lba;
        for _ in 0..self.bpb.fat_cnt() {
            self.write_current_sector(mirror_lba)?;
            mirror_lba += self.bpb.fat_size_sectors();
        }
        Ok(())
    }

    /// Scan the FAT for the first free slot, starting at the sector that
    /// holds `start_cluster`'s slot. Linear in the FAT size; the only
    /// optimization is the caller-provided starting hint. Slots past the
    /// highest real cluster are never considered.
    pub(crate) fn fat_first_free(&mut self, start_cluster: u32) -> Result<u32> {
        let max_cluster = self.bpb.max_cluster();
        let start_sector = start_cluster / FAT_ENTRIES_PER_SECTOR;

        for sector in start_sector..self.bpb.fat_size_sectors() {
            self.load_sector(self.bpb.fat_start_lba() + sector)?;
            let mut cluster = sector * FAT_ENTRIES_PER_SECTOR;
            for slot in 0..FAT_ENTRIES_PER_SECTOR as usize {
                if cluster > max_cluster {
                    return Err(Error::DeviceFull);
                }
                if cluster >= 2
                    && read_le_u32(&self.buffer[slot * 4..]) & CLUSTER_MASK == FREE_CLUSTER
                {
                    return Ok(cluster);
                }
                cluster += 1;
            }
        }

        Err(Error::DeviceFull)
    }

    /// Pick a free cluster, consulting the FSInfo hint first. A missing
    /// or stale hint triggers a full recalculation; only after that
    /// confirms the FAT has no zero slot left does the device count as
    /// full.
    fn fat_take_free(&mut self) -> Result<u32> {
        let fsinfo = self.fsinfo_read()?;

        let hint = fsinfo.next_free_cluster;
        if hint != FSI_NO_VALUE && hint <= self.bpb.max_cluster() {
            if let Ok(cluster) = self.fat_first_free(hint) {
                return Ok(cluster);
            }
        }

        let rebuilt = self.fsinfo_recalculate()?;
        if rebuilt.next_free_cluster == FSI_NO_VALUE {
            return Err(Error::DeviceFull);
        }
        self.fat_first_free(rebuilt.next_free_cluster)
    }

    /// Reserve one cluster as a chain of its own: slot set to EOC,
    /// FSInfo hints advanced. The start of every new file or directory.
    pub(crate) fn fat_reserve_cluster(&mut self) -> Result<u32> {
        let cluster = self.fat_take_free()?;
        self.fat_set(cluster, END_OF_CLUSTER)?;
        self.fsinfo_consume(cluster)?;
        trace!("reserved cluster {}", cluster);
        Ok(cluster)
    }

    /// Extend a chain past `tail_cluster` by one cluster and return it.
    /// The FAT is linked before the new slot is terminated, so a crash
    /// in between leaves an allocated-but-unreferenced cluster rather
    /// than a dangling pointer.
    pub(crate) fn fat_append_cluster(&mut self, tail_cluster: u32) -> Result<u32> {
        let cluster = self.fat_take_free()?;
        self.fat_set(tail_cluster, cluster)?;
        self.fat_set(cluster, END_OF_CLUSTER)?;
        self.fsinfo_consume(cluster)?;
        trace!("appended cluster {} after {}", cluster, tail_cluster);
        Ok(cluster)
    }

    /// Walk the chain starting at `first_cluster`, zeroing every slot,
    /// and return how many clusters were freed. Slot clears are batched
    /// per FAT sector; a sector is flushed (primary plus mirrors) only
    /// when the walk crosses into the next one.
    ///
    /// A free pointer found mid-chain is corruption; the walk stops
    /// there instead of looping, and no repair is attempted.
    pub(crate) fn fat_free_chain(&mut self, first_cluster: u32) -> Result<u32> {
        let max_cluster = self.bpb.max_cluster();
        let mut freed = 0u32;
        let mut current = first_cluster;
        let mut loaded: Option<u32> = None;

        loop {
            let (lba, offset) = self.bpb.fat_slot_of(current);
            if loaded != Some(lba) {
                if let Some(previous) = loaded {
                    self.flush_fat_sector(previous)?;
                }
                self.load_sector(lba)?;
                loaded = Some(lba);
            }

            let next = read_le_u32(&self.buffer[offset..]) & CLUSTER_MASK;
            write_le_u32(&mut self.buffer[offset..], FREE_CLUSTER);
            freed += 1;

            if is_eoc(next) || next == FREE_CLUSTER || next > max_cluster {
                break;
            }
            current = next;
        }

        if let Some(lba) = loaded {
            self.flush_fat_sector(lba)?;
        }

        trace!("freed {} clusters starting at {}", freed, first_cluster);
        Ok(freed)
    }

    /// Read the two FSInfo hints verbatim.
    pub(crate) fn fsinfo_read(&mut self) -> Result<FsInfo> {
        self.load_sector(FSINFO_SECTOR)?;
        Ok(FsInfo {
            free_cluster_count: read_le_u32(&self.buffer[FSI_FREE_COUNT..]),
            next_free_cluster: read_le_u32(&self.buffer[FSI_NEXT_FREE..]),
        })
    }

    /// Patch the two hint fields and flush. The rest of the sector,
    /// signatures included, is preserved because the sector is loaded
    /// before patching.
    pub(crate) fn fsinfo_write(&mut self, fsinfo: FsInfo) -> Result<()> {
        self.load_sector(FSINFO_SECTOR)?;
        write_le_u32(&mut self.buffer[FSI_FREE_COUNT..], fsinfo.free_cluster_count);
        write_le_u32(&mut self.buffer[FSI_NEXT_FREE..], fsinfo.next_free_cluster);
        self.write_current_sector(FSINFO_SECTOR)
    }

    /// Account for one newly allocated cluster.
    fn fsinfo_consume(&mut self, cluster: u32) -> Result<()> {
        let mut fsinfo = self.fsinfo_read()?;
        fsinfo.next_free_cluster = cluster;
        if fsinfo.knows_free_count() {
            fsinfo.free_cluster_count = fsinfo.free_cluster_count.saturating_sub(1);
        }
        self.fsinfo_write(fsinfo)
    }

    /// Account for a freed chain: the head becomes the next-free hint
    /// and the free count grows by the number of clusters returned.
    pub(crate) fn fsinfo_release(&mut self, head_cluster: u32, freed: u32) -> Result<()> {
        let mut fsinfo = self.fsinfo_read()?;
        fsinfo.next_free_cluster = head_cluster;
        if fsinfo.knows_free_count() {
            fsinfo.free_cluster_count = fsinfo.free_cluster_count.saturating_add(freed);
        }
        self.fsinfo_write(fsinfo)
    }

    /// Rebuild both hints from the FAT itself: scan every slot of the
    /// primary FAT, count the zeros among real clusters, note the first
    /// one, and write the result back. Invoked lazily: on mount when the
    /// on-disk free count is the sentinel, and when an allocation finds
    /// the next-free hint stale.
    pub(crate) fn fsinfo_recalculate(&mut self) -> Result<FsInfo> {
        let max_cluster = self.bpb.max_cluster();
        let mut free_count = 0u32;
        let mut first_free = FSI_NO_VALUE;

        'scan: for sector in 0..self.bpb.fat_size_sectors() {
            self.load_sector(self.bpb.fat_start_lba() + sector)?;
            let base = sector * FAT_ENTRIES_PER_SECTOR;
            for slot in 0..FAT_ENTRIES_PER_SECTOR as usize {
                let cluster = base + slot as u32;
                if cluster < 2 {
                    continue;
                }
                if cluster > max_cluster {
                    break 'scan;
                }
                if read_le_u32(&self.buffer[slot * 4..]) & CLUSTER_MASK == FREE_CLUSTER {
                    free_count += 1;
                    if first_free == FSI_NO_VALUE {
                        first_free = cluster;
                    }
                }
            }
        }

        let fsinfo = FsInfo {
            free_cluster_count: free_count,
            next_free_cluster: first_free,
        };
        self.fsinfo_write(fsinfo)?;

        debug!(
            "fsinfo rebuilt: {} free clusters, next free {}",
            free_count, first_free
        );
        Ok(fsinfo)
    }
}
