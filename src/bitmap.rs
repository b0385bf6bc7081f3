//! Bitmap-based block and inode allocation.
//!
//! Each block group has a block bitmap and an inode bitmap; free counts are
//! tracked in the group descriptor and in sharded in-memory counters (the
//! on-disk superblock counts are advisory). Allocation is first-fit: groups
//! are scanned in order — from group 0 for inodes, from the inode's home
//! group for blocks — and the first clear bit (lowest index) wins. All
//! bitmap read-modify-write cycles for a group run under that group's
//! spinlock, which prevents two threads from claiming the same bit.
//!
//! The extent engine requires physically contiguous runs, so block
//! allocation searches for a run of `n` clear bits rather than single bits.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use zerocopy::FromBytes;

use crate::buffer::BlockBuf;
use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::structs::{MAX_BUDDY_ORDER, RawGroupDesc};

impl PackFs {
    /// Run `f` over the group's descriptor, read-only.
    pub(crate) fn with_desc<R>(
        &self,
        group: u32,
        f: impl FnOnce(&RawGroupDesc) -> R,
    ) -> Result<R> {
        let (buf, off) = self.desc_buf(group)?;
        let data = buf.data();
        let desc = RawGroupDesc::ref_from_bytes(&data[off..off + size_of::<RawGroupDesc>()])
            .map_err(|_| FsError::CorruptMetadata("group descriptor out of bounds".into()))?;
        Ok(f(desc))
    }

    /// Run `f` over the group's descriptor with write access and mark the
    /// descriptor block dirty.
    pub(crate) fn with_desc_mut<R>(
        &self,
        group: u32,
        f: impl FnOnce(&mut RawGroupDesc) -> R,
    ) -> Result<R> {
        let (buf, off) = self.desc_buf(group)?;
        let ret = {
            let mut data = buf.data();
            let desc =
                RawGroupDesc::mut_from_bytes(&mut data[off..off + size_of::<RawGroupDesc>()])
                    .map_err(|_| {
                        FsError::CorruptMetadata("group descriptor out of bounds".into())
                    })?;
            f(desc)
        };
        buf.mark_dirty();
        Ok(ret)
    }

    fn desc_buf(&self, group: u32) -> Result<(Arc<BlockBuf>, usize)> {
        if group >= self.geo.groups_count {
            return Err(FsError::CorruptMetadata(format!(
                "invalid block group {group}"
            )));
        }
        let desc_block = (group / self.geo.desc_per_block) as usize;
        let off = (group % self.geo.desc_per_block) as usize * size_of::<RawGroupDesc>();
        let buf = self.cache.read(self.desc_blocks[desc_block])?;
        Ok((buf, off))
    }

    pub(crate) fn read_block_bitmap(&self, group: u32) -> Result<Arc<BlockBuf>> {
        let block = self.with_desc(group, |d| d.block_bitmap.get())?;
        self.cache.read(block as u64)
    }

    pub(crate) fn read_inode_bitmap(&self, group: u32) -> Result<Arc<BlockBuf>> {
        let block = self.with_desc(group, |d| d.inode_bitmap.get())?;
        self.cache.read(block as u64)
    }

    /// Blocks actually present in `group`; the last group may be short.
    pub(crate) fn blocks_in_group(&self, group: u32) -> u32 {
        let data_blocks = self.geo.blocks_count - self.geo.first_data_block;
        let before = group * self.geo.blocks_per_group;
        (data_blocks - before).min(self.geo.blocks_per_group)
    }

    /// Allocate one inode, scanning groups from 0 upward.
    ///
    /// Returns the 1-indexed inode number and its home group. Free counts in
    /// the descriptor and the sharded counters are updated; directory counts
    /// are bumped for directories.
    pub(crate) fn alloc_inode_bit(&self, is_dir: bool) -> Result<(u32, u32)> {
        for group in 0..self.geo.groups_count {
            let free = self.with_desc(group, |d| d.free_inodes_count.get())?;
            if free == 0 {
                continue;
            }

            let _guard = self.group_locks[group as usize].lock();
            let bitmap = self.read_inode_bitmap(group)?;
            let bit = {
                let mut data = bitmap.data();
                match find_first_clear_bit(&data, self.geo.inodes_per_group as usize) {
                    Some(bit) => {
                        set_bit(&mut data, bit);
                        bit
                    }
                    None => continue,
                }
            };
            bitmap.mark_dirty();

            self.with_desc_mut(group, |d| {
                d.free_inodes_count.set(d.free_inodes_count.get() - 1);
                if is_dir {
                    d.used_dirs_count.set(d.used_dirs_count.get() + 1);
                }
            })?;
            self.free_inodes.add(-1);
            if is_dir {
                self.dirs_counter.add(1);
            }

            let ino = group * self.geo.inodes_per_group + bit as u32 + 1;
            return Ok((ino, group));
        }
        Err(FsError::NoSpace)
    }

    /// Clear an inode's bitmap bit and return the counts.
    pub(crate) fn free_inode_bit(&self, ino: u32, is_dir: bool) -> Result<()> {
        if ino < self.geo.first_ino || ino > self.geo.inodes_count {
            return Err(FsError::CorruptMetadata(format!("invalid inode {ino}")));
        }
        let group = (ino - 1) / self.geo.inodes_per_group;
        let bit = ((ino - 1) % self.geo.inodes_per_group) as usize;

        let _guard = self.group_locks[group as usize].lock();
        let bitmap = self.read_inode_bitmap(group)?;
        {
            let mut data = bitmap.data();
            if !test_bit(&data, bit) {
                log::warn!("packfs: inode {ino} was already free");
                return Err(FsError::CorruptMetadata(format!(
                    "double free of inode {ino}"
                )));
            }
            clear_bit(&mut data, bit);
        }
        bitmap.mark_dirty();

        self.with_desc_mut(group, |d| {
            d.free_inodes_count.set(d.free_inodes_count.get() + 1);
            if is_dir {
                d.used_dirs_count.set(d.used_dirs_count.get().saturating_sub(1));
            }
        })?;
        self.free_inodes.add(1);
        if is_dir {
            self.dirs_counter.add(-1);
        }
        Ok(())
    }

    /// Allocate `n` physically contiguous blocks.
    ///
    /// The scan starts at the inode's home group and proceeds linearly with
    /// wraparound. Returns the first block of the run, or `NoSpace` when no
    /// group holds a long-enough run.
    pub(crate) fn new_blocks(&self, home_group: u32, n: u32) -> Result<u32> {
        let groups = self.geo.groups_count;
        for i in 0..groups {
            let group = (home_group + i) % groups;
            let free = self.with_desc(group, |d| d.free_blocks_count.get())?;
            if (free as u32) < n {
                continue;
            }

            let _guard = self.group_locks[group as usize].lock();
            let bitmap = self.read_block_bitmap(group)?;
            let start = {
                let mut data = bitmap.data();
                match find_clear_run(&data, self.blocks_in_group(group) as usize, n as usize) {
                    Some(start) => {
                        for bit in start..start + n as usize {
                            set_bit(&mut data, bit);
                        }
                        start
                    }
                    None => continue,
                }
            };
            bitmap.mark_dirty();

            self.with_desc_mut(group, |d| {
                d.free_blocks_count.set(d.free_blocks_count.get() - n as u16);
            })?;
            self.free_blocks.add(-(n as i64));

            let block =
                self.geo.first_data_block + group * self.geo.blocks_per_group + start as u32;
            log::debug!("packfs: allocated {n} blocks at {block} in group {group}");
            return Ok(block);
        }
        Err(FsError::NoSpace)
    }

    /// Allocate a single block.
    pub(crate) fn new_block(&self, home_group: u32) -> Result<u32> {
        self.new_blocks(home_group, 1)
    }

    /// Free one block: clear the bit and return the counts.
    pub(crate) fn free_block(&self, block: u32) -> Result<()> {
        if block < self.geo.first_data_block || block >= self.geo.blocks_count {
            log::warn!("packfs: free of out-of-range block {block}");
            return Err(FsError::CorruptMetadata(format!(
                "block {block} out of range"
            )));
        }
        let adjusted = block - self.geo.first_data_block;
        let group = adjusted / self.geo.blocks_per_group;
        let bit = (adjusted % self.geo.blocks_per_group) as usize;

        let _guard = self.group_locks[group as usize].lock();
        let bitmap = self.read_block_bitmap(group)?;
        {
            let mut data = bitmap.data();
            if !test_bit(&data, bit) {
                log::warn!("packfs: block {block} was already free");
                return Err(FsError::CorruptMetadata(format!(
                    "double free of block {block}"
                )));
            }
            clear_bit(&mut data, bit);
        }
        bitmap.mark_dirty();

        self.with_desc_mut(group, |d| {
            d.free_blocks_count.set(d.free_blocks_count.get() + 1);
        })?;
        self.free_blocks.add(1);
        self.alloc_stats.blocks_freed.fetch_add(1, Ordering::Relaxed);
        self.cache.forget(block as u64);
        Ok(())
    }

    /// Free a contiguous physical run (a compressed extent).
    pub(crate) fn free_block_run(&self, start: u32, n: u32) -> Result<()> {
        for block in start..start + n {
            self.free_block(block)?;
        }
        self.alloc_stats.extents_freed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Sum of clear bits over every group's block bitmap.
    pub(crate) fn count_free_blocks(&self) -> Result<u64> {
        let mut count = 0u64;
        for group in 0..self.geo.groups_count {
            let bitmap = self.read_block_bitmap(group)?;
            let data = bitmap.data();
            count += count_clear_bits(&data, self.blocks_in_group(group) as usize) as u64;
        }
        Ok(count)
    }

    /// Sum of clear bits over every group's inode bitmap.
    pub(crate) fn count_free_inodes(&self) -> Result<u64> {
        let mut count = 0u64;
        for group in 0..self.geo.groups_count {
            let bitmap = self.read_inode_bitmap(group)?;
            let data = bitmap.data();
            count += count_clear_bits(&data, self.geo.inodes_per_group as usize) as u64;
        }
        Ok(count)
    }

    /// Rebuild the per-group buddy histogram: for every maximal run of free
    /// blocks, bump the bucket of its floor log2 order. Reporting only.
    pub(crate) fn scan_block_bitmaps(&self) {
        let groups = self.geo.groups_count;
        let mut histogram = vec![[0u32; MAX_BUDDY_ORDER + 1]; groups as usize];
        for group in 0..groups {
            let Ok(bitmap) = self.read_block_bitmap(group) else {
                continue;
            };
            let data = bitmap.data();
            let bits = self.blocks_in_group(group) as usize;
            let mut run = 0usize;
            for bit in 0..=bits {
                if bit < bits && !test_bit(&data, bit) {
                    run += 1;
                    continue;
                }
                if run > 0 {
                    let order = (usize::BITS - 1 - run.leading_zeros()) as usize;
                    histogram[group as usize][order.min(MAX_BUDDY_ORDER)] += 1;
                    run = 0;
                }
            }
        }
        *self.buddy.lock().unwrap() = histogram;
    }
}

// =============================================================================
// Bitmap bit manipulation helpers
// =============================================================================

/// Find the first clear (0) bit, scanning up to `max_bits` bits.
pub(crate) fn find_first_clear_bit(bitmap: &[u8], max_bits: usize) -> Option<usize> {
    for (byte_idx, &byte) in bitmap.iter().enumerate() {
        if byte == 0xFF {
            continue;
        }
        for bit in 0..8u32 {
            let index = byte_idx * 8 + bit as usize;
            if index >= max_bits {
                return None;
            }
            if byte & (1 << bit) == 0 {
                return Some(index);
            }
        }
    }
    None
}

/// Find the lowest run of `n` consecutive clear bits within `max_bits`.
pub(crate) fn find_clear_run(bitmap: &[u8], max_bits: usize, n: usize) -> Option<usize> {
    debug_assert!(n > 0);
    let mut run_start = 0usize;
    let mut run_len = 0usize;
    for index in 0..max_bits.min(bitmap.len() * 8) {
        if test_bit(bitmap, index) {
            run_len = 0;
        } else {
            if run_len == 0 {
                run_start = index;
            }
            run_len += 1;
            if run_len == n {
                return Some(run_start);
            }
        }
    }
    None
}

pub(crate) fn test_bit(bitmap: &[u8], index: usize) -> bool {
    bitmap[index / 8] & (1 << (index % 8)) != 0
}

pub(crate) fn set_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] |= 1 << (index % 8);
}

pub(crate) fn clear_bit(bitmap: &mut [u8], index: usize) {
    bitmap[index / 8] &= !(1 << (index % 8));
}

pub(crate) fn count_clear_bits(bitmap: &[u8], max_bits: usize) -> usize {
    (0..max_bits.min(bitmap.len() * 8))
        .filter(|&i| !test_bit(bitmap, i))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_first_clear_empty() {
        let bitmap = [0x00u8; 128];
        assert_eq!(find_first_clear_bit(&bitmap, 1024), Some(0));
    }

    #[test]
    fn find_first_clear_partial() {
        let mut bitmap = [0x00u8; 128];
        bitmap[0] = 0x07;
        assert_eq!(find_first_clear_bit(&bitmap, 1024), Some(3));
    }

    #[test]
    fn find_first_clear_all_set() {
        let bitmap = [0xFFu8; 128];
        assert_eq!(find_first_clear_bit(&bitmap, 1024), None);
    }

    #[test]
    fn find_first_clear_respects_max() {
        let bitmap = [0x00u8; 128];
        assert_eq!(find_first_clear_bit(&bitmap, 0), None);
    }

    #[test]
    fn set_clear_round_trip() {
        let mut bitmap = [0x00u8; 128];
        assert!(!test_bit(&bitmap, 42));
        set_bit(&mut bitmap, 42);
        assert!(test_bit(&bitmap, 42));
        clear_bit(&mut bitmap, 42);
        assert!(!test_bit(&bitmap, 42));
    }

    #[test]
    fn set_preserves_neighbours() {
        let mut bitmap = [0x00u8; 16];
        set_bit(&mut bitmap, 5);
        assert!(!test_bit(&bitmap, 4));
        assert!(test_bit(&bitmap, 5));
        assert!(!test_bit(&bitmap, 6));
    }

    #[test]
    fn clear_run_found_across_bytes() {
        let mut bitmap = [0xFFu8; 16];
        // Clear bits 6..16, a run of 10 spanning two bytes.
        for bit in 6..16 {
            clear_bit(&mut bitmap, bit);
        }
        assert_eq!(find_clear_run(&bitmap, 128, 10), Some(6));
        assert_eq!(find_clear_run(&bitmap, 128, 11), None);
    }

    #[test]
    fn clear_run_prefers_lowest_index() {
        let mut bitmap = [0x00u8; 16];
        set_bit(&mut bitmap, 3);
        assert_eq!(find_clear_run(&bitmap, 128, 2), Some(0));
        assert_eq!(find_clear_run(&bitmap, 128, 4), Some(4));
    }

    #[test]
    fn count_clear_bits_bounded() {
        let mut bitmap = [0x00u8; 2];
        set_bit(&mut bitmap, 1);
        assert_eq!(count_clear_bits(&bitmap, 16), 15);
        assert_eq!(count_clear_bits(&bitmap, 8), 7);
    }
}
