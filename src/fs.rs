//! Superblock manager and filesystem-level operations.
//!
//! [`PackFs::mount`] reads the superblock at byte 1024, validates magic,
//! geometry and checksums, loads the group-descriptor table, cross-checks
//! every group against its bitmaps, rebuilds the free counters from a bitmap
//! scan (the on-disk counters are advisory), stamps the filesystem unclean,
//! replays the orphan list, and starts the compressed-write workqueue and
//! the block-group monitor. A clean unmount drains everything and restores
//! the saved state, so the next mount sees VALID again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spinning_top::Spinlock;
use zerocopy::{FromBytes, IntoBytes};

use crate::buffer::BufferCache;
use crate::checksum::{crc16, crc32};
use crate::compress::WorkspacePool;
use crate::device::BlockDevice;
use crate::dir::DirEntry;
use crate::error::{FsError, Result};
use crate::extent::{ExtentJob, WritebackControl};
use crate::file::{FileStat, PackFile, stat_of};
use crate::inode::{I_STATE_DIRTY, InodeHandle};
use crate::stats::{AllocStats, CompressionStats, ShardedCounter};
use crate::structs::{
    BASE_BLOCK_SIZE, EXTENT_SIZE, FT_DIR, FT_REG_FILE, GOOD_OLD_INODE_SIZE, LINK_MAX,
    MAX_BUDDY_ORDER, NAME_LEN, PAGE_SIZE, RawGroupDesc, RawInode, RawSuperblock, ROOT_INO,
    S_IFDIR, S_IFREG, STATE_ERROR_FS, STATE_VALID_FS, SUPER_MAGIC, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};
use crate::workqueue::WorkQueue;

/// Interval between block-group monitor scans.
const MONITOR_INTERVAL: Duration = Duration::from_secs(15);

/// Seconds since the Unix epoch, truncated to the on-disk width.
pub(crate) fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Mount options. Anything unrecognised fails the mount.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    /// Extent-based allocation hints (advisory in the core).
    pub extents: bool,
    /// Write metadata through synchronously.
    pub sync: bool,
}

impl MountOptions {
    pub fn parse(options: &str) -> Result<Self> {
        let mut opts = MountOptions::default();
        for token in options.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "extents" => opts.extents = true,
                "sync" => opts.sync = true,
                other => {
                    return Err(FsError::InvalidArgument(format!(
                        "unknown mount option '{other}'"
                    )));
                }
            }
        }
        Ok(opts)
    }
}

/// Geometry derived from the superblock at mount.
pub(crate) struct Geometry {
    pub(crate) block_size: usize,
    pub(crate) blocks_count: u32,
    pub(crate) inodes_count: u32,
    pub(crate) first_data_block: u32,
    pub(crate) blocks_per_group: u32,
    pub(crate) inodes_per_group: u32,
    pub(crate) inode_size: usize,
    pub(crate) inodes_per_block: u32,
    pub(crate) itb_per_group: u32,
    pub(crate) addr_per_block: u32,
    pub(crate) desc_per_block: u32,
    pub(crate) groups_count: u32,
    pub(crate) gdb_count: u32,
    pub(crate) first_ino: u32,
    /// Logical blocks per cluster.
    pub(crate) extent_nrblocks: u32,
    /// Block containing the superblock image.
    pub(crate) sb_block: u64,
    /// Byte offset of the image within that block.
    pub(crate) sb_offset: usize,
}

/// The superblock image plus the state it carried on disk, under the
/// superblock lock.
pub(crate) struct SuperState {
    pub(crate) lsb: RawSuperblock,
    /// State as read at mount; restored on clean unmount.
    pub(crate) mount_state: u16,
}

/// Filesystem-wide statistics as reported by statfs.
#[derive(Debug, Clone)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub magic: u16,
}

/// A mounted filesystem instance.
pub struct PackFs {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) cache: BufferCache,
    pub(crate) geo: Geometry,
    pub(crate) opts: MountOptions,
    pub(crate) sync_mount: bool,
    pub(crate) sb: Spinlock<SuperState>,
    /// Block numbers of the descriptor-table blocks.
    pub(crate) desc_blocks: Vec<u64>,
    /// One spinlock per group serialising bitmap read-modify-write.
    pub(crate) group_locks: Vec<Spinlock<()>>,
    pub(crate) inodes: Mutex<HashMap<u32, Arc<InodeHandle>>>,
    /// In-memory orphan list, head first, mirroring the on-disk chain.
    pub(crate) orphans: Mutex<Vec<u32>>,
    pub(crate) free_blocks: ShardedCounter,
    pub(crate) free_inodes: ShardedCounter,
    pub(crate) dirs_counter: ShardedCounter,
    pub(crate) comp_stats: CompressionStats,
    pub(crate) alloc_stats: AllocStats,
    pub(crate) workspaces: WorkspacePool,
    pub(crate) wq: WorkQueue<ExtentJob>,
    pub(crate) buddy: Mutex<Vec<[u32; MAX_BUDDY_ORDER + 1]>>,
    monitor_stop: Arc<(Mutex<bool>, Condvar)>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    epoch: AtomicU32,
    pub(crate) next_generation: AtomicU32,
    /// Back-reference to the owning `Arc`, set once at mount. Deferred jobs
    /// and open files hold the filesystem through this.
    self_ref: OnceLock<Weak<PackFs>>,
}

impl std::fmt::Debug for PackFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFs").finish_non_exhaustive()
    }
}

impl PackFs {
    /// Mount a filesystem from a block device.
    pub fn mount(device: Arc<dyn BlockDevice>, options: &str) -> Result<Arc<Self>> {
        let opts = MountOptions::parse(options)?;

        // The image has a fixed byte location, so it can be read before the
        // block size is known.
        let mut image = [0u8; SUPERBLOCK_SIZE];
        device.read_at(SUPERBLOCK_OFFSET, &mut image).map_err(|_| {
            FsError::Io("error reading super block".into())
        })?;
        let lsb = RawSuperblock::read_from_bytes(&image)
            .map_err(|_| FsError::CorruptMetadata("short superblock".into()))?;

        let geo = Self::validate_superblock(&lsb, device.as_ref())?;
        let mount_state = lsb.state.get();
        if mount_state & STATE_VALID_FS == 0 {
            log::warn!("packfs: mounting file system in unclean state");
        }
        if mount_state & STATE_ERROR_FS != 0 {
            log::warn!("packfs: mounting file system with errors");
        }

        let cache = BufferCache::new(device.clone(), geo.block_size);
        // Pull the superblock's own block into the cache so later image
        // updates preserve whatever shares the block.
        cache.read(geo.sb_block)?;

        let desc_blocks: Vec<u64> = (0..geo.gdb_count as u64)
            .map(|i| geo.sb_block + 1 + i)
            .collect();
        for &block in &desc_blocks {
            cache.read(block)?;
        }

        let group_locks = (0..geo.groups_count).map(|_| Spinlock::new(())).collect();
        let groups_count = geo.groups_count as usize;
        let nr_workers = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(2);

        let fs = Arc::new(PackFs {
            device,
            cache,
            geo,
            opts,
            sync_mount: opts.sync,
            sb: Spinlock::new(SuperState { lsb, mount_state }),
            desc_blocks,
            group_locks,
            inodes: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
            free_blocks: ShardedCounter::new(),
            free_inodes: ShardedCounter::new(),
            dirs_counter: ShardedCounter::new(),
            comp_stats: CompressionStats::default(),
            alloc_stats: AllocStats::default(),
            workspaces: WorkspacePool::new(),
            wq: WorkQueue::new("packfs-compwq", nr_workers, |job: ExtentJob| job.run()),
            buddy: Mutex::new(vec![[0; MAX_BUDDY_ORDER + 1]; groups_count]),
            monitor_stop: Arc::new((Mutex::new(false), Condvar::new())),
            monitor: Mutex::new(None),
            epoch: AtomicU32::new(1),
            next_generation: AtomicU32::new(1),
            self_ref: OnceLock::new(),
        });
        let _ = fs.self_ref.set(Arc::downgrade(&fs));

        if let Err(err) = fs.run_layout_checks() {
            fs.flag_error();
            fs.wq.destroy();
            return Err(err);
        }

        // The on-disk free counters are not authoritative; scan the bitmaps.
        let free_blocks = fs.count_free_blocks()?;
        let free_inodes = fs.count_free_inodes()?;
        fs.free_blocks.set(free_blocks as i64);
        fs.free_inodes.set(free_inodes as i64);

        {
            let mut sb = fs.sb.lock();
            sb.lsb.state.set(0);
            let mnt_count = sb.lsb.mnt_count.get().wrapping_add(1);
            sb.lsb.mnt_count.set(mnt_count);
            let now = now();
            sb.lsb.mtime.set(now);
            sb.lsb.wtime.set(now);
            sb.lsb.free_blocks_count.set(free_blocks as u32);
            sb.lsb.free_inodes_count.set(free_inodes as u32);
        }
        fs.write_super_image(true)?;

        fs.orphan_cleanup();
        fs.scan_block_bitmaps();
        fs.start_monitor();

        log::info!(
            "packfs: mounted, {} groups, block size {}, {free_blocks} free blocks",
            fs.geo.groups_count,
            fs.geo.block_size
        );
        Ok(fs)
    }

    fn validate_superblock(lsb: &RawSuperblock, device: &dyn BlockDevice) -> Result<Geometry> {
        if lsb.magic.get() != SUPER_MAGIC {
            return Err(FsError::CorruptMetadata(
                "invalid magic number on super-block".into(),
            ));
        }

        let block_size = lsb
            .block_size()
            .ok_or_else(|| FsError::CorruptMetadata("invalid block size exponent".into()))?
            as usize;
        if block_size > PAGE_SIZE || PAGE_SIZE % block_size != 0 {
            return Err(FsError::InvalidArgument(format!(
                "unsupported block size {block_size}"
            )));
        }

        // Stored checksum, when present, must match the image with the
        // checksum field zeroed.
        let stored = lsb.checksum.get();
        if stored != 0 {
            let mut copy = *lsb;
            copy.checksum.set(0);
            let computed = crc32(copy.as_bytes());
            if computed != stored {
                return Err(FsError::CorruptMetadata(format!(
                    "super block crc mismatch (stored {stored:#x}, computed {computed:#x})"
                )));
            }
        }

        let inode_size = lsb.inode_size.get() as usize;
        if inode_size < GOOD_OLD_INODE_SIZE as usize
            || inode_size < size_of::<RawInode>()
            || inode_size > block_size
            || !inode_size.is_power_of_two()
        {
            return Err(FsError::CorruptMetadata(format!(
                "invalid inode size {inode_size}"
            )));
        }

        let blocks_count = lsb.blocks_count.get();
        let inodes_count = lsb.inodes_count.get();
        if blocks_count == 0 || inodes_count == 0 {
            return Err(FsError::CorruptMetadata("empty filesystem geometry".into()));
        }
        if (blocks_count as u64) * block_size as u64 > device.size() {
            return Err(FsError::CorruptMetadata(
                "filesystem larger than its device".into(),
            ));
        }

        let bits_per_block = (block_size * 8) as u32;
        let blocks_per_group = lsb.blocks_per_group.get();
        if blocks_per_group == 0 || blocks_per_group > bits_per_block {
            return Err(FsError::CorruptMetadata("invalid blocks per group".into()));
        }
        let inodes_per_group = lsb.inodes_per_group.get();
        if inodes_per_group == 0 || inodes_per_group > bits_per_block {
            return Err(FsError::CorruptMetadata("invalid inodes per group".into()));
        }

        let inodes_per_block = (block_size / inode_size) as u32;
        if inodes_per_block == 0 || inodes_per_group % inodes_per_block != 0 {
            return Err(FsError::CorruptMetadata("invalid inodes per block".into()));
        }
        let itb_per_group = inodes_per_group / inodes_per_block;
        if (itb_per_group as u64) * block_size as u64
            > blocks_per_group as u64 * block_size as u64
        {
            return Err(FsError::CorruptMetadata(
                "inode table exceeds group size".into(),
            ));
        }

        let first_data_block = lsb.first_data_block.get();
        let expected_first = if block_size == BASE_BLOCK_SIZE as usize { 1 } else { 0 };
        if first_data_block != expected_first {
            return Err(FsError::CorruptMetadata(format!(
                "invalid first data block {first_data_block}"
            )));
        }

        let data_blocks = blocks_count - first_data_block;
        let groups_count = ((data_blocks - 1) / blocks_per_group) + 1;
        let desc_per_block = (block_size / size_of::<RawGroupDesc>()) as u32;
        let gdb_count = groups_count.div_ceil(desc_per_block);

        Ok(Geometry {
            block_size,
            blocks_count,
            inodes_count,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            inode_size,
            inodes_per_block,
            itb_per_group,
            addr_per_block: (block_size / size_of::<crate::structs::BlockPtr>()) as u32,
            desc_per_block,
            groups_count,
            gdb_count,
            first_ino: lsb.first_ino.get().max(ROOT_INO + 1),
            extent_nrblocks: (EXTENT_SIZE / block_size) as u32,
            sb_block: SUPERBLOCK_OFFSET / block_size as u64,
            sb_offset: (SUPERBLOCK_OFFSET % block_size as u64) as usize,
        })
    }

    // =========================================================================
    // Mount-time integrity verification
    // =========================================================================

    fn run_layout_checks(&self) -> Result<()> {
        self.check_descriptors()?;
        self.verify_group_bitmaps()?;
        self.check_superblock_backups();
        Ok(())
    }

    /// Validate every group descriptor: CRC when present, and metadata block
    /// numbers within the group's block range.
    fn check_descriptors(&self) -> Result<()> {
        for group in 0..self.geo.groups_count {
            let desc = self.with_desc(group, |d| *d)?;

            if desc.checksum.get() != 0 {
                let mut copy = desc;
                copy.checksum.set(0);
                let computed = crc16(copy.as_bytes());
                if computed != desc.checksum.get() {
                    log::error!(
                        "packfs: group descriptor crc mismatch {:#x}/{computed:#x} bg={group}",
                        desc.checksum.get()
                    );
                    return Err(FsError::CorruptMetadata(format!(
                        "group descriptor {group} crc mismatch"
                    )));
                }
            }

            let first_block =
                (self.geo.first_data_block + group * self.geo.blocks_per_group) as u64;
            let last_block = (first_block + self.geo.blocks_per_group as u64 - 1)
                .min(self.geo.blocks_count as u64 - 1);

            let table_end =
                desc.inode_table.get() as u64 + self.geo.itb_per_group as u64 - 1;
            for (what, block) in [
                ("block bitmap", desc.block_bitmap.get() as u64),
                ("inode bitmap", desc.inode_bitmap.get() as u64),
                ("inode table", desc.inode_table.get() as u64),
                ("inode table end", table_end),
            ] {
                if block < first_block || block > last_block {
                    log::error!(
                        "packfs: invalid block nr for {what}, group={group} block={block}"
                    );
                    return Err(FsError::CorruptMetadata(format!(
                        "{what} of group {group} out of range"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Verify the bitmap checksums and cross-check the descriptor free
    /// counts against a bit count. A stale counter is only a warning.
    fn verify_group_bitmaps(&self) -> Result<()> {
        for group in 0..self.geo.groups_count {
            let desc = self.with_desc(group, |d| *d)?;

            let block_bitmap = self.read_block_bitmap(group)?;
            {
                let data = block_bitmap.data();
                let stored = desc.block_bitmap_csum.get();
                if stored != 0 && crc16(&data) != stored {
                    return Err(FsError::CorruptMetadata(format!(
                        "block bitmap checksum mismatch in group {group}"
                    )));
                }
                let clear = crate::bitmap::count_clear_bits(
                    &data,
                    self.blocks_in_group(group) as usize,
                );
                if clear as u16 != desc.free_blocks_count.get() {
                    log::warn!(
                        "packfs: group {group} free block count {} disagrees with bitmap ({clear})",
                        desc.free_blocks_count.get()
                    );
                }
            }

            let inode_bitmap = self.read_inode_bitmap(group)?;
            {
                let data = inode_bitmap.data();
                let stored = desc.inode_bitmap_csum.get();
                if stored != 0 && crc16(&data) != stored {
                    return Err(FsError::CorruptMetadata(format!(
                        "inode bitmap checksum mismatch in group {group}"
                    )));
                }
                let clear = crate::bitmap::count_clear_bits(
                    &data,
                    self.geo.inodes_per_group as usize,
                );
                if clear as u16 != desc.free_inodes_count.get() {
                    log::warn!(
                        "packfs: group {group} free inode count {} disagrees with bitmap ({clear})",
                        desc.free_inodes_count.get()
                    );
                }
            }
        }
        Ok(())
    }

    /// Probe the first block of each later group for a superblock backup.
    /// Detection only; backups are never used for recovery.
    fn check_superblock_backups(&self) {
        for group in 1..self.geo.groups_count {
            let first_block =
                (self.geo.first_data_block + group * self.geo.blocks_per_group) as u64;
            let Ok(buf) = self.cache.read(first_block) else {
                continue;
            };
            let data = buf.data();
            if let Ok(backup) = RawSuperblock::read_from_bytes(&data[..SUPERBLOCK_SIZE]) {
                if backup.magic.get() == SUPER_MAGIC {
                    log::debug!("packfs: superblock backup at block {first_block} group {group}");
                }
            }
        }
    }

    /// Flag the filesystem as errored on disk. Best effort.
    fn flag_error(&self) {
        {
            let mut sb = self.sb.lock();
            sb.mount_state = STATE_ERROR_FS;
            sb.lsb.state.set(STATE_ERROR_FS);
        }
        if let Err(err) = self.write_super_image(true) {
            log::error!("packfs: failed to record error state: {err}");
        }
    }

    // =========================================================================
    // Superblock writeback
    // =========================================================================

    pub(crate) fn current_epoch(&self) -> u32 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// A weak handle for deferred work; upgrading fails only during final
    /// teardown, and a job that cannot upgrade just unwinds its cluster.
    pub(crate) fn self_weak(&self) -> Weak<PackFs> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    fn self_arc(&self) -> Result<Arc<PackFs>> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| FsError::Io("filesystem instance gone".into()))
    }

    /// Recompute the image CRC and stage the image into its block buffer;
    /// write through when `wait` is set.
    fn write_super_image(&self, wait: bool) -> Result<()> {
        let buf = self.cache.read(self.geo.sb_block)?;
        {
            let mut sb = self.sb.lock();
            sb.lsb.checksum.set(0);
            let crc = crc32(sb.lsb.as_bytes());
            sb.lsb.checksum.set(crc);
            let mut data = buf.data();
            data[self.geo.sb_offset..self.geo.sb_offset + SUPERBLOCK_SIZE]
                .copy_from_slice(sb.lsb.as_bytes());
        }
        buf.mark_dirty();
        if wait {
            self.cache.sync_buf(&buf)?;
            self.device.flush()?;
        }
        Ok(())
    }

    /// Refresh times and scanned free counts in the image and write it out.
    /// The state stays 0 (mounted/unclean) until unmount restores it.
    pub(crate) fn sync_super(&self, wait: bool) -> Result<()> {
        let free_blocks = self.count_free_blocks()?;
        let free_inodes = self.count_free_inodes()?;
        self.free_blocks.set(free_blocks as i64);
        self.free_inodes.set(free_inodes as i64);
        {
            let mut sb = self.sb.lock();
            sb.lsb.state.set(0);
            let now = now();
            sb.lsb.wtime.set(now);
            sb.lsb.mtime.set(now);
            sb.lsb.free_blocks_count.set(free_blocks as u32);
            sb.lsb.free_inodes_count.set(free_inodes as u32);
        }
        self.write_super_image(wait)
    }

    /// Recompute the bitmap checksums and descriptor CRC of every group.
    /// Runs before the descriptor blocks are flushed.
    fn refresh_group_checksums(&self) -> Result<()> {
        for group in 0..self.geo.groups_count {
            let block_csum = {
                let bitmap = self.read_block_bitmap(group)?;
                let data = bitmap.data();
                crc16(&data)
            };
            let inode_csum = {
                let bitmap = self.read_inode_bitmap(group)?;
                let data = bitmap.data();
                crc16(&data)
            };
            self.with_desc_mut(group, |d| {
                d.block_bitmap_csum.set(block_csum);
                d.inode_bitmap_csum.set(inode_csum);
                d.checksum.set(0);
                let crc = crc16(d.as_bytes());
                d.checksum.set(crc);
            })?;
        }
        Ok(())
    }

    /// Flush everything: data writeback, inode records, group metadata,
    /// superblock.
    pub fn sync_fs(&self, wait: bool) -> Result<()> {
        let handles: Vec<Arc<InodeHandle>> =
            self.inodes.lock().unwrap().values().cloned().collect();
        for handle in &handles {
            let mut wbc = WritebackControl::sync();
            self.write_extents(handle, &mut wbc)?;
        }
        self.wq.flush();

        for handle in &handles {
            if handle.with_state(|s| s.state & I_STATE_DIRTY != 0) {
                self.write_inode(handle)?;
            }
        }

        self.refresh_group_checksums()?;
        self.cache.sync_all()?;
        self.sync_super(wait)?;
        self.epoch.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unmount: stop background work, flush everything, restore the saved
    /// state so the image verifies clean.
    pub fn unmount(&self) -> Result<()> {
        self.stop_monitor();

        let handles: Vec<Arc<InodeHandle>> =
            self.inodes.lock().unwrap().values().cloned().collect();
        for handle in &handles {
            let mut wbc = WritebackControl::sync();
            self.write_extents(handle, &mut wbc)?;
        }
        self.wq.flush();
        self.wq.destroy();

        for handle in &handles {
            if handle.with_state(|s| s.state & I_STATE_DIRTY != 0) {
                self.write_inode(handle)?;
            }
        }
        self.refresh_group_checksums()?;
        self.cache.sync_all()?;

        let free_blocks = self.count_free_blocks()?;
        let free_inodes = self.count_free_inodes()?;
        {
            let mut sb = self.sb.lock();
            let restored = sb.mount_state;
            sb.lsb.state.set(restored);
            let now = now();
            sb.lsb.wtime.set(now);
            sb.lsb.mtime.set(now);
            sb.lsb.free_blocks_count.set(free_blocks as u32);
            sb.lsb.free_inodes_count.set(free_inodes as u32);
        }
        self.write_super_image(true)?;
        log::info!("packfs: unmounted cleanly");
        Ok(())
    }

    /// Filesystem statistics from the live (bitmap-scanned) counters.
    pub fn statfs(&self) -> StatFs {
        let sb = self.sb.lock();
        StatFs {
            blocks: sb.lsb.blocks_count.get() as u64,
            bfree: self.free_blocks.read().max(0) as u64,
            bavail: self.free_blocks.read().max(0) as u64,
            files: sb.lsb.inodes_count.get() as u64,
            ffree: self.free_inodes.read().max(0) as u64,
            bsize: self.geo.block_size as u32,
            namelen: NAME_LEN as u32,
            magic: SUPER_MAGIC,
        }
    }

    pub fn compression_stats(&self) -> &CompressionStats {
        &self.comp_stats
    }

    pub fn alloc_stats(&self) -> &AllocStats {
        &self.alloc_stats
    }

    /// Snapshot of the per-group buddy-order histogram.
    pub fn buddy_histogram(&self) -> Vec<[u32; MAX_BUDDY_ORDER + 1]> {
        self.buddy.lock().unwrap().clone()
    }

    /// Whether extent-based allocation hints were requested at mount.
    pub fn extents_enabled(&self) -> bool {
        self.opts.extents
    }

    // =========================================================================
    // Background block-group monitor
    // =========================================================================

    fn start_monitor(&self) {
        let weak = self.self_weak();
        let stop = self.monitor_stop.clone();
        let handle = std::thread::Builder::new()
            .name("packfs-bgmon".into())
            .spawn(move || {
                let (lock, cond) = &*stop;
                loop {
                    {
                        let guard = lock.lock().unwrap();
                        if *guard {
                            return;
                        }
                        let (guard, _) = cond.wait_timeout(guard, MONITOR_INTERVAL).unwrap();
                        if *guard {
                            return;
                        }
                    }
                    match weak.upgrade() {
                        Some(fs) => fs.scan_block_bitmaps(),
                        None => return,
                    }
                }
            })
            .expect("spawn block-group monitor");
        *self.monitor.lock().unwrap() = Some(handle);
    }

    fn stop_monitor(&self) {
        {
            let (lock, cond) = &*self.monitor_stop;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    // =========================================================================
    // Orphan recovery
    // =========================================================================

    /// Walk the on-disk orphan chain left by a crash: truncate inodes that
    /// were merely open, delete inodes whose last link was gone.
    fn orphan_cleanup(&self) {
        let head = self.sb.lock().lsb.last_orphan.get();
        if head == 0 {
            log::debug!("packfs: no orphan inodes found for cleanup");
            return;
        }
        if self.device.read_only() {
            log::info!("packfs: write access unavailable, skipping orphan cleanup");
            return;
        }
        if self.sb.lock().mount_state & STATE_ERROR_FS != 0 {
            log::error!("packfs: errors on filesystem, cannot process orphan list");
            return;
        }

        let mut nr_orphans = 0usize;
        let mut nr_truncates = 0usize;
        loop {
            let ino = self.sb.lock().lsb.last_orphan.get();
            if ino == 0 {
                break;
            }
            let handle = match self.iget(ino) {
                Ok(handle) => handle,
                Err(err) => {
                    log::error!("packfs: error fetching orphan inode {ino}: {err}");
                    self.sb.lock().lsb.last_orphan.set(0);
                    break;
                }
            };
            self.orphans.lock().unwrap().insert(0, ino);

            if handle.links_count() > 0 {
                // Open at crash: keep the data up to its recorded size.
                log::debug!("packfs: truncating orphan inode {ino} to {}", handle.size());
                let size = handle.size();
                if let Err(err) = self.truncate_blocks(&handle, size) {
                    log::error!("packfs: orphan truncate of inode {ino} failed: {err}");
                }
                if let Err(err) = self.orphan_del(&handle) {
                    log::error!("packfs: orphan unlink of inode {ino} failed: {err}");
                    break;
                }
                let _ = self.write_inode(&handle);
                nr_truncates += 1;
            } else {
                log::debug!("packfs: deleting unreferenced orphan inode {ino}");
                if let Err(err) = self.evict_inode(&handle) {
                    log::error!("packfs: orphan delete of inode {ino} failed: {err}");
                    break;
                }
                nr_orphans += 1;
            }
        }

        if nr_orphans > 0 {
            log::info!("packfs: {nr_orphans} orphan inodes deleted");
        }
        if nr_truncates > 0 {
            log::info!("packfs: {nr_truncates} orphan truncates cleaned up");
        }
    }

    // =========================================================================
    // Path operations
    // =========================================================================

    /// Resolve a path to an inode number.
    ///
    /// `.` and `..` components are rejected; the caller works with
    /// canonical absolute paths.
    pub fn resolve_path(&self, path: &str) -> Result<u32> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(ROOT_INO);
        }
        let mut current = ROOT_INO;
        for component in path.split('/').filter(|s| !s.is_empty()) {
            if component == "." || component == ".." {
                return Err(FsError::NotFound);
            }
            let dir = self.iget(current)?;
            if !dir.with_state(|s| s.is_dir()) {
                return Err(FsError::NotFound);
            }
            current = self
                .find_entry(&dir, component)?
                .ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    fn split_path(path: &str) -> Result<(&str, &str)> {
        let trimmed = path.trim_end_matches('/');
        let idx = trimmed
            .rfind('/')
            .ok_or_else(|| FsError::InvalidArgument("path must be absolute".into()))?;
        let name = &trimmed[idx + 1..];
        if name.is_empty() {
            return Err(FsError::InvalidArgument("empty file name".into()));
        }
        let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
        Ok((parent, name))
    }

    /// Create a regular file and open it.
    pub fn create(&self, path: &str, perm: u16) -> Result<PackFile> {
        let (parent, name) = Self::split_path(path)?;
        let dir = self.iget(self.resolve_path(parent)?)?;
        if !dir.with_state(|s| s.is_dir()) {
            return Err(FsError::NotFound);
        }
        if self.find_entry(&dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let guard =
            crate::guards::InodeGuard::new(self, self.new_inode(&dir, S_IFREG | (perm & 0o7777))?);
        guard.handle().with_state_mut(|s| {
            s.links_count = 1;
            s.mark_dirty();
        });
        self.add_link(&dir, name, guard.handle().ino(), FT_REG_FILE)?;
        let handle = guard.consume();
        self.write_inode(&handle)?;
        Ok(PackFile::new(self.self_arc()?, handle))
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, perm: u16) -> Result<()> {
        let (parent, name) = Self::split_path(path)?;
        let dir = self.iget(self.resolve_path(parent)?)?;
        if !dir.with_state(|s| s.is_dir()) {
            return Err(FsError::NotFound);
        }
        if self.find_entry(&dir, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }

        let guard =
            crate::guards::InodeGuard::new(self, self.new_inode(&dir, S_IFDIR | (perm & 0o7777))?);
        self.make_empty_dir(guard.handle(), dir.ino())?;
        guard.handle().with_state_mut(|s| {
            s.links_count = 2;
            s.mark_dirty();
        });
        self.add_link(&dir, name, guard.handle().ino(), FT_DIR)?;
        let handle = guard.consume();
        dir.with_state_mut(|s| {
            s.links_count += 1;
            s.mark_dirty();
        });
        self.write_inode(&handle)?;
        self.write_inode(&dir)?;
        Ok(())
    }

    /// Open an existing file.
    pub fn open(&self, path: &str) -> Result<PackFile> {
        let handle = self.iget(self.resolve_path(path)?)?;
        if handle.with_state(|s| s.is_dir()) {
            return Err(FsError::InvalidArgument("cannot open a directory".into()));
        }
        Ok(PackFile::new(self.self_arc()?, handle))
    }

    /// Metadata for a path.
    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let handle = self.iget(self.resolve_path(path)?)?;
        Ok(stat_of(&handle))
    }

    /// Remove a file's directory entry. When the last link goes and the
    /// file is still open, the inode is parked on the orphan list; otherwise
    /// it is reclaimed immediately.
    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent, name) = Self::split_path(path)?;
        let dir = self.iget(self.resolve_path(parent)?)?;
        let target_ino = self
            .find_entry(&dir, name)?
            .ok_or(FsError::NotFound)?;
        let handle = self.iget(target_ino)?;
        if handle.with_state(|s| s.is_dir()) {
            return Err(FsError::InvalidArgument("cannot unlink a directory".into()));
        }

        self.remove_entry(&dir, name)?;
        handle.with_state_mut(|s| {
            s.links_count -= 1;
            s.ctime = now();
            s.mark_dirty();
        });

        if handle.links_count() == 0 {
            if handle.open_count.load(Ordering::Acquire) > 0 {
                self.orphan_add(&handle)?;
            } else {
                self.evict_inode(&handle)?;
            }
        } else {
            self.write_inode(&handle)?;
        }
        Ok(())
    }

    /// Create an additional hard link to an existing file.
    pub fn link(&self, existing: &str, new_path: &str) -> Result<()> {
        let handle = self.iget(self.resolve_path(existing)?)?;
        if handle.with_state(|s| s.is_dir()) {
            return Err(FsError::InvalidArgument("cannot link a directory".into()));
        }
        if handle.links_count() >= LINK_MAX {
            return Err(FsError::InvalidArgument("too many links".into()));
        }

        let (parent, name) = Self::split_path(new_path)?;
        let dir = self.iget(self.resolve_path(parent)?)?;
        self.add_link(&dir, name, handle.ino(), FT_REG_FILE)?;
        handle.with_state_mut(|s| {
            s.links_count += 1;
            s.ctime = now();
            s.mark_dirty();
        });
        self.write_inode(&handle)
    }

    /// List a directory.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.iget(self.resolve_path(path)?)?;
        if !dir.with_state(|s| s.is_dir()) {
            return Err(FsError::NotFound);
        }
        self.read_dir(&dir)
    }

    /// Truncate a file by path.
    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let handle = self.iget(self.resolve_path(path)?)?;
        if handle.with_state(|s| s.is_dir()) {
            return Err(FsError::InvalidArgument("cannot truncate a directory".into()));
        }
        self.truncate_blocks(&handle, size)?;
        self.write_inode(&handle)
    }
}
