//! Extent compression and writeback engine.
//!
//! The engine processes clusters — fixed, aligned windows of
//! `EXTENT_SIZE / PAGE_SIZE` pages — as atomic units. Writeback scans an
//! inode's page tree one cluster at a time, locks the whole cluster with the
//! writeback flag as the per-cluster exclusion token, and queues a
//! compress-and-flush job. The worker decides compressibility, allocates a
//! contiguous physical run, rewrites the cluster's block-pointer records
//! (copy-on-write) and writes the data, then completes: workspace returned,
//! writeback ended, pages unlocked. A cluster is always rewritten whole or
//! not at all, which is what keeps every record of a compressed cluster
//! byte-identical.
//!
//! The read path is the reverse: resolve a record, read the sector-aligned
//! compressed run, verify the fingerprint over exactly `length` bytes, and
//! stream-decompress into the cluster's pages.

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::Ordering;

use crate::compress::can_compress;
use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::inode::InodeHandle;
use crate::pages::{Page, PageTag};
use crate::structs::{
    BP_COMPRESSED, BlockPtr, COMPRESS_RATIO_LIMIT, EXTENT_NRPAGE, EXTENT_SIZE, NDIR_BLOCKS,
    PAGE_SIZE, sector_align,
};

/// One queued compress-and-flush job: a locked, writeback-marked cluster.
pub(crate) struct ExtentJob {
    pub(crate) fs: Weak<PackFs>,
    pub(crate) ino: u32,
    pub(crate) pages: Vec<Arc<Page>>,
}

impl ExtentJob {
    /// Worker entry point.
    pub(crate) fn run(self) {
        let Some(fs) = self.fs.upgrade() else {
            release_cluster(&self.pages);
            return;
        };
        match fs.iget(self.ino) {
            Ok(handle) => fs.compress_extent_and_write(&handle, self.pages),
            Err(err) => {
                log::error!("packfs: writeback lost inode {}: {err}", self.ino);
                release_cluster(&self.pages);
            }
        }
    }
}

/// Writeback budget and mode, after the host writeback control.
pub struct WritebackControl {
    /// Remaining page budget for this call.
    pub nr_to_write: i64,
    /// Tag-and-wait semantics (fsync, sync_fs).
    pub sync_all: bool,
    /// Resume from the inode's writeback cursor with wraparound.
    pub range_cyclic: bool,
}

impl WritebackControl {
    pub fn sync() -> Self {
        WritebackControl {
            nr_to_write: i64::MAX,
            sync_all: true,
            range_cyclic: false,
        }
    }
}

/// End writeback and unlock without touching dirty state.
fn release_cluster(pages: &[Arc<Page>]) {
    for page in pages {
        page.end_writeback();
        page.unlock();
    }
}

/// Put a cluster back the way writeback found it: dirty, unlocked.
fn redirty_cluster(pages: &[Arc<Page>]) {
    for page in pages {
        page.set_dirty();
        page.end_writeback();
        page.unlock();
    }
}

impl PackFs {
    fn cluster_of(&self, page_index: u32) -> u32 {
        page_index / EXTENT_NRPAGE as u32
    }

    /// Find the next dirty cluster at or after `*index` and lock it for I/O.
    ///
    /// `*index` is advanced past the window that was examined (or to the
    /// first tagged page beyond it). Returns the locked cluster page vector,
    /// or `None` when the scan found nothing in the window — with `*index`
    /// unchanged when the whole tree past `*index` is clean.
    fn scan_pgtree_dirty_pages(
        &self,
        handle: &InodeHandle,
        index: &mut u32,
        wbc: &mut WritebackControl,
    ) -> Option<Vec<Arc<Page>>> {
        let nrpage = EXTENT_NRPAGE as u32;
        let start = *index - *index % nrpage;

        // Tag state prior to WRITEBACK. Everything dirty from the cursor on
        // is tagged so the lookup can land on dirty clusters far past this
        // window; pages dirtied after this point wait for the next pass.
        let tag = if wbc.sync_all {
            handle.pages.tag_for_writeback(start, u32::MAX);
            PageTag::ToWrite
        } else {
            PageTag::Dirty
        };

        let found = handle.pages.lookup_tag(start, tag, EXTENT_NRPAGE);
        if found.is_empty() {
            return None;
        }

        let extent = self.cluster_of(start);
        let mut nr_dirty = 0usize;
        let mut next = start + nrpage;
        for page in &found {
            if self.cluster_of(page.index()) != extent {
                next = page.index();
                break;
            }
            // A page already under writeback belongs to an in-flight job;
            // wait for it to stabilise before flushing the cluster again.
            page.wait_writeback();
            nr_dirty += 1;
        }

        if nr_dirty == 0 {
            *index = next;
            return None;
        }

        // Lock the whole cluster. grab_nowait fails while a racing flush or
        // reader holds a page; yield and retry.
        let mut pages = Vec::with_capacity(EXTENT_NRPAGE);
        for i in 0..nrpage {
            let page = loop {
                match handle.pages.grab_nowait(start + i) {
                    Some(page) => break page,
                    None => std::thread::yield_now(),
                }
            };
            page.clear_dirty_for_io();
            page.clear_towrite();
            page.set_writeback();
            pages.push(page);
        }

        *index = next;
        wbc.nr_to_write -= nr_dirty as i64;
        log::debug!(
            "packfs: inode {} cluster {extent}: {nr_dirty} dirty pages locked for write",
            handle.ino()
        );
        Some(pages)
    }

    /// Scan the inode's page tree and queue one job per dirty cluster,
    /// honouring the writeback budget and cyclic wraparound.
    pub fn write_extents(
        &self,
        handle: &Arc<InodeHandle>,
        wbc: &mut WritebackControl,
    ) -> Result<()> {
        let (mut start_index, mut end_index, mut cycled) = if wbc.range_cyclic {
            let cursor = handle.writeback_index.load(Ordering::Acquire);
            (cursor, u32::MAX, cursor == 0)
        } else {
            (0, u32::MAX, true)
        };

        let mut done = false;
        let mut next;
        loop {
            next = start_index;
            while !done && wbc.nr_to_write > 0 && next < end_index {
                let prev = next;
                match self.scan_pgtree_dirty_pages(handle, &mut next, wbc) {
                    Some(pages) => {
                        let job = ExtentJob {
                            fs: self.self_weak(),
                            ino: handle.ino(),
                            pages,
                        };
                        if let Err(job) = self.wq.queue(job) {
                            log::error!("packfs: workqueue is gone, redirtying cluster");
                            redirty_cluster(&job.pages);
                            return Err(FsError::Io("workqueue is shut down".into()));
                        }
                    }
                    None => {
                        if next == prev {
                            done = true;
                        }
                    }
                }
                std::thread::yield_now();
            }

            // Hit the end with budget left but work pending: cycle back once.
            if !done && !cycled {
                cycled = true;
                start_index = 0;
                end_index = handle.writeback_index.load(Ordering::Acquire).max(1) - 1;
                continue;
            }
            break;
        }

        if wbc.nr_to_write > 0 && wbc.range_cyclic {
            handle
                .writeback_index
                .store(if done { 0 } else { next }, Ordering::Release);
        }
        Ok(())
    }

    /// Worker body: heuristics, compression, allocation, bmap COW, data
    /// write, completion. Never leaves a page with writeback set.
    pub(crate) fn compress_extent_and_write(
        &self,
        handle: &Arc<InodeHandle>,
        pages: Vec<Arc<Page>>,
    ) {
        debug_assert_eq!(pages.len(), EXTENT_NRPAGE);
        let extent = self.cluster_of(pages[0].index());
        let nrpage = EXTENT_NRPAGE as u64;
        self.comp_stats
            .pages_ingested
            .fetch_add(nrpage, Ordering::Relaxed);

        // Read-modify-write: a cluster flushed with pages the write path
        // never touched must pick their bytes up from disk, not zeros.
        if let Err(err) = self.fill_cluster_pages(handle, extent, &pages) {
            log::error!("packfs: cluster {extent} RMW read failed: {err}");
            handle.wb_error.store(true, Ordering::Release);
            redirty_cluster(&pages);
            return;
        }

        let mut cluster = vec![0u8; EXTENT_SIZE];
        for (i, page) in pages.iter().enumerate() {
            cluster[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(&page.data());
        }

        // Admission: clusters inside the direct range stay raw so direct
        // records never carry the compressed flag; then the entropy
        // heuristic; then the compressor's own verdict.
        let nr_blocks = self.geo.extent_nrblocks;
        let direct_only = (extent + 1) * nr_blocks <= NDIR_BLOCKS as u32;
        let compressed = if direct_only || !can_compress(&cluster) {
            self.comp_stats
                .pages_notcompressible
                .fetch_add(nrpage, Ordering::Relaxed);
            None
        } else {
            let mut ws = self.workspaces.get();
            let out = ws.compress_cluster(&cluster);
            self.workspaces.put(ws);
            if out.is_none() {
                self.comp_stats
                    .pages_notcompressed
                    .fetch_add(nrpage, Ordering::Relaxed);
            }
            out
        };

        let block_size = self.geo.block_size;
        let total_out = compressed.as_ref().map_or(EXTENT_SIZE, Vec::len);
        let out_blocks = total_out.div_ceil(block_size) as u32;
        let epoch = self.current_epoch();
        let home_group = handle.with_state(|s| s.block_group);

        // Allocation and the bmap rewrite are serialised against truncate.
        // try_lock: blocking here with writeback held would deadlock against
        // a truncate waiting for this cluster's pages.
        let Ok(guard) = handle.truncate_mutex.try_lock() else {
            redirty_cluster(&pages);
            return;
        };

        let run = match self.new_blocks(home_group, out_blocks) {
            Ok(start) => crate::guards::BlockRunGuard::new(self, start, out_blocks),
            Err(err) => {
                drop(guard);
                log::error!(
                    "packfs: allocation of {out_blocks} blocks for cluster {extent} failed: {err}"
                );
                handle.wb_error.store(true, Ordering::Release);
                redirty_cluster(&pages);
                return;
            }
        };
        let start = run.start();

        let bps: Vec<BlockPtr> = match &compressed {
            Some(out) => {
                let crc = crate::checksum::crc32(out);
                (0..nr_blocks)
                    .map(|_| BlockPtr::new(start, out.len() as u16, BP_COMPRESSED, crc, epoch))
                    .collect()
            }
            None => (0..nr_blocks)
                .map(|i| {
                    let off = i as usize * block_size;
                    let crc = crate::checksum::crc32(&cluster[off..off + block_size]);
                    BlockPtr::new(start + i, 0, 0, crc, epoch)
                })
                .collect(),
        };

        let delta = match self.update_extent_bp(handle, extent, &bps) {
            Ok(delta) => delta,
            Err(err) => {
                drop(run);
                drop(guard);
                log::error!("packfs: bmap update for cluster {extent} failed: {err}");
                handle.wb_error.store(true, Ordering::Release);
                redirty_cluster(&pages);
                return;
            }
        };
        let _ = run.consume();
        handle.with_state_mut(|s| {
            s.size_comp = (s.size_comp as i64 + delta).max(0) as u64;
            s.mark_dirty();
        });
        drop(guard);

        // Data write, sector-aligned.
        let disk_start = start as u64 * block_size as u64;
        let write_res = match &compressed {
            Some(out) => {
                let mut padded = vec![0u8; sector_align(out.len())];
                padded[..out.len()].copy_from_slice(out);
                self.device.write_at(disk_start, &padded)
            }
            None => self.device.write_at(disk_start, &cluster),
        };
        if let Err(err) = write_res {
            log::error!("packfs: extent write for cluster {extent} failed: {err}");
            handle.wb_error.store(true, Ordering::Release);
            for page in &pages {
                page.set_error();
            }
            redirty_cluster(&pages);
            return;
        }

        if let Some(out) = &compressed {
            let ratio = ((EXTENT_SIZE - out.len()) * 100 / EXTENT_SIZE) as u32;
            if ratio >= COMPRESS_RATIO_LIMIT {
                self.comp_stats
                    .pages_wellcompressed
                    .fetch_add(nrpage, Ordering::Relaxed);
            }
            log::debug!(
                "packfs: inode {} cluster {extent} compressed {EXTENT_SIZE} -> {} ({}%)",
                handle.ino(),
                out.len(),
                ratio
            );
        }

        release_cluster(&pages);
    }

    // =========================================================================
    // Buffered write path
    // =========================================================================

    /// Prepare one cluster for a buffered write at `pos`: lock every page of
    /// the cluster, read the missing ones through the compressed read path,
    /// and hand back the page the caller copies into. All pages stay locked
    /// until `write_extent_end`.
    pub(crate) fn write_extent_begin(
        &self,
        handle: &Arc<InodeHandle>,
        pos: u64,
        len: usize,
    ) -> Result<(Vec<Arc<Page>>, Arc<Page>)> {
        if len > PAGE_SIZE {
            return Err(FsError::InvalidArgument(
                "write length exceeds page size".into(),
            ));
        }
        let index = (pos / PAGE_SIZE as u64) as u32;
        let nrpage = EXTENT_NRPAGE as u32;
        let start = index - index % nrpage;

        let mut pages = Vec::with_capacity(EXTENT_NRPAGE);
        for i in 0..nrpage {
            let page = handle.pages.find_or_create(start + i);
            page.lock();
            pages.push(page);
        }

        if let Err(err) = self.fill_cluster_pages(handle, self.cluster_of(start), &pages) {
            for page in &pages {
                page.unlock();
            }
            return Err(err);
        }

        let target = pages[(index - start) as usize].clone();
        Ok((pages, target))
    }

    /// Finish a buffered write: mark the cluster uptodate and dirty, unlock,
    /// and push the file size out if the write extended it.
    pub(crate) fn write_extent_end(
        &self,
        handle: &Arc<InodeHandle>,
        pos: u64,
        len: usize,
        pages: Vec<Arc<Page>>,
    ) {
        for page in &pages {
            page.set_uptodate();
            page.set_dirty();
            page.unlock();
        }
        let end = pos + len as u64;
        handle.with_state_mut(|s| {
            if end > s.size {
                s.size = end;
            }
            s.mtime = crate::fs::now();
            s.ctime = s.mtime;
            s.mark_dirty();
        });
    }

    /// Positioned write through the cluster pipeline.
    pub fn write(&self, handle: &Arc<InodeHandle>, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut written = 0usize;
        while written < buf.len() {
            let cur = pos + written as u64;
            let in_page = (cur % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - written);

            let (pages, target) = self.write_extent_begin(handle, cur, chunk)?;
            target.data()[in_page..in_page + chunk]
                .copy_from_slice(&buf[written..written + chunk]);
            self.write_extent_end(handle, cur, chunk, pages);
            written += chunk;
        }
        Ok(written)
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Make one page uptodate, reading through the compressed path when its
    /// cluster is a compressed extent.
    pub(crate) fn readpage(&self, handle: &Arc<InodeHandle>, index: u32) -> Result<Arc<Page>> {
        let page = handle.pages.find_or_create(index);
        if page.is_uptodate() {
            return Ok(page);
        }

        let nrpage = EXTENT_NRPAGE as u32;
        let start = index - index % nrpage;
        let mut cluster_pages = Vec::with_capacity(EXTENT_NRPAGE);
        for i in 0..nrpage {
            let p = handle.pages.find_or_create(start + i);
            p.lock();
            cluster_pages.push(p);
        }
        let res = self.fill_cluster_pages(handle, self.cluster_of(start), &cluster_pages);
        for p in &cluster_pages {
            p.unlock();
        }
        res?;
        Ok(page)
    }

    /// Positioned read. Bytes past end of file read as zero-length; holes
    /// read as zeros.
    pub fn read(&self, handle: &Arc<InodeHandle>, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let size = handle.size();
        if pos >= size {
            return Ok(0);
        }
        let to_read = ((size - pos) as usize).min(buf.len());

        let mut done = 0usize;
        while done < to_read {
            let cur = pos + done as u64;
            let index = (cur / PAGE_SIZE as u64) as u32;
            let in_page = (cur % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - in_page).min(to_read - done);

            let page = self.readpage(handle, index)?;
            buf[done..done + chunk].copy_from_slice(&page.data()[in_page..in_page + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Fill the not-yet-uptodate pages of a cluster from disk. The caller
    /// holds every page lock.
    pub(crate) fn fill_cluster_pages(
        &self,
        handle: &Arc<InodeHandle>,
        extent: u32,
        pages: &[Arc<Page>],
    ) -> Result<()> {
        if pages.iter().all(|p| p.is_uptodate()) {
            return Ok(());
        }

        let nr_blocks = self.geo.extent_nrblocks;
        let first_block = extent * nr_blocks;
        let head = self.bmap(handle, first_block)?;

        if head.is_compressed() {
            return self.read_extent(&head, pages);
        }

        let block_size = self.geo.block_size;
        let blocks_per_page = PAGE_SIZE / block_size;
        for (i, page) in pages.iter().enumerate() {
            if page.is_uptodate() {
                continue;
            }
            {
                let mut data = page.data();
                for b in 0..blocks_per_page {
                    let logical = first_block + (i * blocks_per_page + b) as u32;
                    let bp = self.bmap(handle, logical)?;
                    let off = b * block_size;
                    if bp.is_hole() {
                        data[off..off + block_size].fill(0);
                        continue;
                    }
                    self.device.read_at(
                        bp.blockno.get() as u64 * block_size as u64,
                        &mut data[off..off + block_size],
                    )?;
                    let checksum = bp.checksum.get();
                    if checksum != 0
                        && crate::checksum::crc32(&data[off..off + block_size]) != checksum
                    {
                        log::error!(
                            "packfs: checksum mismatch on block {} of inode {}",
                            bp.blockno.get(),
                            handle.ino()
                        );
                        return Err(FsError::Io(format!(
                            "checksum mismatch on block {}",
                            bp.blockno.get()
                        )));
                    }
                }
            }
            page.set_uptodate();
        }
        Ok(())
    }

    /// Read and decompress one compressed extent into its cluster pages.
    /// Verifies the fingerprint over exactly `length` bytes before any
    /// decompression happens.
    fn read_extent(&self, bp: &BlockPtr, pages: &[Arc<Page>]) -> Result<()> {
        let total_in = bp.length.get() as usize;
        let aligned = sector_align(total_in);
        let block_size = self.geo.block_size as u64;

        let mut input = vec![0u8; aligned];
        self.device
            .read_at(bp.blockno.get() as u64 * block_size, &mut input)?;

        let crc = crate::checksum::crc32(&input[..total_in]);
        if crc != bp.checksum.get() {
            log::error!(
                "packfs: checksum mismatch on read extent, block={}-{}-{}",
                bp.blockno.get(),
                bp.flags.get(),
                bp.length.get()
            );
            return Err(FsError::Io(format!(
                "extent checksum mismatch at block {}",
                bp.blockno.get()
            )));
        }

        let mut ws = self.workspaces.get();
        let out = ws.decompress_cluster(&input[..total_in], EXTENT_SIZE);
        self.workspaces.put(ws);
        let out = out?;

        for (i, page) in pages.iter().enumerate() {
            if page.is_uptodate() {
                continue;
            }
            page.data()
                .copy_from_slice(&out[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
            page.set_uptodate();
        }
        Ok(())
    }

    /// Flush one inode: run tagged writeback to completion, then push its
    /// metadata and every dirty buffer through to the device.
    pub fn fsync(&self, handle: &Arc<InodeHandle>) -> Result<()> {
        loop {
            let mut wbc = WritebackControl::sync();
            self.write_extents(handle, &mut wbc)?;
            self.wq.flush();
            if handle.wb_error.swap(false, Ordering::AcqRel) {
                return Err(FsError::Io("writeback failed; cluster redirtied".into()));
            }
            if !handle.pages.has_dirty() {
                break;
            }
            std::thread::yield_now();
        }
        self.write_inode(handle)?;
        self.cache.sync_all()?;
        Ok(())
    }
}
