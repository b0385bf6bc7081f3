//! Indirect-tree block map.
//!
//! A logical block resolves through the inode's five roots: two direct
//! pointers, then singly/doubly/triply indirect trees of packed `BlockPtr`
//! records, `block_size / 16` entries per indirect block. A zero pointer at
//! any level is a sparse hole; reads of holes return zeros and growth is
//! lazy (truncate never allocates).
//!
//! Extent writes are copy-on-write at the record level: `update_extent_bp`
//! writes one record per logical block of the cluster (byte-identical for a
//! compressed cluster), allocating missing intermediate indirect blocks
//! zero-filled before their parent pointer is set, then frees the replaced
//! physical storage — a compressed run exactly once, however many records
//! referenced it.

use std::collections::HashSet;
use std::sync::Arc;

use zerocopy::{FromBytes, IntoBytes};

use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::inode::InodeHandle;
use crate::structs::{
    BLKPTR_SIZE, BlockPtr, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS, PAGE_SIZE, TIND_BLOCK,
};

/// Path of one logical block through the tree: the root slot followed by
/// per-level entry offsets.
struct TreePath {
    root: usize,
    /// Entry offsets below the root; empty for a direct block.
    offsets: [u32; 3],
    depth: usize,
}

impl PackFs {
    fn block_to_path(&self, block: u32) -> Result<TreePath> {
        let a = self.geo.addr_per_block as u64;
        let mut left = block as u64;

        if left < NDIR_BLOCKS as u64 {
            return Ok(TreePath {
                root: block as usize,
                offsets: [0; 3],
                depth: 0,
            });
        }
        left -= NDIR_BLOCKS as u64;
        if left < a {
            return Ok(TreePath {
                root: IND_BLOCK,
                offsets: [left as u32, 0, 0],
                depth: 1,
            });
        }
        left -= a;
        if left < a * a {
            return Ok(TreePath {
                root: DIND_BLOCK,
                offsets: [(left / a) as u32, (left % a) as u32, 0],
                depth: 2,
            });
        }
        left -= a * a;
        if left < a * a * a {
            return Ok(TreePath {
                root: TIND_BLOCK,
                offsets: [
                    (left / (a * a)) as u32,
                    ((left / a) % a) as u32,
                    (left % a) as u32,
                ],
                depth: 3,
            });
        }
        Err(FsError::InvalidArgument(format!(
            "logical block {block} beyond maximum file size"
        )))
    }

    fn read_tree_entry(&self, indirect_block: u32, index: u32) -> Result<BlockPtr> {
        let buf = self.cache.read(indirect_block as u64)?;
        let data = buf.data();
        let off = index as usize * BLKPTR_SIZE;
        BlockPtr::read_from_bytes(&data[off..off + BLKPTR_SIZE])
            .map_err(|_| FsError::CorruptMetadata("indirect entry out of bounds".into()))
    }

    fn write_tree_entry(&self, indirect_block: u32, index: u32, bp: BlockPtr) -> Result<BlockPtr> {
        let buf = self.cache.read(indirect_block as u64)?;
        let old = {
            let mut data = buf.data();
            let off = index as usize * BLKPTR_SIZE;
            let old = BlockPtr::read_from_bytes(&data[off..off + BLKPTR_SIZE])
                .map_err(|_| FsError::CorruptMetadata("indirect entry out of bounds".into()))?;
            data[off..off + BLKPTR_SIZE].copy_from_slice(bp.as_bytes());
            old
        };
        buf.mark_dirty();
        Ok(old)
    }

    /// Resolve one logical block to its record. Sparse branches resolve to
    /// `BlockPtr::ZERO`.
    pub fn bmap(&self, handle: &InodeHandle, block: u32) -> Result<BlockPtr> {
        let path = self.block_to_path(block)?;
        let root = handle.with_state(|s| s.block[path.root]);
        if path.depth == 0 {
            return Ok(root);
        }
        let mut bp = root;
        for level in 0..path.depth {
            if bp.is_hole() {
                return Ok(BlockPtr::ZERO);
            }
            bp = self.read_tree_entry(bp.blockno.get(), path.offsets[level])?;
        }
        Ok(bp)
    }

    /// Write one record, creating intermediate indirect blocks on demand.
    /// Returns the record it replaced.
    ///
    /// A new indirect block is zero-filled and marked dirty before its
    /// parent's pointer is written, so a reference is never visible before
    /// its target exists.
    fn bmap_set(&self, handle: &Arc<InodeHandle>, block: u32, bp: BlockPtr) -> Result<BlockPtr> {
        let path = self.block_to_path(block)?;
        let home_group = handle.with_state(|s| s.block_group);

        if path.depth == 0 {
            return Ok(handle.with_state_mut(|s| {
                let old = s.block[path.root];
                s.block[path.root] = bp;
                s.mark_dirty();
                old
            }));
        }

        // Root level: materialise the top indirect block if missing.
        let mut cur = handle.with_state(|s| s.block[path.root]);
        if cur.is_hole() {
            let meta = self.new_block(home_group)?;
            self.cache.get_zeroed(meta as u64);
            cur = BlockPtr::new(meta, 0, 0, 0, bp.birth.get());
            handle.with_state_mut(|s| {
                s.block[path.root] = cur;
                s.blocks += 1;
                s.mark_dirty();
            });
        }

        // Interior levels.
        for level in 0..path.depth - 1 {
            let entry = self.read_tree_entry(cur.blockno.get(), path.offsets[level])?;
            let next = if entry.is_hole() {
                let meta = self.new_block(home_group)?;
                self.cache.get_zeroed(meta as u64);
                let next = BlockPtr::new(meta, 0, 0, 0, bp.birth.get());
                self.write_tree_entry(cur.blockno.get(), path.offsets[level], next)?;
                handle.with_state_mut(|s| {
                    s.blocks += 1;
                    s.mark_dirty();
                });
                next
            } else {
                entry
            };
            cur = next;
        }

        self.write_tree_entry(cur.blockno.get(), path.offsets[path.depth - 1], bp)
    }

    /// Record write used by the directory layer (uncompressed blocks only);
    /// the replaced record is not freed.
    pub(crate) fn bmap_set_entry(
        &self,
        handle: &Arc<InodeHandle>,
        block: u32,
        bp: BlockPtr,
    ) -> Result<()> {
        self.bmap_set(handle, block, bp).map(|_| ())
    }

    /// Rewrite the records of one cluster after an extent write, freeing the
    /// replaced physical storage, and return the change in physical bytes so
    /// the caller can maintain the inode's compressed-size counter.
    pub(crate) fn update_extent_bp(
        &self,
        handle: &Arc<InodeHandle>,
        extent: u32,
        bps: &[BlockPtr],
    ) -> Result<i64> {
        let nr = self.geo.extent_nrblocks;
        debug_assert_eq!(bps.len(), nr as usize);
        let first = extent * nr;
        let block_size = self.geo.block_size as i64;

        let mut old_entries = Vec::with_capacity(nr as usize);
        for (i, bp) in bps.iter().enumerate() {
            old_entries.push(self.bmap_set(handle, first + i as u32, *bp)?);
        }

        // Release the storage the cluster previously occupied. All records
        // of a compressed cluster share one run; the set guards against
        // freeing it once per record.
        let mut freed_runs: HashSet<u32> = HashSet::new();
        let mut old_bytes = 0i64;
        let mut old_blocks = 0u32;
        for old in &old_entries {
            if old.is_hole() {
                continue;
            }
            if old.is_compressed() {
                if freed_runs.insert(old.blockno.get()) {
                    let run = (old.length.get() as u32).div_ceil(self.geo.block_size as u32);
                    old_bytes += old.length.get() as i64;
                    old_blocks += run;
                    self.free_block_run(old.blockno.get(), run)?;
                }
            } else {
                old_bytes += block_size;
                old_blocks += 1;
                self.free_block(old.blockno.get())?;
            }
        }

        let (new_bytes, new_blocks) = if bps[0].is_compressed() {
            let len = bps[0].length.get() as i64;
            (len, (len as u32).div_ceil(self.geo.block_size as u32))
        } else {
            let live = bps.iter().filter(|bp| !bp.is_hole()).count() as u32;
            (live as i64 * block_size, live)
        };

        handle.with_state_mut(|s| {
            s.blocks = (s.blocks as i64 + new_blocks as i64 - old_blocks as i64).max(0) as u32;
            s.mark_dirty();
        });

        Ok(new_bytes - old_bytes)
    }

    // =========================================================================
    // Freeing (truncate)
    // =========================================================================

    /// Shrink (or logically grow) an inode to `new_size` bytes.
    ///
    /// Growth allocates nothing. Shrinking frees every leaf record at or
    /// past the new end, highest index first, then prunes emptied indirect
    /// blocks bottom-up. A compressed cluster whose head survives the cut
    /// keeps all its records; fully-cut clusters have their run freed
    /// exactly once through the extents batch.
    pub fn truncate_blocks(&self, handle: &Arc<InodeHandle>, new_size: u64) -> Result<()> {
        let _guard = handle.truncate_mutex.lock().unwrap();
        let old_size = handle.size();

        if new_size >= old_size {
            if new_size != old_size {
                handle.with_state_mut(|s| {
                    s.size = new_size;
                    s.mtime = crate::fs::now();
                    s.ctime = s.mtime;
                    s.mark_dirty();
                });
            }
            return Ok(());
        }

        let block_size = self.geo.block_size as u64;
        let first_freed = new_size.div_ceil(block_size) as u32;
        let nr = self.geo.extent_nrblocks;

        // If the cut lands inside a populated cluster, pin correct contents
        // in the page cache and zero the dropped tail so a later regrow or
        // rewrite cannot resurrect stale bytes.
        let boundary_cluster = first_freed / nr;
        let cluster_start = boundary_cluster * nr;
        if first_freed % nr != 0 && !self.bmap(handle, cluster_start)?.is_hole() {
            let pages_per_cluster = (self.geo.extent_nrblocks * self.geo.block_size as u32
                / PAGE_SIZE as u32) as u64;
            let first_page = boundary_cluster as u64 * pages_per_cluster;
            for i in 0..pages_per_cluster {
                let page = self.readpage(handle, (first_page + i) as u32)?;
                let page_start = (first_page + i) * PAGE_SIZE as u64;
                if page_start + PAGE_SIZE as u64 > new_size {
                    let keep = new_size.saturating_sub(page_start) as usize;
                    page.data()[keep.min(PAGE_SIZE)..].fill(0);
                    page.set_dirty();
                }
            }
        }

        // Drop cached pages past the boundary cluster.
        handle.pages.wait_all_writeback();
        let keep_pages =
            ((cluster_start + if first_freed % nr != 0 { nr } else { 0 }) as u64 * block_size)
                .div_ceil(PAGE_SIZE as u64) as u32;
        handle.pages.truncate(keep_pages);

        let mut ctx = FreeCtx {
            first_freed,
            cluster_blocks: nr,
            freed_runs: HashSet::new(),
            freed_bytes: 0,
            freed_blocks: 0,
        };

        // Indirect roots, deepest first.
        let a = self.geo.addr_per_block as u64;
        let spans = [
            (TIND_BLOCK, 3usize, a * a * a),
            (DIND_BLOCK, 2usize, a * a),
            (IND_BLOCK, 1usize, a),
        ];
        let mut span_start = NDIR_BLOCKS as u64 + a + a * a;
        for (root, depth, span) in spans {
            let bp = handle.with_state(|s| s.block[root]);
            if !bp.is_hole() && span_start + span > first_freed as u64 {
                let emptied = self.free_branch(&bp, depth, span_start, span / a, &mut ctx)?;
                if emptied {
                    self.free_block(bp.blockno.get())?;
                    ctx.freed_blocks += 1;
                    handle.with_state_mut(|s| {
                        s.block[root] = BlockPtr::ZERO;
                        s.mark_dirty();
                    });
                }
            }
            span_start -= match depth {
                1 => NDIR_BLOCKS as u64,
                2 => a,
                _ => a * a,
            };
        }

        // Direct blocks, highest first.
        for i in (0..NDIR_BLOCKS).rev() {
            let bp = handle.with_state(|s| s.block[i]);
            if bp.is_hole() || (i as u32) < first_freed {
                continue;
            }
            if self.free_leaf_entry(&bp, i as u32, &mut ctx)? {
                handle.with_state_mut(|s| {
                    s.block[i] = BlockPtr::ZERO;
                    s.mark_dirty();
                });
            }
        }

        handle.with_state_mut(|s| {
            s.size = new_size;
            s.blocks = s.blocks.saturating_sub(ctx.freed_blocks);
            s.size_comp = s.size_comp.saturating_sub(ctx.freed_bytes);
            s.mtime = crate::fs::now();
            s.ctime = s.mtime;
            s.mark_dirty();
        });
        log::debug!(
            "packfs: truncated inode {} to {new_size}, freed {} blocks",
            handle.ino(),
            ctx.freed_blocks
        );
        Ok(())
    }

    /// Free one leaf record. Returns whether the record should be cleared:
    /// a compressed record whose cluster head survives the cut is kept so
    /// the cluster stays uniform.
    fn free_leaf_entry(&self, bp: &BlockPtr, logical: u32, ctx: &mut FreeCtx) -> Result<bool> {
        if bp.is_compressed() {
            let cluster_start = (logical / ctx.cluster_blocks) * ctx.cluster_blocks;
            if cluster_start < ctx.first_freed {
                return Ok(false);
            }
            if ctx.freed_runs.insert(bp.blockno.get()) {
                let run = (bp.length.get() as u32).div_ceil(self.geo.block_size as u32);
                self.free_block_run(bp.blockno.get(), run)?;
                ctx.freed_bytes += bp.length.get() as u64;
                ctx.freed_blocks += run;
            }
        } else {
            self.free_block(bp.blockno.get())?;
            ctx.freed_bytes += self.geo.block_size as u64;
            ctx.freed_blocks += 1;
        }
        Ok(true)
    }

    /// Walk one indirect block, freeing covered leaves from the highest
    /// entry downward. Returns whether the block ended up empty (and so
    /// must be freed by the caller).
    fn free_branch(
        &self,
        bp: &BlockPtr,
        depth: usize,
        span_start: u64,
        child_span: u64,
        ctx: &mut FreeCtx,
    ) -> Result<bool> {
        let indirect = bp.blockno.get();
        let a = self.geo.addr_per_block;
        let buf = self.cache.read(indirect as u64)?;

        for idx in (0..a).rev() {
            let child_start = span_start + idx as u64 * child_span;
            if child_start + child_span <= ctx.first_freed as u64 {
                break;
            }

            let entry = {
                let data = buf.data();
                let off = idx as usize * BLKPTR_SIZE;
                BlockPtr::read_from_bytes(&data[off..off + BLKPTR_SIZE])
                    .map_err(|_| FsError::CorruptMetadata("indirect entry out of bounds".into()))?
            };
            if entry.is_hole() {
                continue;
            }

            let clear = if depth == 1 {
                if (child_start as u32) < ctx.first_freed {
                    false
                } else {
                    self.free_leaf_entry(&entry, child_start as u32, ctx)?
                }
            } else {
                let emptied =
                    self.free_branch(&entry, depth - 1, child_start, child_span / a as u64, ctx)?;
                if emptied {
                    self.free_block(entry.blockno.get())?;
                    ctx.freed_blocks += 1;
                }
                emptied
            };

            if clear {
                let mut data = buf.data();
                let off = idx as usize * BLKPTR_SIZE;
                data[off..off + BLKPTR_SIZE].copy_from_slice(BlockPtr::ZERO.as_bytes());
                drop(data);
                buf.mark_dirty();
            }
        }

        let data = buf.data();
        let empty = data
            .chunks_exact(BLKPTR_SIZE)
            .all(|chunk| chunk.iter().all(|&b| b == 0));
        Ok(empty)
    }
}

struct FreeCtx {
    /// First logical block past the new end of file.
    first_freed: u32,
    cluster_blocks: u32,
    /// Compressed runs already released during this truncate.
    freed_runs: HashSet<u32>,
    freed_bytes: u64,
    freed_blocks: u32,
}
