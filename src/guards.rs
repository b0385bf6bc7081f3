//! RAII guards for allocated resources.
//!
//! Multi-step operations (create, the extent worker) allocate an inode or a
//! block run, then perform further fallible steps before the allocation is
//! referenced on disk. These guards free the allocation on drop unless it
//! was consumed at the commit point, so no error path leaks bitmap bits.

use std::sync::Arc;

use crate::fs::PackFs;
use crate::inode::InodeHandle;

/// Guard for a freshly allocated inode.
///
/// `consume` hands the inode over at the commit point (once a directory
/// entry references it); dropping an unconsumed guard frees the inode again.
pub(crate) struct InodeGuard<'a> {
    fs: &'a PackFs,
    handle: Option<Arc<InodeHandle>>,
}

impl<'a> InodeGuard<'a> {
    pub(crate) fn new(fs: &'a PackFs, handle: Arc<InodeHandle>) -> Self {
        InodeGuard {
            fs,
            handle: Some(handle),
        }
    }

    /// Borrow the inode for steps that run before the commit point.
    pub(crate) fn handle(&self) -> &Arc<InodeHandle> {
        self.handle.as_ref().expect("InodeGuard already consumed")
    }

    /// Take ownership at the commit point; cleanup no longer runs.
    pub(crate) fn consume(mut self) -> Arc<InodeHandle> {
        self.handle.take().expect("InodeGuard already consumed")
    }
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.fs.free_inode(&handle) {
                log::warn!(
                    "packfs: failed to roll back inode {}: {err}",
                    handle.ino()
                );
            }
        }
    }
}

/// Guard for a contiguous run of allocated blocks.
pub(crate) struct BlockRunGuard<'a> {
    fs: &'a PackFs,
    run: Option<(u32, u32)>,
}

impl<'a> BlockRunGuard<'a> {
    pub(crate) fn new(fs: &'a PackFs, start: u32, len: u32) -> Self {
        BlockRunGuard {
            fs,
            run: Some((start, len)),
        }
    }

    pub(crate) fn start(&self) -> u32 {
        self.run.expect("BlockRunGuard already consumed").0
    }

    /// Take ownership at the commit point (the bmap now references the run).
    pub(crate) fn consume(mut self) -> u32 {
        self.run.take().expect("BlockRunGuard already consumed").0
    }
}

impl Drop for BlockRunGuard<'_> {
    fn drop(&mut self) {
        if let Some((start, len)) = self.run.take() {
            for block in start..start + len {
                if let Err(err) = self.fs.free_block(block) {
                    log::warn!("packfs: failed to roll back block {block}: {err}");
                }
            }
        }
    }
}
