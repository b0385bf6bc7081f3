//! Buffered metadata blocks.
//!
//! All metadata I/O (superblock block, descriptor blocks, bitmaps, inode
//! table, indirect blocks) goes through a [`BufferCache`] of shared
//! [`BlockBuf`] handles keyed by block number. A handle carries a dirty mark
//! and can be flushed individually (`sync_buf`) or as part of `sync_all`,
//! which writes dirty buffers in ascending block order. Data extents bypass
//! the cache and go straight to the device.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use spinning_top::RwSpinlock;

use crate::device::BlockDevice;
use crate::error::Result;

/// A cached metadata block.
pub struct BlockBuf {
    block: u64,
    data: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

impl BlockBuf {
    /// Lock the block contents.
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    /// Mark the buffer dirty; it will reach the device on the next sync.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Cache of metadata blocks with explicit write-back.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    block_size: usize,
    bufs: RwSpinlock<BTreeMap<u64, Arc<BlockBuf>>>,
}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>, block_size: usize) -> Self {
        BufferCache {
            device,
            block_size,
            bufs: RwSpinlock::new(BTreeMap::new()),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn lookup(&self, block: u64) -> Option<Arc<BlockBuf>> {
        self.bufs.read().get(&block).cloned()
    }

    fn insert(&self, buf: Arc<BlockBuf>) -> Arc<BlockBuf> {
        let mut bufs = self.bufs.write();
        // Another thread may have inserted the block while we were reading
        // it from the device; the first insertion wins.
        bufs.entry(buf.block).or_insert_with(|| buf.clone()).clone()
    }

    /// Read a block through the cache.
    pub fn read(&self, block: u64) -> Result<Arc<BlockBuf>> {
        if let Some(buf) = self.lookup(block) {
            return Ok(buf);
        }
        let mut data = vec![0u8; self.block_size];
        self.device
            .read_at(block * self.block_size as u64, &mut data)?;
        Ok(self.insert(Arc::new(BlockBuf {
            block,
            data: Mutex::new(data),
            dirty: AtomicBool::new(false),
        })))
    }

    /// Get a zero-filled buffer for a freshly allocated block without
    /// reading stale contents from the device.
    pub fn get_zeroed(&self, block: u64) -> Arc<BlockBuf> {
        if let Some(buf) = self.lookup(block) {
            buf.data().fill(0);
            buf.mark_dirty();
            return buf;
        }
        let buf = Arc::new(BlockBuf {
            block,
            data: Mutex::new(vec![0u8; self.block_size]),
            dirty: AtomicBool::new(true),
        });
        self.insert(buf)
    }

    /// Write one buffer through to the device and clear its dirty mark.
    pub fn sync_buf(&self, buf: &BlockBuf) -> Result<()> {
        let data = buf.data();
        self.device
            .write_at(buf.block * self.block_size as u64, &data)?;
        buf.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Write all dirty buffers in ascending block order, then flush the
    /// device.
    pub fn sync_all(&self) -> Result<()> {
        let dirty: Vec<Arc<BlockBuf>> = self
            .bufs
            .read()
            .values()
            .filter(|b| b.is_dirty())
            .cloned()
            .collect();
        for buf in dirty {
            self.sync_buf(&buf)?;
        }
        self.device.flush()?;
        Ok(())
    }

    /// Drop a block from the cache, discarding its contents. Used when the
    /// block has been freed.
    pub fn forget(&self, block: u64) {
        self.bufs.write().remove(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    fn cache() -> (Arc<MemDevice>, BufferCache) {
        let dev = Arc::new(MemDevice::new(64 * 1024));
        let cache = BufferCache::new(dev.clone(), 4096);
        (dev, cache)
    }

    #[test]
    fn read_caches_handle() {
        let (dev, cache) = cache();
        dev.write_at(4096, &[0xAB; 16]).unwrap();
        let a = cache.read(1).unwrap();
        let b = cache.read(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.data()[0], 0xAB);
    }

    #[test]
    fn dirty_buffer_reaches_device_on_sync() {
        let (dev, cache) = cache();
        let buf = cache.read(2).unwrap();
        buf.data()[0] = 0x7F;
        buf.mark_dirty();

        let mut probe = [0u8; 1];
        dev.read_at(2 * 4096, &mut probe).unwrap();
        assert_eq!(probe[0], 0, "dirty data must not leak before sync");

        cache.sync_all().unwrap();
        dev.read_at(2 * 4096, &mut probe).unwrap();
        assert_eq!(probe[0], 0x7F);
        assert!(!buf.is_dirty());
    }

    #[test]
    fn get_zeroed_skips_device_read() {
        let (dev, cache) = cache();
        dev.write_at(3 * 4096, &[0xFF; 4096]).unwrap();
        let buf = cache.get_zeroed(3);
        assert!(buf.data().iter().all(|&b| b == 0));
        assert!(buf.is_dirty());
    }
}
