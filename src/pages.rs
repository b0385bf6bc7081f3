//! Per-inode page cache.
//!
//! The engine works on fixed-size pages with the usual page flags: uptodate,
//! dirty, writeback, error, plus the to-write tag used by synced writeback.
//! Page locks are cooperative: `lock` spins with `yield_now`, `try_lock`
//! fails fast so a cluster grab can back off and retry, and writeback acts
//! as the exclusion token between competing flushes of the same cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use spinning_top::RwSpinlock;

use crate::structs::PAGE_SIZE;

const PG_UPTODATE: u32 = 1 << 0;
const PG_DIRTY: u32 = 1 << 1;
const PG_WRITEBACK: u32 = 1 << 2;
const PG_ERROR: u32 = 1 << 3;
const PG_LOCKED: u32 = 1 << 4;
const PG_TOWRITE: u32 = 1 << 5;

/// Tag scanned for by dirty-page lookup.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Dirty,
    ToWrite,
}

/// One cached page of file data.
pub struct Page {
    index: u32,
    flags: AtomicU32,
    data: Mutex<Vec<u8>>,
}

impl Page {
    fn new(index: u32) -> Self {
        Page {
            index,
            flags: AtomicU32::new(0),
            data: Mutex::new(vec![0u8; PAGE_SIZE]),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap()
    }

    fn set(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
    }

    fn clear(&self, bit: u32) -> bool {
        self.flags.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    fn test(&self, bit: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bit != 0
    }

    /// Try to take the page lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.flags.fetch_or(PG_LOCKED, Ordering::AcqRel) & PG_LOCKED == 0
    }

    /// Take the page lock, yielding until it is available.
    pub fn lock(&self) {
        while !self.try_lock() {
            std::thread::yield_now();
        }
    }

    pub fn unlock(&self) {
        self.clear(PG_LOCKED);
    }

    pub fn set_uptodate(&self) {
        self.set(PG_UPTODATE);
    }

    pub fn is_uptodate(&self) -> bool {
        self.test(PG_UPTODATE)
    }

    pub fn set_dirty(&self) {
        self.set(PG_DIRTY);
    }

    pub fn is_dirty(&self) -> bool {
        self.test(PG_DIRTY)
    }

    /// Clear the dirty flag in preparation for writeout; returns whether the
    /// page was dirty.
    pub fn clear_dirty_for_io(&self) -> bool {
        self.clear(PG_DIRTY)
    }

    pub fn set_writeback(&self) {
        self.set(PG_WRITEBACK);
    }

    pub fn is_writeback(&self) -> bool {
        self.test(PG_WRITEBACK)
    }

    pub fn end_writeback(&self) {
        self.clear(PG_WRITEBACK);
    }

    /// Wait until any in-flight writeback of this page completes.
    pub fn wait_writeback(&self) {
        while self.is_writeback() {
            std::thread::yield_now();
        }
    }

    pub fn set_error(&self) {
        self.set(PG_ERROR);
    }

    pub fn tag_towrite(&self) {
        self.set(PG_TOWRITE);
    }

    pub fn clear_towrite(&self) -> bool {
        self.clear(PG_TOWRITE)
    }

    pub fn is_towrite(&self) -> bool {
        self.test(PG_TOWRITE)
    }
}

/// The page tree of one inode.
pub struct PageCache {
    pages: RwSpinlock<BTreeMap<u32, Arc<Page>>>,
}

impl PageCache {
    pub fn new() -> Self {
        PageCache {
            pages: RwSpinlock::new(BTreeMap::new()),
        }
    }

    pub fn find(&self, index: u32) -> Option<Arc<Page>> {
        self.pages.read().get(&index).cloned()
    }

    pub fn find_or_create(&self, index: u32) -> Arc<Page> {
        if let Some(page) = self.find(index) {
            return page;
        }
        let mut pages = self.pages.write();
        pages
            .entry(index)
            .or_insert_with(|| Arc::new(Page::new(index)))
            .clone()
    }

    /// Find or create a page and lock it, failing instead of blocking if the
    /// lock is contended.
    pub fn grab_nowait(&self, index: u32) -> Option<Arc<Page>> {
        let page = self.find_or_create(index);
        if page.try_lock() { Some(page) } else { None }
    }

    /// Pages carrying `tag` with index at or after `start`, in ascending
    /// order, at most `max`.
    pub fn lookup_tag(&self, start: u32, tag: PageTag, max: usize) -> Vec<Arc<Page>> {
        self.pages
            .read()
            .range(start..)
            .filter(|(_, p)| match tag {
                PageTag::Dirty => p.is_dirty(),
                PageTag::ToWrite => p.is_towrite(),
            })
            .take(max)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Tag every dirty page in `[start, end]` for synced writeback.
    pub fn tag_for_writeback(&self, start: u32, end: u32) {
        for (_, page) in self.pages.read().range(start..=end) {
            if page.is_dirty() {
                page.tag_towrite();
            }
        }
    }

    /// Whether any page at or after `start` carries the dirty tag.
    pub fn has_dirty(&self) -> bool {
        self.pages.read().values().any(|p| p.is_dirty())
    }

    /// Drop all pages with index >= `from`, waiting for in-flight writeback.
    pub fn truncate(&self, from: u32) {
        let doomed: Vec<Arc<Page>> = self
            .pages
            .read()
            .range(from..)
            .map(|(_, p)| p.clone())
            .collect();
        for page in &doomed {
            page.wait_writeback();
        }
        let mut pages = self.pages.write();
        pages.retain(|&idx, _| idx < from);
    }

    /// Wait for every page currently under writeback.
    pub fn wait_all_writeback(&self) {
        let pages: Vec<Arc<Page>> = self.pages.read().values().cloned().collect();
        for page in pages {
            page.wait_writeback();
        }
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grab_nowait_fails_on_locked_page() {
        let cache = PageCache::new();
        let page = cache.grab_nowait(3).unwrap();
        assert!(cache.grab_nowait(3).is_none());
        page.unlock();
        assert!(cache.grab_nowait(3).is_some());
    }

    #[test]
    fn lookup_tag_is_ordered_and_filtered() {
        let cache = PageCache::new();
        for idx in [5u32, 1, 9, 3] {
            let page = cache.find_or_create(idx);
            if idx != 3 {
                page.set_dirty();
            }
        }
        let found = cache.lookup_tag(0, PageTag::Dirty, 16);
        let indexes: Vec<u32> = found.iter().map(|p| p.index()).collect();
        assert_eq!(indexes, vec![1, 5, 9]);

        let bounded = cache.lookup_tag(2, PageTag::Dirty, 1);
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].index(), 5);
    }

    #[test]
    fn tag_for_writeback_only_marks_dirty_pages() {
        let cache = PageCache::new();
        cache.find_or_create(0).set_dirty();
        cache.find_or_create(1);
        cache.tag_for_writeback(0, 1);
        assert!(cache.find(0).unwrap().is_towrite());
        assert!(!cache.find(1).unwrap().is_towrite());
    }

    #[test]
    fn truncate_drops_tail_pages() {
        let cache = PageCache::new();
        for idx in 0..8 {
            cache.find_or_create(idx);
        }
        cache.truncate(3);
        assert!(cache.find(2).is_some());
        assert!(cache.find(3).is_none());
        assert!(cache.find(7).is_none());
    }
}
