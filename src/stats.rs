//! Sharded counters for filesystem-wide statistics.
//!
//! Hot paths (allocation, the compression engine) update a per-shard atomic
//! chosen by thread identity; readers sum all shards. This trades exact
//! point-in-time reads for uncontended writes, which is acceptable for
//! statfs-style reporting.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

const SHARDS: usize = 16;

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Shard assigned to this thread, round-robin at first use.
    static MY_SHARD: usize = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % SHARDS;
}

/// A signed counter split across shards, summed on read.
pub struct ShardedCounter {
    shards: [AtomicI64; SHARDS],
}

impl ShardedCounter {
    pub const fn new() -> Self {
        ShardedCounter {
            shards: [const { AtomicI64::new(0) }; SHARDS],
        }
    }

    fn shard(&self) -> &AtomicI64 {
        // Thread-affine shard; collisions only cost contention.
        let index = MY_SHARD.with(|&s| s);
        &self.shards[index]
    }

    pub fn add(&self, delta: i64) {
        self.shard().fetch_add(delta, Ordering::Relaxed);
    }

    /// Replace the summed value. Used at mount when the counters are
    /// re-initialised from a bitmap scan.
    pub fn set(&self, value: i64) {
        for (i, shard) in self.shards.iter().enumerate() {
            shard.store(if i == 0 { value } else { 0 }, Ordering::Relaxed);
        }
    }

    pub fn read(&self) -> i64 {
        self.shards.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Compression engine statistics, in pages.
#[derive(Default)]
pub struct CompressionStats {
    /// Pages handed to the engine.
    pub pages_ingested: AtomicU64,
    /// Pages written raw because compression did not shrink them.
    pub pages_notcompressed: AtomicU64,
    /// Pages vetoed by the admission heuristic or the direct-range rule.
    pub pages_notcompressible: AtomicU64,
    /// Pages in clusters that compressed past `COMPRESS_RATIO_LIMIT`.
    pub pages_wellcompressed: AtomicU64,
}

/// Allocator instrumentation: every physical free is counted once, which
/// lets tests assert that a compressed run is released exactly once.
#[derive(Default)]
pub struct AllocStats {
    /// Individual block frees.
    pub blocks_freed: AtomicU64,
    /// Compressed extent runs freed.
    pub extents_freed: AtomicU64,
}
