//! packfs: a block-addressed filesystem with transparent per-extent
//! compression.
//!
//! The on-disk format is a classical indirect-block filesystem — superblock,
//! block groups with bitmaps and inode tables, inodes with a small indirect
//! tree — extended with 16-byte block-pointer records that carry compressed
//! extent geometry and checksums. File data moves through fixed-size
//! clusters: writeback gathers a cluster's dirty pages, decides
//! compressibility, allocates a contiguous physical run, rewrites the
//! cluster's records copy-on-write and frees the old run. Reads verify the
//! extent fingerprint before decompressing back into the page cache.
//!
//! ```no_run
//! use std::sync::Arc;
//! use packfs::{FormatOptions, MemDevice, PackFs, format};
//!
//! let device = Arc::new(MemDevice::new(64 << 20));
//! format(device.as_ref(), &FormatOptions::default()).unwrap();
//!
//! let fs = PackFs::mount(device, "").unwrap();
//! let mut file = fs.create("/hello", 0o644).unwrap();
//! file.write(b"hello, world").unwrap();
//! file.sync().unwrap();
//! fs.unmount().unwrap();
//! ```

mod bitmap;
mod bmap;
mod buffer;
mod checksum;
mod compress;
mod device;
mod dir;
mod error;
mod extent;
mod file;
mod format;
mod fs;
mod guards;
mod inode;
mod pages;
mod stats;
mod structs;
mod workqueue;

pub use device::{BlockDevice, FileDevice, MemDevice};
pub use dir::DirEntry;
pub use error::{FsError, Result};
pub use extent::WritebackControl;
pub use file::{FileStat, PackFile};
pub use format::{FormatOptions, format};
pub use fs::{MountOptions, PackFs, StatFs};
pub use inode::{InodeHandle, InodeState};
pub use stats::{AllocStats, CompressionStats};
pub use structs::*;
