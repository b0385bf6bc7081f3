//! Block device gateway.
//!
//! The filesystem talks to storage through the narrow [`BlockDevice`] trait:
//! positioned reads and writes plus an explicit flush. Two implementations
//! are provided — an in-memory device for tests and tooling, and a
//! file-backed device for disk images.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use crate::error::{FsError, Result};

/// A byte-addressable block device.
///
/// Callers issue block-aligned I/O for metadata and sector-aligned I/O for
/// extents; the trait itself only requires that reads and writes stay within
/// `size()` bytes.
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes at the given byte offset.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` at the given byte offset.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush any device-side caching.
    fn flush(&self) -> Result<()>;

    /// Device capacity in bytes.
    fn size(&self) -> u64;

    /// Whether the device rejects writes.
    fn read_only(&self) -> bool {
        false
    }
}

/// An in-memory block device.
///
/// Besides normal I/O it supports two test hooks: `snapshot` clones the
/// current image, and `freeze` makes all subsequent writes disappear —
/// together they let a test cut power at a chosen point and remount what
/// actually reached the medium.
pub struct MemDevice {
    data: RwLock<Vec<u8>>,
    frozen: AtomicBool,
    read_only: AtomicBool,
}

impl MemDevice {
    /// A zero-filled device of the given size.
    pub fn new(size: usize) -> Self {
        MemDevice {
            data: RwLock::new(vec![0u8; size]),
            frozen: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        }
    }

    /// A device backed by an existing image.
    pub fn from_image(image: Vec<u8>) -> Self {
        MemDevice {
            data: RwLock::new(image),
            frozen: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        }
    }

    /// Clone the current on-media image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }

    /// Drop all writes from now on, simulating a crash at this point.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Mark the device read-only; writes return `ReadOnly`.
    pub fn set_read_only(&self, ro: bool) {
        self.read_only.store(ro, Ordering::SeqCst);
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(FsError::Io(format!(
                "read past end of device ({end} > {})",
                data.len()
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(FsError::ReadOnly);
        }
        if self.frozen.load(Ordering::SeqCst) {
            // A frozen device acknowledges writes that never hit the medium.
            return Ok(());
        }
        let mut data = self.data.write().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(FsError::Io(format!(
                "write past end of device ({end} > {})",
                data.len()
            )));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }
}

/// A device backed by a regular file or disk image.
pub struct FileDevice {
    file: Mutex<File>,
    size: u64,
    read_only: bool,
}

impl FileDevice {
    /// Open an existing image read-write.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileDevice {
            file: Mutex::new(file),
            size,
            read_only: false,
        })
    }

    /// Open an existing image read-only.
    pub fn open_read_only(path: &std::path::Path) -> Result<Self> {
        let file = File::options().read(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(FileDevice {
            file: Mutex::new(file),
            size,
            read_only: true,
        })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
