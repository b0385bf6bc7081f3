//! Open-file handles.

use std::io::SeekFrom;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::inode::InodeHandle;

/// File metadata as reported to callers. The apparent size is the logical
/// size; the compressed on-disk footprint is reported separately.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub ino: u32,
    pub mode: u16,
    pub size: u64,
    pub size_comp: u64,
    pub blocks: u32,
    pub nlinks: u16,
    pub is_dir: bool,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
}

/// An open file with a position cursor.
///
/// Dropping the handle releases the open reference; the last release of an
/// unlinked file reclaims its storage.
pub struct PackFile {
    fs: Arc<PackFs>,
    handle: Arc<InodeHandle>,
    pos: u64,
}

impl std::fmt::Debug for PackFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFile")
            .field("ino", &self.handle.ino())
            .field("pos", &self.pos)
            .finish()
    }
}

impl PackFile {
    pub(crate) fn new(fs: Arc<PackFs>, handle: Arc<InodeHandle>) -> Self {
        handle.open_count.fetch_add(1, Ordering::AcqRel);
        PackFile { fs, handle, pos: 0 }
    }

    pub fn ino(&self) -> u32 {
        self.handle.ino()
    }

    /// The underlying inode handle.
    pub fn inode(&self) -> &Arc<InodeHandle> {
        &self.handle
    }

    /// Read from the cursor, advancing it. Short reads happen only at end
    /// of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.fs.read(&self.handle, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Write at the cursor, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.fs.write(&self.handle, self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Reposition the cursor.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let size = self.handle.size() as i64;
        let new_pos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.pos as i64 + n,
            SeekFrom::End(n) => size + n,
        };
        if new_pos < 0 {
            return Err(FsError::InvalidArgument("seek before start".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }

    /// Flush this file's data and metadata to the device.
    pub fn sync(&self) -> Result<()> {
        self.fs.fsync(&self.handle)
    }

    pub fn stat(&self) -> FileStat {
        stat_of(&self.handle)
    }
}

impl Drop for PackFile {
    fn drop(&mut self) {
        if let Err(err) = self.fs.release(&self.handle) {
            log::warn!("packfs: release of inode {} failed: {err}", self.handle.ino());
        }
    }
}

pub(crate) fn stat_of(handle: &InodeHandle) -> FileStat {
    handle.with_state(|s| FileStat {
        ino: handle.ino(),
        mode: s.mode,
        size: s.size,
        size_comp: s.size_comp,
        blocks: s.blocks,
        nlinks: s.links_count,
        is_dir: s.is_dir(),
        atime: s.atime as u64,
        ctime: s.ctime as u64,
        mtime: s.mtime as u64,
    })
}
