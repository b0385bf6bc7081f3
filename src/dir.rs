//! Directory entry manipulation.
//!
//! Directories are linked lists of variable-length records inside data
//! blocks: an 8-byte header followed by the name, with `rec_len` the
//! 4-byte-aligned distance to the next record. The last record of a block
//! extends to the block end, and no record crosses a chunk boundary. A
//! record with a zero inode field is a hole left by deletion.
//!
//! Directory blocks are never compressed; they are read and committed
//! through the buffer cache, and each commit refreshes the block's
//! plaintext fingerprint in its leaf record.

use std::sync::Arc;

use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::buffer::BlockBuf;
use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::inode::InodeHandle;
use crate::structs::{
    BlockPtr, DirEntryHeader, FT_DIR, NAME_LEN, dir_rec_len,
};

const HEADER_SIZE: usize = size_of::<DirEntryHeader>();

/// One decoded directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u32,
    pub name: String,
    pub file_type: u8,
}

fn read_header(data: &[u8], pos: usize) -> Result<DirEntryHeader> {
    DirEntryHeader::read_from_bytes(&data[pos..pos + HEADER_SIZE])
        .map_err(|_| FsError::CorruptMetadata("short directory record".into()))
}

fn write_record(data: &mut [u8], pos: usize, ino: u32, rec_len: u16, name: &[u8], file_type: u8) {
    let mut header = DirEntryHeader::new_zeroed();
    header.inode.set(ino);
    header.rec_len.set(rec_len);
    header.name_len = name.len() as u8;
    header.file_type = file_type;
    data[pos..pos + HEADER_SIZE].copy_from_slice(header.as_bytes());
    data[pos + HEADER_SIZE..pos + HEADER_SIZE + name.len()].copy_from_slice(name);
    // Zero the alignment padding after the name.
    let padded = pos + dir_rec_len(name.len());
    let name_end = pos + HEADER_SIZE + name.len();
    if padded > name_end && padded <= pos + rec_len as usize {
        data[name_end..padded].fill(0);
    }
}

impl PackFs {
    /// Fetch one directory block through the buffer cache. `None` for a
    /// sparse slot.
    fn dir_block(&self, dir: &InodeHandle, index: u32) -> Result<Option<(Arc<BlockBuf>, BlockPtr)>> {
        let bp = self.bmap(dir, index)?;
        if bp.is_hole() {
            return Ok(None);
        }
        Ok(Some((self.cache.read(bp.blockno.get() as u64)?, bp)))
    }

    /// Commit a mutated directory block: refresh the record's plaintext
    /// fingerprint, mark the buffer dirty, write through on a sync mount.
    fn commit_dir_block(
        &self,
        dir: &Arc<InodeHandle>,
        index: u32,
        buf: &BlockBuf,
        bp: &BlockPtr,
    ) -> Result<()> {
        let crc = {
            let data = buf.data();
            crate::checksum::crc32(&data)
        };
        buf.mark_dirty();
        self.bmap_set_entry(
            dir,
            index,
            BlockPtr::new(bp.blockno.get(), 0, 0, crc, self.current_epoch()),
        )?;
        if self.sync_mount {
            self.cache.sync_buf(buf)?;
        }
        Ok(())
    }

    fn dir_blocks(&self, dir: &InodeHandle) -> u32 {
        let block_size = self.geo.block_size as u64;
        (dir.size().div_ceil(block_size)) as u32
    }

    /// Locate a name. Linear scan, first match wins.
    pub fn find_entry(&self, dir: &InodeHandle, name: &str) -> Result<Option<u32>> {
        let name = name.as_bytes();
        if name.is_empty() || name.len() > NAME_LEN {
            return Err(FsError::InvalidArgument("bad entry name".into()));
        }
        let block_size = self.geo.block_size;

        for index in 0..self.dir_blocks(dir) {
            let Some((buf, _)) = self.dir_block(dir, index)? else {
                continue;
            };
            let data = buf.data();
            let mut pos = 0usize;
            while pos + HEADER_SIZE <= block_size {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    log::error!("packfs: zero-length directory record in inode {}", dir.ino());
                    return Err(FsError::CorruptMetadata(
                        "zero-length directory record".into(),
                    ));
                }
                if pos + rec_len > block_size {
                    return Err(FsError::CorruptMetadata(
                        "directory record crosses chunk boundary".into(),
                    ));
                }
                if header.inode.get() != 0
                    && header.name_len as usize == name.len()
                    && HEADER_SIZE + name.len() <= rec_len
                    && &data[pos + HEADER_SIZE..pos + HEADER_SIZE + name.len()] == name
                {
                    return Ok(Some(header.inode.get()));
                }
                pos += rec_len;
            }
        }
        Ok(None)
    }

    /// Insert an entry, reusing a deleted record or slack space, appending a
    /// fresh block when the directory is full.
    pub fn add_link(
        &self,
        dir: &Arc<InodeHandle>,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> Result<()> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() > NAME_LEN {
            return Err(FsError::InvalidArgument("bad entry name".into()));
        }
        let needed = dir_rec_len(name_bytes.len());
        let block_size = self.geo.block_size;

        for index in 0..self.dir_blocks(dir) {
            let Some((buf, bp)) = self.dir_block(dir, index)? else {
                continue;
            };
            let mut insert_at: Option<usize> = None;
            {
                let mut data = buf.data();
                let mut pos = 0usize;
                while pos + HEADER_SIZE <= block_size {
                    let header = read_header(&data, pos)?;
                    let rec_len = header.rec_len.get() as usize;
                    if rec_len == 0 {
                        return Err(FsError::CorruptMetadata(
                            "zero-length directory record".into(),
                        ));
                    }

                    if pos + rec_len > block_size {
                        return Err(FsError::CorruptMetadata(
                            "directory record crosses chunk boundary".into(),
                        ));
                    }
                    if header.inode.get() != 0 {
                        if header.name_len as usize == name_bytes.len()
                            && HEADER_SIZE + name_bytes.len() <= rec_len
                            && &data[pos + HEADER_SIZE..pos + HEADER_SIZE + name_bytes.len()]
                                == name_bytes
                        {
                            return Err(FsError::AlreadyExists);
                        }
                        // Split slack space off an active record.
                        let used = dir_rec_len(header.name_len as usize);
                        if rec_len >= used && rec_len - used >= needed {
                            let mut trimmed = header;
                            trimmed.rec_len.set(used as u16);
                            data[pos..pos + HEADER_SIZE].copy_from_slice(trimmed.as_bytes());
                            write_record(
                                &mut data,
                                pos + used,
                                ino,
                                (rec_len - used) as u16,
                                name_bytes,
                                file_type,
                            );
                            insert_at = Some(pos + used);
                            break;
                        }
                    } else if rec_len >= needed {
                        // Reuse a deleted record.
                        write_record(&mut data, pos, ino, rec_len as u16, name_bytes, file_type);
                        insert_at = Some(pos);
                        break;
                    }
                    pos += rec_len;
                }
            }
            if insert_at.is_some() {
                self.commit_dir_block(dir, index, &buf, &bp)?;
                dir.with_state_mut(|s| {
                    s.mtime = crate::fs::now();
                    s.ctime = s.mtime;
                    s.mark_dirty();
                });
                return Ok(());
            }
        }

        // No room anywhere: append a block holding a single record.
        let index = self.dir_blocks(dir);
        let home = dir.with_state(|s| s.block_group);
        let block = self.new_block(home)?;
        let buf = self.cache.get_zeroed(block as u64);
        {
            let mut data = buf.data();
            write_record(&mut data, 0, ino, block_size as u16, name_bytes, file_type);
        }
        let bp = BlockPtr::new(block, 0, 0, 0, self.current_epoch());
        self.bmap_set_entry(dir, index, bp)?;
        dir.with_state_mut(|s| {
            s.size += block_size as u64;
            s.blocks += 1;
            s.mtime = crate::fs::now();
            s.ctime = s.mtime;
            s.mark_dirty();
        });
        self.commit_dir_block(dir, index, &buf, &bp)?;
        Ok(())
    }

    /// Remove an entry by zeroing its inode field in place and committing
    /// the chunk. Returns the inode number it referenced.
    pub fn remove_entry(&self, dir: &Arc<InodeHandle>, name: &str) -> Result<u32> {
        let name_bytes = name.as_bytes();
        let block_size = self.geo.block_size;

        for index in 0..self.dir_blocks(dir) {
            let Some((buf, bp)) = self.dir_block(dir, index)? else {
                continue;
            };
            let mut removed: Option<u32> = None;
            {
                let mut data = buf.data();
                let mut pos = 0usize;
                while pos + HEADER_SIZE <= block_size {
                    let header = read_header(&data, pos)?;
                    let rec_len = header.rec_len.get() as usize;
                    if rec_len == 0 {
                        return Err(FsError::CorruptMetadata(
                            "zero-length directory record".into(),
                        ));
                    }
                    if pos + rec_len > block_size {
                        return Err(FsError::CorruptMetadata(
                            "directory record crosses chunk boundary".into(),
                        ));
                    }
                    if header.inode.get() != 0
                        && header.name_len as usize == name_bytes.len()
                        && HEADER_SIZE + name_bytes.len() <= rec_len
                        && &data[pos + HEADER_SIZE..pos + HEADER_SIZE + name_bytes.len()]
                            == name_bytes
                    {
                        let mut cleared = header;
                        cleared.inode.set(0);
                        data[pos..pos + HEADER_SIZE].copy_from_slice(cleared.as_bytes());
                        removed = Some(header.inode.get());
                        break;
                    }
                    pos += rec_len;
                }
            }
            if let Some(ino) = removed {
                self.commit_dir_block(dir, index, &buf, &bp)?;
                dir.with_state_mut(|s| {
                    s.mtime = crate::fs::now();
                    s.ctime = s.mtime;
                    s.mark_dirty();
                });
                return Ok(ino);
            }
        }
        Err(FsError::NotFound)
    }

    /// Decode every live entry, in storage order.
    pub fn read_dir(&self, dir: &InodeHandle) -> Result<Vec<DirEntry>> {
        let block_size = self.geo.block_size;
        let mut entries = Vec::new();

        for index in 0..self.dir_blocks(dir) {
            let Some((buf, _)) = self.dir_block(dir, index)? else {
                continue;
            };
            let data = buf.data();
            let mut pos = 0usize;
            while pos + HEADER_SIZE <= block_size {
                let header = read_header(&data, pos)?;
                let rec_len = header.rec_len.get() as usize;
                if rec_len == 0 {
                    log::error!(
                        "packfs: invalid directory record, inode {} block {index} offset {pos}",
                        dir.ino()
                    );
                    return Err(FsError::CorruptMetadata(
                        "zero-length directory record".into(),
                    ));
                }
                if pos + rec_len > block_size || HEADER_SIZE + header.name_len as usize > rec_len {
                    return Err(FsError::CorruptMetadata(
                        "directory record crosses chunk boundary".into(),
                    ));
                }
                if header.inode.get() != 0 {
                    let name_bytes = &data[pos + HEADER_SIZE..pos + HEADER_SIZE + header.name_len as usize];
                    if let Ok(name) = core::str::from_utf8(name_bytes) {
                        entries.push(DirEntry {
                            ino: header.inode.get(),
                            name: name.to_string(),
                            file_type: header.file_type,
                        });
                    }
                }
                pos += rec_len;
            }
        }
        Ok(entries)
    }

    /// Lay out `.` and `..` in a directory's first block.
    pub(crate) fn make_empty_dir(&self, dir: &Arc<InodeHandle>, parent_ino: u32) -> Result<()> {
        let block_size = self.geo.block_size;
        let home = dir.with_state(|s| s.block_group);
        let block = self.new_block(home)?;
        let buf = self.cache.get_zeroed(block as u64);
        {
            let mut data = buf.data();
            let dot_len = dir_rec_len(1);
            write_record(&mut data, 0, dir.ino(), dot_len as u16, b".", FT_DIR);
            write_record(
                &mut data,
                dot_len,
                parent_ino,
                (block_size - dot_len) as u16,
                b"..",
                FT_DIR,
            );
        }
        let bp = BlockPtr::new(block, 0, 0, 0, self.current_epoch());
        self.bmap_set_entry(dir, 0, bp)?;
        dir.with_state_mut(|s| {
            s.size = block_size as u64;
            s.blocks += 1;
            s.mark_dirty();
        });
        self.commit_dir_block(dir, 0, &buf, &bp)?;
        Ok(())
    }
}
