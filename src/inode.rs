//! Inode store and in-memory inode cache.
//!
//! Inodes live in per-group inode-table blocks, `inode_size` bytes apart.
//! The in-memory [`InodeHandle`] embeds the on-disk fields plus the state
//! the engine needs: the home block group, the per-inode truncate mutex,
//! the metadata rwlock, the page tree and an open count driving eviction.
//!
//! The orphan list keeps its on-disk form — the superblock holds the head
//! inode number and each orphan's deletion-time slot holds the next — while
//! in-memory membership is an explicit list owned by the filesystem.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use spinning_top::RwSpinlock;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::error::{FsError, Result};
use crate::fs::PackFs;
use crate::pages::PageCache;
use crate::structs::{BlockPtr, N_BLOCKS, RawInode, S_IFDIR, S_IFMT, S_IFREG};

/// Freshly created, not yet written to the inode table.
pub const I_STATE_NEW: u32 = 1 << 0;
/// Metadata differs from the on-disk record.
pub const I_STATE_DIRTY: u32 = 1 << 1;

/// In-memory copy of an inode's metadata, protected by the handle's rwlock.
pub struct InodeState {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    /// Logical size in bytes.
    pub size: u64,
    /// Allocated blocks (leaf and indirect).
    pub blocks: u32,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    /// Deletion time; holds the next orphan inode number while this inode
    /// is chained on the orphan list.
    pub dtime: u32,
    pub links_count: u16,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,
    /// Compressed physical size in bytes.
    pub size_comp: u64,
    /// Block-pointer roots (2 direct + single/double/triple indirect).
    pub block: [BlockPtr; N_BLOCKS],
    /// Block group the inode was born in; block allocation starts here.
    pub block_group: u32,
    /// `I_STATE_*` flags.
    pub state: u32,
}

impl InodeState {
    pub fn is_dir(&self) -> bool {
        (self.mode & S_IFMT) == S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        (self.mode & S_IFMT) == S_IFREG
    }

    pub fn mark_dirty(&mut self) {
        self.state |= I_STATE_DIRTY;
    }
}

/// A cached inode.
pub struct InodeHandle {
    ino: u32,
    pub(crate) state: RwSpinlock<InodeState>,
    /// Serialises truncate against bmap growth and extent COW updates.
    pub(crate) truncate_mutex: Mutex<()>,
    /// The inode's page tree.
    pub(crate) pages: PageCache,
    /// Open references; eviction runs when this reaches zero.
    pub(crate) open_count: AtomicU32,
    /// Cursor for cyclic writeback scans.
    pub(crate) writeback_index: AtomicU32,
    /// Sticky writeback failure, surfaced by the next fsync.
    pub(crate) wb_error: AtomicBool,
}

impl InodeHandle {
    pub fn ino(&self) -> u32 {
        self.ino
    }

    /// Read-locked access to the inode metadata.
    pub fn with_state<R>(&self, f: impl FnOnce(&InodeState) -> R) -> R {
        f(&self.state.read())
    }

    /// Write-locked access to the inode metadata.
    pub fn with_state_mut<R>(&self, f: impl FnOnce(&mut InodeState) -> R) -> R {
        f(&mut self.state.write())
    }

    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    pub fn size_comp(&self) -> u64 {
        self.state.read().size_comp
    }

    pub fn links_count(&self) -> u16 {
        self.state.read().links_count
    }
}

fn state_from_raw(raw: &RawInode, block_group: u32) -> InodeState {
    let is_file = raw.is_file();
    let size_low = raw.size.get() as u64;
    // Regular files borrow the directory-ACL word for the high size bits.
    let size_high = if is_file { raw.dir_acl.get() as u64 } else { 0 };
    InodeState {
        mode: raw.mode.get(),
        uid: raw.uid.get(),
        gid: raw.gid.get(),
        size: size_low | (size_high << 32),
        blocks: raw.blocks.get(),
        atime: raw.atime.get(),
        ctime: raw.ctime.get(),
        mtime: raw.mtime.get(),
        dtime: raw.dtime.get(),
        links_count: raw.links_count.get(),
        flags: raw.flags.get(),
        generation: raw.generation.get(),
        file_acl: raw.file_acl.get(),
        size_comp: raw.size_comp.get() as u64,
        block: raw.block,
        block_group,
        state: 0,
    }
}

fn state_to_raw(state: &InodeState) -> RawInode {
    let mut raw = RawInode::new_zeroed();
    raw.mode.set(state.mode);
    raw.uid.set(state.uid);
    raw.gid.set(state.gid);
    raw.size.set(state.size as u32);
    if state.is_file() {
        raw.dir_acl.set((state.size >> 32) as u32);
    }
    raw.blocks.set(state.blocks);
    raw.atime.set(state.atime);
    raw.ctime.set(state.ctime);
    raw.mtime.set(state.mtime);
    raw.dtime.set(state.dtime);
    raw.links_count.set(state.links_count);
    raw.flags.set(state.flags);
    raw.generation.set(state.generation);
    raw.file_acl.set(state.file_acl);
    raw.size_comp.set(state.size_comp as u32);
    raw.block = state.block;
    raw
}

impl PackFs {
    /// Byte location of an inode record: (inode-table block, offset within).
    fn inode_location(&self, ino: u32) -> Result<(u64, usize)> {
        if ino == 0 || ino > self.geo.inodes_count {
            return Err(FsError::CorruptMetadata(format!("invalid inode {ino}")));
        }
        let group = (ino - 1) / self.geo.inodes_per_group;
        let index = (ino - 1) % self.geo.inodes_per_group;
        let table = self.with_desc(group, |d| d.inode_table.get())? as u64;
        let block = table + (index / self.geo.inodes_per_block) as u64;
        let off = (index % self.geo.inodes_per_block) as usize * self.geo.inode_size;
        Ok((block, off))
    }

    /// Fetch an inode, reading it from the inode table on a cache miss.
    pub fn iget(&self, ino: u32) -> Result<Arc<InodeHandle>> {
        if let Some(handle) = self.inodes.lock().unwrap().get(&ino) {
            return Ok(handle.clone());
        }

        let (block, off) = self.inode_location(ino)?;
        let buf = self.cache.read(block)?;
        let raw = {
            let data = buf.data();
            RawInode::read_from_bytes(&data[off..off + size_of::<RawInode>()])
                .map_err(|_| FsError::CorruptMetadata("short inode record".into()))?
        };

        let group = (ino - 1) / self.geo.inodes_per_group;
        let handle = Arc::new(InodeHandle {
            ino,
            state: RwSpinlock::new(state_from_raw(&raw, group)),
            truncate_mutex: Mutex::new(()),
            pages: PageCache::new(),
            open_count: AtomicU32::new(0),
            writeback_index: AtomicU32::new(0),
            wb_error: AtomicBool::new(false),
        });

        let mut inodes = self.inodes.lock().unwrap();
        Ok(inodes.entry(ino).or_insert(handle).clone())
    }

    /// Write an inode's metadata back to its inode-table block.
    pub(crate) fn write_inode(&self, handle: &InodeHandle) -> Result<()> {
        let (block, off) = self.inode_location(handle.ino())?;
        let buf = self.cache.read(block)?;
        let raw = {
            let mut state = handle.state.write();
            state.state &= !(I_STATE_DIRTY | I_STATE_NEW);
            state_to_raw(&state)
        };
        buf.data()[off..off + size_of::<RawInode>()].copy_from_slice(raw.as_bytes());
        buf.mark_dirty();
        Ok(())
    }

    /// Allocate and initialise a new inode, owner inherited from `dir`.
    ///
    /// The caller links it into a directory and sets the link count.
    pub fn new_inode(&self, dir: &InodeHandle, mode: u16) -> Result<Arc<InodeHandle>> {
        let is_dir = (mode & S_IFMT) == S_IFDIR;
        let (ino, group) = self.alloc_inode_bit(is_dir)?;
        let now = crate::fs::now();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (uid, gid) = dir.with_state(|d| (d.uid, d.gid));

        let handle = Arc::new(InodeHandle {
            ino,
            state: RwSpinlock::new(InodeState {
                mode,
                uid,
                gid,
                size: 0,
                blocks: 0,
                atime: now,
                ctime: now,
                mtime: now,
                dtime: 0,
                links_count: 0,
                flags: 0,
                generation,
                file_acl: 0,
                size_comp: 0,
                block: [BlockPtr::ZERO; N_BLOCKS],
                block_group: group,
                state: I_STATE_NEW | I_STATE_DIRTY,
            }),
            truncate_mutex: Mutex::new(()),
            pages: PageCache::new(),
            open_count: AtomicU32::new(0),
            writeback_index: AtomicU32::new(0),
            wb_error: AtomicBool::new(false),
        });

        self.inodes.lock().unwrap().insert(ino, handle.clone());
        log::debug!("packfs: new inode {ino} in group {group}");
        Ok(handle)
    }

    /// Release an inode's bitmap bit and clear its table record.
    pub(crate) fn free_inode(&self, handle: &InodeHandle) -> Result<()> {
        let ino = handle.ino();
        let is_dir = handle.with_state(|s| s.is_dir());

        // Stamp the deletion time into the record before the bit goes away.
        let (block, off) = self.inode_location(ino)?;
        let buf = self.cache.read(block)?;
        {
            let mut raw = RawInode::new_zeroed();
            raw.dtime.set(crate::fs::now());
            buf.data()[off..off + size_of::<RawInode>()].copy_from_slice(raw.as_bytes());
        }
        buf.mark_dirty();

        self.free_inode_bit(ino, is_dir)?;
        if self.sync_mount {
            self.cache.sync_buf(&buf)?;
        }
        self.inodes.lock().unwrap().remove(&ino);
        Ok(())
    }

    /// Drop an open reference; the last release of an unlinked inode
    /// reclaims its blocks and its inode slot.
    pub fn release(&self, handle: &Arc<InodeHandle>) -> Result<()> {
        let prev = handle.open_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release without open");
        if prev == 1 {
            self.evict_inode(handle)?;
        }
        Ok(())
    }

    /// Evict an inode with no open references: flush and invalidate its
    /// pages, and if it is unlinked, truncate it to zero, take it off the
    /// orphan list and free it.
    pub(crate) fn evict_inode(&self, handle: &Arc<InodeHandle>) -> Result<()> {
        let ino = handle.ino();
        let (nlink, size) = handle.with_state(|s| (s.links_count, s.size));
        log::debug!("packfs: evicting inode {ino} nlink={nlink} size={size}");

        // A still-linked inode keeps its data; push dirty clusters out
        // before the page tree goes away.
        if nlink > 0 && handle.pages.has_dirty() {
            let mut wbc = crate::extent::WritebackControl::sync();
            self.write_extents(handle, &mut wbc)?;
            self.wq.flush();
        }
        handle.pages.wait_all_writeback();
        handle.pages.truncate(0);

        if nlink == 0 {
            if size > 0 {
                self.truncate_blocks(handle, 0)?;
            }
            self.orphan_del(handle)?;
            self.free_inode(handle)?;
        } else {
            if handle.with_state(|s| s.state & I_STATE_DIRTY != 0) {
                self.write_inode(handle)?;
            }
            self.inodes.lock().unwrap().remove(&ino);
        }
        Ok(())
    }

    // =========================================================================
    // Orphan list
    // =========================================================================

    /// Chain an inode onto the on-disk orphan list and record it in the
    /// in-memory list. Both the inode record and the superblock are written
    /// through so a crash between unlink and eviction leaves the inode
    /// discoverable.
    pub(crate) fn orphan_add(&self, handle: &InodeHandle) -> Result<()> {
        let ino = handle.ino();
        let mut orphans = self.orphans.lock().unwrap();
        if orphans.contains(&ino) {
            return Ok(());
        }

        let head = {
            let mut sb = self.sb.lock();
            let prev = sb.lsb.last_orphan.get();
            sb.lsb.last_orphan.set(ino);
            prev
        };
        handle.with_state_mut(|s| {
            s.dtime = head;
            s.mark_dirty();
        });
        orphans.insert(0, ino);
        drop(orphans);

        self.write_inode(handle)?;
        self.sync_super(true)?;
        log::debug!("packfs: inode {ino} chained on orphan list (next={head})");
        Ok(())
    }

    /// Unchain an inode from the orphan list, rewriting the predecessor's
    /// link (or the superblock head) before the inode itself is reused.
    pub(crate) fn orphan_del(&self, handle: &InodeHandle) -> Result<()> {
        let ino = handle.ino();
        let mut orphans = self.orphans.lock().unwrap();
        let Some(pos) = orphans.iter().position(|&o| o == ino) else {
            return Ok(());
        };
        let next = handle.with_state(|s| s.dtime);

        if pos == 0 {
            let mut sb = self.sb.lock();
            sb.lsb.last_orphan.set(next);
        } else {
            let pred_ino = orphans[pos - 1];
            drop(orphans);
            let pred = self.iget(pred_ino)?;
            pred.with_state_mut(|s| {
                s.dtime = next;
                s.mark_dirty();
            });
            self.write_inode(&pred)?;
            orphans = self.orphans.lock().unwrap();
        }
        orphans.retain(|&o| o != ino);
        drop(orphans);

        handle.with_state_mut(|s| {
            s.dtime = 0;
            s.mark_dirty();
        });
        self.write_inode(handle)?;
        self.sync_super(true)?;
        Ok(())
    }
}
