//! Filesystem creation.
//!
//! `format` writes a complete empty filesystem: superblock (checksummed),
//! group descriptor table, per-group bitmaps (checksummed, metadata blocks
//! pre-marked), zeroed inode tables and a root directory holding `.` and
//! `..`. Each group's bitmaps and inode table live inside that group's
//! block range, which is what the mount-time descriptor checks demand.

use uuid::Uuid;
use zerocopy::{FromZeros, IntoBytes};

use crate::checksum::{crc16, crc32};
use crate::device::BlockDevice;
use crate::error::{FsError, Result};
use crate::structs::{
    BASE_BLOCK_SIZE, BlockPtr, DirEntryHeader, FIRST_INO, FT_DIR, PAGE_SIZE, RawGroupDesc,
    RawInode, RawSuperblock, ROOT_INO, S_IFDIR, STATE_VALID_FS, SUPER_MAGIC, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE, dir_rec_len,
};

/// On-disk inode record size written by this formatter.
const INODE_RECORD_SIZE: usize = 256;

/// Geometry and identity knobs for `format`.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Block size in bytes; power of two, 1024..=4096.
    pub block_size: usize,
    /// Inodes per block group; rounded up to a whole inode-table block.
    pub inodes_per_group: u32,
    /// Blocks per block group; defaults to one bitmap block's worth.
    pub blocks_per_group: Option<u32>,
    /// Volume UUID; random when unset.
    pub uuid: Option<[u8; 16]>,
    /// Volume label.
    pub label: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        FormatOptions {
            block_size: 4096,
            inodes_per_group: 1024,
            blocks_per_group: None,
            uuid: None,
            label: None,
        }
    }
}

struct GroupLayout {
    first_block: u32,
    blocks: u32,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
    meta_blocks: u32,
}

/// Write an empty filesystem onto the device.
pub fn format(device: &dyn BlockDevice, opts: &FormatOptions) -> Result<()> {
    let bs = opts.block_size;
    if !bs.is_power_of_two() || bs < BASE_BLOCK_SIZE as usize || bs > PAGE_SIZE {
        return Err(FsError::InvalidArgument(format!("bad block size {bs}")));
    }

    let total_blocks = (device.size() / bs as u64) as u32;
    let first_data_block: u32 = if bs == BASE_BLOCK_SIZE as usize { 1 } else { 0 };
    let bits_per_block = (bs * 8) as u32;

    let blocks_per_group = opts
        .blocks_per_group
        .unwrap_or(bits_per_block)
        .min(bits_per_block);
    if blocks_per_group == 0 {
        return Err(FsError::InvalidArgument("zero blocks per group".into()));
    }

    let inodes_per_block = (bs / INODE_RECORD_SIZE) as u32;
    let inodes_per_group = opts
        .inodes_per_group
        .next_multiple_of(inodes_per_block)
        .min(bits_per_block);
    let itb_per_group = inodes_per_group / inodes_per_block;

    let data_blocks = total_blocks
        .checked_sub(first_data_block)
        .filter(|&n| n > 0)
        .ok_or_else(|| FsError::InvalidArgument("device too small".into()))?;
    let groups_count = data_blocks.div_ceil(blocks_per_group);
    let inodes_count = inodes_per_group * groups_count;

    let desc_per_block = (bs / size_of::<RawGroupDesc>()) as u32;
    let gdb_count = groups_count.div_ceil(desc_per_block);
    let sb_block = (SUPERBLOCK_OFFSET / bs as u64) as u32;

    // Lay the groups out: bitmaps and inode table at the head of each
    // group, after the superblock and descriptor table in group 0.
    let mut groups = Vec::with_capacity(groups_count as usize);
    for g in 0..groups_count {
        let first_block = first_data_block + g * blocks_per_group;
        let blocks = (data_blocks - g * blocks_per_group).min(blocks_per_group);
        let meta_start = if g == 0 {
            sb_block + 1 + gdb_count
        } else {
            first_block
        };
        let block_bitmap = meta_start;
        let inode_bitmap = meta_start + 1;
        let inode_table = meta_start + 2;
        let meta_end = inode_table + itb_per_group;
        if meta_end > first_block + blocks {
            return Err(FsError::InvalidArgument(
                "group too small for its metadata".into(),
            ));
        }
        groups.push(GroupLayout {
            first_block,
            blocks,
            block_bitmap,
            inode_bitmap,
            inode_table,
            meta_blocks: meta_end - first_block,
        });
    }

    // Root directory data goes into the first data block of group 0.
    let root_block = groups[0].first_block + groups[0].meta_blocks;
    if root_block >= groups[0].first_block + groups[0].blocks {
        return Err(FsError::InvalidArgument("no room for root directory".into()));
    }

    let mut free_blocks_total = 0u32;
    let mut free_inodes_total = 0u32;
    let mut descriptors: Vec<RawGroupDesc> = Vec::with_capacity(groups_count as usize);

    for (g, layout) in groups.iter().enumerate() {
        // Block bitmap: metadata (and the root block in group 0) used, the
        // tail past the group's real size pinned to 1.
        let mut bitmap = vec![0u8; bs];
        let mut used = layout.meta_blocks;
        if g == 0 {
            used += 1; // root directory block
        }
        for bit in 0..used as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        for bit in layout.blocks as usize..bits_per_block as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        device.write_at(layout.block_bitmap as u64 * bs as u64, &bitmap)?;
        let free_blocks = layout.blocks - used;
        let block_bitmap_csum = crc16(&bitmap);

        // Inode bitmap: the reserved inodes live in group 0.
        let mut bitmap = vec![0u8; bs];
        let used_inodes = if g == 0 { FIRST_INO - 1 } else { 0 };
        for bit in 0..used_inodes as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        for bit in inodes_per_group as usize..bits_per_block as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        device.write_at(layout.inode_bitmap as u64 * bs as u64, &bitmap)?;
        let free_inodes = inodes_per_group - used_inodes;
        let inode_bitmap_csum = crc16(&bitmap);

        // Zero the inode table.
        let zero_block = vec![0u8; bs];
        for b in 0..itb_per_group {
            device.write_at((layout.inode_table + b) as u64 * bs as u64, &zero_block)?;
        }

        let mut desc = RawGroupDesc::new_zeroed();
        desc.block_bitmap.set(layout.block_bitmap);
        desc.inode_bitmap.set(layout.inode_bitmap);
        desc.inode_table.set(layout.inode_table);
        desc.free_blocks_count.set(free_blocks as u16);
        desc.free_inodes_count.set(free_inodes as u16);
        desc.used_dirs_count.set(if g == 0 { 1 } else { 0 });
        desc.block_bitmap_csum.set(block_bitmap_csum);
        desc.inode_bitmap_csum.set(inode_bitmap_csum);
        let crc = crc16(desc.as_bytes());
        desc.checksum.set(crc);
        descriptors.push(desc);

        free_blocks_total += free_blocks;
        free_inodes_total += free_inodes;
    }

    // Descriptor table.
    let mut table = vec![0u8; (gdb_count as usize) * bs];
    for (i, desc) in descriptors.iter().enumerate() {
        let off = i * size_of::<RawGroupDesc>();
        table[off..off + size_of::<RawGroupDesc>()].copy_from_slice(desc.as_bytes());
    }
    device.write_at((sb_block + 1) as u64 * bs as u64, &table)?;

    // Root directory block: `.` and `..` both point at the root inode.
    let mut root_data = vec![0u8; bs];
    write_dirent(&mut root_data, 0, ROOT_INO, dir_rec_len(1) as u16, b".", FT_DIR);
    write_dirent(
        &mut root_data,
        dir_rec_len(1),
        ROOT_INO,
        (bs - dir_rec_len(1)) as u16,
        b"..",
        FT_DIR,
    );
    device.write_at(root_block as u64 * bs as u64, &root_data)?;

    // Root inode.
    let now = crate::fs::now();
    let mut root = RawInode::new_zeroed();
    root.mode.set(S_IFDIR | 0o755);
    root.size.set(bs as u32);
    root.atime.set(now);
    root.ctime.set(now);
    root.mtime.set(now);
    root.links_count.set(2);
    root.blocks.set(1);
    root.block[0] = BlockPtr::new(root_block, 0, 0, crc32(&root_data), 0);
    let root_off =
        groups[0].inode_table as u64 * bs as u64 + (ROOT_INO - 1) as u64 * INODE_RECORD_SIZE as u64;
    device.write_at(root_off, root.as_bytes())?;

    // Superblock.
    let mut sb = RawSuperblock::new_zeroed();
    sb.inodes_count.set(inodes_count);
    sb.blocks_count.set(total_blocks);
    sb.free_blocks_count.set(free_blocks_total);
    sb.free_inodes_count.set(free_inodes_total);
    sb.first_data_block.set(first_data_block);
    sb.log_block_size.set((bs as u32 / BASE_BLOCK_SIZE).ilog2());
    sb.log_frag_size.set((bs as u32 / BASE_BLOCK_SIZE).ilog2());
    sb.blocks_per_group.set(blocks_per_group);
    sb.frags_per_group.set(blocks_per_group);
    sb.inodes_per_group.set(inodes_per_group);
    sb.wtime.set(now);
    sb.max_mnt_count.set(1024);
    sb.magic.set(SUPER_MAGIC);
    sb.state.set(STATE_VALID_FS);
    sb.errors.set(1);
    sb.lastcheck.set(now);
    sb.rev_level.set(1);
    sb.first_ino.set(FIRST_INO);
    sb.inode_size.set(INODE_RECORD_SIZE as u16);
    sb.uuid = opts.uuid.unwrap_or_else(|| *Uuid::new_v4().as_bytes());
    if let Some(label) = &opts.label {
        let bytes = label.as_bytes();
        let len = bytes.len().min(sb.volume_name.len());
        sb.volume_name[..len].copy_from_slice(&bytes[..len]);
    }
    let crc = crc32(sb.as_bytes());
    sb.checksum.set(crc);

    let image: &[u8] = sb.as_bytes();
    debug_assert_eq!(image.len(), SUPERBLOCK_SIZE);
    device.write_at(SUPERBLOCK_OFFSET, image)?;
    device.flush()?;

    log::info!(
        "packfs: formatted {total_blocks} blocks, {groups_count} groups, {free_blocks_total} free"
    );
    Ok(())
}

fn write_dirent(data: &mut [u8], pos: usize, ino: u32, rec_len: u16, name: &[u8], ftype: u8) {
    let mut header = DirEntryHeader::new_zeroed();
    header.inode.set(ino);
    header.rec_len.set(rec_len);
    header.name_len = name.len() as u8;
    header.file_type = ftype;
    data[pos..pos + size_of::<DirEntryHeader>()].copy_from_slice(header.as_bytes());
    data[pos + size_of::<DirEntryHeader>()..pos + size_of::<DirEntryHeader>() + name.len()]
        .copy_from_slice(name);
}
