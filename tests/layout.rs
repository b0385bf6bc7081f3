//! On-disk layout: record sizes, little-endian round trips, checksums, and
//! the formatted image.

mod common;

use packfs::{
    BLKPTR_SIZE, BP_COMPRESSED, BlockDevice, BlockPtr, DirEntryHeader, FormatOptions, MemDevice,
    PackFs, RawGroupDesc, RawInode, RawSuperblock, SUPER_MAGIC, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE, STATE_VALID_FS, format,
};
use std::sync::Arc;
use zerocopy::{FromBytes, FromZeros, IntoBytes};

// =============================================================================
// Record sizes
// =============================================================================

#[test]
fn superblock_record_is_1024_bytes() {
    assert_eq!(size_of::<RawSuperblock>(), SUPERBLOCK_SIZE);
}

#[test]
fn group_descriptor_record_is_32_bytes() {
    assert_eq!(size_of::<RawGroupDesc>(), 32);
}

#[test]
fn blkptr_record_is_16_bytes() {
    assert_eq!(size_of::<BlockPtr>(), BLKPTR_SIZE);
}

#[test]
fn dir_entry_header_is_8_bytes() {
    assert_eq!(size_of::<DirEntryHeader>(), 8);
}

// =============================================================================
// Little-endian round trips
// =============================================================================

#[test]
fn superblock_round_trip_preserves_geometry() {
    let mut sb = RawSuperblock::new_zeroed();
    sb.magic.set(SUPER_MAGIC);
    sb.blocks_count.set(16384);
    sb.inodes_count.set(2048);
    sb.blocks_per_group.set(32768);
    sb.inodes_per_group.set(2048);
    sb.log_block_size.set(2);
    sb.inode_size.set(256);
    sb.rev_level.set(1);
    sb.last_orphan.set(42);

    let restored = RawSuperblock::read_from_bytes(sb.as_bytes()).unwrap();
    assert_eq!(restored.magic.get(), 0xEF53);
    assert_eq!(restored.blocks_count.get(), 16384);
    assert_eq!(restored.inodes_count.get(), 2048);
    assert_eq!(restored.block_size(), Some(4096));
    assert_eq!(restored.inode_size.get(), 256);
    assert_eq!(restored.last_orphan.get(), 42);
}

#[test]
fn superblock_magic_bytes_are_little_endian() {
    let mut sb = RawSuperblock::new_zeroed();
    sb.magic.set(SUPER_MAGIC);
    let bytes = sb.as_bytes();
    // magic at offset 56
    assert_eq!(bytes[56], 0x53);
    assert_eq!(bytes[57], 0xEF);
}

#[test]
fn group_descriptor_round_trip() {
    let mut desc = RawGroupDesc::new_zeroed();
    desc.block_bitmap.set(3);
    desc.inode_bitmap.set(4);
    desc.inode_table.set(5);
    desc.free_blocks_count.set(1000);
    desc.free_inodes_count.set(500);
    desc.used_dirs_count.set(10);

    let restored = RawGroupDesc::read_from_bytes(desc.as_bytes()).unwrap();
    assert_eq!(restored.block_bitmap.get(), 3);
    assert_eq!(restored.inode_bitmap.get(), 4);
    assert_eq!(restored.inode_table.get(), 5);
    assert_eq!(restored.free_blocks_count.get(), 1000);
    assert_eq!(restored.free_inodes_count.get(), 500);
    assert_eq!(restored.used_dirs_count.get(), 10);
}

#[test]
fn blkptr_wire_layout() {
    let bp = BlockPtr::new(0x01020304, 0x0A0B, BP_COMPRESSED, 0xCAFEBABE, 7);
    let bytes = bp.as_bytes();
    assert_eq!(&bytes[0..4], &0x01020304u32.to_le_bytes());
    assert_eq!(&bytes[4..6], &0x0A0Bu16.to_le_bytes());
    assert_eq!(&bytes[6..10], &0xCAFEBABEu32.to_le_bytes());
    assert_eq!(&bytes[10..14], &7u32.to_le_bytes());
    assert_eq!(&bytes[14..16], &BP_COMPRESSED.to_le_bytes());

    let restored = BlockPtr::read_from_bytes(bytes).unwrap();
    assert!(restored.is_compressed());
    assert!(!restored.is_hole());
    assert_eq!(restored.length.get(), 0x0A0B);
}

#[test]
fn inode_round_trip_preserves_block_pointers() {
    let mut inode = RawInode::new_zeroed();
    inode.mode.set(0o100644);
    inode.size.set(0x12345678);
    inode.links_count.set(1);
    for (i, bp) in inode.block.iter_mut().enumerate() {
        *bp = BlockPtr::new(100 + i as u32, 0, 0, i as u32, 1);
    }

    let restored = RawInode::read_from_bytes(inode.as_bytes()).unwrap();
    assert_eq!(restored.size.get(), 0x12345678);
    assert_eq!(restored.links_count.get(), 1);
    for (i, bp) in restored.block.iter().enumerate() {
        assert_eq!(bp.blockno.get(), 100 + i as u32, "block[{i}] mismatch");
    }
}

// =============================================================================
// Formatted image
// =============================================================================

fn read_superblock(device: &MemDevice) -> RawSuperblock {
    let mut image = [0u8; SUPERBLOCK_SIZE];
    device.read_at(SUPERBLOCK_OFFSET, &mut image).unwrap();
    RawSuperblock::read_from_bytes(&image).unwrap()
}

#[test]
fn format_writes_valid_checksummed_superblock() {
    let device = MemDevice::new(16 << 20);
    format(&device, &FormatOptions::default()).unwrap();

    let sb = read_superblock(&device);
    assert_eq!(sb.magic.get(), SUPER_MAGIC);
    assert_eq!(sb.state.get(), STATE_VALID_FS);
    assert_eq!(sb.block_size(), Some(4096));
    assert!(sb.inode_size.get().is_power_of_two());

    let stored = sb.checksum.get();
    assert_ne!(stored, 0);
    let mut copy = sb;
    copy.checksum.set(0);
    let computed = crc_of(copy.as_bytes());
    assert_eq!(stored, computed);
}

/// CRC-32/ISO-HDLC, computed independently of the crate's helper.
fn crc_of(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB88320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}

#[test]
fn formatted_image_mounts_and_reports_sane_statfs() {
    let (_, fs) = common::fresh_fs(16 << 20, 1024);
    let stat = fs.statfs();
    assert_eq!(stat.magic, SUPER_MAGIC);
    assert_eq!(stat.blocks, (16 << 20) / 4096);
    assert!(stat.bfree > 0 && stat.bfree < stat.blocks);
    assert!(stat.ffree > 0);
    fs.unmount().unwrap();
}

#[test]
fn mount_rejects_bad_magic() {
    let device = Arc::new(MemDevice::new(16 << 20));
    format(device.as_ref(), &FormatOptions::default()).unwrap();

    // Clobber the magic.
    device.write_at(SUPERBLOCK_OFFSET + 56, &[0, 0]).unwrap();
    assert!(PackFs::mount(device, "").is_err());
}

#[test]
fn mount_rejects_corrupt_superblock_checksum() {
    let device = Arc::new(MemDevice::new(16 << 20));
    format(device.as_ref(), &FormatOptions::default()).unwrap();

    // Flip a byte inside the checksummed image (volume name area).
    device.write_at(SUPERBLOCK_OFFSET + 120, &[0xFF]).unwrap();
    assert!(PackFs::mount(device, "").is_err());
}

#[test]
fn mount_rejects_unknown_options() {
    let device = Arc::new(MemDevice::new(16 << 20));
    format(device.as_ref(), &FormatOptions::default()).unwrap();
    let err = PackFs::mount(device, "extents,journal=fast").unwrap_err();
    assert!(matches!(err, packfs::FsError::InvalidArgument(_)));
}

#[test]
fn mount_accepts_extents_option() {
    let device = Arc::new(MemDevice::new(16 << 20));
    format(device.as_ref(), &FormatOptions::default()).unwrap();
    let fs = PackFs::mount(device, "extents").unwrap();
    assert!(fs.extents_enabled());
    fs.unmount().unwrap();
}

#[test]
fn file_backed_device_round_trip() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("packfs.img");
    std::fs::File::create(&path)
        .unwrap()
        .set_len(16 << 20)
        .unwrap();

    let device = Arc::new(packfs::FileDevice::open(&path).unwrap());
    format(device.as_ref(), &FormatOptions::default()).unwrap();

    let fs = PackFs::mount(device, "").unwrap();
    let mut file = fs.create("/on-disk", 0o644).unwrap();
    file.write(b"persisted through a real file").unwrap();
    file.sync().unwrap();
    drop(file);
    fs.unmount().unwrap();

    // Reopen the image from scratch.
    let device = Arc::new(packfs::FileDevice::open(&path).unwrap());
    let fs = PackFs::mount(device, "").unwrap();
    let mut file = fs.open("/on-disk").unwrap();
    let mut back = [0u8; 29];
    assert_eq!(file.read(&mut back).unwrap(), 29);
    assert_eq!(&back, b"persisted through a real file");
    drop(file);
    fs.unmount().unwrap();
}

#[test]
fn clean_unmount_restores_valid_state() {
    let device = Arc::new(MemDevice::new(16 << 20));
    format(device.as_ref(), &FormatOptions::default()).unwrap();

    let fs = PackFs::mount(device.clone(), "").unwrap();
    // While mounted the on-disk state is 0 (unclean).
    let sb = read_superblock(&device);
    assert_eq!(sb.state.get(), 0);
    assert_eq!(sb.mnt_count.get(), 1);

    fs.unmount().unwrap();
    let sb = read_superblock(&device);
    assert_eq!(sb.state.get(), STATE_VALID_FS);

    // Image still CRC-valid, and it mounts again.
    let mut copy = sb;
    let stored = copy.checksum.get();
    copy.checksum.set(0);
    assert_eq!(stored, crc_of(copy.as_bytes()));

    let fs = PackFs::mount(device.clone(), "").unwrap();
    let sb = read_superblock(&device);
    assert_eq!(sb.mnt_count.get(), 2);
    fs.unmount().unwrap();
}
