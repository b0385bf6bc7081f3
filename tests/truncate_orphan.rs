//! Truncation across compressed extents, directory operations, and orphan
//! recovery after a simulated crash.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use packfs::{EXTENT_SIZE, FT_DIR, FT_REG_FILE, IND_BLOCK, MemDevice, PackFs};

const BS: usize = 4096;
const CLUSTER_BLOCKS: u32 = (EXTENT_SIZE / BS) as u32;

/// Truncate across compressed extents: cut clusters are freed exactly once,
/// the surviving head cluster keeps its records, and the logical size is
/// exact.
#[test]
fn truncate_across_compressed_extents() {
    let (_, fs) = common::standard_fs();
    fs.sync_fs(true).unwrap();
    let baseline = fs.statfs();

    // 1 MiB of constant bytes: sixteen compressed clusters.
    let mut file = fs.create("/big", 0o644).unwrap();
    file.write(&vec![0xCCu8; 1 << 20]).unwrap();
    file.sync().unwrap();
    assert_eq!(file.stat().size, 1 << 20);

    let runs_before = fs.alloc_stats().extents_freed.load(Ordering::Relaxed);
    fs.truncate("/big", 40000).unwrap();
    assert_eq!(file.stat().size, 40000);

    // Fifteen whole clusters were cut; each physical run freed exactly once.
    assert_eq!(
        fs.alloc_stats().extents_freed.load(Ordering::Relaxed),
        runs_before + 15
    );

    // Cleared clusters are sparse again; the boundary cluster survives with
    // its records intact.
    for cluster in 1..16u32 {
        assert!(
            fs.bmap(file.inode(), cluster * CLUSTER_BLOCKS)
                .unwrap()
                .is_hole(),
            "cluster {cluster} still mapped after truncate"
        );
    }
    assert!(!fs.bmap(file.inode(), 0).unwrap().is_hole());

    // Data up to the new end is intact.
    let mut back = vec![0u8; 40000];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), 40000);
    assert!(back.iter().all(|&b| b == 0xCC));

    // Deleting the file returns the filesystem to its baseline.
    drop(file);
    fs.unlink("/big").unwrap();
    fs.sync_fs(true).unwrap();
    let after = fs.statfs();
    assert_eq!(after.bfree, baseline.bfree);
    assert_eq!(after.ffree, baseline.ffree);

    fs.unmount().unwrap();
}

/// Truncating to zero clears every root, including the indirect block
/// itself once it holds no live records.
#[test]
fn truncate_to_zero_clears_tree() {
    let (_, fs) = common::standard_fs();

    let mut file = fs.create("/t", 0o644).unwrap();
    file.write(&vec![0xABu8; 256 * 1024]).unwrap();
    file.sync().unwrap();
    assert!(!file.inode().with_state(|s| s.block[IND_BLOCK].is_hole()));

    fs.truncate("/t", 0).unwrap();
    assert_eq!(file.stat().size, 0);
    assert_eq!(file.stat().size_comp, 0);
    file.inode().with_state(|s| {
        for (i, bp) in s.block.iter().enumerate() {
            assert!(bp.is_hole(), "root {i} still set after truncate to zero");
        }
    });

    // Growth is lazy: truncating back up allocates nothing.
    fs.truncate("/t", 1 << 20).unwrap();
    assert_eq!(file.stat().size, 1 << 20);
    file.inode().with_state(|s| {
        assert!(s.block.iter().all(|bp| bp.is_hole()));
    });
    let mut back = vec![0xFFu8; 8192];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), 8192);
    assert!(back.iter().all(|&b| b == 0));

    drop(file);
    fs.unmount().unwrap();
}

// =============================================================================
// Directory operations
// =============================================================================

#[test]
fn directory_entries_round_trip() {
    let (_, fs) = common::standard_fs();

    fs.create("/one", 0o644).unwrap();
    fs.create("/two", 0o600).unwrap();
    fs.mkdir("/sub", 0o755).unwrap();
    fs.create("/sub/nested", 0o644).unwrap();

    let names: Vec<String> = fs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert!(names.contains(&"one".to_string()));
    assert!(names.contains(&"two".to_string()));
    assert!(names.contains(&"sub".to_string()));

    let sub = fs.readdir("/sub").unwrap();
    let nested = sub.iter().find(|e| e.name == "nested").unwrap();
    assert_eq!(nested.file_type, FT_REG_FILE);
    let dot = sub.iter().find(|e| e.name == ".").unwrap();
    assert_eq!(dot.file_type, FT_DIR);

    assert!(matches!(
        fs.create("/one", 0o644).unwrap_err(),
        packfs::FsError::AlreadyExists
    ));
    assert!(matches!(
        fs.readdir("/one").unwrap_err(),
        packfs::FsError::NotFound
    ));

    fs.unlink("/two").unwrap();
    let names: Vec<String> = fs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(!names.contains(&"two".to_string()));

    fs.unmount().unwrap();
}

#[test]
fn hard_links_share_the_inode() {
    let (_, fs) = common::standard_fs();

    let mut file = fs.create("/orig", 0o644).unwrap();
    file.write(b"shared contents").unwrap();
    file.sync().unwrap();
    drop(file);

    fs.link("/orig", "/alias").unwrap();
    assert_eq!(fs.stat("/alias").unwrap().ino, fs.stat("/orig").unwrap().ino);
    assert_eq!(fs.stat("/orig").unwrap().nlinks, 2);

    let mut alias = fs.open("/alias").unwrap();
    let mut back = [0u8; 15];
    alias.read(&mut back).unwrap();
    assert_eq!(&back, b"shared contents");
    drop(alias);

    // Dropping one name keeps the file alive through the other.
    fs.unlink("/orig").unwrap();
    assert_eq!(fs.stat("/alias").unwrap().nlinks, 1);
    let mut alias = fs.open("/alias").unwrap();
    let mut back = [0u8; 15];
    alias.read(&mut back).unwrap();
    assert_eq!(&back, b"shared contents");
    drop(alias);

    fs.unmount().unwrap();
}

// =============================================================================
// Orphan recovery
// =============================================================================

/// Unlinking an open file parks it on the orphan list; the final release
/// reclaims it without a remount.
#[test]
fn unlinked_open_file_is_reclaimed_on_release() {
    let (_, fs) = common::standard_fs();
    fs.sync_fs(true).unwrap();
    let baseline = fs.statfs();

    let mut file = fs.create("/tmp", 0o600).unwrap();
    file.write(&vec![0x42u8; 4096]).unwrap();
    file.sync().unwrap();

    fs.unlink("/tmp").unwrap();
    // Still readable through the open handle.
    let mut back = [0u8; 4096];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), 4096);

    drop(file);
    fs.sync_fs(true).unwrap();
    let after = fs.statfs();
    assert_eq!(after.bfree, baseline.bfree);
    assert_eq!(after.ffree, baseline.ffree);

    fs.unmount().unwrap();
}

/// Orphan replay: crash between unlink and eviction, remount, and the
/// orphaned inode plus its blocks are recovered. No leaks.
#[test]
fn orphan_replay_after_crash() {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(MemDevice::new(64 << 20));
    packfs::format(
        device.as_ref(),
        &packfs::FormatOptions {
            inodes_per_group: 2048,
            ..Default::default()
        },
    )
    .unwrap();

    // Baseline: what an empty filesystem reports.
    let fs = PackFs::mount(device.clone(), "").unwrap();
    let baseline = fs.statfs();
    fs.unmount().unwrap();

    let fs = PackFs::mount(device.clone(), "").unwrap();
    let mut file = fs.create("/c", 0o644).unwrap();
    file.write(&vec![0x13u8; 4096]).unwrap();
    file.sync().unwrap();

    // Unlink while open: the inode goes onto the on-disk orphan chain.
    fs.unlink("/c").unwrap();
    fs.sync_fs(true).unwrap();

    // Crash: nothing written from here on reaches the medium.
    device.freeze();
    drop(file);
    drop(fs);

    // Remount what actually hit the disk. Recovery must free the inode and
    // its blocks.
    let device = Arc::new(MemDevice::from_image(device.snapshot()));
    let fs = PackFs::mount(device, "").unwrap();
    assert!(matches!(
        fs.stat("/c").unwrap_err(),
        packfs::FsError::NotFound
    ));
    let recovered = fs.statfs();
    assert_eq!(recovered.bfree, baseline.bfree);
    assert_eq!(recovered.ffree, baseline.ffree);
    fs.unmount().unwrap();
}

/// An orphan whose link count survived the crash (open at crash, still
/// linked) is truncated to its recorded size, not deleted.
#[test]
fn orphan_with_links_is_kept() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (device, fs) = common::standard_fs();

    let mut file = fs.create("/keep", 0o644).unwrap();
    file.write(&vec![0x31u8; 8192]).unwrap();
    file.sync().unwrap();
    fs.sync_fs(true).unwrap();
    drop(file);
    fs.unmount().unwrap();

    // Hand-chain the inode onto the orphan list the way a crash mid
    // operation would leave it: superblock head points at a linked inode.
    let fs = PackFs::mount(device.clone(), "").unwrap();
    let ino = fs.stat("/keep").unwrap().ino;
    fs.unmount().unwrap();

    let mut image = device.snapshot();
    // last_orphan at offset 232 of the superblock image.
    image[1024 + 232..1024 + 236].copy_from_slice(&ino.to_le_bytes());
    // Restamp the image checksum.
    let crc = {
        let mut copy = image[1024..2048].to_vec();
        copy[1020..1024].fill(0);
        crc_of(&copy)
    };
    image[1024 + 1020..1024 + 1024].copy_from_slice(&crc.to_le_bytes());

    let device = Arc::new(MemDevice::from_image(image));
    let fs = PackFs::mount(device, "").unwrap();
    let stat = fs.stat("/keep").unwrap();
    assert_eq!(stat.size, 8192);
    assert_eq!(stat.nlinks, 1);

    let mut file = fs.open("/keep").unwrap();
    let mut back = vec![0u8; 8192];
    assert_eq!(file.read(&mut back).unwrap(), 8192);
    assert!(back.iter().all(|&b| b == 0x31));
    drop(file);
    fs.unmount().unwrap();
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
