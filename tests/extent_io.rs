//! The extent engine end to end: compression decisions, cluster-uniform
//! records, checksums, read-modify-write, and durability across remounts.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use packfs::{BlockDevice, EXTENT_SIZE, MemDevice, PackFs};

const BS: usize = 4096;
const CLUSTER_BLOCKS: u32 = (EXTENT_SIZE / BS) as u32;

/// Zero-file round trip: a small write inside the first cluster comes back
/// intact, and the all-zero cluster lands on disk as one tiny compressed run.
#[test]
fn zero_file_round_trip() {
    let (_, fs) = common::standard_fs();
    let baseline = fs.statfs().bfree;

    let mut file = fs.create("/a", 0o644).unwrap();
    file.write(&vec![0u8; 12288]).unwrap();
    assert_eq!(file.stat().size, 12288);

    let mut back = vec![0xFFu8; 12288];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), 12288);
    assert!(back.iter().all(|&b| b == 0));

    file.sync().unwrap();

    // All cluster records are identical and compressed; zeros deflate into
    // a single block.
    let bp = fs.bmap(file.inode(), 0).unwrap();
    assert!(bp.is_compressed());
    assert!(bp.length.get() > 0);
    assert!((bp.length.get() as usize) < BS);
    for block in 1..CLUSTER_BLOCKS {
        assert_eq!(fs.bmap(file.inode(), block).unwrap(), bp);
    }

    // One data block for the run plus one indirect block.
    fs.sync_fs(true).unwrap();
    assert_eq!(fs.statfs().bfree, baseline - 2);

    drop(file);
    fs.unmount().unwrap();
}

/// Compressible payload: well-compressed accounting, uniform records with
/// the compressed flag, fingerprint intact, byte-exact read-back — including
/// after a remount.
#[test]
fn compressible_payload() {
    let (device, fs) = common::standard_fs();

    let payload = vec![0xAAu8; EXTENT_SIZE];
    let mut file = fs.create("/b", 0o644).unwrap();
    file.write(&payload).unwrap();
    file.sync().unwrap();

    let stats = fs.compression_stats();
    assert!(stats.pages_wellcompressed.load(Ordering::Relaxed) >= 16);

    let head = fs.bmap(file.inode(), 0).unwrap();
    assert!(head.is_compressed());
    assert!((head.length.get() as usize) < EXTENT_SIZE);
    for block in 0..CLUSTER_BLOCKS {
        assert_eq!(fs.bmap(file.inode(), block).unwrap(), head);
    }

    // The stored fingerprint covers exactly `length` bytes of the extent.
    let mut raw = vec![0u8; head.length.get() as usize];
    device
        .read_at(head.blockno.get() as u64 * BS as u64, &mut raw)
        .unwrap();
    assert_eq!(crc_of(&raw), head.checksum.get());

    let mut back = vec![0u8; EXTENT_SIZE];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), EXTENT_SIZE);
    assert_eq!(back, payload);

    drop(file);
    fs.unmount().unwrap();

    // Remount and read through the cold path.
    let fs = PackFs::mount(device, "").unwrap();
    let mut file = fs.open("/b").unwrap();
    let mut back = vec![0u8; EXTENT_SIZE];
    assert_eq!(file.read(&mut back).unwrap(), EXTENT_SIZE);
    assert_eq!(back, payload);
    assert_eq!(file.stat().size, EXTENT_SIZE as u64);
    assert!(file.stat().size_comp < EXTENT_SIZE as u64);
    drop(file);
    fs.unmount().unwrap();
}

/// Incompressible payload: stored raw, one record per block with a plaintext
/// fingerprint each, and byte-exact read-back.
#[test]
fn incompressible_payload() {
    let (device, fs) = common::standard_fs();

    let payload = common::random_bytes(EXTENT_SIZE, 0x5EED);
    let mut file = fs.create("/r", 0o644).unwrap();
    file.write(&payload).unwrap();
    file.sync().unwrap();

    let stats = fs.compression_stats();
    assert!(stats.pages_notcompressible.load(Ordering::Relaxed) >= 16);

    let head = fs.bmap(file.inode(), 0).unwrap();
    assert!(!head.is_compressed());
    assert_eq!(head.length.get(), 0);
    for block in 0..CLUSTER_BLOCKS {
        let bp = fs.bmap(file.inode(), block).unwrap();
        assert!(!bp.is_compressed());
        assert_eq!(bp.length.get(), 0);
        assert_eq!(bp.blockno.get(), head.blockno.get() + block);

        let mut raw = vec![0u8; BS];
        device
            .read_at(bp.blockno.get() as u64 * BS as u64, &mut raw)
            .unwrap();
        assert_eq!(raw, payload[block as usize * BS..(block as usize + 1) * BS]);
        assert_eq!(crc_of(&raw), bp.checksum.get());
    }

    drop(file);
    fs.unmount().unwrap();

    let fs = PackFs::mount(device, "").unwrap();
    let mut file = fs.open("/r").unwrap();
    let mut back = vec![0u8; EXTENT_SIZE];
    assert_eq!(file.read(&mut back).unwrap(), EXTENT_SIZE);
    assert_eq!(back, payload);
    drop(file);
    fs.unmount().unwrap();
}

/// Read-modify-write in the middle of a compressed cluster: the whole
/// cluster is re-read, recompressed and COWed to a new run, and the old run
/// is freed.
#[test]
fn rmw_recompresses_whole_cluster() {
    let (_, fs) = common::standard_fs();

    let mut file = fs.create("/b", 0o644).unwrap();
    file.write(&vec![0xAAu8; EXTENT_SIZE]).unwrap();
    file.sync().unwrap();

    let old = fs.bmap(file.inode(), 0).unwrap();
    assert!(old.is_compressed());
    let runs_before = fs.alloc_stats().extents_freed.load(Ordering::Relaxed);

    file.seek(std::io::SeekFrom::Start(32768)).unwrap();
    file.write(&[0x55u8; 100]).unwrap();
    file.sync().unwrap();

    let new = fs.bmap(file.inode(), 0).unwrap();
    assert!(new.is_compressed());
    assert_ne!(new.blockno.get(), old.blockno.get(), "COW must move the run");
    assert_eq!(
        fs.alloc_stats().extents_freed.load(Ordering::Relaxed),
        runs_before + 1,
        "old run freed exactly once"
    );

    let mut back = vec![0u8; EXTENT_SIZE];
    file.seek(std::io::SeekFrom::Start(0)).unwrap();
    file.read(&mut back).unwrap();
    assert!(back[..32768].iter().all(|&b| b == 0xAA));
    assert!(back[32768..32868].iter().all(|&b| b == 0x55));
    assert!(back[32868..].iter().all(|&b| b == 0xAA));

    drop(file);
    fs.unmount().unwrap();
}

/// Unwritten ranges are holes: they read as zeros and allocate nothing
/// until written.
#[test]
fn sparse_holes_read_zero() {
    let (_, fs) = common::standard_fs();

    let mut file = fs.create("/sparse", 0o644).unwrap();
    // Write one cluster far into the file.
    file.seek(std::io::SeekFrom::Start(4 * EXTENT_SIZE as u64))
        .unwrap();
    file.write(&vec![0x77u8; EXTENT_SIZE]).unwrap();
    file.sync().unwrap();

    // The skipped clusters stay holes.
    for cluster in 0..4u32 {
        let bp = fs.bmap(file.inode(), cluster * CLUSTER_BLOCKS).unwrap();
        assert!(bp.is_hole(), "cluster {cluster} should be sparse");
    }

    let mut back = vec![0xFFu8; 8192];
    file.seek(std::io::SeekFrom::Start(EXTENT_SIZE as u64)).unwrap();
    assert_eq!(file.read(&mut back).unwrap(), 8192);
    assert!(back.iter().all(|&b| b == 0));

    drop(file);
    fs.unmount().unwrap();
}

/// A corrupted compressed extent fails its fingerprint check and the read
/// surfaces an I/O error instead of bad data.
#[test]
fn corrupt_extent_fails_checksum() {
    let (device, fs) = common::standard_fs();

    let mut file = fs.create("/b", 0o644).unwrap();
    file.write(&vec![0xAAu8; EXTENT_SIZE]).unwrap();
    file.sync().unwrap();
    let bp = fs.bmap(file.inode(), 0).unwrap();
    assert!(bp.is_compressed());
    drop(file);
    fs.unmount().unwrap();

    // Flip one byte inside the compressed run.
    let mut image = device.snapshot();
    let off = bp.blockno.get() as usize * BS + 10;
    image[off] ^= 0xFF;
    let device = Arc::new(MemDevice::from_image(image));

    let fs = PackFs::mount(device, "").unwrap();
    let mut file = fs.open("/b").unwrap();
    let mut back = vec![0u8; 4096];
    let err = file.read(&mut back).unwrap_err();
    assert!(matches!(err, packfs::FsError::Io(_)));
    drop(file);
}

/// Free-space accounting round trip: everything a file consumed comes back
/// when it is deleted.
#[test]
fn delete_returns_all_blocks() {
    let (_, fs) = common::standard_fs();
    fs.sync_fs(true).unwrap();
    let baseline = fs.statfs();

    let mut file = fs.create("/big", 0o644).unwrap();
    file.write(&vec![0xCCu8; 512 * 1024]).unwrap();
    file.sync().unwrap();
    fs.sync_fs(true).unwrap();
    assert!(fs.statfs().bfree < baseline.bfree);
    drop(file);

    fs.unlink("/big").unwrap();
    fs.sync_fs(true).unwrap();
    let after = fs.statfs();
    assert_eq!(after.bfree, baseline.bfree);
    assert_eq!(after.ffree, baseline.ffree);

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
