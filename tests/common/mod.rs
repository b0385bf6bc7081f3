//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use packfs::{FormatOptions, MemDevice, PackFs, format};

/// Format a fresh in-memory device and mount it.
pub fn fresh_fs(size: usize, inodes_per_group: u32) -> (Arc<MemDevice>, Arc<PackFs>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let device = Arc::new(MemDevice::new(size));
    format(
        device.as_ref(),
        &FormatOptions {
            inodes_per_group,
            ..FormatOptions::default()
        },
    )
    .expect("format");
    let fs = PackFs::mount(device.clone(), "").expect("mount");
    (device, fs)
}

/// The standard 64 MiB test filesystem: 4 KiB blocks, 2048 inodes per group.
pub fn standard_fs() -> (Arc<MemDevice>, Arc<PackFs>) {
    fresh_fs(64 << 20, 2048)
}

/// Deterministic pseudo-random buffer for incompressible payloads with a
/// known seed.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    use rand::{RngCore, SeedableRng, rngs::SmallRng};
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}
