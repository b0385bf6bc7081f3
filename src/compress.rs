//! Cluster compression.
//!
//! Clusters are deflated as one zlib stream. Compressor state is expensive
//! to build, so workspaces are drawn from a shared pool and returned after
//! every job, including error paths. The admission heuristic estimates byte
//! entropy on a sample of the cluster and vetoes payloads that will not
//! deflate, before any workspace is acquired.

use std::sync::Mutex;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{FsError, Result};

/// Entropy (bits per byte) at or above which a cluster is considered
/// incompressible without running the compressor.
const ENTROPY_LIMIT: f64 = 7.5;

/// Bytes sampled from the head of a cluster by the heuristic.
const HEURISTIC_SAMPLE: usize = 4096;

/// Reusable compressor state.
pub struct Workspace {
    deflate: Compress,
    inflate: Decompress,
}

impl Workspace {
    fn new() -> Self {
        Workspace {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }

    /// Deflate `input` into a fresh buffer.
    ///
    /// Returns `None` when the output would be at least as large as the
    /// input — the cluster is then stored raw, which keeps the read path
    /// trivial for data that does not deflate.
    pub fn compress_cluster(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        self.deflate.reset();
        let cap = input.len();
        let mut out = Vec::with_capacity(cap);
        let mut consumed = 0usize;
        loop {
            let before = self.deflate.total_in() as usize;
            let status = self
                .deflate
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Finish)
                .ok()?;
            consumed += self.deflate.total_in() as usize - before;
            match status {
                Status::StreamEnd => break,
                // Output reached the input size before the stream ended: the
                // deflated form is no smaller than the original.
                Status::Ok if out.len() < cap => continue,
                Status::Ok | Status::BufError => return None,
            }
        }
        if out.len() >= cap { None } else { Some(out) }
    }

    /// Inflate `input` (exactly one compressed cluster) into `expected`
    /// bytes.
    pub fn decompress_cluster(&mut self, input: &[u8], expected: usize) -> Result<Vec<u8>> {
        self.inflate.reset(true);
        let mut out = Vec::with_capacity(expected);
        let mut consumed = 0usize;
        loop {
            let before_in = self.inflate.total_in() as usize;
            let before_out = out.len();
            let status = self
                .inflate
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Finish)
                .map_err(|e| FsError::Io(format!("inflate failed: {e}")))?;
            consumed += self.inflate.total_in() as usize - before_in;
            match status {
                Status::StreamEnd => break,
                Status::Ok
                    if out.len() < expected
                        && (out.len() > before_out
                            || self.inflate.total_in() as usize > before_in) =>
                {
                    continue;
                }
                Status::Ok | Status::BufError => {
                    return Err(FsError::Io(
                        "inflated extent is truncated or does not fit the cluster".into(),
                    ));
                }
            }
        }
        if out.len() != expected {
            return Err(FsError::Io(format!(
                "inflated extent is {} bytes, expected {expected}",
                out.len()
            )));
        }
        Ok(out)
    }
}

/// Shared pool of compressor workspaces.
pub struct WorkspacePool {
    pool: Mutex<Vec<Workspace>>,
}

impl WorkspacePool {
    pub fn new() -> Self {
        WorkspacePool {
            pool: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Workspace {
        self.pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(Workspace::new)
    }

    pub fn put(&self, ws: Workspace) {
        self.pool.lock().unwrap().push(ws);
    }
}

impl Default for WorkspacePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-frequency admission heuristic.
///
/// Estimates Shannon entropy over a sample from the head of the cluster;
/// near-random payloads are declared incompressible without spending a
/// workspace on them.
pub fn can_compress(cluster: &[u8]) -> bool {
    let sample = &cluster[..cluster.len().min(HEURISTIC_SAMPLE)];
    if sample.is_empty() {
        return false;
    }
    let mut freq = [0u32; 256];
    for &b in sample {
        freq[b as usize] += 1;
    }
    let n = sample.len() as f64;
    let mut entropy = 0.0f64;
    for &count in freq.iter() {
        if count == 0 {
            continue;
        }
        let p = count as f64 / n;
        entropy -= p * p.log2();
    }
    entropy < ENTROPY_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::EXTENT_SIZE;

    #[test]
    fn constant_payload_compresses_and_round_trips() {
        let mut ws = Workspace::new();
        let input = vec![0xAAu8; EXTENT_SIZE];
        let packed = ws.compress_cluster(&input).expect("0xAA must deflate");
        assert!(packed.len() < EXTENT_SIZE / 4);

        let unpacked = ws.decompress_cluster(&packed, EXTENT_SIZE).unwrap();
        assert_eq!(unpacked, input);
    }

    #[test]
    fn random_payload_is_rejected() {
        // xorshift; statistically incompressible
        let mut state = 0x9E3779B97F4A7C15u64;
        let mut input = vec![0u8; EXTENT_SIZE];
        for b in input.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = state as u8;
        }
        assert!(!can_compress(&input));

        let mut ws = Workspace::new();
        assert!(ws.compress_cluster(&input).is_none());
    }

    #[test]
    fn heuristic_admits_text_like_data() {
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(100);
        assert!(can_compress(&text));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut ws = Workspace::new();
        let input = vec![0x55u8; EXTENT_SIZE];
        let packed = ws.compress_cluster(&input).unwrap();
        let err = ws.decompress_cluster(&packed[..packed.len() / 2], EXTENT_SIZE);
        assert!(err.is_err());
    }
}
