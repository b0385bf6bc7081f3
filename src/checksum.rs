//! Metadata and extent checksums.
//!
//! One CRC-32 (ISO-HDLC) is used throughout: superblock image, block-pointer
//! fingerprints and compressed extents. The 16-bit checksums carried by group
//! descriptors are the low half of the same CRC, matching the on-disk format.

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// CRC-32 over several slices in order, for data that is not contiguous in
/// memory (e.g. a cluster split across pages).
pub fn crc32_iter<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut digest = CRC32.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// 16-bit metadata checksum: the low half of the CRC-32.
pub fn crc16(data: &[u8]) -> u16 {
    (crc32(data) & 0xFFFF) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        // "123456789" under CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn crc32_iter_matches_contiguous() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let split = crc32_iter([&data[..10], &data[10..30], &data[30..]]);
        assert_eq!(split, crc32(data));
    }

    #[test]
    fn crc16_is_low_half() {
        let data = b"group descriptor";
        assert_eq!(crc16(data), (crc32(data) & 0xFFFF) as u16);
    }
}
