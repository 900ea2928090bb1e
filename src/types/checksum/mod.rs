#![forbid(unsafe_code)]

use crc32fast::Hasher;

/// CRC-32 over a contiguous byte range (mini-transactions, log blocks).
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// CRC-32 over several disjoint ranges, fed in order. Page checksums skip
/// the checksum field itself this way.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
