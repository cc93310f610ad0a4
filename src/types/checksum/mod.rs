#![forbid(unsafe_code)]

/// Checksum of a block image, salted with its block number so that an image
/// logged under the wrong number never verifies.
pub fn block_crc32(block_no: u32, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block_no.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
