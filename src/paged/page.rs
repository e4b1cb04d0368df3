use crate::errors::{Error, ErrorKind, Result};

/// Default logical page size, checksum trailer included.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Trailing CRC-32C over the page payload.
pub const CHECKSUM_LEN: usize = 4;

/// CRC-32C (Castagnoli) over a page payload.
#[must_use]
pub fn page_checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Splits a raw page into its payload, verifying the trailing checksum.
///
/// # Errors
/// Returns `BadChecksum` naming the page index when the trailer does not
/// match the payload.
pub fn verify_page(raw: &[u8], index: u64) -> Result<&[u8]> {
    let split = raw.len() - CHECKSUM_LEN;
    let (payload, trailer) = raw.split_at(split);
    let mut stored = [0u8; CHECKSUM_LEN];
    stored.copy_from_slice(trailer);
    let stored = u32::from_le_bytes(stored);
    let computed = page_checksum(payload);
    if stored != computed {
        return Err(Error::new(
            ErrorKind::BadChecksum,
            format!("page {index}: stored {stored:#010x}, computed {computed:#010x}"),
        ));
    }
    Ok(payload)
}
