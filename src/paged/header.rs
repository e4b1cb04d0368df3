use crate::errors::{Error, ErrorKind, Result};
use crate::paged::page::{CHECKSUM_LEN, DEFAULT_PAGE_SIZE};
use std::io::Read;
use std::path::Path;

/// ASCII magic at logical offset 0.
pub const SIGNATURE: [u8; 8] = *b"ASTM-E57";

/// Serialized header length, the first 48 logical bytes of the container.
pub const HEADER_LEN: usize = 48;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 0;

/// The fixed container header: signature, format version, physical length,
/// XML section location, page size. All integers little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub physical_length: u64,
    pub xml_offset: u64,
    pub xml_length: u64,
    pub page_size: u64,
}

impl FileHeader {
    #[must_use]
    pub const fn new(page_size: u64) -> Self {
        Self { physical_length: 0, xml_offset: 0, xml_length: 0, page_size }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..8].copy_from_slice(&SIGNATURE);
        out[8..12].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        out[12..16].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        out[16..24].copy_from_slice(&self.physical_length.to_le_bytes());
        out[24..32].copy_from_slice(&self.xml_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.xml_length.to_le_bytes());
        out[40..48].copy_from_slice(&self.page_size.to_le_bytes());
        out
    }

    /// Parses and validates a serialized header.
    ///
    /// # Errors
    /// Returns `ReadFailed` on a bad signature, an unsupported version, or an
    /// implausible page size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::new(ErrorKind::ReadFailed, "container shorter than its header"));
        }
        if bytes[0..8] != SIGNATURE {
            return Err(Error::new(ErrorKind::ReadFailed, "bad container signature"));
        }
        let major = u32::from_le_bytes(le4(&bytes[8..12]));
        if major != VERSION_MAJOR {
            return Err(Error::new(
                ErrorKind::ReadFailed,
                format!("unsupported format version {major}"),
            ));
        }
        let page_size = u64::from_le_bytes(le8(&bytes[40..48]));
        if page_size < (HEADER_LEN + CHECKSUM_LEN) as u64 || page_size > 65536 {
            return Err(Error::new(
                ErrorKind::ReadFailed,
                format!("implausible page size {page_size}"),
            ));
        }
        Ok(Self {
            physical_length: u64::from_le_bytes(le8(&bytes[16..24])),
            xml_offset: u64::from_le_bytes(le8(&bytes[24..32])),
            xml_length: u64::from_le_bytes(le8(&bytes[32..40])),
            page_size,
        })
    }

    /// Reads the header from the raw front of a container file, before the
    /// page layer exists. The first 48 physical bytes coincide with the
    /// first 48 logical bytes for every legal page size, so this needs no
    /// checksum bookkeeping; the paged re-read after open still verifies
    /// page 0.
    ///
    /// # Errors
    /// Returns `ReadFailed` if the file cannot be read or the header does
    /// not validate.
    pub fn probe(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path).map_err(|e| Error::read_failed(&e))?;
        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf).map_err(|e| Error::read_failed(&e))?;
        Self::from_bytes(&buf)
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE as u64)
    }
}

fn le4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    out
}

fn le8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}
