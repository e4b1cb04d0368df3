//! Wire layout of compressed-vector packets and the binary-section header.
//! All multi-byte integers are little-endian.

use crate::errors::{Error, ErrorKind, Result};

/// Hard cap on any packet, the 16-bit length field plus one.
pub const MAX_PACKET_LEN: usize = 65536;

pub const INDEX_PACKET_TYPE: u8 = 0;
pub const DATA_PACKET_TYPE: u8 = 1;

/// `[type][flags][length_minus_1 u16][bytestream_count u16]`
pub const DATA_HEADER_LEN: usize = 6;

/// `[type][flags][length_minus_1 u16][entry_count u16][index_level][reserved x9]`
pub const INDEX_HEADER_LEN: usize = 16;

/// `{record_index u64, packet_logical_offset u64}`
pub const INDEX_ENTRY_LEN: usize = 16;

pub const MAX_INDEX_ENTRIES: usize = (MAX_PACKET_LEN - INDEX_HEADER_LEN) / INDEX_ENTRY_LEN;

pub const SECTION_ID: u8 = 1;

/// `[section_id][reserved x7][section_length u64][data_offset u64]
/// [index_offset u64][record_count u64]`
pub const SECTION_HEADER_LEN: usize = 40;

/// Rounds a logical offset up to a packet-start boundary.
#[must_use]
pub const fn align_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

/// Total length of a packet's first bytes; both packet types keep the
/// 16-bit `length_minus_1` field at offset 2.
///
/// # Errors
/// `BadCVPacket` on a truncated prefix.
pub fn packet_length(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < 4 {
        return Err(Error::new(ErrorKind::BadCvPacket, "truncated packet header"));
    }
    Ok(u16::from_le_bytes([prefix[2], prefix[3]]) as usize + 1)
}

/// One data packet: a bytestream per terminal prototype field, in
/// prototype order.
pub struct DataPacket {
    pub streams: Vec<Vec<u8>>,
}

impl DataPacket {
    /// Serialized length for the given stream sizes.
    #[must_use]
    pub fn encoded_len(stream_lens: &[usize]) -> usize {
        DATA_HEADER_LEN + 2 * stream_lens.len() + stream_lens.iter().sum::<usize>()
    }

    /// # Errors
    /// `InternalError` when the packet or one of its streams overflows its
    /// 16-bit length field; the write engine sizes packets to prevent this.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let lens: Vec<usize> = self.streams.iter().map(Vec::len).collect();
        let total = Self::encoded_len(&lens);
        if total > MAX_PACKET_LEN {
            return Err(Error::internal(format!("data packet of {total} bytes overflows")));
        }
        if self.streams.len() > usize::from(u16::MAX) {
            return Err(Error::internal("too many bytestreams for one packet"));
        }
        let mut out = Vec::with_capacity(total);
        out.push(DATA_PACKET_TYPE);
        out.push(0); // flags
        out.extend_from_slice(&((total - 1) as u16).to_le_bytes());
        out.extend_from_slice(&(self.streams.len() as u16).to_le_bytes());
        for len in &lens {
            let len16 = u16::try_from(*len)
                .map_err(|_| Error::internal(format!("bytestream of {len} bytes overflows")))?;
            out.extend_from_slice(&len16.to_le_bytes());
        }
        for stream in &self.streams {
            out.extend_from_slice(stream);
        }
        Ok(out)
    }

    /// Parses a whole data packet.
    ///
    /// # Errors
    /// `BadCVPacket` on a type mismatch, a stream-count mismatch, or stream
    /// lengths inconsistent with the packet length.
    pub fn decode(bytes: &[u8], expected_streams: usize) -> Result<Self> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(Error::new(ErrorKind::BadCvPacket, "truncated data packet"));
        }
        if bytes[0] != DATA_PACKET_TYPE {
            return Err(Error::new(
                ErrorKind::BadCvPacket,
                format!("expected a data packet, found type {}", bytes[0]),
            ));
        }
        let length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize + 1;
        if length != bytes.len() {
            return Err(Error::new(
                ErrorKind::BadCvPacket,
                format!("packet length field {length} disagrees with {} bytes", bytes.len()),
            ));
        }
        let count = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        if count != expected_streams {
            return Err(Error::new(
                ErrorKind::BadCvPacket,
                format!("packet carries {count} bytestreams, prototype has {expected_streams}"),
            ));
        }
        let streams_at = DATA_HEADER_LEN + 2 * count;
        if streams_at > bytes.len() {
            return Err(Error::new(ErrorKind::BadCvPacket, "bytestream table truncated"));
        }
        let mut streams = Vec::with_capacity(count);
        let mut cursor = streams_at;
        for i in 0..count {
            let at = DATA_HEADER_LEN + 2 * i;
            let len = u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
            if cursor + len > bytes.len() {
                return Err(Error::new(
                    ErrorKind::BadCvPacket,
                    format!("bytestream {i} of {len} bytes overruns the packet"),
                ));
            }
            streams.push(bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }
        if cursor != bytes.len() {
            return Err(Error::new(
                ErrorKind::BadCvPacket,
                format!("{} trailing bytes after the last bytestream", bytes.len() - cursor),
            ));
        }
        Ok(Self { streams })
    }
}

/// Maps the first record of a data packet to the packet's logical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub record_index: u64,
    pub offset: u64,
}

/// Serializes one (single-level) index packet.
#[must_use]
pub fn encode_index_packet(entries: &[IndexEntry]) -> Vec<u8> {
    debug_assert!(entries.len() <= MAX_INDEX_ENTRIES);
    let total = INDEX_HEADER_LEN + entries.len() * INDEX_ENTRY_LEN;
    let mut out = Vec::with_capacity(total);
    out.push(INDEX_PACKET_TYPE);
    out.push(0); // flags
    out.extend_from_slice(&((total - 1) as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.push(0); // index level
    out.extend_from_slice(&[0u8; 9]);
    for entry in entries {
        out.extend_from_slice(&entry.record_index.to_le_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
    }
    out
}

/// Parses one index packet.
///
/// # Errors
/// `BadCVPacket` on a type mismatch or an entry table inconsistent with
/// the packet length.
pub fn decode_index_packet(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    if bytes.len() < INDEX_HEADER_LEN {
        return Err(Error::new(ErrorKind::BadCvPacket, "truncated index packet"));
    }
    if bytes[0] != INDEX_PACKET_TYPE {
        return Err(Error::new(
            ErrorKind::BadCvPacket,
            format!("expected an index packet, found type {}", bytes[0]),
        ));
    }
    let count = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    if INDEX_HEADER_LEN + count * INDEX_ENTRY_LEN != bytes.len() {
        return Err(Error::new(
            ErrorKind::BadCvPacket,
            format!("index packet of {} bytes cannot hold {count} entries", bytes.len()),
        ));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = INDEX_HEADER_LEN + i * INDEX_ENTRY_LEN;
        let mut rec = [0u8; 8];
        rec.copy_from_slice(&bytes[at..at + 8]);
        let mut off = [0u8; 8];
        off.copy_from_slice(&bytes[at + 8..at + 16]);
        entries.push(IndexEntry {
            record_index: u64::from_le_bytes(rec),
            offset: u64::from_le_bytes(off),
        });
    }
    Ok(entries)
}

/// Header of a compressed-vector binary section, patched in place when the
/// writer closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub section_length: u64,
    pub data_offset: u64,
    pub index_offset: u64,
    pub record_count: u64,
}

impl SectionHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_LEN] {
        let mut out = [0u8; SECTION_HEADER_LEN];
        out[0] = SECTION_ID;
        out[8..16].copy_from_slice(&self.section_length.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.index_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.record_count.to_le_bytes());
        out
    }

    /// # Errors
    /// `BadCVHeader` on a wrong section id or truncated header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SECTION_HEADER_LEN {
            return Err(Error::new(ErrorKind::BadCvHeader, "truncated section header"));
        }
        if bytes[0] != SECTION_ID {
            return Err(Error::new(
                ErrorKind::BadCvHeader,
                format!("bad section id {}", bytes[0]),
            ));
        }
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        Ok(Self {
            section_length: u64_at(8),
            data_offset: u64_at(16),
            index_offset: u64_at(24),
            record_count: u64_at(32),
        })
    }
}
