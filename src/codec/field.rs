//! Per-field encodings: the snapshot of a prototype field taken when a
//! stream engine is created, and the stateful encoder/decoder pair that
//! carries a field's bytestream across packet boundaries.

use crate::codec::bitpack::{push_varint, read_varint, varint_len, BitCursor, BitWriter};
use crate::errors::{Error, ErrorKind, Result};
use crate::node::core::{NodeKind, NodeRef};
use crate::node::Node;
use crate::types::FloatPrecision;
use std::collections::VecDeque;

/// Bits needed for `max - min + 1` distinct values; zero when the field is
/// constant.
#[must_use]
pub fn int_bit_width(min: i64, max: i64) -> u32 {
    let range = (i128::from(max) - i128::from(min)) as u128;
    128 - range.leading_zeros()
}

/// Immutable description of one terminal prototype field.
#[derive(Debug, Clone)]
pub enum FieldSpec {
    Integer { min: i64, max: i64 },
    ScaledInteger { min: i64, max: i64, scale: f64, offset: f64 },
    Float { precision: FloatPrecision, min: f64, max: f64 },
    UString,
}

impl FieldSpec {
    /// Snapshots the terminal fields of a record template, depth first in
    /// declaration order, paths relative to the prototype root.
    ///
    /// # Errors
    /// `BadAPIArgument` when the template contains a non-terminal leaf or
    /// has no fields at all.
    pub fn fields_of(prototype: &Node) -> Result<Vec<(String, FieldSpec)>> {
        let mut out = Vec::new();
        collect_fields(&prototype.body, String::new(), &mut out)?;
        if out.is_empty() {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                "prototype has no terminal fields",
            ));
        }
        Ok(out)
    }
}

fn collect_fields(
    node: &NodeRef,
    prefix: String,
    out: &mut Vec<(String, FieldSpec)>,
) -> Result<()> {
    let body = node.read();
    match &body.kind {
        NodeKind::Structure { children } => {
            for (name, child) in children {
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                collect_fields(child, path, out)?;
            }
            Ok(())
        }
        NodeKind::Integer { min, max, .. } => {
            out.push((prefix, FieldSpec::Integer { min: *min, max: *max }));
            Ok(())
        }
        NodeKind::ScaledInteger { min, max, scale, offset, .. } => {
            out.push((
                prefix,
                FieldSpec::ScaledInteger {
                    min: *min,
                    max: *max,
                    scale: *scale,
                    offset: *offset,
                },
            ));
            Ok(())
        }
        NodeKind::Float { precision, min, max, .. } => {
            out.push((prefix, FieldSpec::Float { precision: *precision, min: *min, max: *max }));
            Ok(())
        }
        NodeKind::UString { .. } => {
            out.push((prefix, FieldSpec::UString));
            Ok(())
        }
        other => Err(Error::new(
            ErrorKind::BadApiArgument,
            format!(
                "prototype field {prefix:?} has unsupported type {}",
                other.node_type()
            ),
        )),
    }
}

/// A value in its stored representation, between coercion and the packet
/// bytestreams.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FieldValue {
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
}

/// Write-side state of one field: accumulates stored values into the
/// bytestream of the packet being assembled.
pub(crate) enum FieldEncoder {
    Bits { min: i64, bits: u32, out: BitWriter },
    F32 { out: Vec<u8> },
    F64 { out: Vec<u8> },
    UString { lengths: Vec<u8>, payload: Vec<u8> },
}

impl FieldEncoder {
    pub(crate) fn new(spec: &FieldSpec) -> Self {
        match spec {
            FieldSpec::Integer { min, max }
            | FieldSpec::ScaledInteger { min, max, .. } => Self::Bits {
                min: *min,
                bits: int_bit_width(*min, *max),
                out: BitWriter::new(),
            },
            FieldSpec::Float { precision: FloatPrecision::Single, .. } => {
                Self::F32 { out: Vec::new() }
            }
            FieldSpec::Float { precision: FloatPrecision::Double, .. } => {
                Self::F64 { out: Vec::new() }
            }
            FieldSpec::UString => Self::UString { lengths: Vec::new(), payload: Vec::new() },
        }
    }

    /// Bytes this field's bytestream occupies if flushed now.
    pub(crate) fn stream_len(&self) -> usize {
        match self {
            Self::Bits { out, .. } => out.byte_len(),
            Self::F32 { out } | Self::F64 { out } => out.len(),
            Self::UString { lengths, payload } => lengths.len() + payload.len(),
        }
    }

    /// Bytes the bytestream would occupy with `value` appended.
    pub(crate) fn stream_len_with(&self, value: &FieldValue) -> usize {
        match (self, value) {
            (Self::Bits { bits, out, .. }, _) => (out.bit_len() + *bits as usize).div_ceil(8),
            (Self::F32 { out }, _) => out.len() + 4,
            (Self::F64 { out }, _) => out.len() + 8,
            (Self::UString { lengths, payload }, FieldValue::Str(s)) => {
                lengths.len() + varint_len(s.len() as u64) + payload.len() + s.len()
            }
            (Self::UString { lengths, payload }, _) => lengths.len() + payload.len(),
        }
    }

    /// # Errors
    /// `InternalError` on a value/encoder mismatch; coercion upstream
    /// guarantees the match.
    pub(crate) fn append(&mut self, value: &FieldValue) -> Result<()> {
        match (self, value) {
            (Self::Bits { min, bits, out }, FieldValue::I64(v)) => {
                let biased = (i128::from(*v) - i128::from(*min)) as u64;
                out.push(biased, *bits);
                Ok(())
            }
            (Self::F32 { out }, FieldValue::F32(v)) => {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            }
            (Self::F64 { out }, FieldValue::F64(v)) => {
                out.extend_from_slice(&v.to_le_bytes());
                Ok(())
            }
            (Self::UString { lengths, payload }, FieldValue::Str(s)) => {
                push_varint(lengths, s.len() as u64);
                payload.extend_from_slice(s.as_bytes());
                Ok(())
            }
            _ => Err(Error::internal("stored value does not match its field encoder")),
        }
    }

    /// Yields the byte-aligned bytestream for the current packet and resets
    /// the field for the next one. A string bytestream is the LEB128 length
    /// table followed by the payload group at the end; a trailing length
    /// table could not be delimited, since UTF-8 continuation bytes carry
    /// the same continuation bit as LEB128.
    pub(crate) fn take_stream(&mut self) -> Vec<u8> {
        match self {
            Self::Bits { out, .. } => out.take(),
            Self::F32 { out } | Self::F64 { out } => std::mem::take(out),
            Self::UString { lengths, payload } => {
                let mut stream = std::mem::take(lengths);
                stream.append(payload);
                stream
            }
        }
    }
}

/// Read-side state of one field: the current packet's bytestream plus a
/// cursor, surviving partial consumption across `read` calls.
pub(crate) enum FieldDecoder {
    Bits { min: i64, max: i64, bits: u32, cursor: BitCursor },
    F32 { bytes: Vec<u8>, pos: usize },
    F64 { bytes: Vec<u8>, pos: usize },
    UString { queue: VecDeque<String> },
}

impl FieldDecoder {
    pub(crate) fn new(spec: &FieldSpec) -> Self {
        match spec {
            FieldSpec::Integer { min, max }
            | FieldSpec::ScaledInteger { min, max, .. } => Self::Bits {
                min: *min,
                max: *max,
                bits: int_bit_width(*min, *max),
                cursor: BitCursor::default(),
            },
            FieldSpec::Float { precision: FloatPrecision::Single, .. } => {
                Self::F32 { bytes: Vec::new(), pos: 0 }
            }
            FieldSpec::Float { precision: FloatPrecision::Double, .. } => {
                Self::F64 { bytes: Vec::new(), pos: 0 }
            }
            FieldSpec::UString => Self::UString { queue: VecDeque::new() },
        }
    }

    /// Installs one packet's bytestream, which must hold exactly `records`
    /// values (plus byte padding).
    ///
    /// # Errors
    /// `BadCVPacket` when the stream is too short or malformed.
    pub(crate) fn load(&mut self, stream: Vec<u8>, records: u64) -> Result<()> {
        match self {
            Self::Bits { bits, cursor, .. } => {
                let needed = records * u64::from(*bits);
                if (stream.len() as u64) * 8 < needed {
                    return Err(Error::new(
                        ErrorKind::BadCvPacket,
                        format!(
                            "bytestream of {} bytes cannot hold {records} {bits}-bit values",
                            stream.len()
                        ),
                    ));
                }
                *cursor = BitCursor::new(stream);
                Ok(())
            }
            Self::F32 { bytes, pos } => {
                if (stream.len() as u64) < records * 4 {
                    return Err(Error::new(
                        ErrorKind::BadCvPacket,
                        format!("bytestream of {} bytes cannot hold {records} f32", stream.len()),
                    ));
                }
                *bytes = stream;
                *pos = 0;
                Ok(())
            }
            Self::F64 { bytes, pos } => {
                if (stream.len() as u64) < records * 8 {
                    return Err(Error::new(
                        ErrorKind::BadCvPacket,
                        format!("bytestream of {} bytes cannot hold {records} f64", stream.len()),
                    ));
                }
                *bytes = stream;
                *pos = 0;
                Ok(())
            }
            Self::UString { queue } => {
                queue.clear();
                let mut pos = 0usize;
                let mut lens = Vec::with_capacity(records as usize);
                for _ in 0..records {
                    let len = read_varint(&stream, &mut pos).ok_or_else(|| {
                        Error::new(ErrorKind::BadCvPacket, "truncated string length table")
                    })?;
                    lens.push(len as usize);
                }
                for len in lens {
                    let end = pos.checked_add(len).filter(|end| *end <= stream.len());
                    let Some(end) = end else {
                        return Err(Error::new(
                            ErrorKind::BadCvPacket,
                            "string payload overruns its bytestream",
                        ));
                    };
                    let text = std::str::from_utf8(&stream[pos..end]).map_err(|_| {
                        Error::new(ErrorKind::BadCvPacket, "string payload is not valid UTF-8")
                    })?;
                    queue.push_back(text.to_string());
                    pos = end;
                }
                if pos != stream.len() {
                    return Err(Error::new(
                        ErrorKind::BadCvPacket,
                        "trailing bytes after the last string payload",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Decodes the next value of the current packet.
    ///
    /// # Errors
    /// `BadCVPacket` when the stream is exhausted or a decoded integer
    /// falls outside the prototype bounds.
    pub(crate) fn next(&mut self) -> Result<FieldValue> {
        match self {
            Self::Bits { min, max, bits, cursor } => {
                let raw = cursor.read(*bits).ok_or_else(|| {
                    Error::new(ErrorKind::BadCvPacket, "bytestream exhausted mid-packet")
                })?;
                let value = (i128::from(*min) + i128::from(raw)) as i64;
                if value > *max {
                    return Err(Error::new(
                        ErrorKind::BadCvPacket,
                        format!("decoded value {value} above the field maximum {max}"),
                    ));
                }
                Ok(FieldValue::I64(value))
            }
            Self::F32 { bytes, pos } => {
                let end = *pos + 4;
                if end > bytes.len() {
                    return Err(Error::new(ErrorKind::BadCvPacket, "bytestream exhausted"));
                }
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes[*pos..end]);
                *pos = end;
                Ok(FieldValue::F32(f32::from_le_bytes(buf)))
            }
            Self::F64 { bytes, pos } => {
                let end = *pos + 8;
                if end > bytes.len() {
                    return Err(Error::new(ErrorKind::BadCvPacket, "bytestream exhausted"));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[*pos..end]);
                *pos = end;
                Ok(FieldValue::F64(f64::from_le_bytes(buf)))
            }
            Self::UString { queue } => queue
                .pop_front()
                .map(FieldValue::Str)
                .ok_or_else(|| Error::new(ErrorKind::BadCvPacket, "string queue exhausted")),
        }
    }
}
