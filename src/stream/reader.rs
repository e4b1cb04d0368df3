use crate::codec::convert;
use crate::codec::field::{FieldDecoder, FieldSpec};
use crate::codec::packet::{
    align_up, decode_index_packet, packet_length, DataPacket, IndexEntry, SectionHeader,
    DATA_HEADER_LEN, SECTION_HEADER_LEN,
};
use crate::errors::{Error, ErrorKind, Result};
use crate::node::Node;
use crate::stream::buffer::{validate_bindings, validate_rebinding, SourceDestBuffer};
use crate::types::NodeType;
use crate::ImageFileInner;
use log::{debug, warn};
use std::sync::Arc;

impl Node {
    /// Opens the read engine over this CompressedVector.
    ///
    /// # Errors
    /// `BadNodeDowncast` on a non-CompressedVector node, `BadAPIArgument`
    /// when the node is not attached, `TooManyReaders` while a writer is
    /// open, `BadCVHeader`/`BadCVPacket` on a malformed section, plus the
    /// binding-contract kinds.
    pub fn reader(&self, buffers: &[SourceDestBuffer]) -> Result<CompressedVectorReader> {
        CompressedVectorReader::create(self, buffers)
    }
}

/// Position within the currently loaded data packet.
struct LoadedPacket {
    index: usize,
    remaining: u64,
}

/// Streams records out of data packets into bound destination buffers,
/// holding per-field decoder state across calls. A conversion failure
/// leaves the reader sick: every operation except `close` then reports the
/// original error.
pub struct CompressedVectorReader {
    file: Arc<ImageFileInner>,
    node: Node,
    fields: Vec<(String, FieldSpec)>,
    buffers: Vec<SourceDestBuffer>,
    decoders: Vec<FieldDecoder>,
    index: Vec<IndexEntry>,
    record_count: u64,
    payload: u64,
    next_record: u64,
    current: Option<LoadedPacket>,
    open: bool,
    sick: Option<Error>,
}

impl std::fmt::Debug for CompressedVectorReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedVectorReader")
            .field("node", &self.node)
            .field("record_count", &self.record_count)
            .field("open", &self.open)
            .finish()
    }
}

impl CompressedVectorReader {
    pub(crate) fn create(node: &Node, buffers: &[SourceDestBuffer]) -> Result<Self> {
        if node.node_type() != NodeType::CompressedVector {
            return Err(Error::new(
                ErrorKind::BadNodeDowncast,
                format!("{} node is not CompressedVector", node.node_type()),
            ));
        }
        if !node.is_attached() {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                "compressed vector must be attached before reading",
            ));
        }
        let file = node.file()?;
        let fields = FieldSpec::fields_of(&node.prototype()?)?;
        let ordered = validate_bindings(&fields, buffers)?;
        let payload = file.payload_size()?;
        file.begin_read()?;
        let loaded = Self::load_section(&file, node, payload);
        let (record_count, index) = match loaded {
            Ok(section) => section,
            Err(e) => {
                if e.kind().is_file_fatal() {
                    file.mark_sick(&e);
                }
                file.end_read();
                return Err(e);
            }
        };
        let decoders = fields.iter().map(|(_, spec)| FieldDecoder::new(spec)).collect();
        debug!(
            "reader open: {} field(s), {record_count} record(s) in {} packet(s)",
            fields.len(),
            index.len()
        );
        Ok(Self {
            file,
            node: node.clone(),
            fields,
            buffers: ordered,
            decoders,
            index,
            record_count,
            payload,
            next_record: 0,
            current: None,
            open: true,
            sick: None,
        })
    }

    /// Reads the section header and the index packets behind it.
    fn load_section(
        file: &Arc<ImageFileInner>,
        node: &Node,
        payload: u64,
    ) -> Result<(u64, Vec<IndexEntry>)> {
        let section_start = node.data_packet_offset()?;
        if section_start == 0 {
            // Never written; an empty stream.
            return Ok((0, Vec::new()));
        }
        let mut raw = [0u8; SECTION_HEADER_LEN];
        file.read_at(section_start, &mut raw)?;
        let header = SectionHeader::from_bytes(&raw)?;
        let end = section_start + header.section_length;
        let mut index = Vec::new();
        let mut cursor = header.index_offset;
        while cursor < end {
            let mut prefix = [0u8; 4];
            file.read_at(cursor, &mut prefix)?;
            let length = packet_length(&prefix)?;
            let mut bytes = vec![0u8; length];
            file.read_at(cursor, &mut bytes)?;
            index.extend(decode_index_packet(&bytes)?);
            cursor = align_up(cursor + length as u64, payload);
        }
        if header.record_count > 0 {
            let first_ok = index.first().is_some_and(|e| e.record_index == 0);
            let monotone = index.windows(2).all(|w| w[0].record_index < w[1].record_index);
            if !first_ok || !monotone {
                return Err(Error::new(
                    ErrorKind::BadCvPacket,
                    "index entries do not cover the record range",
                ));
            }
        }
        Ok((header.record_count, index))
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// The CompressedVector this reader drains.
    #[must_use]
    pub fn compressed_vector_node(&self) -> Node {
        self.node.clone()
    }

    /// Reads up to `capacity` records into the bound buffers, filling
    /// positions `[0, n)`. Returns fewer than `capacity` only at the end
    /// of the stream, and zero forever after it.
    ///
    /// # Errors
    /// `ReaderNotOpen` after close; a sick reader repeats its original
    /// error; conversion and bounds kinds sicken the reader; I/O, packet,
    /// and checksum kinds additionally sicken the container.
    pub fn read(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let result = self.read_records();
        if let Err(e) = &result {
            self.sicken(e);
        }
        result
    }

    /// Rebinds the destination buffers, then reads.
    ///
    /// # Errors
    /// As [`read`](Self::read), plus the rebinding-contract kinds (which
    /// leave the reader healthy).
    pub fn read_with(&mut self, buffers: &[SourceDestBuffer]) -> Result<u64> {
        self.ensure_open()?;
        self.buffers = validate_rebinding(&self.fields, &self.buffers, buffers)?;
        self.read()
    }

    /// Positions the stream at `record`; `record_count` is allowed and
    /// leaves the stream at its end. Resets all per-field decoder state;
    /// the next read locates the containing packet through the index and
    /// skips the within-packet prefix.
    ///
    /// # Errors
    /// `BadAPIArgument` past `record_count` (the reader stays healthy);
    /// `ReaderNotOpen`/sickness as for [`read`](Self::read).
    pub fn seek(&mut self, record: u64) -> Result<()> {
        self.ensure_open()?;
        if record > self.record_count {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("seek to {record} past the record count {}", self.record_count),
            ));
        }
        self.current = None;
        for i in 0..self.fields.len() {
            self.decoders[i] = FieldDecoder::new(&self.fields[i].1);
        }
        self.next_record = record;
        debug!("seek to record {record}");
        Ok(())
    }

    /// Releases the container's reader slot. Idempotent, and the only
    /// operation a sick reader accepts.
    ///
    /// # Errors
    /// Never fails; fallible for parity with the write engine.
    pub fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.file.end_read();
        }
        Ok(())
    }

    /// Verifies the externally visible reader invariants.
    ///
    /// # Errors
    /// `InvarianceViolation` naming the violated predicate.
    pub fn check_invariant(&self) -> Result<()> {
        if !self.open || !self.file.is_open() {
            return Ok(());
        }
        if !self.node.is_attached() {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "reader over a detached compressed vector",
            ));
        }
        if self.file.reader_count() < 1 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "open reader but the container counts none",
            ));
        }
        if self.file.writer_count() != 0 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                format!("reader co-exists with {} writer(s)", self.file.writer_count()),
            ));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(Error::new(ErrorKind::ReaderNotOpen, "reader is closed"));
        }
        if let Some(original) = &self.sick {
            return Err(original.clone());
        }
        self.file.usable()
    }

    /// File-fatal failures poison the container, after which every handle
    /// reports `ImageFileNotOpen`; value failures poison only this reader,
    /// which then repeats the original error.
    fn sicken(&mut self, e: &Error) {
        if e.kind().is_file_fatal() {
            self.file.mark_sick(e);
        } else if self.sick.is_none() {
            warn!("reader sick: {e}");
            self.sick = Some(e.clone());
        }
    }

    fn read_records(&mut self) -> Result<u64> {
        let capacity = self.buffers[0].capacity as u64;
        let mut delivered = 0u64;
        while delivered < capacity && self.next_record < self.record_count {
            if self.current.as_ref().is_none_or(|c| c.remaining == 0) {
                self.load_packet(self.next_record)?;
            }
            for i in 0..self.fields.len() {
                let value = self.decoders[i].next()?;
                let (path, spec) = &self.fields[i];
                convert::deliver(path, spec, &self.buffers[i], delivered as usize, value)?;
            }
            if let Some(current) = &mut self.current {
                current.remaining -= 1;
            }
            self.next_record += 1;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Loads the packet containing `record` and discards the within-packet
    /// prefix so the decoders stand at `record`.
    fn load_packet(&mut self, record: u64) -> Result<()> {
        let index = match &self.current {
            Some(current)
                if self
                    .index
                    .get(current.index + 1)
                    .is_some_and(|e| e.record_index == record) =>
            {
                current.index + 1
            }
            _ => self.locate_packet(record)?,
        };
        let entry = self.index[index];
        let next_first =
            self.index.get(index + 1).map_or(self.record_count, |e| e.record_index);
        let records = next_first - entry.record_index;
        let mut prefix = [0u8; DATA_HEADER_LEN];
        self.file.read_at(entry.offset, &mut prefix)?;
        let length = packet_length(&prefix)?;
        let mut bytes = vec![0u8; length];
        self.file.read_at(entry.offset, &mut bytes)?;
        let packet = DataPacket::decode(&bytes, self.fields.len())?;
        for (i, stream) in packet.streams.into_iter().enumerate() {
            self.decoders[i].load(stream, records)?;
        }
        let skip = record - entry.record_index;
        for _ in 0..skip {
            for decoder in &mut self.decoders {
                decoder.next()?;
            }
        }
        self.current = Some(LoadedPacket { index, remaining: records - skip });
        Ok(())
    }

    fn locate_packet(&self, record: u64) -> Result<usize> {
        let pos = self.index.partition_point(|e| e.record_index <= record);
        if pos == 0 {
            return Err(Error::internal(format!("record {record} precedes the index")));
        }
        Ok(pos - 1)
    }
}

impl Drop for CompressedVectorReader {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.file.end_read();
        }
    }
}
