use crate::codec::convert;
use crate::codec::field::{FieldEncoder, FieldSpec, FieldValue};
use crate::codec::packet::{
    align_up, encode_index_packet, DataPacket, IndexEntry, SectionHeader, DATA_HEADER_LEN,
    MAX_INDEX_ENTRIES, MAX_PACKET_LEN, SECTION_HEADER_LEN,
};
use crate::errors::{Error, ErrorKind, Result};
use crate::node::Node;
use crate::stream::buffer::{validate_bindings, validate_rebinding, SourceDestBuffer};
use crate::types::NodeType;
use crate::ImageFileInner;
use log::{debug, warn};
use std::sync::Arc;

impl Node {
    /// Opens the write engine over this CompressedVector.
    ///
    /// # Errors
    /// `BadNodeDowncast` on a non-CompressedVector node, `BadAPIArgument`
    /// when the node is not attached, `TooManyWriters` when a writer or any
    /// reader is already open, `FileReadOnly` on a read-only container,
    /// plus the binding-contract kinds.
    pub fn writer(&self, buffers: &[SourceDestBuffer]) -> Result<CompressedVectorWriter> {
        CompressedVectorWriter::create(self, buffers)
    }
}

/// Streams records from bound source buffers into data packets. At most
/// one writer may exist per container, and only while no reader does.
pub struct CompressedVectorWriter {
    file: Arc<ImageFileInner>,
    node: Node,
    fields: Vec<(String, FieldSpec)>,
    buffers: Vec<SourceDestBuffer>,
    encoders: Vec<FieldEncoder>,
    /// Bytes of one page's payload; packets start on these boundaries.
    payload: u64,
    section_start: u64,
    cursor: u64,
    packet_first_record: u64,
    records_in_packet: u64,
    total_records: u64,
    index: Vec<IndexEntry>,
    open: bool,
}

impl std::fmt::Debug for CompressedVectorWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedVectorWriter")
            .field("node", &self.node)
            .field("total_records", &self.total_records)
            .field("open", &self.open)
            .finish()
    }
}

impl CompressedVectorWriter {
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
                "compressed vector must be attached before writing",
            ));
        }
        let file = node.file()?;
        let fields = FieldSpec::fields_of(&node.prototype()?)?;
        let ordered = validate_bindings(&fields, buffers)?;
        let payload = file.payload_size()?;
        file.begin_write()?;
        if node.cv_writing_started().unwrap_or(false) {
            file.end_write();
            return Err(Error::new(
                ErrorKind::SetTwice,
                "compressed vector already has a written record stream",
            ));
        }
        let placed = (|| -> Result<u64> {
            let section_start = file.allocate_section()?;
            file.write_at(section_start, &[0u8; SECTION_HEADER_LEN])?;
            Ok(section_start)
        })();
        let section_start = match placed.and_then(|start| {
            node.cv_begin_write(start)?;
            Ok(start)
        }) {
            Ok(start) => start,
            Err(e) => {
                file.end_write();
                return Err(e);
            }
        };
        let cursor = align_up(section_start + SECTION_HEADER_LEN as u64, payload);
        let encoders = fields.iter().map(|(_, spec)| FieldEncoder::new(spec)).collect();
        debug!(
            "writer open: {} field(s), section at {section_start}, first packet at {cursor}",
            fields.len()
        );
        Ok(Self {
            file,
            node: node.clone(),
            fields,
            buffers: ordered,
            encoders,
            payload,
            section_start,
            cursor,
            packet_first_record: 0,
            records_in_packet: 0,
            total_records: 0,
            index: Vec::new(),
            open: true,
        })
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// The CompressedVector this writer feeds.
    #[must_use]
    pub fn compressed_vector_node(&self) -> Node {
        self.node.clone()
    }

    /// Consumes the first `n` records from every bound source buffer. All
    /// values are coerced and bounds-checked before a single bit reaches
    /// the packet buffer, so a failed call leaves the stream untouched.
    ///
    /// # Errors
    /// `WriterNotOpen` after close, `BadAPIArgument` when `n` exceeds the
    /// buffer capacity or one record cannot fit a packet, plus the
    /// coercion kinds and the page layer's I/O kinds.
    pub fn write(&mut self, n: usize) -> Result<()> {
        self.ensure_open()?;
        let capacity = self.buffers[0].capacity;
        if n > capacity {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("write of {n} record(s) exceeds the buffer capacity {capacity}"),
            ));
        }
        // Stage first: nothing below may fail for value reasons.
        let mut staged: Vec<Vec<FieldValue>> = Vec::with_capacity(n);
        for record in 0..n {
            let mut values = Vec::with_capacity(self.fields.len());
            for (i, (path, spec)) in self.fields.iter().enumerate() {
                let source = convert::fetch(&self.buffers[i], record);
                values.push(convert::stage(path, spec, &self.buffers[i], source)?);
            }
            staged.push(values);
        }
        for values in &staged {
            self.make_room_for(values)?;
            for (i, value) in values.iter().enumerate() {
                self.encoders[i].append(value)?;
            }
            self.records_in_packet += 1;
            self.total_records += 1;
        }
        Ok(())
    }

    /// Rebinds the source buffers, then writes `n` records.
    ///
    /// # Errors
    /// As [`write`](Self::write), plus the rebinding-contract kinds.
    pub fn write_with(&mut self, buffers: &[SourceDestBuffer], n: usize) -> Result<()> {
        self.ensure_open()?;
        self.buffers = validate_rebinding(&self.fields, &self.buffers, buffers)?;
        self.write(n)
    }

    /// Flushes the pending data packet, emits the index packets, patches
    /// the section header and the node's record count, and releases the
    /// container's writer slot. Idempotent.
    ///
    /// # Errors
    /// The page layer's I/O kinds; the writer is closed regardless.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let result = if self.file.usable().is_ok() { self.finish() } else { Ok(()) };
        self.file.end_write();
        result
    }

    /// Verifies the externally visible writer invariants.
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
                "writer over a detached compressed vector",
            ));
        }
        if self.file.writer_count() != 1 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                format!("open writer but writer count is {}", self.file.writer_count()),
            ));
        }
        if self.file.reader_count() != 0 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                format!("writer co-exists with {} reader(s)", self.file.reader_count()),
            ));
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open {
            return Err(Error::new(ErrorKind::WriterNotOpen, "writer is closed"));
        }
        self.file.usable()
    }

    /// Flushes the pending packet when the next record would overflow the
    /// packet or one of its bytestream length fields.
    fn make_room_for(&mut self, values: &[FieldValue]) -> Result<()> {
        if self.projected_len(values) <= MAX_PACKET_LEN && self.streams_fit(values) {
            return Ok(());
        }
        if self.records_in_packet > 0 {
            self.flush_packet()?;
        }
        if self.projected_len(values) > MAX_PACKET_LEN || !self.streams_fit(values) {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                "a single record does not fit one data packet",
            ));
        }
        Ok(())
    }

    fn projected_len(&self, values: &[FieldValue]) -> usize {
        let streams: usize = self
            .encoders
            .iter()
            .zip(values.iter())
            .map(|(encoder, value)| encoder.stream_len_with(value))
            .sum();
        DATA_HEADER_LEN + 2 * self.fields.len() + streams
    }

    fn streams_fit(&self, values: &[FieldValue]) -> bool {
        self.encoders
            .iter()
            .zip(values.iter())
            .all(|(encoder, value)| encoder.stream_len_with(value) <= usize::from(u16::MAX))
    }

    fn flush_packet(&mut self) -> Result<()> {
        if self.records_in_packet == 0 {
            return Ok(());
        }
        let streams: Vec<Vec<u8>> =
            self.encoders.iter_mut().map(FieldEncoder::take_stream).collect();
        let bytes = DataPacket { streams }.encode()?;
        self.file.write_at(self.cursor, &bytes)?;
        debug!(
            "data packet: {} record(s), {} bytes at {}",
            self.records_in_packet,
            bytes.len(),
            self.cursor
        );
        self.index
            .push(IndexEntry { record_index: self.packet_first_record, offset: self.cursor });
        self.cursor = align_up(self.cursor + bytes.len() as u64, self.payload);
        self.packet_first_record = self.total_records;
        self.records_in_packet = 0;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.flush_packet()?;
        let index_offset = self.cursor;
        for entries in self.index.chunks(MAX_INDEX_ENTRIES) {
            let bytes = encode_index_packet(entries);
            self.file.write_at(self.cursor, &bytes)?;
            self.cursor = align_up(self.cursor + bytes.len() as u64, self.payload);
        }
        let header = SectionHeader {
            section_length: self.cursor - self.section_start,
            data_offset: align_up(self.section_start + SECTION_HEADER_LEN as u64, self.payload),
            index_offset,
            record_count: self.total_records,
        };
        self.file.write_at(self.section_start, &header.to_bytes())?;
        self.node.cv_set_record_count(self.total_records);
        self.file.extend_end(self.cursor);
        self.file.flush_paged()?;
        debug!(
            "writer closed: {} record(s) in {} packet(s)",
            self.total_records,
            self.index.len()
        );
        Ok(())
    }
}

impl Drop for CompressedVectorWriter {
    fn drop(&mut self) {
        if self.open {
            warn!("compressed vector writer dropped without close; cancelling");
            self.open = false;
            self.file.end_write();
        }
    }
}
