#![forbid(unsafe_code)]

//! Core engine of an E57-style container: a typed node tree over a paged,
//! CRC-32C-checksummed file image, with compressed-vector record streams
//! read and written through caller-bound transfer buffers.

pub mod codec;
pub mod errors;
pub mod logger;
pub mod node;
pub mod paged;
pub mod stream;
pub mod types;

pub use errors::{Error, ErrorKind, Result};
pub use node::Node;
pub use stream::{
    shared_buffer, CompressedVectorReader, CompressedVectorWriter, SharedBuffer, SourceDestBuffer,
};
pub use types::{FloatPrecision, MemoryKind, NodeType};

use crate::codec::packet::align_up;
use crate::node::core::{NodeBody, NodeKind, NodeRef};
use crate::paged::header::HEADER_LEN;
use crate::paged::{FileHeader, PagedFile, CHECKSUM_LEN, DEFAULT_PAGE_SIZE};
use log::{debug, warn};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::{Arc, Weak};

/// Mutable container state, all behind one lock: the page layer, the tree
/// root, the handle counts, and the sickness marker.
pub(crate) struct FileState {
    paged: Option<PagedFile>,
    writable: bool,
    root: Option<NodeRef>,
    reader_count: usize,
    writer_count: usize,
    sick: Option<Error>,
    /// Allocation cursor for binary sections and blobs.
    logical_end: u64,
    page_size: u64,
}

pub(crate) struct ImageFileInner {
    state: RwLock<FileState>,
}

impl ImageFileInner {
    fn new(paged: PagedFile, writable: bool, logical_end: u64) -> Arc<Self> {
        let page_size = paged.page_size() as u64;
        let inner = Arc::new(Self {
            state: RwLock::new(FileState {
                paged: Some(paged),
                writable,
                root: None,
                reader_count: 0,
                writer_count: 0,
                sick: None,
                logical_end,
                page_size,
            }),
        });
        let root = Arc::new(RwLock::new(NodeBody {
            element_name: String::new(),
            parent: Weak::new(),
            file: Arc::downgrade(&inner),
            attached: true,
            kind: NodeKind::Structure { children: Vec::new() },
        }));
        inner.state.write().root = Some(root);
        inner
    }

    /// Open and healthy, the precondition of every handle operation.
    pub(crate) fn usable(&self) -> Result<()> {
        let state = self.state.read();
        if state.paged.is_none() {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
        }
        if let Some(original) = &state.sick {
            return Err(Error::new(
                ErrorKind::ImageFileNotOpen,
                format!("container is sick: {original}"),
            ));
        }
        Ok(())
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.read().paged.is_some()
    }

    pub(crate) fn is_container_root(&self, node: &NodeRef) -> bool {
        self.state.read().root.as_ref().is_some_and(|root| Arc::ptr_eq(root, node))
    }

    pub(crate) fn payload_size(&self) -> Result<u64> {
        self.usable()?;
        Ok(self.state.read().page_size - CHECKSUM_LEN as u64)
    }

    pub(crate) fn reader_count(&self) -> usize {
        self.state.read().reader_count
    }

    pub(crate) fn writer_count(&self) -> usize {
        self.state.read().writer_count
    }

    pub(crate) fn mark_sick(&self, error: &Error) {
        let mut state = self.state.write();
        if state.sick.is_none() {
            warn!("container sick: {error}");
            state.sick = Some(error.clone());
        }
    }

    /// Claims the single writer slot.
    pub(crate) fn begin_write(&self) -> Result<()> {
        let mut state = self.state.write();
        check_state(&state)?;
        if !state.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "container opened read-only"));
        }
        if state.writer_count > 0 || state.reader_count > 0 {
            return Err(Error::new(
                ErrorKind::TooManyWriters,
                format!(
                    "{} writer(s) and {} reader(s) already open",
                    state.writer_count, state.reader_count
                ),
            ));
        }
        state.writer_count = 1;
        Ok(())
    }

    pub(crate) fn end_write(&self) {
        let mut state = self.state.write();
        state.writer_count = state.writer_count.saturating_sub(1);
    }

    /// Claims a reader slot; any number may coexist, but none with a
    /// writer.
    pub(crate) fn begin_read(&self) -> Result<()> {
        let mut state = self.state.write();
        check_state(&state)?;
        if state.writer_count > 0 {
            return Err(Error::new(
                ErrorKind::TooManyReaders,
                "a writer is open on this container",
            ));
        }
        state.reader_count += 1;
        Ok(())
    }

    pub(crate) fn end_read(&self) {
        let mut state = self.state.write();
        state.reader_count = state.reader_count.saturating_sub(1);
    }

    /// Reserves a page-aligned binary section start.
    pub(crate) fn allocate_section(&self) -> Result<u64> {
        let mut state = self.state.write();
        check_state(&state)?;
        let payload = state.page_size - CHECKSUM_LEN as u64;
        let start = align_up(state.logical_end, payload);
        state.logical_end = start + codec::packet::SECTION_HEADER_LEN as u64;
        Ok(start)
    }

    /// Reserves and zero-fills a blob byte run.
    pub(crate) fn allocate_blob(&self, length: u64) -> Result<u64> {
        let mut state = self.state.write();
        check_state(&state)?;
        if !state.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "container opened read-only"));
        }
        if state.writer_count > 0 {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                "cannot allocate a blob while a compressed vector writer is open",
            ));
        }
        let start = state.logical_end;
        state.logical_end += length;
        let Some(paged) = state.paged.as_mut() else {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
        };
        let zeros = vec![0u8; 65536.min(length as usize).max(1)];
        let mut written = 0u64;
        while written < length {
            let chunk = (zeros.len() as u64).min(length - written) as usize;
            paged.write_logical(start + written, &zeros[..chunk])?;
            written += chunk as u64;
        }
        Ok(start)
    }

    pub(crate) fn extend_end(&self, end: u64) {
        let mut state = self.state.write();
        state.logical_end = state.logical_end.max(end);
    }

    /// Checksummed read at a logical offset; a fatal failure poisons the
    /// container.
    pub(crate) fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.write();
        check_state(&state)?;
        let Some(paged) = state.paged.as_mut() else {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
        };
        let result = paged.read_logical(offset, buf);
        if let Err(e) = &result
            && e.kind().is_file_fatal()
        {
            warn!("container sick: {e}");
            state.sick = Some(e.clone());
        }
        result
    }

    /// Buffered write at a logical offset; a fatal failure poisons the
    /// container.
    pub(crate) fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        check_state(&state)?;
        if !state.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "container opened read-only"));
        }
        let Some(paged) = state.paged.as_mut() else {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
        };
        let result = paged.write_logical(offset, data);
        if let Err(e) = &result
            && e.kind().is_file_fatal()
        {
            warn!("container sick: {e}");
            state.sick = Some(e.clone());
        }
        result
    }

    /// Seals and writes out every dirty page.
    pub(crate) fn flush_paged(&self) -> Result<()> {
        let mut state = self.state.write();
        check_state(&state)?;
        let Some(paged) = state.paged.as_mut() else {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
        };
        let result = paged.flush();
        if let Err(e) = &result
            && e.kind().is_file_fatal()
        {
            warn!("container sick: {e}");
            state.sick = Some(e.clone());
        }
        result
    }
}

fn check_state(state: &FileState) -> Result<()> {
    if state.paged.is_none() {
        return Err(Error::new(ErrorKind::ImageFileNotOpen, "container is closed"));
    }
    if let Some(original) = &state.sick {
        return Err(Error::new(
            ErrorKind::ImageFileNotOpen,
            format!("container is sick: {original}"),
        ));
    }
    Ok(())
}

/// The container: a paged file image, its tree root, and the bookkeeping
/// shared by every handle derived from it. Cloning shares the container.
#[derive(Clone)]
pub struct ImageFile {
    inner: Arc<ImageFileInner>,
}

impl ImageFile {
    /// Creates a new writable container at `path`, truncating any existing
    /// file, and writes the fixed header into page 0.
    ///
    /// # Errors
    /// `WriteFailed` when the file cannot be created or seeded.
    pub fn create(path: &Path) -> Result<Self> {
        let mut paged = PagedFile::create(path, DEFAULT_PAGE_SIZE)?;
        let header = FileHeader::new(DEFAULT_PAGE_SIZE as u64);
        paged.write_logical(0, &header.to_bytes())?;
        debug!("created container {}", path.display());
        Ok(Self { inner: ImageFileInner::new(paged, true, HEADER_LEN as u64) })
    }

    /// Opens an existing container read-only, validating its header
    /// through the page layer (so page 0's checksum is verified).
    ///
    /// # Errors
    /// `ReadFailed` on a bad signature, version, or page size;
    /// `BadChecksum` when page 0 is corrupt.
    pub fn open(path: &Path) -> Result<Self> {
        let probed = FileHeader::probe(path)?;
        let mut paged = PagedFile::open(path, probed.page_size as usize)?;
        let mut raw = [0u8; HEADER_LEN];
        paged.read_logical(0, &mut raw)?;
        FileHeader::from_bytes(&raw)?;
        let logical_end = paged.logical_len();
        debug!("opened container {} ({} logical bytes)", path.display(), logical_end);
        Ok(Self { inner: ImageFileInner::new(paged, false, logical_end) })
    }

    pub(crate) fn from_inner(inner: Arc<ImageFileInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ImageFileInner> {
        &self.inner
    }

    /// The Structure node at the root of this container's tree.
    ///
    /// # Errors
    /// `ImageFileNotOpen` after close or on a sick container.
    pub fn root(&self) -> Result<Node> {
        self.inner.usable()?;
        let state = self.inner.state.read();
        state
            .root
            .clone()
            .map(Node::from_ref)
            .ok_or_else(|| Error::internal("open container without a root"))
    }

    /// Closes the container: patches the physical-length header field,
    /// flushes every dirty page, and invalidates all derived handles.
    /// Idempotent.
    ///
    /// # Errors
    /// `BadAPIArgument` while readers or writers remain open; the page
    /// layer's I/O kinds when the final flush fails (the container closes
    /// regardless).
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.paged.is_none() {
            return Ok(());
        }
        if state.reader_count > 0 || state.writer_count > 0 {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!(
                    "cannot close: {} reader(s) and {} writer(s) still open",
                    state.reader_count, state.writer_count
                ),
            ));
        }
        let mut result = Ok(());
        if state.writable && state.sick.is_none() {
            let page_size = state.page_size;
            if let Some(paged) = state.paged.as_mut() {
                let mut header = FileHeader::new(page_size);
                header.physical_length = paged.physical_len();
                result = paged
                    .write_logical(0, &header.to_bytes())
                    .and_then(|()| paged.flush());
            }
        }
        state.paged = None;
        state.root = None;
        debug!("container closed");
        result
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        let state = self.inner.state.read();
        state.paged.is_some() && state.writable
    }

    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.inner.reader_count()
    }

    #[must_use]
    pub fn writer_count(&self) -> usize {
        self.inner.writer_count()
    }

    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.inner.state.read().page_size
    }

    /// Verifies the externally visible container invariants, optionally
    /// recursing over the whole tree.
    ///
    /// # Errors
    /// `InvarianceViolation` naming the violated predicate.
    pub fn check_invariant(&self, do_recurse: bool) -> Result<()> {
        let root = {
            let state = self.inner.state.read();
            if state.paged.is_none() {
                return Ok(());
            }
            if state.writer_count > 1 {
                return Err(Error::new(
                    ErrorKind::InvarianceViolation,
                    format!("writer count {} exceeds one", state.writer_count),
                ));
            }
            if state.writer_count > 0 && state.reader_count > 0 {
                return Err(Error::new(
                    ErrorKind::InvarianceViolation,
                    "a writer co-exists with readers",
                ));
            }
            state.root.clone()
        };
        if let Some(root) = root {
            if !root.read().attached {
                return Err(Error::new(
                    ErrorKind::InvarianceViolation,
                    "container root is not attached",
                ));
            }
            if do_recurse {
                Node::from_ref(root).check_invariant(true)?;
            }
        }
        Ok(())
    }
}
