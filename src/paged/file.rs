use crate::errors::{Error, ErrorKind, Result};
use crate::paged::page::{page_checksum, verify_page, CHECKSUM_LEN};
use log::{debug, trace};
use lru::LruCache;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

const DEFAULT_CACHE_PAGES: usize = 256;

/// Random-access file image built from fixed-size pages, each sealed with a
/// trailing CRC-32C. Callers address a contiguous logical byte stream; the
/// page layer maps it onto physical pages, verifies checksums on read and
/// computes them when dirty pages are flushed.
pub struct PagedFile {
    file: File,
    page_size: usize,
    writable: bool,
    /// Pages physically present on disk.
    disk_pages: u64,
    /// Logical page count, dirty pages beyond the disk image included.
    pages: u64,
    /// Modified payloads awaiting flush, keyed by page index.
    dirty: BTreeMap<u64, Vec<u8>>,
    /// Verified payloads from the read path.
    cache: LruCache<u64, Vec<u8>>,
}

impl PagedFile {
    /// Creates (truncating) a writable container image.
    ///
    /// # Errors
    /// Returns `WriteFailed` if the file cannot be created.
    pub fn create(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::write_failed(&e))?;
        Ok(Self::with_file(file, page_size, true, 0))
    }

    /// Opens an existing container image read-only.
    ///
    /// # Errors
    /// Returns `ReadFailed` if the file cannot be opened or its length is
    /// not a whole number of pages.
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path).map_err(|e| Error::read_failed(&e))?;
        let len = file.metadata().map_err(|e| Error::read_failed(&e))?.len();
        if len % page_size as u64 != 0 {
            return Err(Error::new(
                ErrorKind::ReadFailed,
                format!("file length {len} is not a multiple of the page size {page_size}"),
            ));
        }
        let disk_pages = len / page_size as u64;
        Ok(Self::with_file(file, page_size, false, disk_pages))
    }

    fn with_file(file: File, page_size: usize, writable: bool, disk_pages: u64) -> Self {
        let cap = NonZeroUsize::new(DEFAULT_CACHE_PAGES)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            file,
            page_size,
            writable,
            disk_pages,
            pages: disk_pages,
            dirty: BTreeMap::new(),
            cache: LruCache::new(cap),
        }
    }

    /// Resizes the read cache. Capacity is clamped to at least one page.
    pub fn set_cache_capacity(&mut self, pages: usize) {
        let cap = NonZeroUsize::new(pages.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.cache.resize(cap);
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Usable bytes per page.
    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.page_size - CHECKSUM_LEN
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Upper bound of the logical byte stream.
    #[must_use]
    pub const fn logical_len(&self) -> u64 {
        self.pages * self.payload_size() as u64
    }

    /// Physical file length once all pages are flushed.
    #[must_use]
    pub const fn physical_len(&self) -> u64 {
        self.pages * self.page_size as u64
    }

    /// Reads `buf.len()` bytes starting at a logical offset, verifying the
    /// checksum of every page crossed.
    ///
    /// # Errors
    /// `ReadFailed` past the end of the image, `BadChecksum` on a corrupt
    /// page.
    pub fn read_logical(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let payload = self.payload_size() as u64;
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| Error::new(ErrorKind::ReadFailed, "logical offset overflow"))?;
        if end > self.logical_len() {
            return Err(Error::new(
                ErrorKind::ReadFailed,
                format!("read of {} bytes at logical offset {offset} past end", buf.len()),
            ));
        }
        let mut pos = 0usize;
        while pos < buf.len() {
            let at = offset + pos as u64;
            let page = at / payload;
            let in_page = (at % payload) as usize;
            let n = (payload as usize - in_page).min(buf.len() - pos);
            self.read_from_page(page, in_page, &mut buf[pos..pos + n])?;
            pos += n;
        }
        Ok(())
    }

    /// Writes bytes at a logical offset, extending the image as needed.
    /// Touched pages stay dirty until [`flush`](Self::flush).
    ///
    /// # Errors
    /// `FileReadOnly` on a read-only image.
    pub fn write_logical(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "container opened read-only"));
        }
        let payload = self.payload_size() as u64;
        let mut pos = 0usize;
        while pos < data.len() {
            let at = offset + pos as u64;
            let page = at / payload;
            let in_page = (at % payload) as usize;
            let n = (payload as usize - in_page).min(data.len() - pos);
            self.modify_page(page, in_page, &data[pos..pos + n])?;
            pos += n;
        }
        Ok(())
    }

    /// Seals every dirty page with its checksum and writes it out, then
    /// syncs file data.
    ///
    /// # Errors
    /// `SeekFailed`/`WriteFailed` on I/O errors.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let count = self.dirty.len();
        let dirty = std::mem::take(&mut self.dirty);
        for (page, data) in dirty {
            let crc = page_checksum(&data);
            self.file
                .seek(SeekFrom::Start(page * self.page_size as u64))
                .map_err(|e| Error::seek_failed(&e))?;
            self.file.write_all(&data).map_err(|e| Error::write_failed(&e))?;
            self.file.write_all(&crc.to_le_bytes()).map_err(|e| Error::write_failed(&e))?;
            self.disk_pages = self.disk_pages.max(page + 1);
            self.cache.put(page, data);
        }
        self.file.sync_data().map_err(|e| Error::write_failed(&e))?;
        debug!("flushed {count} page(s), image now {} pages", self.pages);
        Ok(())
    }

    fn read_from_page(&mut self, page: u64, start: usize, out: &mut [u8]) -> Result<()> {
        if let Some(data) = self.dirty.get(&page) {
            out.copy_from_slice(&data[start..start + out.len()]);
            return Ok(());
        }
        if let Some(data) = self.cache.get(&page) {
            out.copy_from_slice(&data[start..start + out.len()]);
            return Ok(());
        }
        let data = self.load_page(page)?;
        out.copy_from_slice(&data[start..start + out.len()]);
        self.cache.put(page, data);
        Ok(())
    }

    /// Reads and checksum-verifies one page from disk.
    fn load_page(&mut self, page: u64) -> Result<Vec<u8>> {
        if page >= self.disk_pages {
            return Err(Error::new(
                ErrorKind::ReadFailed,
                format!("page {page} beyond the {}-page disk image", self.disk_pages),
            ));
        }
        trace!("loading page {page}");
        self.file
            .seek(SeekFrom::Start(page * self.page_size as u64))
            .map_err(|e| Error::seek_failed(&e))?;
        let mut raw = vec![0u8; self.page_size];
        self.file.read_exact(&mut raw).map_err(|e| Error::read_failed(&e))?;
        let payload = verify_page(&raw, page)?;
        Ok(payload.to_vec())
    }

    fn modify_page(&mut self, page: u64, start: usize, chunk: &[u8]) -> Result<()> {
        if let Some(data) = self.dirty.get_mut(&page) {
            data[start..start + chunk.len()].copy_from_slice(chunk);
            return Ok(());
        }
        let mut data = if page < self.disk_pages {
            self.load_page(page)?
        } else {
            vec![0u8; self.payload_size()]
        };
        data[start..start + chunk.len()].copy_from_slice(chunk);
        self.cache.pop(&page);
        self.pages = self.pages.max(page + 1);
        self.dirty.insert(page, data);
        Ok(())
    }
}
