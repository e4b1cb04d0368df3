use e57lite::paged::header::{FileHeader, HEADER_LEN, SIGNATURE};
use e57lite::paged::{PagedFile, DEFAULT_PAGE_SIZE};
use e57lite::ErrorKind;
use std::io::{Seek, SeekFrom, Write};
use tempfile::tempdir;

#[test]
fn header_round_trip() {
    let header = FileHeader {
        physical_length: 10 * 1024,
        xml_offset: 0,
        xml_length: 0,
        page_size: DEFAULT_PAGE_SIZE as u64,
    };
    let bytes = header.to_bytes();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(&bytes[0..8], &SIGNATURE);
    assert_eq!(FileHeader::from_bytes(&bytes).unwrap(), header);

    let mut bad_magic = bytes;
    bad_magic[0] = b'X';
    assert_eq!(FileHeader::from_bytes(&bad_magic).unwrap_err().kind(), ErrorKind::ReadFailed);

    let mut bad_page = header;
    bad_page.page_size = 8;
    assert_eq!(
        FileHeader::from_bytes(&bad_page.to_bytes()).unwrap_err().kind(),
        ErrorKind::ReadFailed
    );
}

#[test]
fn logical_stream_round_trips_across_pages() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("paged.bin");
    let mut file = PagedFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
    assert_eq!(file.payload_size(), DEFAULT_PAGE_SIZE - 4);

    let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    // straddles four pages, starting mid-page
    file.write_logical(500, &data).unwrap();
    let mut back = vec![0u8; 4000];
    file.read_logical(500, &mut back).unwrap();
    assert_eq!(back, data);
    file.flush().unwrap();

    // read again after flush, through the cache and from disk
    let mut again = vec![0u8; 4000];
    file.read_logical(500, &mut again).unwrap();
    assert_eq!(again, data);

    // physical image is whole pages
    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len % DEFAULT_PAGE_SIZE as u64, 0);
    assert_eq!(len, file.physical_len());
}

#[test]
fn reads_verify_page_checksums() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.bin");
    let mut file = PagedFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
    file.write_logical(0, &vec![0xabu8; 3 * 1020]).unwrap();
    file.flush().unwrap();
    drop(file);

    // flip one payload byte of page 1
    let mut raw = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    raw.seek(SeekFrom::Start(1024 + 17)).unwrap();
    raw.write_all(&[0x00]).unwrap();
    drop(raw);

    let mut file = PagedFile::open(&path, DEFAULT_PAGE_SIZE).unwrap();
    // page 0 is intact
    let mut head = vec![0u8; 100];
    file.read_logical(0, &mut head).unwrap();
    // any read crossing page 1 fails
    let mut buf = vec![0u8; 2 * 1020];
    let err = file.read_logical(500, &mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadChecksum);
    assert!(err.context().contains("page 1"));
}

#[test]
fn reading_past_the_end_fails() {
    let dir = tempdir().unwrap();
    let mut file = PagedFile::create(&dir.path().join("short.bin"), DEFAULT_PAGE_SIZE).unwrap();
    file.write_logical(0, &[1, 2, 3]).unwrap();
    let mut buf = vec![0u8; 2000];
    assert_eq!(file.read_logical(0, &mut buf).unwrap_err().kind(), ErrorKind::ReadFailed);
}

#[test]
fn read_only_images_refuse_writes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ro.bin");
    let mut file = PagedFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
    file.write_logical(0, &[9u8; 64]).unwrap();
    file.flush().unwrap();
    drop(file);

    let mut file = PagedFile::open(&path, DEFAULT_PAGE_SIZE).unwrap();
    assert!(!file.is_writable());
    assert_eq!(file.write_logical(0, &[1]).unwrap_err().kind(), ErrorKind::FileReadOnly);
    let mut back = [0u8; 64];
    file.read_logical(0, &mut back).unwrap();
    assert_eq!(back, [9u8; 64]);
}
