use e57lite::codec::packet::{align_up, packet_length, DataPacket, SectionHeader, SECTION_HEADER_LEN};
use e57lite::paged::{PagedFile, DEFAULT_PAGE_SIZE};
use e57lite::{
    shared_buffer, ErrorKind, FloatPrecision, ImageFile, Node, SourceDestBuffer,
};
use rand::Rng;
use std::io::{Read, Seek, SeekFrom, Write};
use tempfile::tempdir;

const PAYLOAD: u64 = (DEFAULT_PAGE_SIZE - 4) as u64;

fn attach_cv(file: &ImageFile, proto: &Node) -> Node {
    let codecs = Node::vector(file, true).unwrap();
    let cv = Node::compressed_vector(file, proto, &codecs).unwrap();
    file.root().unwrap().set("points", &cv).unwrap();
    cv
}

/// 1000 records of one Integer field in [0, 1023] pack at
/// ten bits per value into a single 1250-byte bytestream.
#[test]
fn thousand_integers_pack_at_ten_bits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ten_bits.e57");
    let file = ImageFile::create(&path).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 1023).unwrap()).unwrap();
    let cv = attach_cv(&file, &proto);

    let values: Vec<i64> = (0..1000).collect();
    let src = shared_buffer(values.clone());
    let mut writer =
        cv.writer(&[SourceDestBuffer::i64("v", src, 1000).unwrap()]).unwrap();
    writer.write(1000).unwrap();
    writer.close().unwrap();
    assert_eq!(cv.record_count().unwrap(), 1000);
    let section_offset = cv.data_packet_offset().unwrap();

    let dst = shared_buffer(vec![0i64; 1000]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("v", dst.clone(), 1000).unwrap()]).unwrap();
    assert_eq!(reader.read().unwrap(), 1000);
    assert_eq!(reader.read().unwrap(), 0);
    reader.close().unwrap();
    assert_eq!(&*dst.read(), &values);
    file.close().unwrap();

    // inspect the written layout: one data packet, payload 1250 bytes
    let mut paged = PagedFile::open(&path, DEFAULT_PAGE_SIZE).unwrap();
    let mut raw = [0u8; SECTION_HEADER_LEN];
    paged.read_logical(section_offset, &mut raw).unwrap();
    let section = SectionHeader::from_bytes(&raw).unwrap();
    assert_eq!(section.record_count, 1000);
    assert_eq!(section.data_offset % PAYLOAD, 0);

    let mut prefix = [0u8; 4];
    paged.read_logical(section.data_offset, &mut prefix).unwrap();
    let length = packet_length(&prefix).unwrap();
    let mut bytes = vec![0u8; length];
    paged.read_logical(section.data_offset, &mut bytes).unwrap();
    let packet = DataPacket::decode(&bytes, 1).unwrap();
    assert_eq!(packet.streams[0].len(), (1000 * 10usize).div_ceil(8));
    assert_eq!(packet.streams[0].len(), 1250);
    // the index begins right after this single packet
    assert_eq!(align_up(section.data_offset + length as u64, PAYLOAD), section.index_offset);
}

/// ScaledInteger written and read as f64 with scaling;
/// raw values are exact, scaled delivery matches raw * 0.001.
#[test]
fn scaled_integer_round_trips_through_doubles() {
    let dir = tempdir().unwrap();
    let file = ImageFile::create(&dir.path().join("scaled.e57")).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto
        .set("d", &Node::scaled_integer(&file, 0, -1000, 1000, 0.001, 0.0).unwrap())
        .unwrap();
    let cv = attach_cv(&file, &proto);

    let raws: Vec<i64> = (-1000..=1000).collect();
    let scaled: Vec<f64> = raws.iter().map(|r| *r as f64 * 0.001).collect();
    let src = shared_buffer(scaled.clone());
    let buffers =
        vec![SourceDestBuffer::f64("d", src, raws.len()).unwrap().with_scaling()];
    let mut writer = cv.writer(&buffers).unwrap();
    writer.write(raws.len()).unwrap();
    writer.close().unwrap();

    // raw readback is exact
    let raw_dst = shared_buffer(vec![0i64; raws.len()]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("d", raw_dst.clone(), raws.len()).unwrap()]).unwrap();
    assert_eq!(reader.read().unwrap(), raws.len() as u64);
    reader.close().unwrap();
    assert_eq!(&*raw_dst.read(), &raws);

    // scaled delivery is exact to 1e-12
    let dst = shared_buffer(vec![0f64; raws.len()]);
    let buffers =
        vec![SourceDestBuffer::f64("d", dst.clone(), raws.len()).unwrap().with_scaling()];
    let mut reader = cv.reader(&buffers).unwrap();
    assert_eq!(reader.read().unwrap(), raws.len() as u64);
    reader.close().unwrap();
    for (out, want) in dst.read().iter().zip(scaled.iter()) {
        assert!((out - want).abs() < 1e-12, "{out} != {want}");
    }
    file.close().unwrap();
}

/// Two fields, 10000 random records, read back in two
/// half-capacity calls; the third read reports end of stream.
#[test]
fn two_field_stream_reads_in_halves() {
    let dir = tempdir().unwrap();
    let file = ImageFile::create(&dir.path().join("pairs.e57")).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto
        .set("id", &Node::integer(&file, 0, 0, i64::from(i32::MAX)).unwrap())
        .unwrap();
    proto
        .set("x", &Node::float(&file, 0.0, FloatPrecision::Single, -1000.0, 1000.0).unwrap())
        .unwrap();
    let cv = attach_cv(&file, &proto);

    let mut rng = rand::rng();
    let ids: Vec<i64> = (0..10000).map(|_| rng.random_range(0..=i64::from(i32::MAX))).collect();
    let xs: Vec<f32> = (0..10000).map(|_| rng.random_range(-1000.0f32..1000.0)).collect();

    let id_src = shared_buffer(ids[..5000].to_vec());
    let x_src = shared_buffer(xs[..5000].to_vec());
    let buffers = vec![
        SourceDestBuffer::i64("id", id_src.clone(), 5000).unwrap(),
        SourceDestBuffer::f32("x", x_src.clone(), 5000).unwrap(),
    ];
    let mut writer = cv.writer(&buffers).unwrap();
    writer.write(5000).unwrap();
    *id_src.write() = ids[5000..].to_vec();
    *x_src.write() = xs[5000..].to_vec();
    writer.write(5000).unwrap();
    writer.close().unwrap();
    assert_eq!(cv.record_count().unwrap(), 10000);

    let id_dst = shared_buffer(vec![0i64; 5000]);
    let x_dst = shared_buffer(vec![0f32; 5000]);
    let buffers = vec![
        SourceDestBuffer::i64("id", id_dst.clone(), 5000).unwrap(),
        SourceDestBuffer::f32("x", x_dst.clone(), 5000).unwrap(),
    ];
    let mut reader = cv.reader(&buffers).unwrap();
    assert_eq!(reader.read().unwrap(), 5000);
    assert_eq!(&*id_dst.read(), &ids[..5000]);
    assert_eq!(&*x_dst.read(), &xs[..5000]);
    assert_eq!(reader.read().unwrap(), 5000);
    assert_eq!(&*id_dst.read(), &ids[5000..]);
    assert_eq!(&*x_dst.read(), &xs[5000..]);
    assert_eq!(reader.read().unwrap(), 0);
    assert_eq!(reader.read().unwrap(), 0);
    reader.close().unwrap();
    file.close().unwrap();
}

/// Seeking anywhere in the stream yields the same records a sequential
/// read would.
#[test]
fn seek_matches_sequential_reading() {
    let dir = tempdir().unwrap();
    let file = ImageFile::create(&dir.path().join("seek.e57")).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 1023).unwrap()).unwrap();
    let cv = attach_cv(&file, &proto);

    let values: Vec<i64> = (0..1000).map(|i| (i * 7) % 1024).collect();
    let src = shared_buffer(values.clone());
    let mut writer =
        cv.writer(&[SourceDestBuffer::i64("v", src, 1000).unwrap()]).unwrap();
    writer.write(1000).unwrap();
    writer.close().unwrap();

    let dst = shared_buffer(vec![0i64; 100]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("v", dst.clone(), 100).unwrap()]).unwrap();

    for start in [0u64, 1, 437, 900, 999] {
        reader.seek(start).unwrap();
        let n = reader.read().unwrap();
        let want = 100u64.min(1000 - start);
        assert_eq!(n, want);
        assert_eq!(
            &dst.read()[..n as usize],
            &values[start as usize..(start + n) as usize]
        );
    }

    // seeking to the record count parks the stream at its end
    reader.seek(1000).unwrap();
    assert_eq!(reader.read().unwrap(), 0);
    // and one past it is an argument error that does not sicken the reader
    assert_eq!(reader.seek(1001).unwrap_err().kind(), ErrorKind::BadApiArgument);
    reader.seek(0).unwrap();
    assert_eq!(reader.read().unwrap(), 100);
    reader.close().unwrap();
    file.close().unwrap();
}

/// A flipped payload byte surfaces as BadChecksum on the
/// first read that crosses the page, and the container sickens.
#[test]
fn corruption_is_caught_by_the_page_checksums() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("corrupt.e57");
    let file = ImageFile::create(&path).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 1023).unwrap()).unwrap();
    let cv = attach_cv(&file, &proto);
    let src = shared_buffer((0i64..1000).collect::<Vec<_>>());
    let mut writer =
        cv.writer(&[SourceDestBuffer::i64("v", src, 1000).unwrap()]).unwrap();
    writer.write(1000).unwrap();
    writer.close().unwrap();
    let section_offset = cv.data_packet_offset().unwrap();
    file.close().unwrap();

    // flip one payload byte in the page holding the first data packet
    let first_packet = align_up(section_offset + SECTION_HEADER_LEN as u64, PAYLOAD);
    let page = first_packet / PAYLOAD;
    let physical = page * DEFAULT_PAGE_SIZE as u64 + 50;
    let mut raw = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
    raw.seek(SeekFrom::Start(physical)).unwrap();
    let mut byte = [0u8; 1];
    raw.read_exact(&mut byte).unwrap();
    raw.seek(SeekFrom::Start(physical)).unwrap();
    raw.write_all(&[byte[0] ^ 0xff]).unwrap();
    drop(raw);

    // opening only touches page 0, so it succeeds
    let file = ImageFile::open(&path).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 1023).unwrap()).unwrap();
    let codecs = Node::vector(&file, true).unwrap();
    let cv =
        Node::compressed_vector_at(&file, &proto, &codecs, section_offset, 1000).unwrap();
    file.root().unwrap().set("points", &cv).unwrap();

    let dst = shared_buffer(vec![0i64; 1000]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("v", dst, 1000).unwrap()]).unwrap();
    assert_eq!(reader.read().unwrap_err().kind(), ErrorKind::BadChecksum);
    // the whole container is sick now
    assert_eq!(reader.read().unwrap_err().kind(), ErrorKind::ImageFileNotOpen);
    assert_eq!(file.root().unwrap_err().kind(), ErrorKind::ImageFileNotOpen);
    reader.close().unwrap();
}

/// An out-of-bounds record is rejected before any bit is
/// buffered; the writer stays open and accepts the corrected record.
#[test]
fn out_of_bounds_records_do_not_disturb_the_stream() {
    let dir = tempdir().unwrap();
    let file = ImageFile::create(&dir.path().join("bounds.e57")).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 10).unwrap()).unwrap();
    let cv = attach_cv(&file, &proto);

    let src = shared_buffer(vec![3i64, 11]);
    let buffers = vec![SourceDestBuffer::i64("v", src.clone(), 2).unwrap()];
    let mut writer = cv.writer(&buffers).unwrap();
    // record 1 is out of bounds, so the whole call is rejected
    assert_eq!(writer.write(2).unwrap_err().kind(), ErrorKind::ValueOutOfBounds);
    assert!(writer.is_open());
    src.write()[1] = 5;
    writer.write(2).unwrap();
    writer.close().unwrap();
    assert_eq!(cv.record_count().unwrap(), 2);

    let dst = shared_buffer(vec![0i64; 2]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("v", dst.clone(), 2).unwrap()]).unwrap();
    assert_eq!(reader.read().unwrap(), 2);
    assert_eq!(&*dst.read(), &[3, 5]);
    reader.close().unwrap();
    file.close().unwrap();
}
