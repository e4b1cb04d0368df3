use e57lite::codec::bitpack::{BitCursor, BitWriter};
use e57lite::{shared_buffer, ImageFile, Node, SourceDestBuffer};
use proptest::prelude::*;
use tempfile::tempdir;

fn bounded_values() -> impl Strategy<Value = (i64, i64, Vec<i64>)> {
    (any::<i32>().prop_map(i64::from), 0i64..4096).prop_flat_map(|(min, width)| {
        let max = min + width;
        (Just(min), Just(max), proptest::collection::vec(min..=max, 1..200))
    })
}

fn write_and_read(min: i64, max: i64, values: &[i64]) -> Vec<i64> {
    let dir = tempdir().unwrap();
    let file = ImageFile::create(&dir.path().join("prop.e57")).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, min, min, max).unwrap()).unwrap();
    let codecs = Node::vector(&file, true).unwrap();
    let cv = Node::compressed_vector(&file, &proto, &codecs).unwrap();
    file.root().unwrap().set("points", &cv).unwrap();

    let src = shared_buffer(values.to_vec());
    let mut writer =
        cv.writer(&[SourceDestBuffer::i64("v", src, values.len()).unwrap()]).unwrap();
    writer.write(values.len()).unwrap();
    writer.close().unwrap();

    let dst = shared_buffer(vec![0i64; values.len()]);
    let mut reader =
        cv.reader(&[SourceDestBuffer::i64("v", dst.clone(), values.len()).unwrap()]).unwrap();
    assert_eq!(reader.read().unwrap(), values.len() as u64);
    assert_eq!(reader.read().unwrap(), 0);
    reader.close().unwrap();
    file.close().unwrap();
    let out = dst.read().clone();
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any in-range record sequence survives a write/read cycle bit for bit.
    #[test]
    fn prop_integer_round_trip((min, max, values) in bounded_values()) {
        let back = write_and_read(min, max, &values);
        prop_assert_eq!(back, values);
    }

    /// Seeking to any record yields the same suffix a sequential read
    /// would, after discarding the prefix.
    #[test]
    fn prop_seek_equals_discarding((min, max, values) in bounded_values(), frac in 0.0f64..=1.0) {
        let dir = tempdir().unwrap();
        let file = ImageFile::create(&dir.path().join("seek.e57")).unwrap();
        let proto = Node::structure(&file).unwrap();
        proto.set("v", &Node::integer(&file, min, min, max).unwrap()).unwrap();
        let codecs = Node::vector(&file, true).unwrap();
        let cv = Node::compressed_vector(&file, &proto, &codecs).unwrap();
        file.root().unwrap().set("points", &cv).unwrap();

        let src = shared_buffer(values.clone());
        let mut writer =
            cv.writer(&[SourceDestBuffer::i64("v", src, values.len()).unwrap()]).unwrap();
        writer.write(values.len()).unwrap();
        writer.close().unwrap();

        let start = ((values.len() as f64) * frac) as usize;
        let start = start.min(values.len());
        let dst = shared_buffer(vec![0i64; values.len()]);
        let mut reader = cv
            .reader(&[SourceDestBuffer::i64("v", dst.clone(), values.len()).unwrap()])
            .unwrap();
        reader.seek(start as u64).unwrap();
        let n = reader.read().unwrap() as usize;
        prop_assert_eq!(n, values.len() - start);
        prop_assert_eq!(&dst.read()[..n], &values[start..]);
        reader.close().unwrap();
        file.close().unwrap();
    }

    /// ScaledInteger: raw values are exact, scaled delivery equals
    /// raw * scale + offset.
    #[test]
    fn prop_scaled_delivery(
        raws in proptest::collection::vec(-100_000i64..=100_000, 1..100),
        scale_pick in 0usize..3,
        offset in -50i64..=50,
    ) {
        let scale = [0.001, 0.01, 2.5][scale_pick];
        let offset = offset as f64;
        let dir = tempdir().unwrap();
        let file = ImageFile::create(&dir.path().join("scaled.e57")).unwrap();
        let proto = Node::structure(&file).unwrap();
        proto.set(
            "d",
            &Node::scaled_integer(&file, 0, -100_000, 100_000, scale, offset).unwrap(),
        ).unwrap();
        let codecs = Node::vector(&file, true).unwrap();
        let cv = Node::compressed_vector(&file, &proto, &codecs).unwrap();
        file.root().unwrap().set("points", &cv).unwrap();

        let src = shared_buffer(raws.clone());
        let mut writer =
            cv.writer(&[SourceDestBuffer::i64("d", src, raws.len()).unwrap()]).unwrap();
        writer.write(raws.len()).unwrap();
        writer.close().unwrap();

        let dst = shared_buffer(vec![0f64; raws.len()]);
        let buffers = vec![
            SourceDestBuffer::f64("d", dst.clone(), raws.len()).unwrap().with_scaling(),
        ];
        let mut reader = cv.reader(&buffers).unwrap();
        prop_assert_eq!(reader.read().unwrap(), raws.len() as u64);
        reader.close().unwrap();
        for (out, raw) in dst.read().iter().zip(raws.iter()) {
            let want = *raw as f64 * scale + offset;
            prop_assert!((out - want).abs() <= want.abs() * 1e-12 + 1e-12);
        }
        file.close().unwrap();
    }
}

proptest! {
    /// A field whose range is 2^k wide packs at exactly k bits per record.
    #[test]
    fn prop_bit_packing_is_exact(
        k in 0u32..=16,
        values in proptest::collection::vec(any::<u64>(), 1..200),
    ) {
        let mask = if k == 0 { 0 } else { (1u64 << k) - 1 };
        let masked: Vec<u64> = values.iter().map(|v| v & mask).collect();
        let mut writer = BitWriter::new();
        for v in &masked {
            writer.push(*v, k);
        }
        prop_assert_eq!(writer.byte_len(), (masked.len() * k as usize).div_ceil(8));
        let mut cursor = BitCursor::new(writer.take());
        for v in &masked {
            prop_assert_eq!(cursor.read(k), Some(*v));
        }
    }
}
