use e57lite::{ErrorKind, FloatPrecision, ImageFile, Node, NodeType};
use tempfile::tempdir;

fn new_file(dir: &tempfile::TempDir, name: &str) -> ImageFile {
    ImageFile::create(&dir.path().join(name)).unwrap()
}

#[test]
fn integer_bounds_are_checked_eagerly() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    for v in -3i64..=3 {
        let node = Node::integer(&file, v, -3, 3).unwrap();
        assert_eq!(node.int_value().unwrap(), v);
        assert_eq!(node.int_minimum().unwrap(), -3);
        assert_eq!(node.int_maximum().unwrap(), 3);
    }
    for v in [-4i64, 4, i64::MAX] {
        let err = Node::integer(&file, v, -3, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueOutOfBounds);
    }
    let err = Node::integer(&file, 0, 3, -3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadApiArgument);
    file.close().unwrap();
}

#[test]
fn scaled_integer_accessors() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let node = Node::scaled_integer(&file, 500, -1000, 1000, 0.001, 2.0).unwrap();
    assert_eq!(node.node_type(), NodeType::ScaledInteger);
    assert_eq!(node.raw_value().unwrap(), 500);
    assert!((node.scaled_value().unwrap() - 2.5).abs() < 1e-12);
    assert!((node.scaled_minimum().unwrap() - 1.0).abs() < 1e-12);
    assert!((node.scaled_maximum().unwrap() - 3.0).abs() < 1e-12);
    assert_eq!(node.scale().unwrap(), 0.001);
    assert_eq!(node.offset().unwrap(), 2.0);
    let err = Node::scaled_integer(&file, 0, -1, 1, 0.0, 0.0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadApiArgument);
    file.close().unwrap();
}

#[test]
fn downcast_is_a_tag_check() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let node = Node::float(&file, 0.5, FloatPrecision::Double, 0.0, 1.0).unwrap();
    assert_eq!(node.float_value().unwrap(), 0.5);
    assert_eq!(node.precision().unwrap(), FloatPrecision::Double);
    assert_eq!(node.int_value().unwrap_err().kind(), ErrorKind::BadNodeDowncast);
    assert_eq!(node.string_value().unwrap_err().kind(), ErrorKind::BadNodeDowncast);
    assert_eq!(node.record_count().unwrap_err().kind(), ErrorKind::BadNodeDowncast);
    file.close().unwrap();
}

#[test]
fn structure_set_get_and_paths() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let root = file.root().unwrap();
    assert!(root.is_root());
    assert!(root.is_attached());
    assert_eq!(root.path_name(), "/");

    let pos = Node::structure(&file).unwrap();
    pos.set("x", &Node::integer(&file, 1, 0, 10).unwrap()).unwrap();
    pos.set("y", &Node::integer(&file, 2, 0, 10).unwrap()).unwrap();
    assert!(!pos.is_attached());
    root.set("pos", &pos).unwrap();
    assert!(pos.is_attached());
    assert!(pos.get("x").unwrap().is_attached());

    assert_eq!(pos.path_name(), "/pos");
    assert_eq!(root.get("pos/y").unwrap().int_value().unwrap(), 2);
    assert_eq!(root.get("pos/y").unwrap().path_name(), "/pos/y");
    assert_eq!(pos.get("/pos/x").unwrap().int_value().unwrap(), 1);
    assert_eq!(pos.child_count().unwrap(), 2);
    assert!(root.is_defined("pos/x"));
    assert!(!root.is_defined("pos/z"));
    assert_eq!(root.get("pos/z").unwrap_err().kind(), ErrorKind::PathUndefined);
    assert_eq!(pos.get_index(1).unwrap().element_name(), "y");
    assert_eq!(pos.parent().path_name(), "/");
    file.close().unwrap();
}

#[test]
fn set_rejects_bad_and_colliding_names() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let root = file.root().unwrap();
    let child = Node::integer(&file, 0, 0, 1).unwrap();
    for name in ["", "9lives", "a b", "a/b", "café"] {
        assert_eq!(root.set(name, &child).unwrap_err().kind(), ErrorKind::BadPathName);
    }
    root.set("a", &child).unwrap();
    let other = Node::integer(&file, 0, 0, 1).unwrap();
    assert_eq!(root.set("a", &other).unwrap_err().kind(), ErrorKind::BadPathName);
    file.close().unwrap();
}

#[test]
fn a_node_attaches_at_most_once() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let root = file.root().unwrap();
    let child = Node::integer(&file, 0, 0, 1).unwrap();
    root.set("a", &child).unwrap();
    assert_eq!(root.set("b", &child).unwrap_err().kind(), ErrorKind::AlreadyHasParent);

    let held = Node::structure(&file).unwrap();
    let inner = Node::integer(&file, 0, 0, 1).unwrap();
    held.set("v", &inner).unwrap();
    // parented but not yet attached still counts
    let err = root.set("c", &inner).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyHasParent);
    file.close().unwrap();
}

#[test]
fn attachment_is_per_container() {
    let dir = tempdir().unwrap();
    let file_a = new_file(&dir, "a.e57");
    let file_b = new_file(&dir, "b.e57");
    let stranger = Node::integer(&file_b, 0, 0, 1).unwrap();
    let err = file_a.root().unwrap().set("n", &stranger).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadApiArgument);
    assert!(file_b.root().unwrap().set("n", &stranger).is_ok());
    file_a.close().unwrap();
    file_b.close().unwrap();
}

#[test]
fn homogeneous_vectors_enforce_shape() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "nodes.e57");
    let vec = Node::vector(&file, false).unwrap();
    assert!(!vec.allow_hetero().unwrap());

    let make_pair = || {
        let s = Node::structure(&file).unwrap();
        s.set("a", &Node::integer(&file, 0, 0, 7).unwrap()).unwrap();
        s.set("b", &Node::ustring(&file, "t").unwrap()).unwrap();
        s
    };
    vec.append(&make_pair()).unwrap();
    vec.append(&make_pair()).unwrap();
    assert_eq!(vec.get("1/b").unwrap().string_value().unwrap(), "t");

    let odd = Node::structure(&file).unwrap();
    odd.set("a", &Node::integer(&file, 0, 0, 7).unwrap()).unwrap();
    assert_eq!(vec.append(&odd).unwrap_err().kind(), ErrorKind::BadApiArgument);

    let hetero = Node::vector(&file, true).unwrap();
    hetero.append(&Node::integer(&file, 1, 0, 1).unwrap()).unwrap();
    hetero.append(&Node::ustring(&file, "s").unwrap()).unwrap();
    assert_eq!(hetero.child_count().unwrap(), 2);
    file.close().unwrap();
}

#[test]
fn blob_round_trip_and_bounds() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "blob.e57");
    let blob = Node::blob(&file, 4096).unwrap();
    assert_eq!(blob.byte_count().unwrap(), 4096);
    file.root().unwrap().set("raw", &blob).unwrap();

    let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    blob.blob_write(100, &data).unwrap();
    let mut back = vec![0u8; 3000];
    blob.blob_read(100, &mut back).unwrap();
    assert_eq!(back, data);

    // untouched range reads as zeros
    let mut head = vec![0xffu8; 100];
    blob.blob_read(0, &mut head).unwrap();
    assert!(head.iter().all(|b| *b == 0));

    let mut over = vec![0u8; 8];
    assert_eq!(blob.blob_read(4090, &mut over).unwrap_err().kind(), ErrorKind::BadApiArgument);
    assert_eq!(blob.blob_write(4095, &[1, 2]).unwrap_err().kind(), ErrorKind::BadApiArgument);
    file.close().unwrap();
}

#[test]
fn invariants_hold_on_a_built_tree() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "tree.e57");
    let root = file.root().unwrap();
    let pos = Node::structure(&file).unwrap();
    pos.set("x", &Node::scaled_integer(&file, 0, -1000, 1000, 0.01, 0.0).unwrap()).unwrap();
    pos.set("name", &Node::ustring(&file, "origin").unwrap()).unwrap();
    root.set("pos", &pos).unwrap();
    let proto = Node::structure(&file).unwrap();
    proto.set("v", &Node::integer(&file, 0, 0, 100).unwrap()).unwrap();
    let codecs = Node::vector(&file, true).unwrap();
    let cv = Node::compressed_vector(&file, &proto, &codecs).unwrap();
    root.set("points", &cv).unwrap();

    root.check_invariant(true).unwrap();
    cv.check_invariant(true).unwrap();
    file.check_invariant(true).unwrap();
    assert_eq!(cv.prototype().unwrap().path_name(), "/points/prototype");
    assert!(cv.prototype().unwrap().is_attached());
    assert_eq!(cv.codecs().unwrap().node_type(), NodeType::Vector);
    assert_eq!(file.page_size(), 1024);
    file.close().unwrap();
}

#[test]
fn blobs_persist_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("persist.e57");
    let file = ImageFile::create(&path).unwrap();
    let blob = Node::blob(&file, 256).unwrap();
    file.root().unwrap().set("raw", &blob).unwrap();
    let payload: Vec<u8> = (0..=255u8).collect();
    blob.blob_write(0, &payload).unwrap();
    file.close().unwrap();

    // the XML collaborator re-declares the blob over its recorded range;
    // the first allocation lands right behind the 48-byte header
    let file = ImageFile::open(&path).unwrap();
    assert!(!file.is_writable());
    let blob = Node::blob_at(&file, 48, 256).unwrap();
    file.root().unwrap().set("raw", &blob).unwrap();
    let mut back = vec![0u8; 256];
    blob.blob_read(0, &mut back).unwrap();
    assert_eq!(back, payload);
    assert_eq!(blob.blob_write(0, &[1]).unwrap_err().kind(), ErrorKind::FileReadOnly);
    file.close().unwrap();
}

#[test]
fn close_invalidates_derived_handles() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "closing.e57");
    let root = file.root().unwrap();
    let blob = Node::blob(&file, 16).unwrap();
    root.set("raw", &blob).unwrap();
    file.close().unwrap();
    file.close().unwrap(); // idempotent

    assert!(!file.is_open());
    assert_eq!(file.root().unwrap_err().kind(), ErrorKind::ImageFileNotOpen);
    assert_eq!(
        Node::integer(&file, 0, 0, 1).unwrap_err().kind(),
        ErrorKind::ImageFileNotOpen
    );
    let mut buf = [0u8; 4];
    assert_eq!(blob.blob_read(0, &mut buf).unwrap_err().kind(), ErrorKind::ImageFileNotOpen);
    // closed container: nothing left to check
    blob.check_invariant(true).unwrap();
}

#[test]
fn dest_image_file_follows_the_declaring_container() {
    let dir = tempdir().unwrap();
    let file = new_file(&dir, "dest.e57");
    let node = Node::ustring(&file, "hi").unwrap();
    let owner = node.dest_image_file().unwrap();
    assert!(owner.is_open());
    assert!(owner.is_writable());
    file.close().unwrap();
    assert!(!owner.is_open());
}
