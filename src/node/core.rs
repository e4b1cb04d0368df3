use crate::errors::{Error, ErrorKind, Result};
use crate::node::path::{self, PathComponent};
use crate::types::{FloatPrecision, NodeType};
use crate::{ImageFile, ImageFileInner};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

pub(crate) type NodeRef = Arc<RwLock<NodeBody>>;
pub(crate) type NodeWeak = Weak<RwLock<NodeBody>>;

/// Shared body behind every [`Node`] handle. Parent and container links are
/// weak; child links are strong, so ownership flows root-down and no cycles
/// can form.
pub(crate) struct NodeBody {
    pub(crate) element_name: String,
    pub(crate) parent: NodeWeak,
    pub(crate) file: Weak<ImageFileInner>,
    pub(crate) attached: bool,
    pub(crate) kind: NodeKind,
}

pub(crate) enum NodeKind {
    Integer {
        value: i64,
        min: i64,
        max: i64,
    },
    ScaledInteger {
        raw: i64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    },
    Float {
        value: f64,
        precision: FloatPrecision,
        min: f64,
        max: f64,
    },
    UString {
        value: String,
    },
    Blob {
        offset: u64,
        length: u64,
    },
    Vector {
        children: Vec<NodeRef>,
        allow_hetero: bool,
    },
    Structure {
        children: Vec<(String, NodeRef)>,
    },
    CompressedVector {
        prototype: NodeRef,
        codecs: NodeRef,
        record_count: u64,
        data_offset: u64,
        writing_started: bool,
    },
}

impl NodeKind {
    pub(crate) const fn node_type(&self) -> NodeType {
        match self {
            Self::Integer { .. } => NodeType::Integer,
            Self::ScaledInteger { .. } => NodeType::ScaledInteger,
            Self::Float { .. } => NodeType::Float,
            Self::UString { .. } => NodeType::UString,
            Self::Blob { .. } => NodeType::Blob,
            Self::Vector { .. } => NodeType::Vector,
            Self::Structure { .. } => NodeType::Structure,
            Self::CompressedVector { .. } => NodeType::CompressedVector,
        }
    }
}

/// Generic handle to a typed element in a container's tree. Handles share
/// the underlying body; the body outlives any individual handle.
#[derive(Clone)]
pub struct Node {
    pub(crate) body: NodeRef,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = self.body.read();
        f.debug_struct("Node")
            .field("element_name", &body.element_name)
            .field("type", &body.kind.node_type())
            .finish()
    }
}

fn downcast_error(actual: NodeType, wanted: &str) -> Error {
    Error::new(ErrorKind::BadNodeDowncast, format!("{actual} node is not {wanted}"))
}

impl Node {
    fn new_detached(file: &ImageFile, kind: NodeKind) -> Result<Self> {
        let inner = file.inner();
        inner.usable()?;
        let body = NodeBody {
            element_name: String::new(),
            parent: Weak::new(),
            file: Arc::downgrade(inner),
            attached: false,
            kind,
        };
        Ok(Self { body: Arc::new(RwLock::new(body)) })
    }

    pub(crate) fn from_ref(body: NodeRef) -> Self {
        Self { body }
    }

    /// Creates an Integer node with inclusive bounds.
    ///
    /// # Errors
    /// `BadAPIArgument` when `min > max`, `ValueOutOfBounds` when the value
    /// lies outside the bounds, `ImageFileNotOpen` on a closed container.
    pub fn integer(file: &ImageFile, value: i64, min: i64, max: i64) -> Result<Self> {
        if min > max {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("integer bounds reversed: [{min}, {max}]"),
            ));
        }
        if value < min || value > max {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("integer value {value} outside [{min}, {max}]"),
            ));
        }
        Self::new_detached(file, NodeKind::Integer { value, min, max })
    }

    /// Creates a ScaledInteger node; the represented value is
    /// `raw * scale + offset`.
    ///
    /// # Errors
    /// `BadAPIArgument` on reversed bounds or a zero scale,
    /// `ValueOutOfBounds` when `raw` lies outside the bounds.
    pub fn scaled_integer(
        file: &ImageFile,
        raw: i64,
        min: i64,
        max: i64,
        scale: f64,
        offset: f64,
    ) -> Result<Self> {
        if min > max {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("scaled integer bounds reversed: [{min}, {max}]"),
            ));
        }
        if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("bad scale/offset pair ({scale}, {offset})"),
            ));
        }
        if raw < min || raw > max {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("raw value {raw} outside [{min}, {max}]"),
            ));
        }
        Self::new_detached(file, NodeKind::ScaledInteger { raw, min, max, scale, offset })
    }

    /// Creates a Float node of the given precision.
    ///
    /// # Errors
    /// `BadAPIArgument` when the bounds are reversed or outside the
    /// precision's domain, `ValueOutOfBounds` when the value lies outside
    /// the bounds.
    pub fn float(
        file: &ImageFile,
        value: f64,
        precision: FloatPrecision,
        min: f64,
        max: f64,
    ) -> Result<Self> {
        if !(min <= max) {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("float bounds reversed or NaN: [{min}, {max}]"),
            ));
        }
        if precision == FloatPrecision::Single
            && (min < f64::from(f32::MIN) || max > f64::from(f32::MAX))
        {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("bounds [{min}, {max}] outside the single-precision domain"),
            ));
        }
        if !(value >= min && value <= max) {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("float value {value} outside [{min}, {max}]"),
            ));
        }
        Self::new_detached(file, NodeKind::Float { value, precision, min, max })
    }

    /// Creates a UString node.
    ///
    /// # Errors
    /// `ImageFileNotOpen` on a closed container.
    pub fn ustring(file: &ImageFile, value: &str) -> Result<Self> {
        Self::new_detached(file, NodeKind::UString { value: value.to_string() })
    }

    /// Creates a Blob node, reserving (and zero-filling) `length` bytes in
    /// the container's binary section.
    ///
    /// # Errors
    /// `FileReadOnly` on a read-only container, `BadAPIArgument` while a
    /// compressed-vector writer is open.
    pub fn blob(file: &ImageFile, length: u64) -> Result<Self> {
        let offset = file.inner().allocate_blob(length)?;
        Self::new_detached(file, NodeKind::Blob { offset, length })
    }

    /// Declares a Blob node over an existing byte range, as recovered from
    /// the container's XML index.
    ///
    /// # Errors
    /// `ImageFileNotOpen` on a closed container.
    pub fn blob_at(file: &ImageFile, offset: u64, length: u64) -> Result<Self> {
        Self::new_detached(file, NodeKind::Blob { offset, length })
    }

    /// Creates an empty Vector node.
    ///
    /// # Errors
    /// `ImageFileNotOpen` on a closed container.
    pub fn vector(file: &ImageFile, allow_hetero: bool) -> Result<Self> {
        Self::new_detached(file, NodeKind::Vector { children: Vec::new(), allow_hetero })
    }

    /// Creates an empty Structure node.
    ///
    /// # Errors
    /// `ImageFileNotOpen` on a closed container.
    pub fn structure(file: &ImageFile) -> Result<Self> {
        Self::new_detached(file, NodeKind::Structure { children: Vec::new() })
    }

    /// Creates a CompressedVector node over a record template and a codecs
    /// description. Both become children of the new node.
    ///
    /// # Errors
    /// `BadAPIArgument` unless the prototype is a Structure and the codecs
    /// node a Vector, both declared against `file`; `AlreadyHasParent` when
    /// either is already part of a tree.
    pub fn compressed_vector(file: &ImageFile, prototype: &Node, codecs: &Node) -> Result<Self> {
        Self::compressed_vector_impl(file, prototype, codecs, 0, 0)
    }

    /// Declares a CompressedVector over an existing binary section, as
    /// recovered from the container's XML index.
    ///
    /// # Errors
    /// As [`compressed_vector`](Self::compressed_vector).
    pub fn compressed_vector_at(
        file: &ImageFile,
        prototype: &Node,
        codecs: &Node,
        data_offset: u64,
        record_count: u64,
    ) -> Result<Self> {
        Self::compressed_vector_impl(file, prototype, codecs, data_offset, record_count)
    }

    fn compressed_vector_impl(
        file: &ImageFile,
        prototype: &Node,
        codecs: &Node,
        data_offset: u64,
        record_count: u64,
    ) -> Result<Self> {
        for (role, part) in [("prototype", prototype), ("codecs", codecs)] {
            let body = part.body.read();
            if !body.file.ptr_eq(&Arc::downgrade(file.inner())) {
                return Err(Error::new(
                    ErrorKind::BadApiArgument,
                    format!("{role} declared against a different container"),
                ));
            }
            if body.attached || body.parent.upgrade().is_some() {
                return Err(Error::new(
                    ErrorKind::AlreadyHasParent,
                    format!("{role} already belongs to a tree"),
                ));
            }
        }
        if prototype.node_type() != NodeType::Structure {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("prototype must be a Structure, got {}", prototype.node_type()),
            ));
        }
        if codecs.node_type() != NodeType::Vector {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("codecs must be a Vector, got {}", codecs.node_type()),
            ));
        }
        let node = Self::new_detached(
            file,
            NodeKind::CompressedVector {
                prototype: prototype.body.clone(),
                codecs: codecs.body.clone(),
                record_count,
                data_offset,
                writing_started: false,
            },
        )?;
        for (name, part) in [("prototype", prototype), ("codecs", codecs)] {
            let mut body = part.body.write();
            body.parent = Arc::downgrade(&node.body);
            body.element_name = name.to_string();
        }
        Ok(node)
    }

    // --- Generic accessors ---

    #[must_use]
    pub fn node_type(&self) -> NodeType {
        self.body.read().kind.node_type()
    }

    #[must_use]
    pub fn element_name(&self) -> String {
        self.body.read().element_name.clone()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.body.read().attached
    }

    /// A node is the root of the tree it currently belongs to when it has
    /// no parent; a freshly created node is the root of its own one-node
    /// tree.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.body.read().parent.upgrade().is_none()
    }

    /// The parent node, or the node itself when it is a root.
    #[must_use]
    pub fn parent(&self) -> Self {
        match self.body.read().parent.upgrade() {
            Some(parent) => Self { body: parent },
            None => self.clone(),
        }
    }

    /// Absolute path of this node from the root of its tree, e.g.
    /// `/points/prototype/x`. The root itself is `/`.
    #[must_use]
    pub fn path_name(&self) -> String {
        let mut names = Vec::new();
        let mut cur = self.body.clone();
        loop {
            let parent = {
                let body = cur.read();
                if body.parent.upgrade().is_some() {
                    names.push(body.element_name.clone());
                }
                body.parent.upgrade()
            };
            match parent {
                Some(p) => cur = p,
                None => break,
            }
        }
        if names.is_empty() {
            return "/".to_string();
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// The container this node was declared against.
    ///
    /// # Errors
    /// `ImageFileNotOpen` when the container object no longer exists.
    pub fn dest_image_file(&self) -> Result<ImageFile> {
        Ok(ImageFile::from_inner(self.file()?))
    }

    pub(crate) fn file(&self) -> Result<Arc<ImageFileInner>> {
        self.body
            .read()
            .file
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::ImageFileNotOpen, "container no longer exists"))
    }

    // --- Integer / ScaledInteger / Float accessors ---

    /// # Errors
    /// `BadNodeDowncast` unless this is an Integer node.
    pub fn int_value(&self) -> Result<i64> {
        match &self.body.read().kind {
            NodeKind::Integer { value, .. } => Ok(*value),
            kind => Err(downcast_error(kind.node_type(), "Integer")),
        }
    }

    /// Lower bound of an Integer or ScaledInteger node (on the raw value).
    ///
    /// # Errors
    /// `BadNodeDowncast` on any other variant.
    pub fn int_minimum(&self) -> Result<i64> {
        match &self.body.read().kind {
            NodeKind::Integer { min, .. } | NodeKind::ScaledInteger { min, .. } => Ok(*min),
            kind => Err(downcast_error(kind.node_type(), "Integer or ScaledInteger")),
        }
    }

    /// Upper bound of an Integer or ScaledInteger node (on the raw value).
    ///
    /// # Errors
    /// `BadNodeDowncast` on any other variant.
    pub fn int_maximum(&self) -> Result<i64> {
        match &self.body.read().kind {
            NodeKind::Integer { max, .. } | NodeKind::ScaledInteger { max, .. } => Ok(*max),
            kind => Err(downcast_error(kind.node_type(), "Integer or ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn raw_value(&self) -> Result<i64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { raw, .. } => Ok(*raw),
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// The represented value `raw * scale + offset`.
    ///
    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn scaled_value(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { raw, scale, offset, .. } => {
                Ok((*raw as f64).mul_add(*scale, *offset))
            }
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn scaled_minimum(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { min, scale, offset, .. } => {
                Ok((*min as f64).mul_add(*scale, *offset))
            }
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn scaled_maximum(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { max, scale, offset, .. } => {
                Ok((*max as f64).mul_add(*scale, *offset))
            }
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn scale(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { scale, .. } => Ok(*scale),
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a ScaledInteger node.
    pub fn offset(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::ScaledInteger { offset, .. } => Ok(*offset),
            kind => Err(downcast_error(kind.node_type(), "ScaledInteger")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a Float node.
    pub fn float_value(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::Float { value, .. } => Ok(*value),
            kind => Err(downcast_error(kind.node_type(), "Float")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a Float node.
    pub fn float_minimum(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::Float { min, .. } => Ok(*min),
            kind => Err(downcast_error(kind.node_type(), "Float")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a Float node.
    pub fn float_maximum(&self) -> Result<f64> {
        match &self.body.read().kind {
            NodeKind::Float { max, .. } => Ok(*max),
            kind => Err(downcast_error(kind.node_type(), "Float")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a Float node.
    pub fn precision(&self) -> Result<FloatPrecision> {
        match &self.body.read().kind {
            NodeKind::Float { precision, .. } => Ok(*precision),
            kind => Err(downcast_error(kind.node_type(), "Float")),
        }
    }

    // --- UString / Blob accessors ---

    /// # Errors
    /// `BadNodeDowncast` unless this is a UString node.
    pub fn string_value(&self) -> Result<String> {
        match &self.body.read().kind {
            NodeKind::UString { value } => Ok(value.clone()),
            kind => Err(downcast_error(kind.node_type(), "UString")),
        }
    }

    /// Declared length of a Blob's byte run.
    ///
    /// # Errors
    /// `BadNodeDowncast` unless this is a Blob node.
    pub fn byte_count(&self) -> Result<u64> {
        match &self.body.read().kind {
            NodeKind::Blob { length, .. } => Ok(*length),
            kind => Err(downcast_error(kind.node_type(), "Blob")),
        }
    }

    /// Reads from the blob's byte run into `buf`.
    ///
    /// # Errors
    /// `BadAPIArgument` when the range exceeds the blob, plus the page
    /// layer's `ReadFailed`/`BadChecksum`.
    pub fn blob_read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (blob_offset, blob_length) = match &self.body.read().kind {
            NodeKind::Blob { offset, length } => (*offset, *length),
            kind => return Err(downcast_error(kind.node_type(), "Blob")),
        };
        let end = offset.saturating_add(buf.len() as u64);
        if end > blob_length {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("blob read of {} bytes at {offset} exceeds length {blob_length}", buf.len()),
            ));
        }
        self.file()?.read_at(blob_offset + offset, buf)
    }

    /// Writes into the blob's byte run.
    ///
    /// # Errors
    /// `BadAPIArgument` when the range exceeds the blob, `FileReadOnly` on a
    /// read-only container, plus the page layer's `WriteFailed`.
    pub fn blob_write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let (blob_offset, blob_length) = match &self.body.read().kind {
            NodeKind::Blob { offset, length } => (*offset, *length),
            kind => return Err(downcast_error(kind.node_type(), "Blob")),
        };
        let end = offset.saturating_add(data.len() as u64);
        if end > blob_length {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!(
                    "blob write of {} bytes at {offset} exceeds length {blob_length}",
                    data.len()
                ),
            ));
        }
        self.file()?.write_at(blob_offset + offset, data)
    }

    // --- Vector / Structure / CompressedVector accessors ---

    /// Number of children of a Structure or Vector.
    ///
    /// # Errors
    /// `BadNodeDowncast` on any other variant.
    pub fn child_count(&self) -> Result<usize> {
        match &self.body.read().kind {
            NodeKind::Structure { children } => Ok(children.len()),
            NodeKind::Vector { children, .. } => Ok(children.len()),
            kind => Err(downcast_error(kind.node_type(), "Structure or Vector")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a Vector node.
    pub fn allow_hetero(&self) -> Result<bool> {
        match &self.body.read().kind {
            NodeKind::Vector { allow_hetero, .. } => Ok(*allow_hetero),
            kind => Err(downcast_error(kind.node_type(), "Vector")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a CompressedVector node.
    pub fn record_count(&self) -> Result<u64> {
        match &self.body.read().kind {
            NodeKind::CompressedVector { record_count, .. } => Ok(*record_count),
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    /// Logical offset of the compressed-vector binary section, zero until a
    /// writer has allocated one.
    ///
    /// # Errors
    /// `BadNodeDowncast` unless this is a CompressedVector node.
    pub fn data_packet_offset(&self) -> Result<u64> {
        match &self.body.read().kind {
            NodeKind::CompressedVector { data_offset, .. } => Ok(*data_offset),
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a CompressedVector node.
    pub fn prototype(&self) -> Result<Self> {
        match &self.body.read().kind {
            NodeKind::CompressedVector { prototype, .. } => Ok(Self { body: prototype.clone() }),
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    /// # Errors
    /// `BadNodeDowncast` unless this is a CompressedVector node.
    pub fn codecs(&self) -> Result<Self> {
        match &self.body.read().kind {
            NodeKind::CompressedVector { codecs, .. } => Ok(Self { body: codecs.clone() }),
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    // --- Path resolution ---

    /// Resolves a `/`-separated path relative to this node (or from the
    /// tree root when the path starts with `/`).
    ///
    /// # Errors
    /// `BadPathName` on malformed paths, `PathUndefined` when a component
    /// does not resolve.
    pub fn get(&self, path_str: &str) -> Result<Self> {
        let (absolute, components) = path::parse_path(path_str)?;
        let mut cur = if absolute { self.tree_root_ref() } else { self.body.clone() };
        for component in components {
            let next = {
                let body = cur.read();
                match (&body.kind, component) {
                    (NodeKind::Structure { children }, PathComponent::Name(name)) => children
                        .iter()
                        .find(|(child_name, _)| child_name == name)
                        .map(|(_, child)| child.clone()),
                    (NodeKind::Structure { children }, PathComponent::Index(i)) => {
                        children.get(i).map(|(_, child)| child.clone())
                    }
                    (NodeKind::Vector { children, .. }, PathComponent::Index(i)) => {
                        children.get(i).cloned()
                    }
                    _ => None,
                }
            };
            cur = next.ok_or_else(|| {
                Error::new(ErrorKind::PathUndefined, format!("path {path_str:?} is not defined"))
            })?;
        }
        Ok(Self { body: cur })
    }

    /// Child of a Structure or Vector by position.
    ///
    /// # Errors
    /// `BadNodeDowncast` on terminal variants, `PathUndefined` when the
    /// index is out of range.
    pub fn get_index(&self, index: usize) -> Result<Self> {
        let child = match &self.body.read().kind {
            NodeKind::Structure { children } => children.get(index).map(|(_, c)| c.clone()),
            NodeKind::Vector { children, .. } => children.get(index).cloned(),
            kind => return Err(downcast_error(kind.node_type(), "Structure or Vector")),
        };
        child.map(|body| Self { body }).ok_or_else(|| {
            Error::new(ErrorKind::PathUndefined, format!("child index {index} is not defined"))
        })
    }

    /// Whether a path resolves under this node.
    #[must_use]
    pub fn is_defined(&self, path_str: &str) -> bool {
        self.get(path_str).is_ok()
    }

    fn tree_root_ref(&self) -> NodeRef {
        let mut cur = self.body.clone();
        loop {
            let parent = cur.read().parent.upgrade();
            match parent {
                Some(p) => cur = p,
                None => return cur,
            }
        }
    }

    // --- Mutation ---

    /// Adds `child` to this Structure under `name`.
    ///
    /// # Errors
    /// `BadNodeDowncast` unless this is a Structure; `BadPathName` on an
    /// invalid or colliding name; `AlreadyHasParent` when the child is in a
    /// tree; `BadAPIArgument` when the child belongs to another container;
    /// `SetTwice` inside a compressed vector's template once writing has
    /// started.
    pub fn set(&self, name: &str, child: &Self) -> Result<()> {
        if self.node_type() != NodeType::Structure {
            return Err(downcast_error(self.node_type(), "Structure"));
        }
        if !path::is_valid_element_name(name) {
            return Err(Error::new(
                ErrorKind::BadPathName,
                format!("invalid element name {name:?}"),
            ));
        }
        self.check_new_child(child)?;
        {
            let body = self.body.read();
            if let NodeKind::Structure { children } = &body.kind
                && children.iter().any(|(child_name, _)| child_name == name)
            {
                return Err(Error::new(
                    ErrorKind::BadPathName,
                    format!("element {name:?} already defined"),
                ));
            }
        }
        let attached = {
            let mut body = self.body.write();
            let attached = body.attached;
            if let NodeKind::Structure { children } = &mut body.kind {
                children.push((name.to_string(), child.body.clone()));
            }
            attached
        };
        {
            let mut child_body = child.body.write();
            child_body.parent = Arc::downgrade(&self.body);
            child_body.element_name = name.to_string();
        }
        if attached {
            mark_attached(&child.body);
        }
        Ok(())
    }

    /// Appends `child` to this Vector.
    ///
    /// # Errors
    /// As [`set`](Self::set); additionally `BadAPIArgument` when a
    /// homogeneous vector would receive a child of a different shape than
    /// its first.
    pub fn append(&self, child: &Self) -> Result<()> {
        if self.node_type() != NodeType::Vector {
            return Err(downcast_error(self.node_type(), "Vector"));
        }
        self.check_new_child(child)?;
        {
            let body = self.body.read();
            if let NodeKind::Vector { children, allow_hetero } = &body.kind
                && !*allow_hetero
                && let Some(first) = children.first()
                && !same_shape(first, &child.body)
            {
                return Err(Error::new(
                    ErrorKind::BadApiArgument,
                    "homogeneous vector children must share the first child's shape",
                ));
            }
        }
        let (attached, index) = {
            let mut body = self.body.write();
            let attached = body.attached;
            let index = if let NodeKind::Vector { children, .. } = &mut body.kind {
                children.push(child.body.clone());
                children.len() - 1
            } else {
                0
            };
            (attached, index)
        };
        {
            let mut child_body = child.body.write();
            child_body.parent = Arc::downgrade(&self.body);
            child_body.element_name = index.to_string();
        }
        if attached {
            mark_attached(&child.body);
        }
        Ok(())
    }

    /// Common `set`/`append` admission checks.
    fn check_new_child(&self, child: &Self) -> Result<()> {
        if Arc::ptr_eq(&self.body, &child.body) {
            return Err(Error::new(ErrorKind::BadApiArgument, "a node cannot contain itself"));
        }
        {
            let parent_body = self.body.read();
            let child_body = child.body.read();
            if !parent_body.file.ptr_eq(&child_body.file) {
                return Err(Error::new(
                    ErrorKind::BadApiArgument,
                    "child was declared against a different container",
                ));
            }
            if child_body.attached || child_body.parent.upgrade().is_some() {
                return Err(Error::new(
                    ErrorKind::AlreadyHasParent,
                    "child already belongs to a tree",
                ));
            }
        }
        if in_started_compressed_vector(&self.body) {
            return Err(Error::new(
                ErrorKind::SetTwice,
                "compressed vector template is frozen once writing has started",
            ));
        }
        Ok(())
    }

    // --- CompressedVector bookkeeping for the stream engines ---

    pub(crate) fn cv_writing_started(&self) -> Result<bool> {
        match &self.body.read().kind {
            NodeKind::CompressedVector { writing_started, .. } => Ok(*writing_started),
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    pub(crate) fn cv_begin_write(&self, section_offset: u64) -> Result<()> {
        match &mut self.body.write().kind {
            NodeKind::CompressedVector { data_offset, writing_started, .. } => {
                *data_offset = section_offset;
                *writing_started = true;
                Ok(())
            }
            kind => Err(downcast_error(kind.node_type(), "CompressedVector")),
        }
    }

    pub(crate) fn cv_set_record_count(&self, count: u64) {
        if let NodeKind::CompressedVector { record_count, .. } = &mut self.body.write().kind {
            *record_count = count;
        }
    }
}

/// Marks a subtree reachable from the container root.
pub(crate) fn mark_attached(node: &NodeRef) {
    let children = {
        let mut body = node.write();
        body.attached = true;
        children_of(&body.kind)
    };
    for child in children {
        mark_attached(&child);
    }
}

pub(crate) fn children_of(kind: &NodeKind) -> Vec<NodeRef> {
    match kind {
        NodeKind::Structure { children } => {
            children.iter().map(|(_, child)| child.clone()).collect()
        }
        NodeKind::Vector { children, .. } => children.clone(),
        NodeKind::CompressedVector { prototype, codecs, .. } => {
            vec![prototype.clone(), codecs.clone()]
        }
        _ => Vec::new(),
    }
}

/// Whether any enclosing compressed vector has begun writing, freezing the
/// structural shape of its template subtree.
fn in_started_compressed_vector(start: &NodeRef) -> bool {
    let mut cur = start.clone();
    loop {
        let parent = {
            let body = cur.read();
            if let NodeKind::CompressedVector { writing_started: true, .. } = body.kind {
                return true;
            }
            body.parent.upgrade()
        };
        match parent {
            Some(p) => cur = p,
            None => return false,
        }
    }
}

/// Structural identity used by homogeneous vectors: same variant and,
/// recursively, the same child names and arity. Bounds and values are not
/// part of the shape.
pub(crate) fn same_shape(a: &NodeRef, b: &NodeRef) -> bool {
    let a_body = a.read();
    let b_body = b.read();
    match (&a_body.kind, &b_body.kind) {
        (NodeKind::Structure { children: ca }, NodeKind::Structure { children: cb }) => {
            ca.len() == cb.len()
                && ca
                    .iter()
                    .zip(cb.iter())
                    .all(|((na, a), (nb, b))| na == nb && same_shape(a, b))
        }
        (
            NodeKind::Vector { children: ca, allow_hetero: ha },
            NodeKind::Vector { children: cb, allow_hetero: hb },
        ) => ha == hb && ca.len() == cb.len() && ca.iter().zip(cb.iter()).all(|(a, b)| same_shape(a, b)),
        (a_kind, b_kind) => a_kind.node_type() == b_kind.node_type(),
    }
}
