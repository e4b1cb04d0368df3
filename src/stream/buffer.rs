use crate::codec::field::FieldSpec;
use crate::errors::{Error, ErrorKind, Result};
use crate::node::path;
use crate::types::MemoryKind;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Caller-owned backing storage for one bound field. The engine reads and
/// writes through the lock; the caller keeps the other handle.
pub type SharedBuffer<T> = Arc<RwLock<Vec<T>>>;

/// Wraps a vector as caller-owned backing storage.
#[must_use]
pub fn shared_buffer<T>(data: Vec<T>) -> SharedBuffer<T> {
    Arc::new(RwLock::new(data))
}

#[derive(Clone)]
pub(crate) enum BufferData {
    I8(SharedBuffer<i8>),
    I16(SharedBuffer<i16>),
    I32(SharedBuffer<i32>),
    I64(SharedBuffer<i64>),
    F32(SharedBuffer<f32>),
    F64(SharedBuffer<f64>),
    UString(SharedBuffer<String>),
}

impl BufferData {
    fn len(&self) -> usize {
        match self {
            Self::I8(d) => d.read().len(),
            Self::I16(d) => d.read().len(),
            Self::I32(d) => d.read().len(),
            Self::I64(d) => d.read().len(),
            Self::F32(d) => d.read().len(),
            Self::F64(d) => d.read().len(),
            Self::UString(d) => d.read().len(),
        }
    }

    const fn kind(&self) -> MemoryKind {
        match self {
            Self::I8(_) => MemoryKind::I8,
            Self::I16(_) => MemoryKind::I16,
            Self::I32(_) => MemoryKind::I32,
            Self::I64(_) => MemoryKind::I64,
            Self::F32(_) => MemoryKind::F32,
            Self::F64(_) => MemoryKind::F64,
            Self::UString(_) => MemoryKind::UString,
        }
    }
}

/// Binding between a terminal prototype field and caller memory: a path,
/// typed backing storage, a record capacity, an element stride, and the
/// coercion switches.
#[derive(Clone)]
pub struct SourceDestBuffer {
    pub(crate) path: String,
    pub(crate) data: BufferData,
    pub(crate) capacity: usize,
    pub(crate) stride: usize,
    pub(crate) do_conversion: bool,
    pub(crate) do_scaling: bool,
}

macro_rules! buffer_ctor {
    ($name:ident, $ty:ty, $variant:ident) => {
        /// Binds `path` to the given backing storage for `capacity`
        /// records.
        ///
        /// # Errors
        /// `BadPathName` on a malformed path, `BadAPIArgument` when the
        /// backing storage is too short for the capacity.
        pub fn $name(path: &str, data: SharedBuffer<$ty>, capacity: usize) -> Result<Self> {
            Self::with_data(path, BufferData::$variant(data), capacity)
        }
    };
}

impl SourceDestBuffer {
    buffer_ctor!(i8, i8, I8);
    buffer_ctor!(i16, i16, I16);
    buffer_ctor!(i32, i32, I32);
    buffer_ctor!(i64, i64, I64);
    buffer_ctor!(f32, f32, F32);
    buffer_ctor!(f64, f64, F64);
    buffer_ctor!(ustring, String, UString);

    fn with_data(path_str: &str, data: BufferData, capacity: usize) -> Result<Self> {
        path::parse_path(path_str)?;
        let buffer = Self {
            path: path::normalize(path_str).to_string(),
            data,
            capacity,
            stride: 1,
            do_conversion: false,
            do_scaling: false,
        };
        buffer.check_backing()?;
        Ok(buffer)
    }

    /// Allows narrowing/widening coercions between the field's stored type
    /// and this buffer's element type.
    #[must_use]
    pub fn with_conversion(mut self) -> Self {
        self.do_conversion = true;
        self
    }

    /// Applies scale and offset when a ScaledInteger field moves through a
    /// floating-point buffer.
    #[must_use]
    pub fn with_scaling(mut self) -> Self {
        self.do_scaling = true;
        self
    }

    /// Records are `stride` elements apart in the backing storage.
    ///
    /// # Errors
    /// `BadAPIArgument` when the stride is zero or the storage becomes too
    /// short.
    pub fn with_stride(mut self, stride: usize) -> Result<Self> {
        self.stride = stride;
        self.check_backing()?;
        Ok(self)
    }

    fn check_backing(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("buffer {:?} has zero capacity", self.path),
            ));
        }
        if self.stride == 0 {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!("buffer {:?} has zero stride", self.path),
            ));
        }
        let needed = (self.capacity - 1) * self.stride + 1;
        if self.data.len() < needed {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!(
                    "buffer {:?} backing holds {} element(s), {needed} needed",
                    self.path,
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub const fn memory_kind(&self) -> MemoryKind {
        self.data.kind()
    }

    #[must_use]
    pub const fn do_conversion(&self) -> bool {
        self.do_conversion
    }

    #[must_use]
    pub const fn do_scaling(&self) -> bool {
        self.do_scaling
    }
}

/// Checks the binding contract and returns the buffers reordered to match
/// the prototype's field order.
///
/// # Errors
/// `BufferSizeMismatch` on unequal capacities or more buffers than fields,
/// `BufferDuplicatePathName` on duplicate paths, `PathUndefined` when a
/// buffer path does not name a terminal field or a field is left unbound.
pub(crate) fn validate_bindings(
    fields: &[(String, FieldSpec)],
    buffers: &[SourceDestBuffer],
) -> Result<Vec<SourceDestBuffer>> {
    if buffers.is_empty() {
        return Err(Error::new(ErrorKind::BufferSizeMismatch, "no buffers bound"));
    }
    let capacity = buffers[0].capacity;
    for buffer in buffers {
        if buffer.capacity != capacity {
            return Err(Error::new(
                ErrorKind::BufferSizeMismatch,
                format!(
                    "buffer {:?} capacity {} differs from {capacity}",
                    buffer.path, buffer.capacity
                ),
            ));
        }
    }
    if buffers.len() > fields.len() {
        return Err(Error::new(
            ErrorKind::BufferSizeMismatch,
            format!("{} buffer(s) bound, prototype has {} field(s)", buffers.len(), fields.len()),
        ));
    }
    let mut by_path: HashMap<&str, &SourceDestBuffer> = HashMap::new();
    for buffer in buffers {
        if by_path.insert(buffer.path.as_str(), buffer).is_some() {
            return Err(Error::new(
                ErrorKind::BufferDuplicatePathName,
                format!("path {:?} bound twice", buffer.path),
            ));
        }
    }
    let mut ordered = Vec::with_capacity(fields.len());
    for (path, _) in fields {
        let buffer = by_path.remove(path.as_str()).ok_or_else(|| {
            Error::new(ErrorKind::PathUndefined, format!("prototype field {path:?} is unbound"))
        })?;
        ordered.push(buffer.clone());
    }
    if let Some(stray) = by_path.keys().next() {
        return Err(Error::new(
            ErrorKind::PathUndefined,
            format!("path {stray:?} does not name a terminal prototype field"),
        ));
    }
    Ok(ordered)
}

/// Validates a rebinding against the original: the path set and coercion
/// switches must survive; backing storage, stride, and capacity may change.
///
/// # Errors
/// The binding-contract kinds, plus `BadAPIArgument` when a buffer changed
/// anything but its base, stride, or capacity.
pub(crate) fn validate_rebinding(
    fields: &[(String, FieldSpec)],
    previous: &[SourceDestBuffer],
    buffers: &[SourceDestBuffer],
) -> Result<Vec<SourceDestBuffer>> {
    let ordered = validate_bindings(fields, buffers)?;
    for (old, new) in previous.iter().zip(ordered.iter()) {
        if old.memory_kind() != new.memory_kind()
            || old.do_conversion != new.do_conversion
            || old.do_scaling != new.do_scaling
        {
            return Err(Error::new(
                ErrorKind::BadApiArgument,
                format!(
                    "rebinding {:?} may change only base, stride, and capacity",
                    new.path
                ),
            ));
        }
    }
    Ok(ordered)
}
