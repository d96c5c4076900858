//! Tensor records, shapes and buffer usage flags.
//!
//! A tensor is a row-major rank-2 `f32` matrix backed by one device buffer.
//! Records live in an append-only arena owned by the
//! [`BufferManager`](crate::buffer::BufferManager) and are addressed by
//! [`TensorId`]. Graph edges (`parents`, `grad`) are ids into the same arena.

use crate::autograd::GradFn;
use crate::error::{Error, Result};
use std::fmt;
use std::ops::BitOr;

/// Index of a tensor record in the runtime arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u32);

impl TensorId {
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Identity of a physical device buffer.
///
/// Ids are handed out monotonically and never reused, so two tensors share
/// storage exactly when their buffer ids compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Capabilities requested for a buffer.
///
/// Two requests belong to the same usage class only when their flags are
/// identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    /// Bindable as a storage buffer.
    pub const STORAGE: Self = Self(1);
    /// Usable as the source of a copy.
    pub const COPY_SRC: Self = Self(1 << 1);
    /// Usable as the destination of a copy or upload.
    pub const COPY_DST: Self = Self(1 << 2);
    /// Mappable for host reads.
    pub const MAP_READ: Self = Self(1 << 3);
    /// Bindable as a uniform buffer.
    pub const UNIFORM: Self = Self(1 << 4);
    /// Storage that can be uploaded to and read back; the default for tensors.
    pub const TENSOR: Self = Self(Self::STORAGE.0 | Self::COPY_SRC.0 | Self::COPY_DST.0);
    /// Staging buffer for readback.
    pub const READBACK: Self = Self(Self::MAP_READ.0 | Self::COPY_DST.0);

    /// Raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if every flag of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Rank-2 tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    pub rows: usize,
    pub cols: usize,
}

impl Shape {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// A single row; this is how `[N]` vectors are stored.
    pub const fn row(cols: usize) -> Self {
        Self::new(1, cols)
    }

    /// Number of elements.
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical size of the data in bytes.
    pub const fn byte_len(&self) -> u64 {
        (self.len() * size_of::<f32>()) as u64
    }

    pub const fn transposed(&self) -> Self {
        Self::new(self.cols, self.rows)
    }

    pub(crate) fn ensure_non_empty(self) -> Result<Self> {
        if self.is_empty() {
            return Err(Error::EmptyShape {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(self)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = Error;

    fn try_from(dims: &[usize]) -> Result<Self> {
        match *dims {
            [cols] => Shape::row(cols).ensure_non_empty(),
            [rows, cols] => Shape::new(rows, cols).ensure_non_empty(),
            _ => Err(Error::Rank(dims.len())),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.rows, self.cols)
    }
}

/// Storage and graph metadata of one tensor.
#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub(crate) name: String,
    pub(crate) buffer: BufferId,
    pub(crate) usage: BufferUsage,
    pub(crate) shape: Shape,
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<TensorId>,
    pub(crate) parents: Vec<TensorId>,
    pub(crate) grad_fn: Option<GradFn>,
}

impl TensorRecord {
    pub(crate) fn new(name: String, buffer: BufferId, usage: BufferUsage, shape: Shape) -> Self {
        Self {
            name,
            buffer,
            usage,
            shape,
            requires_grad: false,
            grad: None,
            parents: Vec::new(),
            grad_fn: None,
        }
    }

    /// Drops graph linkage so a reused record starts out like a fresh one.
    pub(crate) fn reset_graph(&mut self) {
        self.requires_grad = false;
        self.grad = None;
        self.parents.clear();
        self.grad_fn = None;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn grad(&self) -> Option<TensorId> {
        self.grad
    }

    pub fn parents(&self) -> &[TensorId] {
        &self.parents
    }

    pub fn grad_fn(&self) -> Option<&GradFn> {
        self.grad_fn.as_ref()
    }
}
