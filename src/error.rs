//! Error type shared by every fallible operation of the runtime.

use crate::backend::Backend;
use crate::tensor::{BufferId, Shape, TensorId};
use std::path::PathBuf;
use thiserror::Error;

#[cfg(feature = "wgpu")]
pub use crate::device::gpu::GpuError;

/// Everything that can go wrong while allocating, dispatching or differentiating.
///
/// Shape and contract violations are reported before any device work is
/// submitted. Failures while destroying buffers are never surfaced here; they
/// are logged and skipped so that teardown always completes.
#[derive(Debug, Error)]
pub enum Error {
    /// A dimension list that is neither a row vector nor a matrix.
    #[error("expected a rank-1 or rank-2 shape, got rank {0}")]
    Rank(usize),

    /// A shape with a zero dimension.
    #[error("shape dimensions must be positive, got [{rows}, {cols}]")]
    EmptyShape { rows: usize, cols: usize },

    /// Two operands whose shapes do not fit the operation.
    #[error("{op}: incompatible shapes {lhs} and {rhs}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// A bias that is not a single row matching the input columns.
    #[error("bias_add: bias {bias} must have shape [1, {cols}]")]
    BiasShape { bias: Shape, cols: usize },

    /// A caller-supplied output tensor of the wrong shape.
    #[error("{op}: output has shape {output}, expected {expected}")]
    OutputShape {
        op: &'static str,
        output: Shape,
        expected: Shape,
    },

    /// Host data whose length disagrees with the tensor it is meant for.
    #[error("expected {expected} values, got {found}")]
    DataLength { expected: usize, found: usize },

    /// A caller-supplied output that already takes part in the autodiff graph.
    #[error("{op}: output `{name}` requires gradients and cannot be overwritten")]
    OutputInGraph { op: &'static str, name: String },

    /// An output buffer that is also bound as an input of the same dispatch.
    #[error("{op}: output buffer {buffer} is also bound as an input")]
    Aliasing { op: &'static str, buffer: BufferId },

    /// A transfer that would run past the end of its buffer.
    #[error("{len} bytes at offset {offset} exceed the {capacity} byte capacity of {buffer}")]
    Capacity {
        buffer: BufferId,
        offset: u64,
        len: u64,
        capacity: u64,
    },

    /// A transfer length that is zero or not a multiple of four.
    #[error("transfer of {0} bytes is not a positive multiple of 4")]
    TransferSize(u64),

    /// A byte offset that is not a multiple of four.
    #[error("offset {0} is not aligned to a 4-byte boundary")]
    Misaligned(u64),

    /// A tensor id that does not name a live record.
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorId),

    /// A buffer that was destroyed or never allocated.
    #[error("buffer {0} has been released")]
    BufferReleased(BufferId),

    /// Reading the gradient of a tensor that never received one.
    #[error("tensor `{0}` has no gradient")]
    MissingGradient(String),

    /// Starting a backward pass from a tensor outside the graph.
    #[error("cannot run backward from `{0}`: it does not require gradients")]
    NotDifferentiable(String),

    /// A dropout probability outside `[0, 1)`.
    #[error("dropout probability {0} is outside [0, 1)")]
    DropoutProbability(f32),

    /// A buffer alignment that is not a power of two of at least four bytes.
    #[error("buffer alignment {0} must be a power of two no smaller than 4")]
    Alignment(u64),

    /// A parameter file whose length disagrees with its tensor.
    #[error("snapshot `{}` holds {found} bytes, expected {expected}", path.display())]
    Snapshot {
        path: PathBuf,
        found: u64,
        expected: u64,
    },

    /// A kernel source rejected before compilation.
    #[error("shader `{0}` failed validation")]
    Shader(&'static str),

    /// A backend that was not compiled into this build.
    #[error("backend {0:?} is not available in this build")]
    BackendUnavailable(Backend),

    /// A failure reported by the GPU.
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// Filesystem failure while saving or loading parameters.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A configuration file that could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
