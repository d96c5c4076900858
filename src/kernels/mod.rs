//! # Kernel Set
//!
//! One compute kernel per numerical primitive. Every kernel reads its shape
//! and scalar arguments from a 16-byte [`Params`] uniform, reads its inputs
//! from storage bindings `1..=n` and writes the binding after them:
//!
//! | binding | contents |
//! |---|---|
//! | 0 | `Params { M, N, K, scalar }` |
//! | 1..=n | read-only inputs |
//! | n + 1 | read-write output |
//!
//! Kernels validate nothing; shape checks happen in the
//! [`Runtime`](crate::Runtime) entry points before a [`Launch`] is built.
//!
//! ## Backends
//!
//! - [`cpu`]: `rayon` implementations over host buffers
//! - `gpu` *(feature `wgpu`)*: WGSL pipelines compiled once per runtime

pub(crate) mod cpu;
#[cfg(feature = "wgpu")]
pub(crate) mod gpu;

use crate::device::Device;
use crate::error::Result;
use crate::tensor::BufferId;
use bytemuck::{Pod, Zeroable};

/// Edge length of the square workgroup tile used by 2-D kernels.
pub const TILE: u32 = 16;

/// Invocations per workgroup of the row-wise and reduction kernels.
pub const WORKGROUP_SIZE: u32 = 256;

/// Element count beyond which the single-workgroup reductions lose accuracy.
pub const REDUCTION_WARN_THRESHOLD: usize = (WORKGROUP_SIZE * WORKGROUP_SIZE) as usize;

/// Every primitive the runtime can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kernel {
    MatMul,
    Add,
    Mul,
    BiasAdd,
    Relu,
    ReluBackward,
    Softmax,
    SoftmaxBackward,
    CrossEntropy,
    SoftmaxCrossEntropyBackward,
    Transpose,
    SumAll,
    SumReduce,
    InplaceAdd,
    ScalarMul,
    ClipGradNorm,
}

impl Kernel {
    #[cfg(feature = "wgpu")]
    pub(crate) const ALL: [Kernel; 16] = [
        Kernel::MatMul,
        Kernel::Add,
        Kernel::Mul,
        Kernel::BiasAdd,
        Kernel::Relu,
        Kernel::ReluBackward,
        Kernel::Softmax,
        Kernel::SoftmaxBackward,
        Kernel::CrossEntropy,
        Kernel::SoftmaxCrossEntropyBackward,
        Kernel::Transpose,
        Kernel::SumAll,
        Kernel::SumReduce,
        Kernel::InplaceAdd,
        Kernel::ScalarMul,
        Kernel::ClipGradNorm,
    ];

    pub(crate) const fn label(self) -> &'static str {
        match self {
            Kernel::MatMul => "matmul",
            Kernel::Add => "add",
            Kernel::Mul => "mul",
            Kernel::BiasAdd => "bias_add",
            Kernel::Relu => "relu",
            Kernel::ReluBackward => "relu_backward",
            Kernel::Softmax => "softmax",
            Kernel::SoftmaxBackward => "softmax_backward",
            Kernel::CrossEntropy => "cross_entropy",
            Kernel::SoftmaxCrossEntropyBackward => "softmax_cross_entropy_backward",
            Kernel::Transpose => "transpose",
            Kernel::SumAll => "sum_all",
            Kernel::SumReduce => "sum_reduce",
            Kernel::InplaceAdd => "inplace_add",
            Kernel::ScalarMul => "scalar_mul",
            Kernel::ClipGradNorm => "clip_grad_norm",
        }
    }

    /// Number of read-only storage bindings before the output.
    #[cfg(feature = "wgpu")]
    pub(crate) const fn inputs(self) -> usize {
        match self {
            Kernel::ClipGradNorm => 0,
            Kernel::Relu
            | Kernel::Softmax
            | Kernel::Transpose
            | Kernel::SumAll
            | Kernel::SumReduce
            | Kernel::InplaceAdd
            | Kernel::ScalarMul => 1,
            Kernel::SoftmaxCrossEntropyBackward => 3,
            _ => 2,
        }
    }

    /// Workgroup counts for a dispatch with `params`.
    pub(crate) fn grid(self, params: &Params) -> [u32; 3] {
        let tiles = |n: u32| n.div_ceil(TILE);
        let groups = |n: u32| n.div_ceil(WORKGROUP_SIZE);
        match self {
            Kernel::Softmax
            | Kernel::SoftmaxBackward
            | Kernel::CrossEntropy
            | Kernel::SoftmaxCrossEntropyBackward => [groups(params.m), 1, 1],
            Kernel::SumReduce => [groups(params.n), 1, 1],
            Kernel::SumAll | Kernel::ClipGradNorm => [1, 1, 1],
            _ => [tiles(params.n), tiles(params.m), 1],
        }
    }
}

/// Shape and scalar arguments, laid out like the WGSL `Params` struct.
///
/// `m`/`n` are the rows and columns the kernel iterates over, `k` is the
/// shared dimension of a matmul, and `scalar` carries the multiplier of
/// `scalar_mul` or the threshold of `clip_grad_norm`. The reductions over a
/// whole tensor put its element count in `m`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub(crate) struct Params {
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub scalar: f32,
}

impl Params {
    pub(crate) fn matrix(rows: usize, cols: usize) -> Self {
        Self {
            m: rows as u32,
            n: cols as u32,
            ..Self::default()
        }
    }

    pub(crate) fn with_k(mut self, k: usize) -> Self {
        self.k = k as u32;
        self
    }

    pub(crate) fn with_scalar(mut self, scalar: f32) -> Self {
        self.scalar = scalar;
        self
    }
}

/// A fully resolved kernel invocation.
#[derive(Debug)]
pub(crate) struct Launch<'a> {
    pub kernel: Kernel,
    pub params: Params,
    pub inputs: &'a [BufferId],
    pub output: BufferId,
}

/// Compiled kernels for the device a runtime was created on.
pub(crate) struct KernelRegistry {
    #[cfg(feature = "wgpu")]
    gpu: Option<gpu::GpuKernels>,
}

impl KernelRegistry {
    /// Registry for the host device, which needs no compilation.
    pub(crate) fn host() -> Self {
        Self {
            #[cfg(feature = "wgpu")]
            gpu: None,
        }
    }

    pub(crate) fn new(device: &Device) -> Result<Self> {
        match device {
            Device::Host(_) => Ok(Self::host()),
            #[cfg(feature = "wgpu")]
            Device::Gpu(gpu) => Ok(Self {
                gpu: Some(gpu::GpuKernels::compile(gpu)?),
            }),
        }
    }

    pub(crate) fn dispatch(&self, device: &mut Device, launch: &Launch<'_>) -> Result<()> {
        log::trace!(
            "dispatch {} {:?} grid {:?}",
            launch.kernel.label(),
            launch.params,
            launch.kernel.grid(&launch.params)
        );
        match device {
            Device::Host(host) => cpu::run(host, launch),
            #[cfg(feature = "wgpu")]
            Device::Gpu(device) => match &self.gpu {
                Some(kernels) => kernels.run(device, launch),
                None => Err(crate::error::Error::BackendUnavailable(
                    crate::backend::Backend::Wgpu,
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_the_uniform_layout() {
        assert_eq!(size_of::<Params>(), 16);
        let params = Params::matrix(3, 5).with_k(7).with_scalar(0.5);
        let words: &[u32] = bytemuck::cast_slice(bytemuck::bytes_of(&params));
        assert_eq!(&words[..3], &[3, 5, 7]);
        assert_eq!(f32::from_bits(words[3]), 0.5);
    }

    #[test]
    fn grids_cover_every_element() {
        let params = Params::matrix(33, 17);
        assert_eq!(Kernel::MatMul.grid(&params), [2, 3, 1]);
        assert_eq!(Kernel::Softmax.grid(&params), [1, 1, 1]);
        assert_eq!(Kernel::SumReduce.grid(&Params::matrix(1, 300)), [2, 1, 1]);
        assert_eq!(Kernel::SumAll.grid(&Params::matrix(1_000_000, 1)), [1, 1, 1]);
    }
}
