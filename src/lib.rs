//! gpugrad: a buffer-pooled tensor runtime with reverse-mode autodiff.
//!
//! Tensors are flat row-major `f32` matrices living in device buffers. Every
//! numerical primitive is a compute kernel launched on a small, fixed grid,
//! and the autodiff engine replays those same kernels backwards to produce
//! gradients.
//!
//! # Features
//!
//! - Named and scoped tensors backed by a reusing buffer pool.
//! - A closed set of kernels (matmul, element-wise, softmax, fused
//!   cross-entropy, reductions, optimizer helpers) on the host or, with the
//!   `wgpu` feature, on the GPU.
//! - Graph recording on differentiable kernels and a topological backward pass.
//! - Layers, SGD with learning-rate schedules, and pull-based training and
//!   evaluation drivers.
//!
//! # Modules
//!
//! - [`runtime`]: the explicit context passed to everything else.
//! - [`buffer`]: the buffer manager behind named and scoped tensors.
//! - [`ops`]: kernel entry points on [`Runtime`].
//! - [`autograd`]: gradient functions and the backward pass.
//! - [`nn`], [`optim`], [`train`]: model building and training.
//! - [`snapshot`]: raw parameter files.
//!
//! # Example
//!
//! ```rust
//! use gpugrad::{Runtime, Shape};
//!
//! let mut rt = Runtime::cpu();
//! let x = rt.tensor("x", Shape::new(1, 2), &[1.0, 2.0]).unwrap();
//! let w = rt.parameter("w", Shape::new(2, 1), &[3.0, 4.0]).unwrap();
//! let y = rt.matmul(x, w, None).unwrap();
//! rt.backward(y).unwrap();
//!
//! let grad = rt.gradient(w).unwrap();
//! assert_eq!(rt.read_tensor(grad).unwrap(), vec![1.0, 2.0]);
//! ```

pub mod approx;
pub mod autograd;
pub mod backend;
pub mod buffer;
pub mod config;
pub(crate) mod device;
pub mod error;
pub(crate) mod kernels;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod runtime;
pub mod snapshot;
pub mod tensor;
pub mod train;

pub use autograd::GradFn;
pub use backend::Backend;
pub use config::{RuntimeConfig, TrainConfig};
pub use error::{Error, Result};
pub use runtime::Runtime;
pub use tensor::{BufferId, BufferUsage, Shape, TensorId, TensorRecord};
