//! Layer units built on the kernel entry points.
//!
//! A [`Layer`] only has to produce tensors through [`Runtime`] operations; the
//! graph wiring comes for free because every differentiable kernel records
//! itself.

mod dropout;
pub mod init;
mod linear;
mod relu;
mod sequential;

pub use dropout::Dropout;
pub use linear::Linear;
pub use relu::Relu;
pub use sequential::Sequential;

use crate::error::Result;
use crate::runtime::Runtime;
use crate::tensor::TensorId;

/// A forward-capable unit with trainable parameters.
pub trait Layer {
    /// Maps `input` to an output tensor, allocating in the active scope.
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, training: bool) -> Result<TensorId>;

    /// Tensors an optimizer should update.
    fn parameters(&self) -> Vec<TensorId> {
        Vec::new()
    }
}

impl<L: Layer + ?Sized> Layer for Box<L> {
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, training: bool) -> Result<TensorId> {
        (**self).forward(rt, input, training)
    }

    fn parameters(&self) -> Vec<TensorId> {
        (**self).parameters()
    }
}
