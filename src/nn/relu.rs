use super::Layer;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::tensor::TensorId;

/// Rectified linear activation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Relu;

impl Layer for Relu {
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, _training: bool) -> Result<TensorId> {
        rt.relu(input, None)
    }
}
