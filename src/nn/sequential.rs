use super::Layer;
use crate::error::Result;
use crate::runtime::Runtime;
use crate::tensor::TensorId;

/// Layers applied in order.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer, builder style.
    pub fn with(mut self, layer: impl Layer + 'static) -> Self {
        self.push(layer);
        self
    }

    pub fn push(&mut self, layer: impl Layer + 'static) {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Sequential {
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, training: bool) -> Result<TensorId> {
        self.layers
            .iter_mut()
            .try_fold(input, |x, layer| layer.forward(rt, x, training))
    }

    fn parameters(&self) -> Vec<TensorId> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }
}
