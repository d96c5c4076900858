use super::{Layer, init};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::tensor::{Shape, TensorId};
use rand::Rng;

/// Fully connected layer: `Y = X · W + b`.
///
/// Weights are registered as `<name>_weights` (`[in, out]`) and the bias as
/// `<name>_bias` (`[1, out]`), both requiring gradients.
#[derive(Debug, Clone)]
pub struct Linear {
    weights: TensorId,
    bias: TensorId,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    /// He-uniform weights and a zero bias.
    pub fn new<R: Rng + ?Sized>(
        rt: &mut Runtime,
        name: &str,
        in_features: usize,
        out_features: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let weights = init::he_uniform(rng, in_features, in_features * out_features);
        Self::with_weights(rt, name, in_features, out_features, &weights)
    }

    /// Explicit row-major `[in, out]` weights and a zero bias.
    pub fn with_weights(
        rt: &mut Runtime,
        name: &str,
        in_features: usize,
        out_features: usize,
        weights: &[f32],
    ) -> Result<Self> {
        let weights = rt.parameter(
            &format!("{name}_weights"),
            Shape::new(in_features, out_features),
            weights,
        )?;
        let bias = rt.parameter(
            &format!("{name}_bias"),
            Shape::row(out_features),
            &vec![0.0; out_features],
        )?;
        Ok(Self {
            weights,
            bias,
            in_features,
            out_features,
        })
    }

    pub fn weights(&self) -> TensorId {
        self.weights
    }

    pub fn bias(&self) -> TensorId {
        self.bias
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Layer for Linear {
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, _training: bool) -> Result<TensorId> {
        let shape = rt.shape(input)?;
        if shape.cols != self.in_features {
            return Err(Error::ShapeMismatch {
                op: "linear",
                lhs: shape,
                rhs: Shape::new(self.in_features, self.out_features),
            });
        }
        let hidden = rt.matmul(input, self.weights, None)?;
        rt.bias_add(hidden, self.bias, None)
    }

    fn parameters(&self) -> Vec<TensorId> {
        vec![self.weights, self.bias]
    }
}
