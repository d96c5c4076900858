use super::Layer;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::tensor::TensorId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Inverted dropout.
///
/// While training, each element is zeroed with probability `p` and the
/// survivors are scaled by `1 / (1 - p)`. The mask is drawn on the host and
/// uploaded as a scoped tensor, so a training scope always allocates it at
/// the same position. Evaluation passes the input through untouched.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f32,
    rng: StdRng,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        Self::with_rng(p, StdRng::from_rng(&mut rand::rng()))
    }

    /// A dropout layer with a reproducible mask sequence.
    pub fn with_seed(p: f32, seed: u64) -> Result<Self> {
        Self::with_rng(p, StdRng::seed_from_u64(seed))
    }

    fn with_rng(p: f32, rng: StdRng) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::DropoutProbability(p));
        }
        Ok(Self { p, rng })
    }

    pub fn probability(&self) -> f32 {
        self.p
    }
}

impl Layer for Dropout {
    fn forward(&mut self, rt: &mut Runtime, input: TensorId, training: bool) -> Result<TensorId> {
        if !training {
            return Ok(input);
        }
        let shape = rt.shape(input)?;
        let scale = 1.0 / (1.0 - self.p);
        let mask: Vec<f32> = (0..shape.len())
            .map(|_| {
                if self.rng.random::<f32>() < self.p {
                    0.0
                } else {
                    scale
                }
            })
            .collect();
        let mask = rt.scoped(shape, Some(&mask))?;
        rt.dropout(input, mask, None)
    }
}
