use super::{LrPolicy, LrSchedule, Optimizer};
use crate::error::Result;
use crate::runtime::Runtime;
use crate::tensor::TensorId;

/// Plain stochastic gradient descent.
///
/// Each step computes `update = grad * (-lr / batch)` and adds it to the
/// parameter in place, optionally clipping the gradient norm first.
pub struct Sgd {
    params: Vec<TensorId>,
    base_lr: f32,
    lr: f32,
    schedule: Box<dyn LrPolicy>,
    max_grad_norm: Option<f32>,
    steps: u64,
}

impl Sgd {
    pub fn new(params: Vec<TensorId>, lr: f32) -> Self {
        Self {
            params,
            base_lr: lr,
            lr,
            schedule: Box::new(LrSchedule::Constant),
            max_grad_norm: None,
            steps: 0,
        }
    }

    /// Clips each gradient to `max_norm` before it is applied.
    pub fn with_max_grad_norm(mut self, max_norm: Option<f32>) -> Self {
        self.max_grad_norm = max_norm;
        self
    }

    /// Replaces the schedule and restarts from the base rate.
    pub fn set_schedule(&mut self, schedule: impl LrPolicy + 'static) {
        self.schedule = Box::new(schedule);
        self.lr = self.base_lr;
    }

    pub fn params(&self) -> &[TensorId] {
        &self.params
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    pub fn reset_step_count(&mut self) {
        self.steps = 0;
        self.lr = self.base_lr;
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, rt: &mut Runtime, batch_size: usize) -> Result<()> {
        self.lr = self
            .schedule
            .learning_rate(self.base_lr, self.lr, self.steps);
        let scale = -self.lr / batch_size.max(1) as f32;

        for &param in &self.params {
            let Some(grad) = rt.try_gradient(param)? else {
                continue;
            };
            if let Some(max_norm) = self.max_grad_norm {
                rt.clip_grad_norm(grad, max_norm)?;
            }
            let update = rt.scalar_mul(grad, scale, None)?;
            rt.inplace_add(param, update)?;
        }

        self.steps += 1;
        log::trace!("sgd step {} at lr {}", self.steps, self.lr);
        Ok(())
    }

    fn zero_grad(&mut self, rt: &mut Runtime) -> Result<()> {
        for &param in &self.params {
            if let Some(grad) = rt.try_gradient(param)? {
                rt.fill(grad, 0.0)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.base_lr = lr;
        self.lr = lr;
    }
}
