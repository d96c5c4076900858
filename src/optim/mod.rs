//! Optimizers and learning-rate policies.

mod sgd;

pub use sgd::Sgd;

use crate::error::Result;
use crate::runtime::Runtime;
use serde::{Deserialize, Serialize};

/// Updates parameters from their accumulated gradients.
pub trait Optimizer {
    /// Applies one update, averaging gradients over `batch_size` samples.
    fn step(&mut self, rt: &mut Runtime, batch_size: usize) -> Result<()>;

    /// Resets every existing parameter gradient to zero.
    fn zero_grad(&mut self, rt: &mut Runtime) -> Result<()>;

    fn learning_rate(&self) -> f32;

    /// Sets both the base and the current learning rate.
    fn set_learning_rate(&mut self, lr: f32);
}

/// Computes the learning rate for an upcoming step.
///
/// `step` counts completed updates; `current` is the rate used by the last one.
pub trait LrPolicy {
    fn learning_rate(&self, base: f32, current: f32, step: u64) -> f32;
}

/// Built-in learning-rate schedules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Keep the current rate.
    #[default]
    Constant,
    /// Multiply the current rate by `factor` every `every_n_steps` updates.
    Step { factor: f32, every_n_steps: u64 },
    /// `base * decay_rate ^ step`.
    Exponential { decay_rate: f32 },
    /// Cosine annealing from `base` down to `min_lr` over `max_steps`.
    Cosine { min_lr: f32, max_steps: u64 },
}

impl LrPolicy for LrSchedule {
    fn learning_rate(&self, base: f32, current: f32, step: u64) -> f32 {
        match *self {
            Self::Constant => current,
            Self::Step {
                factor,
                every_n_steps,
            } => {
                if step > 0 && every_n_steps > 0 && step % every_n_steps == 0 {
                    current * factor
                } else {
                    current
                }
            }
            Self::Exponential { decay_rate } => base * decay_rate.powf(step as f32),
            Self::Cosine { min_lr, max_steps } => {
                let progress = if max_steps == 0 {
                    1.0
                } else {
                    (step as f32 / max_steps as f32).min(1.0)
                };
                min_lr + 0.5 * (base - min_lr) * (1.0 + (std::f32::consts::PI * progress).cos())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approx::approx_eq;

    #[test]
    fn step_schedule_decays_on_multiples() {
        let schedule = LrSchedule::Step {
            factor: 0.5,
            every_n_steps: 2,
        };
        assert_eq!(schedule.learning_rate(1.0, 1.0, 0), 1.0);
        assert_eq!(schedule.learning_rate(1.0, 1.0, 1), 1.0);
        assert_eq!(schedule.learning_rate(1.0, 1.0, 2), 0.5);
    }

    #[test]
    fn cosine_anneals_to_the_floor() {
        let schedule = LrSchedule::Cosine {
            min_lr: 0.1,
            max_steps: 10,
        };
        assert!(approx_eq(&schedule.learning_rate(1.0, 1.0, 0), &1.0));
        assert!(approx_eq(&schedule.learning_rate(1.0, 1.0, 5), &0.55));
        assert!(approx_eq(&schedule.learning_rate(1.0, 1.0, 10), &0.1));
        assert!(approx_eq(&schedule.learning_rate(1.0, 1.0, 50), &0.1));
    }

    #[test]
    fn exponential_uses_the_base_rate() {
        let schedule = LrSchedule::Exponential { decay_rate: 0.5 };
        assert!(approx_eq(&schedule.learning_rate(0.8, 0.01, 3), &0.1));
    }
}
