//! Runtime and training configuration.
//!
//! Both structs deserialize from TOML with every field optional:
//!
//! ```toml
//! epochs = 5
//! batch_size = 64
//! learning_rate = 0.1
//! max_grad_norm = 5.0
//!
//! [schedule]
//! kind = "step"
//! factor = 0.5
//! every_n_steps = 200
//! ```

use crate::backend::Backend;
use crate::buffer::DEFAULT_ALIGNMENT;
use crate::error::{Error, Result};
use crate::optim::LrSchedule;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Settings fixed when a [`Runtime`](crate::Runtime) is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Where buffers live and kernels run.
    pub backend: Backend,
    /// Byte boundary every buffer allocation is rounded up to.
    pub alignment: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Cpu,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl RuntimeConfig {
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.alignment < 4 || !self.alignment.is_power_of_two() {
            return Err(Error::Alignment(self.alignment));
        }
        if !self.backend.is_available() {
            return Err(Error::BackendUnavailable(self.backend));
        }
        Ok(())
    }
}

/// Hyperparameters of a [`Trainer`](crate::train::Trainer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Learning-rate schedule; cosine decay over the whole run when absent.
    pub schedule: Option<LrSchedule>,
    /// Clip each parameter gradient to this L2 norm before the update.
    pub max_grad_norm: Option<f32>,
    /// Directory receiving a parameter snapshot after every epoch.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 15,
            batch_size: 32,
            learning_rate: 0.05,
            schedule: None,
            max_grad_norm: None,
            snapshot_dir: None,
        }
    }
}

impl TrainConfig {
    /// Final learning rate of the default cosine schedule.
    pub const DEFAULT_MIN_LR: f32 = 0.001;

    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Batches needed to cover `samples` once, counting a trailing partial batch.
    pub fn steps_per_epoch(&self, samples: usize) -> usize {
        samples.div_ceil(self.batch_size.max(1))
    }

    /// The configured schedule, or cosine decay spanning every step of the run.
    pub fn schedule_for(&self, samples: usize) -> LrSchedule {
        self.schedule.clone().unwrap_or(LrSchedule::Cosine {
            min_lr: Self::DEFAULT_MIN_LR,
            max_steps: (self.steps_per_epoch(samples) * self.epochs) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = TrainConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrainConfig::default());
        let runtime = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(runtime, RuntimeConfig::default());
    }

    #[test]
    fn parses_schedule_tables() {
        let config = TrainConfig::from_toml_str(
            r#"
            epochs = 2
            batch_size = 8
            max_grad_norm = 1.5

            [schedule]
            kind = "step"
            factor = 0.5
            every_n_steps = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.epochs, 2);
        assert_eq!(config.max_grad_norm, Some(1.5));
        assert_eq!(
            config.schedule,
            Some(LrSchedule::Step {
                factor: 0.5,
                every_n_steps: 10
            })
        );
    }

    #[test]
    fn default_schedule_spans_the_run() {
        let config = TrainConfig {
            epochs: 3,
            batch_size: 32,
            ..TrainConfig::default()
        };
        assert_eq!(config.steps_per_epoch(100), 4);
        assert_eq!(
            config.schedule_for(100),
            LrSchedule::Cosine {
                min_lr: TrainConfig::DEFAULT_MIN_LR,
                max_steps: 12
            }
        );
    }

    #[test]
    fn rejects_bad_alignment_and_backend_strings() {
        let config = RuntimeConfig {
            alignment: 100,
            ..RuntimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Alignment(100))));
        assert!(RuntimeConfig::from_toml_str("backend = \"metal\"").is_err());
    }
}
