use super::{Batch, BatchSource, CancelFlag};
use crate::config::TrainConfig;
use crate::error::Result;
use crate::nn::Layer;
use crate::optim::{Optimizer, Sgd};
use crate::runtime::Runtime;
use crate::snapshot;
use crate::tensor::Shape;
use log::{debug, info};

/// Lifecycle of a [`Trainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    Training,
    Finished,
    Cancelling,
    Cancelled,
}

/// What a single [`Trainer::step`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// A batch was trained; `loss` is the mean cross-entropy over it.
    Batch { epoch: usize, loss: f32 },
    /// The source ran dry and `epoch` epochs are now complete.
    EpochEnd { epoch: usize },
    Finished,
    Cancelled,
}

/// Drives a model through epochs of mini-batch training.
pub struct Trainer<M, O> {
    model: M,
    optimizer: O,
    config: TrainConfig,
    state: TrainerState,
    epoch: usize,
    cancel: CancelFlag,
}

impl<M: Layer> Trainer<M, Sgd> {
    /// An [`Sgd`] trainer set up from `config` for a source of `samples` samples.
    pub fn sgd(model: M, config: TrainConfig, samples: usize) -> Self {
        let mut optimizer = Sgd::new(model.parameters(), config.learning_rate)
            .with_max_grad_norm(config.max_grad_norm);
        optimizer.set_schedule(config.schedule_for(samples));
        Self::new(model, optimizer, config)
    }
}

impl<M: Layer, O: Optimizer> Trainer<M, O> {
    pub fn new(model: M, optimizer: O, config: TrainConfig) -> Self {
        Self {
            model,
            optimizer,
            config,
            state: TrainerState::Idle,
            epoch: 0,
            cancel: CancelFlag::new(),
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// A handle that cancels this trainer when triggered.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Requests cancellation; takes effect at the next step.
    pub fn cancel(&mut self) {
        if self.state == TrainerState::Training {
            self.state = TrainerState::Cancelling;
        }
    }

    /// Trains one batch, or closes the epoch when the source is exhausted.
    pub fn step(&mut self, rt: &mut Runtime, source: &mut dyn BatchSource) -> Result<StepOutcome> {
        match self.state {
            TrainerState::Finished => return Ok(StepOutcome::Finished),
            TrainerState::Cancelled => return Ok(StepOutcome::Cancelled),
            TrainerState::Idle => {
                info!("training for {} epochs", self.config.epochs);
                self.state = TrainerState::Training;
            }
            TrainerState::Training | TrainerState::Cancelling => {}
        }
        if self.cancel.is_cancelled() {
            self.cancel();
        }
        if self.state == TrainerState::Cancelling {
            info!("training cancelled after {} epochs", self.epoch);
            self.state = TrainerState::Cancelled;
            return Ok(StepOutcome::Cancelled);
        }
        if self.epoch >= self.config.epochs {
            self.state = TrainerState::Finished;
            return Ok(StepOutcome::Finished);
        }

        if let Some(batch) = source.next_batch(self.config.batch_size) {
            let loss = self.train_batch(rt, source, &batch)?;
            return Ok(StepOutcome::Batch {
                epoch: self.epoch,
                loss,
            });
        }

        self.epoch += 1;
        self.end_epoch(rt)?;
        source.reset();
        if self.epoch >= self.config.epochs {
            info!("training finished");
            self.state = TrainerState::Finished;
        }
        Ok(StepOutcome::EpochEnd { epoch: self.epoch })
    }

    /// Steps until training finishes or is cancelled.
    pub fn run(&mut self, rt: &mut Runtime, source: &mut dyn BatchSource) -> Result<TrainerState> {
        loop {
            match self.step(rt, source)? {
                StepOutcome::Finished | StepOutcome::Cancelled => return Ok(self.state),
                StepOutcome::EpochEnd { .. } if self.state == TrainerState::Finished => {
                    return Ok(self.state);
                }
                _ => {}
            }
        }
    }

    fn train_batch(&mut self, rt: &mut Runtime, source: &dyn BatchSource, batch: &Batch) -> Result<f32> {
        self.optimizer.zero_grad(rt)?;
        rt.synchronize()?;

        let input = rt.tensor("input", Shape::new(batch.size, source.features()), &batch.data)?;
        let labels = rt.tensor(
            "labels_onehot",
            Shape::new(batch.size, source.classes()),
            &batch.labels,
        )?;

        rt.begin_scope("fwd");
        let logits = self.model.forward(rt, input, true)?;
        let loss = rt.cross_entropy(logits, labels, None)?;
        rt.backward(loss)?;
        rt.synchronize()?;

        self.optimizer.step(rt, batch.size)?;
        rt.synchronize()?;

        let total = rt.sum_all(loss, None)?;
        let mean = rt.read_tensor(total)?[0] / batch.size as f32;
        debug!(
            "epoch {} batch of {}: loss {mean:.5}, lr {}",
            self.epoch,
            batch.size,
            self.optimizer.learning_rate()
        );
        Ok(mean)
    }

    fn end_epoch(&mut self, rt: &mut Runtime) -> Result<()> {
        info!("epoch {}/{} complete", self.epoch, self.config.epochs);
        if let Some(dir) = &self.config.snapshot_dir {
            let prefix = format!("model-{}-", self.epoch);
            snapshot::save_snapshot(rt, &self.model.parameters(), dir, &prefix)?;
        }
        rt.flush_destroy_queue()
    }
}
