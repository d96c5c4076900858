use super::{Batch, BatchSource, CancelFlag};
use crate::error::Result;
use crate::nn::Layer;
use crate::runtime::Runtime;
use crate::tensor::Shape;

/// Lifecycle of a [`Tester`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TesterState {
    Idle,
    Testing,
    Finished,
    Cancelling,
    Cancelled,
}

/// Running classification tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    /// Fraction of correct predictions; zero before any sample was seen.
    pub fn ratio(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

/// Measures argmax accuracy of a model without recording gradients.
pub struct Tester<'m, M> {
    model: &'m mut M,
    batch_size: usize,
    state: TesterState,
    accuracy: Accuracy,
    cancel: CancelFlag,
}

impl<'m, M: Layer> Tester<'m, M> {
    pub fn new(model: &'m mut M, batch_size: usize) -> Self {
        Self {
            model,
            batch_size,
            state: TesterState::Idle,
            accuracy: Accuracy::default(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn state(&self) -> TesterState {
        self.state
    }

    pub fn accuracy(&self) -> Accuracy {
        self.accuracy
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&mut self) {
        if self.state == TesterState::Testing {
            self.state = TesterState::Cancelling;
        }
    }

    /// Evaluates one batch and returns the resulting state.
    pub fn step(&mut self, rt: &mut Runtime, source: &mut dyn BatchSource) -> Result<TesterState> {
        match self.state {
            TesterState::Finished | TesterState::Cancelled => return Ok(self.state),
            TesterState::Idle => {
                self.accuracy = Accuracy::default();
                self.state = TesterState::Testing;
            }
            TesterState::Testing | TesterState::Cancelling => {}
        }
        if self.cancel.is_cancelled() {
            self.cancel();
        }
        if self.state == TesterState::Cancelling {
            self.state = TesterState::Cancelled;
            return Ok(self.state);
        }

        match source.next_batch(self.batch_size) {
            Some(batch) => self.test_batch(rt, source, &batch)?,
            None => {
                log::info!(
                    "test accuracy {}/{} ({:.2}%)",
                    self.accuracy.correct,
                    self.accuracy.total,
                    self.accuracy.ratio() * 100.0
                );
                self.state = TesterState::Finished;
            }
        }
        Ok(self.state)
    }

    /// Evaluates the whole source from its current position.
    pub fn run(&mut self, rt: &mut Runtime, source: &mut dyn BatchSource) -> Result<Accuracy> {
        while matches!(self.step(rt, source)?, TesterState::Testing) {}
        Ok(self.accuracy)
    }

    fn test_batch(&mut self, rt: &mut Runtime, source: &dyn BatchSource, batch: &Batch) -> Result<()> {
        let classes = source.classes();
        let input = rt.tensor("test_input", Shape::new(batch.size, source.features()), &batch.data)?;

        rt.begin_scope("test");
        let model = &mut *self.model;
        let probs = rt.no_grad(|rt| {
            let logits = model.forward(rt, input, false)?;
            rt.softmax(logits, None)
        })?;
        let probs = rt.read_tensor(probs)?;

        for (row, label) in probs
            .chunks_exact(classes)
            .zip(batch.labels.chunks_exact(classes))
        {
            let actual = label.iter().position(|&v| v > 0.5).unwrap_or(0);
            if argmax(row) == actual {
                self.accuracy.correct += 1;
            }
            self.accuracy.total += 1;
        }
        Ok(())
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}
