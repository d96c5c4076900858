//! Training and evaluation drivers.
//!
//! Both drivers are pull based: the caller advances them one batch at a time
//! with `step` (or lets `run` loop until completion), and can stop them from
//! another thread through a shared [`CancelFlag`].

mod tester;
mod trainer;

pub use tester::{Accuracy, Tester, TesterState};
pub use trainer::{StepOutcome, Trainer, TrainerState};

use crate::error::{Error, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation shared between a driver and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One batch of row-major samples with one-hot labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub data: Vec<f32>,
    pub labels: Vec<f32>,
    pub size: usize,
}

/// A finite, restartable stream of batches.
pub trait BatchSource {
    /// Values per sample.
    fn features(&self) -> usize;

    /// Width of the one-hot label rows.
    fn classes(&self) -> usize;

    /// Total number of samples.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples already handed out in the current pass.
    fn position(&self) -> usize;

    /// The next batch of at most `batch_size` samples, or `None` at the end of a pass.
    fn next_batch(&mut self, batch_size: usize) -> Option<Batch>;

    /// Starts a new pass.
    fn reset(&mut self);
}

/// A dataset held in host memory, visited in a shuffled order.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    data: Vec<f32>,
    labels: Vec<f32>,
    features: usize,
    classes: usize,
    order: Vec<usize>,
    cursor: usize,
    rng: StdRng,
}

impl InMemoryDataset {
    /// `data` holds `features` values per sample, `labels` one-hot rows of width `classes`.
    pub fn new(features: usize, classes: usize, data: Vec<f32>, labels: Vec<f32>) -> Result<Self> {
        Self::with_rng(features, classes, data, labels, StdRng::from_rng(&mut rand::rng()))
    }

    /// Like [`new`](Self::new), with a reproducible visiting order.
    pub fn with_seed(
        features: usize,
        classes: usize,
        data: Vec<f32>,
        labels: Vec<f32>,
        seed: u64,
    ) -> Result<Self> {
        Self::with_rng(features, classes, data, labels, StdRng::seed_from_u64(seed))
    }

    /// Builds one-hot labels from class indices.
    pub fn one_hot(classes: usize, targets: &[usize]) -> Vec<f32> {
        let mut labels = vec![0.0; targets.len() * classes];
        for (row, &target) in targets.iter().enumerate() {
            if target < classes {
                labels[row * classes + target] = 1.0;
            }
        }
        labels
    }

    fn with_rng(
        features: usize,
        classes: usize,
        data: Vec<f32>,
        labels: Vec<f32>,
        rng: StdRng,
    ) -> Result<Self> {
        let samples = data.len() / features.max(1);
        if features == 0 || data.len() % features != 0 {
            return Err(Error::DataLength {
                expected: samples * features,
                found: data.len(),
            });
        }
        if labels.len() != samples * classes {
            return Err(Error::DataLength {
                expected: samples * classes,
                found: labels.len(),
            });
        }
        let mut dataset = Self {
            data,
            labels,
            features,
            classes,
            order: (0..samples).collect(),
            cursor: 0,
            rng,
        };
        dataset.reset();
        Ok(dataset)
    }
}

impl BatchSource for InMemoryDataset {
    fn features(&self) -> usize {
        self.features
    }

    fn classes(&self) -> usize {
        self.classes
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn position(&self) -> usize {
        self.cursor
    }

    fn next_batch(&mut self, batch_size: usize) -> Option<Batch> {
        let end = (self.cursor + batch_size.max(1)).min(self.order.len());
        if self.cursor >= end {
            return None;
        }
        let indices = &self.order[self.cursor..end];
        let mut batch = Batch {
            data: Vec::with_capacity(indices.len() * self.features),
            labels: Vec::with_capacity(indices.len() * self.classes),
            size: indices.len(),
        };
        for &i in indices {
            batch
                .data
                .extend_from_slice(&self.data[i * self.features..(i + 1) * self.features]);
            batch
                .labels
                .extend_from_slice(&self.labels[i * self.classes..(i + 1) * self.classes]);
        }
        self.cursor = end;
        Some(batch)
    }

    fn reset(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }
}
