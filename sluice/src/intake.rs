//! Thread-safe intake buffer between producers and the flush cycle.
//!
//! Producers append sample containers from any thread; the flush cycle
//! drains everything buffered since its previous drain in one atomic swap.
//! The buffer is the only state shared between producer threads and the
//! engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::series::Sample;

/// Cloneable handle to a shared sample buffer.
///
/// Every clone refers to the same underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct SampleBuffer {
    containers: Arc<Mutex<Vec<Vec<Sample>>>>,
}

impl SampleBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one container of samples.
    ///
    /// Empty containers are ignored.
    pub fn add(&self, samples: Vec<Sample>) {
        if samples.is_empty() {
            return;
        }
        self.lock().push(samples);
    }

    /// Appends a single sample as its own container.
    pub fn push(&self, sample: Sample) {
        self.lock().push(vec![sample]);
    }

    /// Returns and clears every container buffered since the last drain,
    /// in arrival order.
    pub fn drain(&self) -> Vec<Vec<Sample>> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of containers currently buffered.
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    // A producer that panicked mid-append cannot leave the Vec in a torn
    // state, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, Vec<Vec<Sample>>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
