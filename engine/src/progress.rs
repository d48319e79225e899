//! Progress reporting.
//!
//! This module defines the ProgressSink trait, which decouples the copy
//! engine from whatever displays progress (CLI, a task scheduler, a UI).
//! The engine resets the goal at the start of each file and reports bytes
//! written after every destination write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::model::FileItem;

/// Receiver of progress updates from a copy operation.
///
/// All methods are called synchronously on the consumer thread and take
/// `&self`, so implementations use interior mutability.
pub trait ProgressSink: Send + Sync {
    /// Start a new unit of work with the given goal; current drops to zero.
    fn reset(&self, goal: f64);

    /// Set the current value.
    fn update_current(&self, current: f64);

    /// Add to the current value.
    fn increase_current(&self, delta: f64);

    /// Fraction complete in `[0, 1]`. A zero goal yields 0.
    fn progress(&self) -> f64;

    /// Human-readable description of the current step.
    fn set_status(&self, _status: &str) {}

    /// Called once per item after the walk records its final state.
    fn file_completed(&self, _item: &FileItem) {}
}

/// Thread-safe progress holder, the engine's default ProgressSink.
///
/// Goal and current are stored as `f64` bit patterns so readers on other
/// threads never block the consumer.
#[derive(Debug, Default)]
pub struct TaskProgress {
    goal: AtomicU64,
    current: AtomicU64,
    status: Mutex<String>,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn goal(&self) -> f64 {
        f64::from_bits(self.goal.load(Ordering::Acquire))
    }

    pub fn current(&self) -> f64 {
        f64::from_bits(self.current.load(Ordering::Acquire))
    }

    pub fn status(&self) -> String {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressSink for TaskProgress {
    fn reset(&self, goal: f64) {
        self.current.store(0f64.to_bits(), Ordering::Release);
        self.goal.store(goal.to_bits(), Ordering::Release);
    }

    fn update_current(&self, current: f64) {
        self.current.store(current.to_bits(), Ordering::Release);
    }

    fn increase_current(&self, delta: f64) {
        let _ = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }

    fn progress(&self) -> f64 {
        let goal = self.goal();
        if goal > 0.0 {
            (self.current() / goal).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    fn set_status(&self, status: &str) {
        let mut current = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        current.clear();
        current.push_str(status);
    }
}
