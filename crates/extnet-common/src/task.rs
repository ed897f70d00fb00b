//! Periodic task trait and tick outcome types.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Every unit of work completed
    Success,
    /// Some units failed or were skipped, the rest completed
    Partial,
    /// Nothing was done this tick (e.g. another process holds the lock)
    Skipped,
    /// The tick failed as a whole
    Failed,
}

impl TaskStatus {
    /// Returns true if the tick made progress.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Partial)
    }

    /// Returns true if the tick should be considered a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Partial => write!(f, "partial"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Per-tick counters reported by a [`PeriodicTask`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Units of work completed
    pub completed: usize,
    /// Units skipped (lock held elsewhere, nothing to do)
    pub skipped: usize,
    /// Units that failed
    pub failed: usize,
}

impl TickReport {
    /// Classifies the report.
    pub fn status(&self) -> TaskStatus {
        match (self.completed, self.skipped, self.failed) {
            (0, 0, 0) => TaskStatus::Success,
            (0, _, 0) => TaskStatus::Skipped,
            (0, _, _) => TaskStatus::Failed,
            (_, 0, 0) => TaskStatus::Success,
            _ => TaskStatus::Partial,
        }
    }

    /// Adds another report's counters into this one.
    pub fn merge(&mut self, other: &TickReport) {
        self.completed += other.completed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// Error type for a failed tick.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task could not run at all this tick
    #[error("Task '{task}' failed: {message}")]
    Failed { task: String, message: String },
}

impl TaskError {
    /// Creates a failure error.
    pub fn failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failed {
            task: task.into(),
            message: message.into(),
        }
    }
}

/// Result type for task ticks.
pub type TaskResult<T> = Result<T, TaskError>;

/// Work driven on a fixed interval by the daemon scheduler.
///
/// # Lifecycle
///
/// 1. Construction: the task is built with its collaborators
/// 2. Registration: the daemon reads `interval()`; `None` disables the task
/// 3. Ticks: `run_once()` is called every interval on its own tokio task,
///    so an error or panic in one tick never stops later ticks
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Returns the name of this task (for logging).
    fn name(&self) -> &str;

    /// Returns the tick interval, or `None` if the task is disabled.
    fn interval(&self) -> Option<Duration>;

    /// Runs one tick.
    async fn run_once(&self) -> TaskResult<TickReport>;

    /// Returns the priority of this task (lower = started first).
    fn priority(&self) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_report_status() {
        assert_eq!(TickReport::default().status(), TaskStatus::Success);
        let r = TickReport { completed: 3, skipped: 0, failed: 0 };
        assert_eq!(r.status(), TaskStatus::Success);
        let r = TickReport { completed: 0, skipped: 2, failed: 0 };
        assert_eq!(r.status(), TaskStatus::Skipped);
        let r = TickReport { completed: 2, skipped: 1, failed: 1 };
        assert_eq!(r.status(), TaskStatus::Partial);
        let r = TickReport { completed: 0, skipped: 0, failed: 1 };
        assert_eq!(r.status(), TaskStatus::Failed);
        assert!(r.status().is_failure());
    }

    #[test]
    fn test_tick_report_merge() {
        let mut total = TickReport::default();
        total.merge(&TickReport { completed: 1, skipped: 2, failed: 0 });
        total.merge(&TickReport { completed: 1, skipped: 0, failed: 3 });
        assert_eq!(total, TickReport { completed: 2, skipped: 2, failed: 3 });
    }

    #[test]
    fn test_task_error_display() {
        let e = TaskError::failed("usage-collector", "store offline");
        assert_eq!(e.to_string(), "Task 'usage-collector' failed: store offline");
    }
}
