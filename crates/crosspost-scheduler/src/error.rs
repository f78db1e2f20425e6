//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed time, unknown timezone, empty time list, zero interval or
    /// an instant in the past.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// `start` called on a scheduler that is running or has been stopped.
    #[error("scheduler already started")]
    AlreadyStarted,

    /// `stop` called on a scheduler that is not running.
    #[error("scheduler is not running")]
    NotRunning,

    /// The timing loop task ended abnormally.
    #[error("scheduler loop failed: {0}")]
    LoopFailed(String),
}
