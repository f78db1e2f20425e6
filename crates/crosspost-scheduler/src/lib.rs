//! Job scheduler for crosspost.
//!
//! This crate provides an in-process scheduler that:
//! - Fires recurring jobs at times of day in a named timezone
//! - Fires one-shot jobs at an instant and interval jobs on a fixed period
//! - Never overlaps a job with itself; an overlapping fire is recorded as skipped
//! - Stops gracefully, aborting jobs that outlive a grace period

mod clock;
mod error;
mod scheduler;
mod types;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::SchedulerError;
pub use scheduler::{JobContext, JobFn, Scheduler, SchedulerConfig};
pub use types::{
    Job, JobId, JobOutcome, OutcomeTally, Trigger, next_fire_after, parse_time_of_day,
    parse_timezone,
};
