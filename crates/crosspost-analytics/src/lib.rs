//! Outcome tracking and feedback signals for crosspost.
//!
//! This crate provides:
//! - The outcome and run record model
//! - The metrics store contract, with in-memory and JSON-file backends
//! - The feedback engine that ranks publish hours and tags by engagement

mod engine;
mod error;
mod record;
mod store;

pub use engine::{
    AnalyticsConfig, DEFAULT_SMOOTHING_K, Export, FeedbackEngine, RunTally, Statistics, TagScore,
    TimeSlot,
};
pub use error::StoreError;
pub use record::{ContentId, Engagement, OutcomeRecord, RunRecord, RunStatus};
pub use store::{DEFAULT_RUN_HISTORY, JsonFileStore, MemoryStore, MetricsStore};
