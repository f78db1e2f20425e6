//! Pipeline state machine for crosspost.
//!
//! Carries one content item from discovery through filtering, download,
//! editing, captioning and publication, with:
//! - An explicit stage transition table
//! - Bounded exponential backoff for transient collaborator failures
//! - At most one active run per content id
//! - An optional manual approval gate before publishing

mod approval;
mod caption;
mod collaborators;
mod config;
mod error;
mod filter;
mod machine;
mod registry;
mod retry;
mod run;
mod stage;

pub use approval::{ApprovalGate, ApprovalRequest, Decision};
pub use caption::{MAX_TAGS, finish_caption, template_caption};
pub use collaborators::{
    Artifact, Candidate, Caption, Captioner, Collaborators, ContentFlags, Discovery, Downloader,
    EditingOptions, EngagementSource, Publisher, Receipt, SearchFilters, Transformer,
};
pub use config::{ApprovalConfig, CaptionConfig, CaptionStyle, FilterConfig, PipelineConfig};
pub use error::{CollaboratorError, ErrorKind, PipelineError};
pub use filter::admit;
pub use machine::Pipeline;
pub use registry::{ActiveRunRegistry, RunSlot};
pub use retry::{RetryPolicy, TRANSFORM_ATTEMPTS};
pub use run::{FailReason, PipelineRun, RunOutcome, SkipReason};
pub use stage::Stage;
