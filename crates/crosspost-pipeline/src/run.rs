//! A single item's run through the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crosspost_analytics::{ContentId, RunRecord, RunStatus};
use uuid::Uuid;

use crate::{PipelineError, Receipt, Stage};

/// Why a run ended without publishing, through no fault of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    BelowMinViews,
    BelowLikeRatio,
    DurationOutOfBounds,
    CategoryMismatch,
    Copyright,
    Nsfw,
    /// Downloader reported the content as permanently unavailable.
    ContentUnavailable,
    DryRun,
    Rejected,
    ApprovalTimeout,
    /// Another run already holds this content id.
    DuplicateInFlight,
    AlreadyPublished,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::BelowMinViews => "below minimum views",
            SkipReason::BelowLikeRatio => "below minimum like ratio",
            SkipReason::DurationOutOfBounds => "duration out of bounds",
            SkipReason::CategoryMismatch => "category mismatch",
            SkipReason::Copyright => "copyright risk",
            SkipReason::Nsfw => "nsfw",
            SkipReason::ContentUnavailable => "content unavailable",
            SkipReason::DryRun => "dry-run",
            SkipReason::Rejected => "rejected",
            SkipReason::ApprovalTimeout => "approval timeout",
            SkipReason::DuplicateInFlight => "duplicate in flight",
            SkipReason::AlreadyPublished => "already published",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailReason {
    DownloadFailed,
    TransformFailed,
    PublishFailed,
    /// Publisher refused our credentials.
    PublisherAuth,
    /// Publisher refused the post itself.
    PublishRejected,
    OverallTimeout,
    AbortedByShutdown,
    Internal,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::DownloadFailed => "download failed",
            FailReason::TransformFailed => "transform failed",
            FailReason::PublishFailed => "publish failed",
            FailReason::PublisherAuth => "publisher authentication failed",
            FailReason::PublishRejected => "publish rejected",
            FailReason::OverallTimeout => "overall timeout",
            FailReason::AbortedByShutdown => "aborted by shutdown",
            FailReason::Internal => "internal error",
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Published(Receipt),
    Skipped(SkipReason),
    Failed { reason: FailReason, detail: String },
}

impl RunOutcome {
    pub fn failed(reason: FailReason, detail: impl Into<String>) -> Self {
        RunOutcome::Failed {
            reason,
            detail: detail.into(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            RunOutcome::Published(_) => Stage::Published,
            RunOutcome::Skipped(_) => Stage::Skipped,
            RunOutcome::Failed { .. } => Stage::Failed,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Published(_) => RunStatus::Published,
            RunOutcome::Skipped(_) => RunStatus::Skipped,
            RunOutcome::Failed { .. } => RunStatus::Failed,
        }
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            RunOutcome::Published(_) => None,
            RunOutcome::Skipped(reason) => Some(reason.as_str()),
            RunOutcome::Failed { reason, .. } => Some(reason.as_str()),
        }
    }
}

/// State of one content item's run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub content_id: ContentId,
    pub stage: Stage,
    pub attempts: BTreeMap<Stage, u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    /// Set when the failure needs an operator, e.g. rejected credentials.
    pub needs_attention: bool,
    history: Vec<Stage>,
}

impl PipelineRun {
    pub fn new(content_id: ContentId) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            content_id,
            stage: Stage::Discovered,
            attempts: BTreeMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: None,
            needs_attention: false,
            history: vec![Stage::Discovered],
        }
    }

    /// Every stage this run has been in, in order.
    pub fn history(&self) -> &[Stage] {
        &self.history
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn attempts_at(&self, stage: Stage) -> u32 {
        self.attempts.get(&stage).copied().unwrap_or(0)
    }

    pub(crate) fn attempts_mut(&mut self, stage: Stage) -> &mut u32 {
        self.attempts.entry(stage).or_default()
    }

    /// Move to `next` if the transition table allows it.
    pub fn advance(&mut self, next: Stage) -> Result<(), PipelineError> {
        if !self.stage.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }
        self.stage = next;
        self.history.push(next);
        Ok(())
    }

    /// Record the outcome and move to its terminal stage.
    pub(crate) fn finish(&mut self, outcome: RunOutcome) {
        if self.is_finished() {
            return;
        }
        let stage = outcome.stage();
        debug_assert!(self.stage.can_transition_to(stage), "{} -> {stage}", self.stage);
        self.stage = stage;
        self.history.push(stage);
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }

    /// Summary for the metrics store. `None` until the run has finished.
    pub fn to_record(&self) -> Option<RunRecord> {
        let outcome = self.outcome.as_ref()?;
        let detail = match outcome {
            RunOutcome::Failed { detail, .. } if !detail.is_empty() => Some(detail.clone()),
            _ => None,
        };

        Some(RunRecord {
            run_id: self.run_id,
            content_id: self.content_id.clone(),
            status: outcome.status(),
            reason: outcome.reason().map(str::to_string),
            detail,
            needs_attention: self.needs_attention,
            attempts: self
                .attempts
                .iter()
                .map(|(stage, n)| (stage.to_string(), *n))
                .collect(),
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or(self.started_at),
        })
    }
}
