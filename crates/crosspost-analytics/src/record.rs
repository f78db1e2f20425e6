//! Outcome and run records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a source item, used as the deduplication key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(pub String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Engagement counters reported by the publishing platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Engagement {
    pub likes: u64,
    pub comments: u64,
    pub views: u64,
}

impl Engagement {
    pub fn new(likes: u64, comments: u64, views: u64) -> Self {
        Self {
            likes,
            comments,
            views,
        }
    }

    /// Likes plus comments.
    pub fn interactions(&self) -> u64 {
        self.likes + self.comments
    }

    /// Engagement rate as a percentage: `(likes + comments) / max(views, 1) * 100`.
    ///
    /// Returns `None` when there are no views, since the rate is undefined and
    /// such records must not influence rankings.
    pub fn rate(&self) -> Option<f64> {
        if self.views == 0 {
            return None;
        }
        Some(self.interactions() as f64 / self.views.max(1) as f64 * 100.0)
    }
}

/// Record of a successful publish.
///
/// Append-only: everything except `engagement` is fixed once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub content_id: ContentId,
    /// Identifier assigned by the publishing platform.
    pub external_id: String,
    /// Public URL of the published post.
    pub url: String,
    pub source_title: String,
    pub source_url: String,
    pub caption: String,
    pub tags: Vec<String>,
    pub category: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub engagement: Engagement,
    /// When engagement was last refreshed, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement_updated_at: Option<DateTime<Utc>>,
}

impl OutcomeRecord {
    pub fn engagement_rate(&self) -> Option<f64> {
        self.engagement.rate()
    }
}

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Published,
    Skipped,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Published => "published",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Summary of a finished pipeline run, written when it reaches a terminal stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: Uuid,
    pub content_id: ContentId,
    pub status: RunStatus,
    /// Short reason code, e.g. `dry-run` or `approval timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error detail for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Set when the failure needs an operator (e.g. publisher rejected credentials).
    #[serde(default)]
    pub needs_attention: bool,
    /// Attempts made per stage name.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
