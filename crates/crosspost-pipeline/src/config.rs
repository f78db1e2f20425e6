//! Per-run pipeline configuration.
//!
//! A run reads one immutable [`PipelineConfig`] for its whole lifetime;
//! reloading configuration only affects runs started afterwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{EditingOptions, PipelineError, RetryPolicy, SearchFilters};

/// Phrases in a title or description that suggest content we may not repost.
pub const DEFAULT_COPYRIGHT_KEYWORDS: &[&str] = &[
    "official music video",
    "official video",
    "vevo",
    "full movie",
    "full episode",
    "hd movie",
    "soundtrack",
];

/// Admission criteria applied at the Filtered stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_views: u64,
    /// Minimum likes per view, e.g. `0.009` for 0.9%.
    pub min_like_ratio: f64,
    pub min_duration_secs: u32,
    pub max_duration_secs: u32,
    pub reject_copyright: bool,
    pub reject_nsfw: bool,
    pub copyright_keywords: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_views: 10_000,
            min_like_ratio: 0.009,
            min_duration_secs: 10,
            max_duration_secs: 60,
            reject_copyright: true,
            reject_nsfw: true,
            copyright_keywords: DEFAULT_COPYRIGHT_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionStyle {
    #[default]
    Inspiring,
    Casual,
    Informative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub style: CaptionStyle,
    pub hashtag_count: usize,
    pub custom_hashtags: Vec<String>,
    pub call_to_action: bool,
    /// Maximum caption length in characters, tags excluded.
    pub max_length: usize,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            style: CaptionStyle::Inspiring,
            hashtag_count: 15,
            custom_hashtags: Vec::new(),
            call_to_action: true,
            max_length: 2_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_secs: 2 * 60 * 60,
        }
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Everything a single pipeline run needs to know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Content category, e.g. `motivational` or `tech`.
    pub category: String,
    pub keywords: Vec<String>,
    pub search: SearchFilters,
    pub filter: FilterConfig,
    pub editing: EditingOptions,
    pub caption: CaptionConfig,
    pub approval: ApprovalConfig,
    /// Run everything except the publish call.
    pub dry_run: bool,
    /// Upper bound on a run's active work. Time spent waiting for approval
    /// is bounded separately.
    pub run_timeout_secs: u64,
    /// Upper bound on any single collaborator call.
    pub call_timeout_secs: u64,
    pub download_retry: RetryPolicy,
    /// Pause before the single transform retry.
    pub transform_retry_delay_ms: u64,
    pub publish_retry: RetryPolicy,
    /// Delete local artifacts once a run ends.
    pub cleanup_artifacts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            category: String::new(),
            keywords: Vec::new(),
            search: SearchFilters::default(),
            filter: FilterConfig::default(),
            editing: EditingOptions::default(),
            caption: CaptionConfig::default(),
            approval: ApprovalConfig::default(),
            dry_run: false,
            run_timeout_secs: 30 * 60,
            call_timeout_secs: 10 * 60,
            download_retry: RetryPolicy::download(),
            transform_retry_delay_ms: 5_000,
            publish_retry: RetryPolicy::publish(),
            cleanup_artifacts: true,
        }
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn transform_retry(&self) -> RetryPolicy {
        RetryPolicy::transform(Duration::from_millis(self.transform_retry_delay_ms))
    }

    /// Reject configurations a run cannot work with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.category.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "content category must be set".into(),
            ));
        }
        if self.keywords.iter().all(|k| k.trim().is_empty()) {
            return Err(PipelineError::InvalidConfig(
                "at least one search keyword is required".into(),
            ));
        }
        if self.filter.min_duration_secs > self.filter.max_duration_secs {
            return Err(PipelineError::InvalidConfig(format!(
                "min duration {}s exceeds max duration {}s",
                self.filter.min_duration_secs, self.filter.max_duration_secs
            )));
        }
        if self.run_timeout_secs == 0 || self.call_timeout_secs == 0 {
            return Err(PipelineError::InvalidConfig(
                "timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
