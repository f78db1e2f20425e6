//! Contracts for the external collaborators a run drives.
//!
//! Discovery, download, transformation, caption generation and publishing
//! are all opaque services. Each reports failures as a [`CollaboratorError`]
//! whose [`ErrorKind`](crate::ErrorKind) decides how the pipeline reacts.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use crosspost_analytics::{ContentId, Engagement};
use serde::{Deserialize, Serialize};

use crate::CollaboratorError;

/// Content safety flags reported by discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFlags {
    #[serde(default)]
    pub copyright: bool,
    #[serde(default)]
    pub nsfw: bool,
}

/// A source item found by discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub id: ContentId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    pub duration_secs: u32,
    pub view_count: u64,
    pub like_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub flags: ContentFlags,
}

impl Candidate {
    /// Likes per view. Zero views are treated as one.
    pub fn like_ratio(&self) -> f64 {
        self.like_count as f64 / self.view_count.max(1) as f64
    }
}

/// Search parameters handed to discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchFilters {
    pub max_results: u32,
    /// Upload window, e.g. `today`, `this_week` or `this_month`.
    pub timeframe: String,
    pub min_views: u64,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            max_results: 50,
            timeframe: "this_week".to_string(),
            min_views: 10_000,
        }
    }
}

/// Handle to a local media file produced by download or transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Editing parameters for the transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditingOptions {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
    pub burn_subtitles: bool,
    pub intro_outro: bool,
}

impl Default for EditingOptions {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            watermark: None,
            burn_subtitles: false,
            intro_outro: false,
        }
    }
}

/// Caption text plus hashtags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub tags: Vec<String>,
}

impl Caption {
    /// Text followed by a blank line and space-separated tags.
    pub fn full_text(&self) -> String {
        if self.tags.is_empty() {
            return self.text.clone();
        }
        format!("{}\n\n{}", self.text, self.tags.join(" "))
    }
}

/// What the publisher returns for a successful post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub external_id: String,
    pub url: String,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    /// Ordered candidates matching the keywords, best first.
    async fn find(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>, CollaboratorError>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, candidate: &Candidate) -> Result<Artifact, CollaboratorError>;
}

#[async_trait]
pub trait Transformer: Send + Sync {
    async fn process(
        &self,
        artifact: &Artifact,
        options: &EditingOptions,
    ) -> Result<Artifact, CollaboratorError>;
}

#[async_trait]
pub trait Captioner: Send + Sync {
    async fn generate(&self, candidate: &Candidate) -> Result<Caption, CollaboratorError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        artifact: &Artifact,
        caption: &str,
        tags: &[String],
    ) -> Result<Receipt, CollaboratorError>;
}

/// Source of fresh engagement counters for published posts.
#[async_trait]
pub trait EngagementSource: Send + Sync {
    async fn fetch(&self, external_id: &str) -> Result<Engagement, CollaboratorError>;
}

/// The full set of collaborators a pipeline drives.
#[derive(Clone)]
pub struct Collaborators {
    pub discovery: Arc<dyn Discovery>,
    pub downloader: Arc<dyn Downloader>,
    pub transformer: Arc<dyn Transformer>,
    pub captioner: Arc<dyn Captioner>,
    pub publisher: Arc<dyn Publisher>,
}
