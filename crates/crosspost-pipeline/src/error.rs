//! Error types for the pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Stage;

/// Classification of a collaborator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying: timeouts, rate limits, unavailable upstreams.
    Transient,
    /// Retrying cannot help: removed content, geo-blocks, rejected input.
    Permanent,
    /// Credentials were refused. Never retried automatically.
    AuthFailure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::AuthFailure => "authentication",
        };
        f.write_str(s)
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error)]
#[error("{kind} error: {message}")]
pub struct CollaboratorError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailure, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Errors surfaced by pipeline operations outside a run's own outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Candidate discovery failed.
    #[error("discovery failed: {0}")]
    Discovery(#[source] CollaboratorError),

    /// Metrics store error.
    #[error("metrics store error: {0}")]
    Store(#[from] crosspost_analytics::StoreError),

    /// A stage change not permitted by the transition table.
    #[error("invalid stage transition {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
