//! File-based approval inbox.
//!
//! `crosspost approve <id>` drops `<id>.approve` into the approvals directory
//! and `crosspost reject <id>` drops `<id>.reject`. The daemon polls the
//! directory and hands each decision to the pipeline's approval gate. A file
//! is deleted once a waiting run has taken it; decisions for runs that are not
//! waiting yet stay put until one asks.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crosspost_analytics::ContentId;
use crosspost_pipeline::{ApprovalGate, Decision};

const APPROVE_EXT: &str = "approve";
const REJECT_EXT: &str = "reject";

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approvals directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{0}' is not a usable content id")]
    InvalidId(String),
}

fn extension(decision: Decision) -> &'static str {
    match decision {
        Decision::Approve => APPROVE_EXT,
        Decision::Reject => REJECT_EXT,
    }
}

fn parse_file_name(name: &str) -> Option<(ContentId, Decision)> {
    let (stem, ext) = name.rsplit_once('.')?;
    let decision = match ext {
        APPROVE_EXT => Decision::Approve,
        REJECT_EXT => Decision::Reject,
        _ => return None,
    };
    (!stem.is_empty()).then(|| (ContentId::from(stem), decision))
}

#[derive(Debug, Clone)]
pub struct ApprovalInbox {
    dir: PathBuf,
}

impl ApprovalInbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn io_err(&self, source: std::io::Error) -> ApprovalError {
        ApprovalError::Io {
            path: self.dir.clone(),
            source,
        }
    }

    /// Record an operator decision. Replaces any earlier decision for the id.
    pub async fn submit(
        &self,
        content_id: &ContentId,
        decision: Decision,
    ) -> Result<PathBuf, ApprovalError> {
        let id = content_id.as_str();
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(['/', '\\'])
            || id.chars().any(char::is_control)
        {
            return Err(ApprovalError::InvalidId(id.to_string()));
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.io_err(e))?;

        let opposite = match decision {
            Decision::Approve => Decision::Reject,
            Decision::Reject => Decision::Approve,
        };
        let stale = self.dir.join(format!("{id}.{}", extension(opposite)));
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => debug!(content_id = %content_id, "replaced earlier decision"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(self.io_err(e)),
        }

        let path = self.dir.join(format!("{id}.{}", extension(decision)));
        tokio::fs::write(&path, chrono::Utc::now().to_rfc3339())
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(path)
    }

    /// Decisions currently waiting in the directory, sorted by content id.
    pub async fn decisions(&self) -> Result<Vec<(ContentId, Decision)>, ApprovalError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_err(e))? {
            let name = entry.file_name();
            if let Some(parsed) = name.to_str().and_then(parse_file_name) {
                found.push(parsed);
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }

    /// Hand waiting decisions to `gate`. Returns how many were consumed.
    pub async fn forward(&self, gate: &ApprovalGate) -> Result<usize, ApprovalError> {
        let mut consumed = 0;
        for (content_id, decision) in self.decisions().await? {
            if !gate.decide(&content_id, decision) {
                continue;
            }
            info!(content_id = %content_id, ?decision, "forwarded operator decision");
            consumed += 1;

            let path = self
                .dir
                .join(format!("{}.{}", content_id.as_str(), extension(decision)));
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove consumed decision");
            }
        }
        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("vid-1.approve"),
            Some((ContentId::from("vid-1"), Decision::Approve))
        );
        assert_eq!(
            parse_file_name("a.b.reject"),
            Some((ContentId::from("a.b"), Decision::Reject))
        );
        assert_eq!(parse_file_name("vid-1.json"), None);
        assert_eq!(parse_file_name(".approve"), None);
        assert_eq!(parse_file_name("noext"), None);
    }

    #[tokio::test]
    async fn test_submit_writes_decision_file() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::new(dir.path().join("approvals"));

        let path = inbox
            .submit(&ContentId::from("vid-1"), Decision::Approve)
            .await
            .unwrap();

        assert!(path.ends_with("vid-1.approve"));
        assert!(path.exists());
        assert_eq!(
            inbox.decisions().await.unwrap(),
            vec![(ContentId::from("vid-1"), Decision::Approve)]
        );
    }

    #[tokio::test]
    async fn test_later_decision_replaces_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::new(dir.path());
        let id = ContentId::from("vid-1");

        inbox.submit(&id, Decision::Approve).await.unwrap();
        inbox.submit(&id, Decision::Reject).await.unwrap();

        assert_eq!(
            inbox.decisions().await.unwrap(),
            vec![(id, Decision::Reject)]
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::new(dir.path());

        for bad in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                inbox.submit(&ContentId::from(bad), Decision::Approve).await,
                Err(ApprovalError::InvalidId(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::new(dir.path().join("absent"));
        assert!(inbox.decisions().await.unwrap().is_empty());
        assert_eq!(inbox.forward(&ApprovalGate::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_forward_keeps_decisions_nobody_waits_for() {
        let dir = tempfile::tempdir().unwrap();
        let inbox = ApprovalInbox::new(dir.path());
        inbox
            .submit(&ContentId::from("vid-1"), Decision::Approve)
            .await
            .unwrap();

        let consumed = inbox.forward(&ApprovalGate::new()).await.unwrap();

        assert_eq!(consumed, 0);
        assert_eq!(inbox.decisions().await.unwrap().len(), 1);
    }
}
