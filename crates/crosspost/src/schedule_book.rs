//! Operator-defined schedules persisted between daemon restarts.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crosspost_scheduler::{SchedulerError, Trigger};

#[derive(Debug, Error)]
pub enum BookError {
    #[error("failed to access schedule book {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed schedule book {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("schedule '{name}': {source}")]
    Invalid {
        name: String,
        #[source]
        source: SchedulerError,
    },

    #[error("no schedule matches '{0}'")]
    UnknownEntry(String),

    #[error("'{0}' matches more than one schedule")]
    Ambiguous(String),
}

/// When a booked schedule fires, as the operator wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookTrigger {
    Recurring { times: Vec<String>, timezone: String },
    Once { at: DateTime<Utc> },
}

impl BookTrigger {
    pub fn to_trigger(&self) -> Result<Trigger, SchedulerError> {
        match self {
            BookTrigger::Recurring { times, timezone } => Trigger::times_of_day(times, timezone),
            BookTrigger::Once { at } => Ok(Trigger::Once { at: *at }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookEntry {
    pub id: Uuid,
    pub name: String,
    pub trigger: BookTrigger,
    pub created_at: DateTime<Utc>,
}

impl BookEntry {
    /// A one-shot whose instant has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.trigger, BookTrigger::Once { at } if at < now)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BookFile {
    #[serde(default)]
    entries: Vec<BookEntry>,
}

/// JSON file of booked schedules.
#[derive(Debug)]
pub struct ScheduleBook {
    path: PathBuf,
    entries: Vec<BookEntry>,
}

impl ScheduleBook {
    /// Load the book at `path`. A missing file is an empty book.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, BookError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<BookFile>(&bytes)
                    .map_err(|source| BookError::Json {
                        path: path.clone(),
                        source,
                    })?
                    .entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(BookError::Io { path, source }),
        };
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[BookEntry] {
        &self.entries
    }

    /// Validate and add an entry, then persist the book.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        trigger: BookTrigger,
        now: DateTime<Utc>,
    ) -> Result<BookEntry, BookError> {
        let name = name.into();
        trigger
            .to_trigger()
            .and_then(|t| t.validate(now))
            .map_err(|source| BookError::Invalid {
                name: name.clone(),
                source,
            })?;

        let entry = BookEntry {
            id: Uuid::new_v4(),
            name,
            trigger,
            created_at: now,
        };
        self.entries.push(entry.clone());
        self.save()?;
        Ok(entry)
    }

    /// Remove the entry whose id equals or starts with `id`, then persist.
    pub fn remove(&mut self, id: &str) -> Result<BookEntry, BookError> {
        let id = id.trim();
        let matches: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !id.is_empty() && e.id.to_string().starts_with(id))
            .map(|(i, _)| i)
            .collect();

        let index = match matches.as_slice() {
            [] => return Err(BookError::UnknownEntry(id.to_string())),
            [index] => *index,
            _ => return Err(BookError::Ambiguous(id.to_string())),
        };
        let removed = self.entries.remove(index);
        self.save()?;
        Ok(removed)
    }

    /// Drop one-shots that can no longer fire. Returns how many were dropped.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> Result<usize, BookError> {
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now));
        let pruned = before - self.entries.len();
        if pruned > 0 {
            self.save()?;
        }
        Ok(pruned)
    }

    fn save(&self) -> Result<(), BookError> {
        let io_err = |source: std::io::Error| BookError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        let file = BookFile {
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| BookError::Json {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)
    }
}
