//! Metrics store contract and backends.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{ContentId, Engagement, OutcomeRecord, RunRecord, StoreError};

/// Durable keyed storage of outcome records.
///
/// Writers for the same content id are serialized; writers for distinct ids
/// may proceed concurrently.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Append a new outcome record. Fails if one exists for the content id.
    async fn append(&self, record: OutcomeRecord) -> Result<(), StoreError>;

    /// Replace the engagement counters of an existing record.
    async fn update_engagement(
        &self,
        content_id: &ContentId,
        engagement: Engagement,
    ) -> Result<(), StoreError>;

    /// Snapshot of all outcome records, ordered by publish time.
    async fn all(&self) -> Result<Vec<OutcomeRecord>, StoreError>;

    /// Look up the outcome record for a content id.
    async fn get(&self, content_id: &ContentId) -> Result<Option<OutcomeRecord>, StoreError>;

    /// Record the terminal state of a pipeline run.
    async fn record_run(&self, run: RunRecord) -> Result<(), StoreError>;

    /// Recorded runs, oldest first. Backends may keep only the most recent ones.
    async fn runs(&self) -> Result<Vec<RunRecord>, StoreError>;

    /// Counter bumped on every outcome write. Used to invalidate derived signals.
    fn generation(&self) -> u64;
}

/// How many run records a store keeps unless told otherwise.
pub const DEFAULT_RUN_HISTORY: usize = 1_000;

/// In-memory metrics store.
pub struct MemoryStore {
    records: DashMap<ContentId, OutcomeRecord>,
    runs: RwLock<Vec<RunRecord>>,
    run_history: usize,
    generation: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            runs: RwLock::new(Vec::new()),
            run_history: DEFAULT_RUN_HISTORY,
            generation: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` run records, dropping the oldest first.
    /// Outcome records are never dropped.
    pub fn with_run_history(mut self, limit: usize) -> Self {
        self.run_history = limit;
        trim_runs(self.runs.get_mut(), limit);
        self
    }

    fn from_parts(records: Vec<OutcomeRecord>, runs: Vec<RunRecord>) -> Self {
        let mut store = Self::new();
        for record in records {
            store.records.insert(record.content_id.clone(), record);
        }
        store.runs = RwLock::new(runs);
        store
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn append(&self, record: OutcomeRecord) -> Result<(), StoreError> {
        match self.records.entry(record.content_id.clone()) {
            Entry::Occupied(entry) => Err(StoreError::Duplicate(entry.key().clone())),
            Entry::Vacant(entry) => {
                debug!(content_id = %record.content_id, "appended outcome record");
                entry.insert(record);
                self.bump();
                Ok(())
            }
        }
    }

    async fn update_engagement(
        &self,
        content_id: &ContentId,
        engagement: Engagement,
    ) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(content_id)
            .ok_or_else(|| StoreError::NotFound(content_id.clone()))?;
        record.engagement = engagement;
        record.engagement_updated_at = Some(Utc::now());
        drop(record);

        self.bump();
        Ok(())
    }

    async fn all(&self) -> Result<Vec<OutcomeRecord>, StoreError> {
        let mut records: Vec<OutcomeRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| {
            a.published_at
                .cmp(&b.published_at)
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        Ok(records)
    }

    async fn get(&self, content_id: &ContentId) -> Result<Option<OutcomeRecord>, StoreError> {
        Ok(self.records.get(content_id).map(|r| r.value().clone()))
    }

    async fn record_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        runs.push(run);
        trim_runs(&mut runs, self.run_history);
        Ok(())
    }

    async fn runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        Ok(self.runs.read().await.clone())
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn trim_runs(runs: &mut Vec<RunRecord>, limit: usize) {
    if runs.len() > limit {
        let excess = runs.len() - limit;
        runs.drain(..excess);
    }
}

/// On-disk layout of [`JsonFileStore`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    records: Vec<OutcomeRecord>,
    #[serde(default)]
    runs: Vec<RunRecord>,
}

/// Metrics store persisted as a single JSON document.
///
/// Every write is applied in memory and then the full snapshot is written to a
/// sibling temp file and renamed over the target, so readers of the file never
/// observe a partial write.
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open a store at `path`, loading existing contents if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let file = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreFile>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreFile::default(),
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            records = file.records.len(),
            runs = file.runs.len(),
            "opened metrics store"
        );

        Ok(Self {
            path,
            inner: MemoryStore::from_parts(file.records, file.runs),
            write_lock: Mutex::new(()),
        })
    }

    /// Keep at most `limit` run records. Takes effect on the next write.
    pub fn with_run_history(mut self, limit: usize) -> Self {
        self.inner = self.inner.with_run_history(limit);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            records: self.inner.all().await?,
            runs: self.inner.runs().await?,
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for JsonFileStore {
    async fn append(&self, record: OutcomeRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.append(record).await?;
        self.persist().await
    }

    async fn update_engagement(
        &self,
        content_id: &ContentId,
        engagement: Engagement,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.update_engagement(content_id, engagement).await?;
        self.persist().await
    }

    async fn all(&self) -> Result<Vec<OutcomeRecord>, StoreError> {
        self.inner.all().await
    }

    async fn get(&self, content_id: &ContentId) -> Result<Option<OutcomeRecord>, StoreError> {
        self.inner.get(content_id).await
    }

    async fn record_run(&self, run: RunRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.record_run(run).await?;
        self.persist().await
    }

    async fn runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.runs().await
    }

    fn generation(&self) -> u64 {
        self.inner.generation()
    }
}
