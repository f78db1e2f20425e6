//! End-to-end runs against scripted collaborators.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;

use crosspost_analytics::{ContentId, Engagement, MemoryStore, MetricsStore, RunStatus};
use crosspost_pipeline::{
    Artifact, Candidate, Caption, Captioner, CollaboratorError, Collaborators, ContentFlags,
    Discovery, Downloader, EditingOptions, EngagementSource, FailReason, Pipeline,
    PipelineConfig, Publisher, Receipt, RetryPolicy, RunOutcome, SearchFilters, SkipReason, Stage,
    TRANSFORM_ATTEMPTS, Transformer,
};

// ============================================================================
// Scripted collaborators
// ============================================================================

struct FixedDiscovery(Vec<Candidate>);

#[async_trait]
impl Discovery for FixedDiscovery {
    async fn find(
        &self,
        _keywords: &[String],
        _filters: &SearchFilters,
    ) -> Result<Vec<Candidate>, CollaboratorError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct FakeDownloader {
    failures: Mutex<VecDeque<CollaboratorError>>,
    calls: AtomicU32,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
    dir: Option<PathBuf>,
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, candidate: &Candidate) -> Result<Artifact, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }

        let path = match &self.dir {
            Some(dir) => {
                let path = dir.join(format!("{}.mp4", candidate.id));
                tokio::fs::write(&path, b"raw")
                    .await
                    .map_err(|e| CollaboratorError::transient(e.to_string()))?;
                path
            }
            None => PathBuf::from(format!("/nonexistent/{}.mp4", candidate.id)),
        };
        Ok(Artifact::new(path))
    }
}

#[derive(Default)]
struct FakeTransformer {
    failures: Mutex<VecDeque<CollaboratorError>>,
    calls: AtomicU32,
}

#[async_trait]
impl Transformer for FakeTransformer {
    async fn process(
        &self,
        artifact: &Artifact,
        _options: &EditingOptions,
    ) -> Result<Artifact, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(Artifact::new(artifact.path.with_extension("edited.mp4")))
    }
}

#[derive(Default)]
struct FakeCaptioner {
    fail: bool,
}

#[async_trait]
impl Captioner for FakeCaptioner {
    async fn generate(&self, candidate: &Candidate) -> Result<Caption, CollaboratorError> {
        if self.fail {
            return Err(CollaboratorError::transient("caption service down"));
        }
        Ok(Caption {
            text: format!("Generated for {}", candidate.title),
            tags: vec!["#generated".into()],
        })
    }
}

#[derive(Default)]
struct FakePublisher {
    failures: Mutex<VecDeque<CollaboratorError>>,
    calls: AtomicU32,
    last_caption: Mutex<Option<String>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        artifact: &Artifact,
        caption: &str,
        _tags: &[String],
    ) -> Result<Receipt, CollaboratorError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        *self.last_caption.lock().unwrap() = Some(caption.to_string());
        Ok(Receipt {
            external_id: format!("ext-{n}"),
            url: format!("https://social.example/p/{}", artifact.path.display()),
        })
    }
}

struct FixedEngagement;

#[async_trait]
impl EngagementSource for FixedEngagement {
    async fn fetch(&self, external_id: &str) -> Result<Engagement, CollaboratorError> {
        if external_id == "ext-missing" {
            return Err(CollaboratorError::permanent("post deleted"));
        }
        Ok(Engagement::new(40, 10, 1_000))
    }
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct Fakes {
    downloader: FakeDownloader,
    transformer: FakeTransformer,
    captioner: FakeCaptioner,
    publisher: FakePublisher,
}

struct Harness {
    pipeline: Arc<Pipeline>,
    store: Arc<MemoryStore>,
    downloader: Arc<FakeDownloader>,
    transformer: Arc<FakeTransformer>,
    publisher: Arc<FakePublisher>,
    // Keeps the shutdown channel open for the duration of a test.
    shutdown_tx: watch::Sender<bool>,
}

impl Fakes {
    fn build(self, candidates: Vec<Candidate>) -> Harness {
        let downloader = Arc::new(self.downloader);
        let transformer = Arc::new(self.transformer);
        let publisher = Arc::new(self.publisher);
        let store = Arc::new(MemoryStore::new());

        let collaborators = Collaborators {
            discovery: Arc::new(FixedDiscovery(candidates)),
            downloader: downloader.clone(),
            transformer: transformer.clone(),
            captioner: Arc::new(self.captioner),
            publisher: publisher.clone(),
        };
        let pipeline = Arc::new(Pipeline::new(collaborators, store.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Harness {
            pipeline,
            store,
            downloader,
            transformer,
            publisher,
            shutdown_tx,
        }
    }
}

impl Harness {
    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    async fn run(&self, config: PipelineConfig, candidate: Candidate) -> crosspost_pipeline::PipelineRun {
        self.pipeline
            .run_candidate(Arc::new(config), candidate, self.shutdown_rx())
            .await
    }
}

fn candidate(id: &str) -> Candidate {
    Candidate {
        id: id.into(),
        title: "Five habits of focused people".into(),
        description: "A short clip".into(),
        url: format!("https://video.example/watch?v={id}"),
        duration_secs: 45,
        view_count: 50_000,
        like_count: 2_000,
        category: Some("motivational".into()),
        channel: Some("focus".into()),
        flags: ContentFlags::default(),
    }
}

fn config() -> PipelineConfig {
    let fast = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));
    PipelineConfig {
        category: "motivational".into(),
        keywords: vec!["habits".into()],
        download_retry: fast.clone(),
        transform_retry_delay_ms: 5,
        publish_retry: fast,
        cleanup_artifacts: false,
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// Happy path and dry run
// ============================================================================

#[tokio::test]
async fn test_run_publishes_and_records_outcome() {
    let h = Fakes::default().build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert_eq!(
        run.history(),
        &[
            Stage::Discovered,
            Stage::Filtered,
            Stage::Downloaded,
            Stage::Edited,
            Stage::Captioned,
            Stage::Published,
        ]
    );

    let record = h.store.get(&"vid1".into()).await.unwrap().unwrap();
    assert_eq!(record.external_id, "ext-1");
    assert_eq!(record.category, "motivational");
    assert!(record.tags.contains(&"#generated".to_string()));

    let runs = h.store.runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Published);
    assert!(h.pipeline.registry().is_empty());
}

#[tokio::test]
async fn test_dry_run_never_publishes() {
    let h = Fakes::default().build(vec![]);
    let config = PipelineConfig {
        dry_run: true,
        ..config()
    };

    let run = h.run(config, candidate("vid1")).await;

    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::DryRun)));
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.get(&"vid1".into()).await.unwrap().is_none());

    let runs = h.store.runs().await.unwrap();
    assert_eq!(runs[0].reason.as_deref(), Some("dry-run"));
}

#[tokio::test]
async fn test_dry_run_skips_approval_gate() {
    let h = Fakes::default().build(vec![]);
    let mut config = PipelineConfig {
        dry_run: true,
        ..config()
    };
    config.approval.enabled = true;

    let run = h.run(config, candidate("vid1")).await;

    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::DryRun)));
    assert!(!run.history().contains(&Stage::PendingApproval));
}

#[tokio::test]
async fn test_filtered_out_candidate_is_skipped() {
    let h = Fakes::default().build(vec![]);
    let mut c = candidate("vid1");
    c.view_count = 10;

    let run = h.run(config(), c).await;

    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::BelowMinViews)));
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_already_published_is_skipped() {
    let h = Fakes::default().build(vec![]);
    let first = h.run(config(), candidate("vid1")).await;
    assert!(matches!(first.outcome, Some(RunOutcome::Published(_))));

    let second = h.run(config(), candidate("vid1")).await;

    assert_eq!(second.outcome, Some(RunOutcome::Skipped(SkipReason::AlreadyPublished)));
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Retry semantics
// ============================================================================

#[tokio::test]
async fn test_download_retries_transient_failures() {
    let fakes = Fakes {
        downloader: FakeDownloader {
            failures: Mutex::new(VecDeque::from([
                CollaboratorError::transient("503"),
                CollaboratorError::transient("timeout"),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert_eq!(run.attempts_at(Stage::Downloaded), 3);
}

#[tokio::test]
async fn test_download_exhaustion_fails_run() {
    let fakes = Fakes {
        downloader: FakeDownloader {
            failures: Mutex::new(VecDeque::from(vec![CollaboratorError::transient("503"); 5])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::DownloadFailed,
            ..
        })
    ));
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 3);
    assert_eq!(run.attempts_at(Stage::Downloaded), 3);
}

#[tokio::test]
async fn test_permanent_download_failure_skips_without_retry() {
    let fakes = Fakes {
        downloader: FakeDownloader {
            failures: Mutex::new(VecDeque::from([CollaboratorError::permanent("removed")])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::ContentUnavailable)));
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transform_retried_once_then_fails_and_releases_download() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes {
        downloader: FakeDownloader {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
        transformer: FakeTransformer {
            failures: Mutex::new(VecDeque::from([
                CollaboratorError::permanent("bad codec"),
                CollaboratorError::permanent("bad codec"),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::TransformFailed,
            ..
        })
    ));
    assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 2);
    assert!(!dir.path().join("vid1.mp4").exists());
}

#[tokio::test]
async fn test_transform_attempts_do_not_follow_other_stage_policies() {
    let fakes = Fakes {
        transformer: FakeTransformer {
            failures: Mutex::new(VecDeque::from([
                CollaboratorError::transient("busy"),
                CollaboratorError::transient("busy"),
                CollaboratorError::transient("busy"),
            ])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);
    let config = PipelineConfig {
        download_retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        publish_retry: RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1)),
        ..config()
    };

    let run = h.run(config, candidate("vid1")).await;

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::TransformFailed,
            ..
        })
    ));
    assert_eq!(
        h.transformer.calls.load(Ordering::SeqCst),
        TRANSFORM_ATTEMPTS
    );
}

#[tokio::test]
async fn test_transform_recovers_on_its_single_retry() {
    let fakes = Fakes {
        transformer: FakeTransformer {
            failures: Mutex::new(VecDeque::from([CollaboratorError::transient("busy")])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert_eq!(h.transformer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_caption_failure_falls_back_to_template() {
    let fakes = Fakes {
        captioner: FakeCaptioner { fail: true },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    let caption = h.publisher.last_caption.lock().unwrap().clone().unwrap();
    assert!(caption.starts_with("Five habits of focused people"));

    let record = h.store.get(&"vid1".into()).await.unwrap().unwrap();
    assert!(record.tags.contains(&"#motivation".to_string()));
}

#[tokio::test]
async fn test_publish_auth_failure_needs_attention() {
    let fakes = Fakes {
        publisher: FakePublisher {
            failures: Mutex::new(VecDeque::from([CollaboratorError::auth("token expired")])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::PublisherAuth,
            ..
        })
    ));
    assert!(run.needs_attention);
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 1);

    let runs = h.store.runs().await.unwrap();
    assert!(runs[0].needs_attention);
    assert!(h.store.get(&"vid1".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_publish_retries_rate_limits() {
    let fakes = Fakes {
        publisher: FakePublisher {
            failures: Mutex::new(VecDeque::from([CollaboratorError::transient("429")])),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let run = h.run(config(), candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert_eq!(run.attempts_at(Stage::Published), 2);
}

#[tokio::test]
async fn test_artifacts_cleaned_after_run() {
    let dir = tempfile::tempdir().unwrap();
    let fakes = Fakes {
        downloader: FakeDownloader {
            dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);
    let config = PipelineConfig {
        cleanup_artifacts: true,
        ..config()
    };

    let run = h.run(config, candidate("vid1")).await;

    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert!(!dir.path().join("vid1.mp4").exists());
}

// ============================================================================
// Approval
// ============================================================================

#[tokio::test]
async fn test_approved_run_publishes() {
    let h = Fakes::default().build(vec![]);
    let mut config = config();
    config.approval.enabled = true;

    let pipeline = h.pipeline.clone();
    let rx = h.shutdown_rx();
    let task = tokio::spawn(async move {
        pipeline
            .run_candidate(Arc::new(config), candidate("vid1"), rx)
            .await
    });

    wait_until(|| !h.pipeline.approvals().pending().is_empty()).await;
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 0);
    assert!(h.pipeline.approvals().approve(&"vid1".into()));

    let run = task.await.unwrap();
    assert!(matches!(run.outcome, Some(RunOutcome::Published(_))));
    assert!(run.history().contains(&Stage::PendingApproval));
}

#[tokio::test]
async fn test_rejected_run_is_skipped() {
    let h = Fakes::default().build(vec![]);
    let mut config = config();
    config.approval.enabled = true;

    let pipeline = h.pipeline.clone();
    let rx = h.shutdown_rx();
    let task = tokio::spawn(async move {
        pipeline
            .run_candidate(Arc::new(config), candidate("vid1"), rx)
            .await
    });

    wait_until(|| !h.pipeline.approvals().pending().is_empty()).await;
    assert!(h.pipeline.approvals().reject(&"vid1".into()));

    let run = task.await.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::Rejected)));
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_approval_times_out() {
    let h = Fakes::default().build(vec![]);
    let mut config = config();
    config.approval.enabled = true;
    config.approval.timeout_secs = 2 * 60 * 60;
    // Shorter than the approval wait: the wait must not count against it.
    config.run_timeout_secs = 30 * 60;

    let started = tokio::time::Instant::now();
    let run = h.run(config, candidate("vid1")).await;

    assert_eq!(run.outcome, Some(RunOutcome::Skipped(SkipReason::ApprovalTimeout)));
    assert!(started.elapsed() >= Duration::from_secs(2 * 60 * 60));
    assert!(h.pipeline.approvals().pending().is_empty());
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 0);

    let runs = h.store.runs().await.unwrap();
    assert_eq!(runs[0].reason.as_deref(), Some("approval timeout"));
}

// ============================================================================
// Concurrency, timeouts and shutdown
// ============================================================================

#[tokio::test]
async fn test_concurrent_runs_for_same_item_admit_one() {
    let gate = Arc::new(Notify::new());
    let fakes = Fakes {
        downloader: FakeDownloader {
            gate: Some(gate.clone()),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);
    let config = Arc::new(config());

    let mut runs = JoinSet::new();
    for _ in 0..5 {
        let pipeline = h.pipeline.clone();
        let config = config.clone();
        let rx = h.shutdown_rx();
        runs.spawn(async move { pipeline.run_candidate(config, candidate("hot"), rx).await });
    }

    // The winner is parked in download; the other four finish on their own.
    let mut finished = Vec::new();
    for _ in 0..4 {
        finished.push(runs.join_next().await.unwrap().unwrap());
    }
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);
    gate.notify_one();
    finished.push(runs.join_next().await.unwrap().unwrap());

    let past_discovered = finished
        .iter()
        .filter(|run| run.history().contains(&Stage::Filtered))
        .count();
    let duplicates = finished
        .iter()
        .filter(|run| run.outcome == Some(RunOutcome::Skipped(SkipReason::DuplicateInFlight)))
        .count();

    assert_eq!(past_discovered, 1);
    assert_eq!(duplicates, 4);
    assert_eq!(h.publisher.calls.load(Ordering::SeqCst), 1);
    assert!(h.pipeline.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_run() {
    let fakes = Fakes {
        downloader: FakeDownloader {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);

    let pipeline = h.pipeline.clone();
    let rx = h.shutdown_rx();
    let task = tokio::spawn(async move {
        pipeline
            .run_candidate(Arc::new(config()), candidate("vid1"), rx)
            .await
    });

    wait_until(|| h.downloader.calls.load(Ordering::SeqCst) == 1).await;
    h.shutdown_tx.send(true).unwrap();

    let run = task.await.unwrap();
    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::AbortedByShutdown,
            ..
        })
    ));
    assert_eq!(run.to_record().unwrap().reason.as_deref(), Some("aborted by shutdown"));
    assert!(h.pipeline.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_overall_timeout_fails_run() {
    let fakes = Fakes {
        downloader: FakeDownloader {
            delay: Some(Duration::from_secs(120)),
            ..Default::default()
        },
        ..Default::default()
    };
    let h = fakes.build(vec![]);
    let config = PipelineConfig {
        run_timeout_secs: 60,
        call_timeout_secs: 300,
        ..config()
    };

    let run = h.run(config, candidate("vid1")).await;

    assert!(matches!(
        run.outcome,
        Some(RunOutcome::Failed {
            reason: FailReason::OverallTimeout,
            ..
        })
    ));
    assert_eq!(run.stage, Stage::Failed);
}

// ============================================================================
// Discovery and engagement
// ============================================================================

#[tokio::test]
async fn test_run_once_picks_first_eligible_candidate() {
    let mut low = candidate("low");
    low.view_count = 5;
    let h = Fakes::default().build(vec![low, candidate("vid1"), candidate("vid2")]);

    let run = h
        .pipeline
        .run_once(Arc::new(config()), h.shutdown_rx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.content_id, ContentId::from("vid1"));

    let next = h
        .pipeline
        .run_once(Arc::new(config()), h.shutdown_rx())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.content_id, ContentId::from("vid2"));
}

#[tokio::test]
async fn test_run_once_without_candidates() {
    let h = Fakes::default().build(vec![]);

    let run = h
        .pipeline
        .run_once(Arc::new(config()), h.shutdown_rx())
        .await
        .unwrap();

    assert!(run.is_none());
}

#[tokio::test]
async fn test_refresh_engagement_updates_recent_posts() {
    let h = Fakes::default().build(vec![]);
    h.run(config(), candidate("vid1")).await;
    h.run(config(), candidate("vid2")).await;

    let updated = h
        .pipeline
        .refresh_engagement(&FixedEngagement, 10)
        .await
        .unwrap();

    assert_eq!(updated, 2);
    let record = h.store.get(&"vid1".into()).await.unwrap().unwrap();
    assert_eq!(record.engagement, Engagement::new(40, 10, 1_000));
}
