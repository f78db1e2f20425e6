//! Daemon command: the scheduler driving the pipeline.
//!
//! The daemon registers:
//! - the configured post times as one recurring job
//! - every entry of the schedule book
//! - the periodic engagement refresh
//!
//! and polls the approvals directory while it runs. Ctrl+C stops the
//! scheduler, which signals in-flight runs and waits out the grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use miette::{Result, miette};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crosspost_analytics::{JsonFileStore, MetricsStore};
use crosspost_pipeline::{
    ApprovalGate, EngagementSource, FailReason, Pipeline, PipelineConfig, PipelineRun, RunOutcome,
};
use crosspost_scheduler::{JobContext, JobFn, JobOutcome, Scheduler};

use crate::approvals::ApprovalInbox;
use crate::http::{Endpoints, HttpCollaborators};
use crate::schedule_book::ScheduleBook;
use crate::settings::Settings;

/// Open the metrics store configured in `settings`.
pub async fn open_store(settings: &Settings) -> Result<Arc<dyn MetricsStore>> {
    let path = settings.storage.metrics_path();
    let store = JsonFileStore::open(path.clone())
        .await
        .map_err(|e| miette!("failed to open metrics store {}: {}", path.display(), e))?
        .with_run_history(settings.storage.run_history);
    Ok(Arc::new(store))
}

/// Everything a pipeline run needs, wired from settings.
pub struct Runtime {
    pub http: Arc<HttpCollaborators>,
    pub pipeline: Arc<Pipeline>,
}

impl Runtime {
    pub async fn open(settings: &Settings, publish_token: Option<String>) -> Result<Self> {
        let store = open_store(settings).await?;

        let http = HttpCollaborators::new(
            Endpoints::from(&settings.services),
            publish_token,
            Duration::from_secs(settings.services.connect_timeout_secs),
        )
        .map_err(|e| miette!("failed to build HTTP client: {}", e))?;
        let http = Arc::new(http);
        debug!(endpoints = ?http.endpoints(), "collaborator endpoints");

        let pipeline = Arc::new(Pipeline::new(Arc::clone(&http).into_collaborators(), store));
        Ok(Self { http, pipeline })
    }
}

/// Counts runs started by scheduled jobs and how they ended.
#[derive(Debug, Default)]
pub struct RunCounters {
    started: AtomicUsize,
    finished: AtomicUsize,
    aborted: AtomicUsize,
}

impl RunCounters {
    fn begin(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a finished run and translate it for the scheduler's tally.
    pub fn observe(&self, run: &PipelineRun) -> JobOutcome {
        self.finished.fetch_add(1, Ordering::SeqCst);
        match &run.outcome {
            Some(RunOutcome::Published(_)) => JobOutcome::Success,
            Some(RunOutcome::Skipped(_)) => JobOutcome::Skipped,
            Some(RunOutcome::Failed { reason, .. }) => {
                if *reason == FailReason::AbortedByShutdown {
                    self.aborted.fetch_add(1, Ordering::SeqCst);
                }
                JobOutcome::Failure
            }
            None => JobOutcome::Failure,
        }
    }

    fn abandon(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    /// Runs that were cut short by shutdown, including ones whose task was
    /// aborted before it could report.
    pub fn aborted(&self) -> usize {
        let started = self.started.load(Ordering::SeqCst);
        let finished = self.finished.load(Ordering::SeqCst);
        self.aborted.load(Ordering::SeqCst) + started.saturating_sub(finished)
    }
}

/// Job that discovers and runs one candidate per fire.
pub fn post_job(
    pipeline: Arc<Pipeline>,
    config: Arc<PipelineConfig>,
    counters: Arc<RunCounters>,
) -> JobFn {
    Arc::new(move |ctx: JobContext| {
        let pipeline = Arc::clone(&pipeline);
        let config = Arc::clone(&config);
        let counters = Arc::clone(&counters);
        async move {
            info!(job = %ctx.name, fired_at = %ctx.fired_at, "starting pipeline run");
            counters.begin();
            match pipeline.run_once(config, ctx.shutdown).await {
                Ok(Some(run)) => counters.observe(&run),
                Ok(None) => {
                    counters.abandon();
                    JobOutcome::Skipped
                }
                Err(e) => {
                    counters.abandon();
                    error!(job = %ctx.name, error = %e, "pipeline run could not start");
                    JobOutcome::Failure
                }
            }
        }
        .boxed()
    })
}

/// Job that refreshes engagement for the most recent posts.
pub fn refresh_job(
    pipeline: Arc<Pipeline>,
    source: Arc<dyn EngagementSource>,
    limit: usize,
) -> JobFn {
    Arc::new(move |_ctx: JobContext| {
        let pipeline = Arc::clone(&pipeline);
        let source = Arc::clone(&source);
        async move {
            match pipeline.refresh_engagement(source.as_ref(), limit).await {
                Ok(_) => JobOutcome::Success,
                Err(e) => {
                    error!(error = %e, "engagement refresh failed");
                    JobOutcome::Failure
                }
            }
        }
        .boxed()
    })
}

/// Wrap a one-shot job so its book entry is dropped once it has fired.
fn forget_after_firing(job: JobFn, book: Arc<Mutex<ScheduleBook>>, entry_id: Uuid) -> JobFn {
    Arc::new(move |ctx: JobContext| {
        let run = job(ctx);
        let book = Arc::clone(&book);
        async move {
            let outcome = run.await;
            if let Err(e) = book.lock().await.remove(&entry_id.to_string()) {
                warn!(entry_id = %entry_id, error = %e, "failed to drop fired one-shot from schedule book");
            }
            outcome
        }
        .boxed()
    })
}

/// Register every schedule book entry. A malformed entry fails startup.
async fn register_book(
    scheduler: &Scheduler,
    settings: &Settings,
    post: &JobFn,
) -> Result<Arc<Mutex<ScheduleBook>>> {
    let mut book =
        ScheduleBook::load(settings.storage.schedules_path()).map_err(|e| miette!("{}", e))?;
    let pruned = book
        .prune_expired(Utc::now())
        .map_err(|e| miette!("{}", e))?;
    if pruned > 0 {
        info!(pruned, "dropped expired one-shot schedules");
    }

    let entries = book.entries().to_vec();
    let book = Arc::new(Mutex::new(book));

    for entry in entries {
        let trigger = entry
            .trigger
            .to_trigger()
            .map_err(|e| miette!("schedule '{}' ({}): {}", entry.name, entry.id, e))?;
        let run = if trigger.is_one_shot() {
            forget_after_firing(Arc::clone(post), Arc::clone(&book), entry.id)
        } else {
            Arc::clone(post)
        };
        scheduler
            .register(&entry.name, trigger, run)
            .await
            .map_err(|e| miette!("schedule '{}' ({}): {}", entry.name, entry.id, e))?;
    }

    Ok(book)
}

/// Forward approval decisions from `inbox` to `gate` until shutdown.
pub fn spawn_approval_poller(
    inbox: ApprovalInbox,
    gate: ApprovalGate,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = inbox.forward(&gate).await {
                        warn!(error = %e, "failed to read approval decisions");
                    }
                }
            }
        }
        debug!("approval poller stopped");
    })
}

pub async fn run(settings: Settings, publish_token: Option<String>, dry_run: bool) -> Result<()> {
    settings.validate().map_err(|e| miette!("{}", e))?;

    let config = Arc::new(settings.pipeline_config(dry_run));
    if !config.dry_run && publish_token.is_none() {
        warn!("no publish token set, the publisher will likely refuse posts");
    }

    let runtime = Runtime::open(&settings, publish_token).await?;
    let scheduler = Scheduler::new(settings.scheduler_config());
    let counters = Arc::new(RunCounters::default());
    let post = post_job(
        Arc::clone(&runtime.pipeline),
        Arc::clone(&config),
        Arc::clone(&counters),
    );

    if settings.schedule.enabled {
        let times = settings.schedule.effective_times();
        let id = scheduler
            .register_recurring(
                "scheduled post",
                &times,
                &settings.schedule.timezone,
                Arc::clone(&post),
            )
            .await
            .map_err(|e| miette!("failed to register post times: {}", e))?;
        info!(job_id = %id, ?times, timezone = %settings.schedule.timezone, "registered post times");
    }

    let _book = register_book(&scheduler, &settings, &post).await?;

    if settings.analytics.enabled {
        let source: Arc<dyn EngagementSource> = runtime.http.clone();
        scheduler
            .register_interval(
                "engagement refresh",
                Duration::from_secs(settings.analytics.refresh_interval_secs),
                refresh_job(
                    Arc::clone(&runtime.pipeline),
                    source,
                    settings.analytics.refresh_limit,
                ),
            )
            .await
            .map_err(|e| miette!("failed to register engagement refresh: {}", e))?;
    }

    scheduler
        .start()
        .await
        .map_err(|e| miette!("failed to start scheduler: {}", e))?;

    let poller = spawn_approval_poller(
        ApprovalInbox::new(settings.storage.approvals_dir()),
        runtime.pipeline.approvals().clone(),
        Duration::from_secs(settings.pipeline.approval_poll_secs),
        scheduler.shutdown_signal(),
    );

    for job in scheduler.list_jobs().await {
        info!(job_id = %job.id, name = %job.name, next_fire = ?job.next_fire, "scheduled");
    }
    info!(dry_run = config.dry_run, "daemon running, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal");

    scheduler
        .stop()
        .await
        .map_err(|e| miette!("failed to stop scheduler: {}", e))?;
    if let Err(e) = poller.await {
        warn!(error = %e, "approval poller ended abnormally");
    }

    let aborted = counters.aborted();
    if aborted > 0 {
        return Err(miette!("{} run(s) aborted by shutdown", aborted));
    }

    info!("daemon stopped");
    Ok(())
}
