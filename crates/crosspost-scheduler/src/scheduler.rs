//! Job scheduler implementation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{Clock, Job, JobId, JobOutcome, SchedulerError, SystemClock, Trigger};

/// Minimum sleep between loop iterations.
const MIN_SLEEP: Duration = Duration::from_millis(50);

/// Work performed when a job fires.
pub type JobFn = Arc<dyn Fn(JobContext) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// What a firing job gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub name: String,
    /// When the loop decided the job was due.
    pub fired_at: DateTime<Utc>,
    /// Flips to `true` when the scheduler is stopping.
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps before re-checking jobs.
    pub poll_interval: Duration,
    /// How long `stop` waits for running jobs before aborting them.
    pub grace_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(30),
        }
    }
}

struct Entry {
    job: Job,
    run: JobFn,
}

struct Shared {
    jobs: RwLock<Vec<Entry>>,
    wake: Notify,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

/// The job scheduler.
pub struct Scheduler {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                jobs: RwLock::new(Vec::new()),
                wake: Notify::new(),
                clock,
                config,
            }),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Receiver that flips to `true` once `stop` is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Register a job with any trigger.
    #[tracing::instrument(skip_all, fields(name = %name.as_ref()))]
    pub async fn register(
        &self,
        name: impl AsRef<str>,
        trigger: Trigger,
        run: JobFn,
    ) -> Result<JobId, SchedulerError> {
        let now = self.shared.clock.now();
        trigger.validate(now)?;

        let job = Job::new(name.as_ref().to_string(), trigger, now);
        let id = job.id;
        info!(job_id = %id, next_fire = ?job.next_fire, "registered job");

        self.shared.jobs.write().await.push(Entry { job, run });
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Fire every day at each `HH:MM` in `times`, local to `timezone`.
    pub async fn register_recurring(
        &self,
        name: impl AsRef<str>,
        times: &[impl AsRef<str>],
        timezone: &str,
        run: JobFn,
    ) -> Result<JobId, SchedulerError> {
        let trigger = Trigger::times_of_day(times, timezone)?;
        self.register(name, trigger, run).await
    }

    /// Fire once at `at`, which must not be in the past.
    pub async fn register_one_shot(
        &self,
        name: impl AsRef<str>,
        at: DateTime<Utc>,
        run: JobFn,
    ) -> Result<JobId, SchedulerError> {
        self.register(name, Trigger::Once { at }, run).await
    }

    /// Fire every `every`, first one `every` from now.
    pub async fn register_interval(
        &self,
        name: impl AsRef<str>,
        every: Duration,
        run: JobFn,
    ) -> Result<JobId, SchedulerError> {
        self.register(name, Trigger::Interval { every }, run).await
    }

    /// Remove a job. A running invocation is left to finish.
    ///
    /// Returns false if no such job exists.
    pub async fn cancel(&self, id: JobId) -> bool {
        let removed = {
            let mut jobs = self.shared.jobs.write().await;
            let before = jobs.len();
            jobs.retain(|e| e.job.id != id);
            jobs.len() != before
        };

        if removed {
            info!(job_id = %id, "cancelled job");
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Enable or disable a job. Re-enabling reschedules from now.
    pub async fn set_enabled(&self, id: JobId, enabled: bool) -> bool {
        let now = self.shared.clock.now();
        let mut jobs = self.shared.jobs.write().await;
        let Some(entry) = jobs.iter_mut().find(|e| e.job.id == id) else {
            return false;
        };

        if enabled && !entry.job.enabled && !entry.job.trigger.is_one_shot() {
            entry.job.next_fire = entry.job.trigger.next_after(now);
        }
        entry.job.enabled = enabled;
        debug!(job_id = %id, enabled, "job toggled");
        drop(jobs);

        self.shared.wake.notify_one();
        true
    }

    /// All jobs, soonest next fire first. Jobs without a next fire sort last.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .shared
            .jobs
            .read()
            .await
            .iter()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| match (a.next_fire, b.next_fire) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        jobs
    }

    pub async fn get_job(&self, id: JobId) -> Option<Job> {
        self.shared
            .jobs
            .read()
            .await
            .iter()
            .find(|e| e.job.id == id)
            .map(|e| e.job.clone())
    }

    /// Spawn the timing loop.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || *self.shutdown_tx.borrow() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let shared = Arc::clone(&self.shared);
        let shutdown_rx = self.shutdown_tx.subscribe();
        *handle = Some(tokio::spawn(shared.run(shutdown_rx)));
        Ok(())
    }

    /// Signal shutdown and wait for the loop to exit.
    ///
    /// Running jobs see the shutdown signal and get the grace period to
    /// finish; whatever is still running after that is aborted.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let handle = self
            .handle
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        info!("stopping scheduler");
        self.shutdown_tx.send_replace(true);

        handle
            .await
            .map_err(|e| SchedulerError::LoopFailed(e.to_string()))
    }
}

impl Shared {
    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!("scheduler starting");
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                log_task_exit(result);
            }

            self.fire_due(&mut tasks, &shutdown_rx).await;

            let sleep_duration = self.sleep_duration().await;
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        // Scheduler handle dropped without stop.
                        break;
                    }
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_duration) => {}
                Some(result) = tasks.join_next(), if !tasks.is_empty() => log_task_exit(result),
            }
        }

        self.drain(tasks).await;
        info!("scheduler shut down gracefully");
    }

    /// Fire every due job. A job whose previous invocation is still running
    /// is recorded as skipped instead.
    async fn fire_due(self: &Arc<Self>, tasks: &mut JoinSet<()>, shutdown_rx: &watch::Receiver<bool>) {
        let now = self.clock.now();
        let mut jobs = self.jobs.write().await;

        for entry in jobs.iter_mut().filter(|e| e.job.is_due(now)) {
            let job = &mut entry.job;
            job.last_fire = Some(now);
            job.next_fire = job.trigger.next_after(now);

            if job.running {
                warn!(
                    job_id = %job.id,
                    name = %job.name,
                    next_fire = ?job.next_fire,
                    "previous run still in progress, skipping"
                );
                job.last_outcome = Some(JobOutcome::Skipped);
                job.tally.record(JobOutcome::Skipped);
                continue;
            }

            job.running = true;
            info!(job_id = %job.id, name = %job.name, next_fire = ?job.next_fire, "firing job");

            let ctx = JobContext {
                job_id: job.id,
                name: job.name.clone(),
                fired_at: now,
                shutdown: shutdown_rx.clone(),
            };
            let run = Arc::clone(&entry.run);
            let shared = Arc::clone(self);
            let id = job.id;

            tasks.spawn(async move {
                let outcome = match AssertUnwindSafe(async move { run(ctx).await })
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        error!(job_id = %id, panic = %panic_message(&panic), "job panicked");
                        JobOutcome::Failure
                    }
                };
                shared.complete(id, outcome).await;
            });
        }
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) {
        let mut jobs = self.jobs.write().await;
        let Some(pos) = jobs.iter().position(|e| e.job.id == id) else {
            debug!(job_id = %id, ?outcome, "job finished after being cancelled");
            return;
        };

        let job = &mut jobs[pos].job;
        job.running = false;
        job.last_outcome = Some(outcome);
        job.tally.record(outcome);

        match outcome {
            JobOutcome::Failure => warn!(job_id = %id, name = %job.name, "job failed"),
            _ => debug!(job_id = %id, name = %job.name, ?outcome, "job finished"),
        }

        if job.trigger.is_one_shot() {
            jobs.remove(pos);
            debug!(job_id = %id, "one-shot job removed");
        }
    }

    async fn sleep_duration(&self) -> Duration {
        let now = self.clock.now();
        let next_due = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|e| e.job.enabled)
            .filter_map(|e| e.job.next_fire)
            .min();

        match next_due {
            Some(next) => (next - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_SLEEP, self.config.poll_interval.max(MIN_SLEEP)),
            None => self.config.poll_interval,
        }
    }

    /// Wait up to the grace period for running jobs, then abort the rest.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(running = tasks.len(), "waiting for running jobs");
        let wait_all = async {
            while let Some(result) = tasks.join_next().await {
                log_task_exit(result);
            }
        };

        if tokio::time::timeout(self.config.grace_period, wait_all)
            .await
            .is_err()
        {
            warn!(
                abandoned = tasks.len(),
                grace_secs = self.config.grace_period.as_secs(),
                "grace period elapsed, aborting running jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

fn log_task_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && !e.is_cancelled()
    {
        error!(error = %e, "job task ended abnormally");
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
