//! Drives candidates through the stage machine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crosspost_analytics::{Engagement, MetricsStore, OutcomeRecord};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::approval::ApprovalRequest;
use crate::retry::with_retry;
use crate::{
    ActiveRunRegistry, ApprovalGate, Artifact, Candidate, Caption, CollaboratorError,
    Collaborators, Decision, EngagementSource, ErrorKind, FailReason, PipelineConfig,
    PipelineError, PipelineRun, Receipt, RunOutcome, SkipReason, Stage, admit, finish_caption,
    template_caption,
};

/// Early exit from a run: the error side carries the terminal outcome.
type Step<T> = Result<T, RunOutcome>;

/// Output of the preparation stages, ready to publish.
struct Prepared {
    artifact: Artifact,
    caption: Caption,
}

/// The pipeline: collaborators, the outcome store and the run bookkeeping
/// shared by every run.
pub struct Pipeline {
    collaborators: Collaborators,
    store: Arc<dyn MetricsStore>,
    registry: ActiveRunRegistry,
    approvals: ApprovalGate,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            collaborators,
            store,
            registry: ActiveRunRegistry::new(),
            approvals: ApprovalGate::new(),
        }
    }

    pub fn registry(&self) -> &ActiveRunRegistry {
        &self.registry
    }

    pub fn approvals(&self) -> &ApprovalGate {
        &self.approvals
    }

    pub fn store(&self) -> &Arc<dyn MetricsStore> {
        &self.store
    }

    /// Ask discovery for candidates matching the configured keywords.
    pub async fn discover(&self, config: &PipelineConfig) -> Result<Vec<Candidate>, PipelineError> {
        let search = self
            .collaborators
            .discovery
            .find(&config.keywords, &config.search);

        match tokio::time::timeout(config.call_timeout(), search).await {
            Ok(result) => result.map_err(PipelineError::Discovery),
            Err(_) => Err(PipelineError::Discovery(CollaboratorError::transient(
                "discovery timed out",
            ))),
        }
    }

    /// First candidate that is not published, not in flight and passes admission.
    pub async fn select_candidate(
        &self,
        config: &PipelineConfig,
        candidates: Vec<Candidate>,
    ) -> Result<Option<Candidate>, PipelineError> {
        for candidate in candidates {
            if self.registry.is_active(&candidate.id) {
                debug!(content_id = %candidate.id, "candidate already in flight");
                continue;
            }
            if self.store.get(&candidate.id).await?.is_some() {
                debug!(content_id = %candidate.id, "candidate already published");
                continue;
            }
            if let Err(reason) = admit(&candidate, &config.filter, &config.category) {
                debug!(content_id = %candidate.id, %reason, "candidate not admitted");
                continue;
            }
            return Ok(Some(candidate));
        }
        Ok(None)
    }

    /// Discover candidates and run the first eligible one.
    ///
    /// Returns `Ok(None)` when nothing eligible was found.
    #[instrument(skip_all, fields(category = %config.category, dry_run = config.dry_run))]
    pub async fn run_once(
        &self,
        config: Arc<PipelineConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Option<PipelineRun>, PipelineError> {
        let candidates = self.discover(&config).await?;
        info!(count = candidates.len(), "discovered candidates");

        let Some(candidate) = self.select_candidate(&config, candidates).await? else {
            info!("no eligible candidates");
            return Ok(None);
        };

        Ok(Some(self.run_candidate(config, candidate, shutdown).await))
    }

    /// Run one candidate to a terminal stage.
    ///
    /// Never returns an unfinished run. A second concurrent run for the same
    /// content id ends immediately as skipped.
    #[instrument(skip_all, fields(content_id = %candidate.id))]
    pub async fn run_candidate(
        &self,
        config: Arc<PipelineConfig>,
        candidate: Candidate,
        mut shutdown: watch::Receiver<bool>,
    ) -> PipelineRun {
        let mut run = PipelineRun::new(candidate.id.clone());

        let Some(_slot) = self.registry.try_acquire(&candidate.id, run.run_id) else {
            info!("run already in flight for this content");
            run.finish(RunOutcome::Skipped(SkipReason::DuplicateInFlight));
            return run;
        };

        info!(run_id = %run.run_id, title = %candidate.title, "starting run");

        let mut artifacts = Vec::new();
        let outcome = self
            .drive(&mut run, &candidate, &config, &mut artifacts, &mut shutdown)
            .await;

        match &outcome {
            RunOutcome::Published(receipt) => {
                info!(external_id = %receipt.external_id, url = %receipt.url, "published")
            }
            RunOutcome::Skipped(reason) => info!(stage = %run.stage, %reason, "skipped"),
            RunOutcome::Failed { reason, detail } => {
                warn!(stage = %run.stage, %reason, %detail, "run failed")
            }
        }
        run.finish(outcome);

        if config.cleanup_artifacts {
            release_artifacts(&mut artifacts).await;
        }

        if let Some(record) = run.to_record()
            && let Err(e) = self.store.record_run(record).await
        {
            warn!(error = %e, "failed to record run");
        }

        run
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        candidate: &Candidate,
        config: &PipelineConfig,
        artifacts: &mut Vec<Artifact>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> RunOutcome {
        match self.store.get(&candidate.id).await {
            Ok(None) => {}
            Ok(Some(_)) => return RunOutcome::Skipped(SkipReason::AlreadyPublished),
            Err(e) => return RunOutcome::failed(FailReason::Internal, e.to_string()),
        }

        let started = Instant::now();
        let budget = config.run_timeout();

        let prepared = match bounded(
            shutdown,
            started + budget,
            self.prepare(run, candidate, config, artifacts),
        )
        .await
        {
            Ok(prepared) => prepared,
            Err(outcome) => return outcome,
        };

        if config.dry_run {
            info!(caption = %prepared.caption.full_text(), "dry-run, not publishing");
            return RunOutcome::Skipped(SkipReason::DryRun);
        }

        // Waiting on an operator does not eat into the work budget.
        let mut waited = Duration::ZERO;
        if config.approval.enabled {
            let wait_started = Instant::now();
            if let Err(outcome) = self
                .await_approval(run, candidate, &prepared.caption, config, shutdown)
                .await
            {
                return outcome;
            }
            waited = wait_started.elapsed();
        }

        match bounded(
            shutdown,
            started + budget + waited,
            self.publish(run, candidate, &prepared, config),
        )
        .await
        {
            Ok(receipt) => RunOutcome::Published(receipt),
            Err(outcome) => outcome,
        }
    }

    /// Filter, download, transform and caption.
    async fn prepare(
        &self,
        run: &mut PipelineRun,
        candidate: &Candidate,
        config: &PipelineConfig,
        artifacts: &mut Vec<Artifact>,
    ) -> Step<Prepared> {
        admit(candidate, &config.filter, &config.category).map_err(RunOutcome::Skipped)?;
        enter(run, Stage::Filtered)?;

        let downloader = &self.collaborators.downloader;
        let downloaded = with_retry(
            "download",
            &config.download_retry,
            config.call_timeout(),
            run.attempts_mut(Stage::Downloaded),
            |kind| kind == ErrorKind::Transient,
            || downloader.fetch(candidate),
        )
        .await
        .map_err(|e| match e.kind {
            ErrorKind::Permanent => {
                info!(error = %e, "source content unavailable");
                RunOutcome::Skipped(SkipReason::ContentUnavailable)
            }
            ErrorKind::Transient | ErrorKind::AuthFailure => {
                RunOutcome::failed(FailReason::DownloadFailed, e.to_string())
            }
        })?;
        artifacts.push(downloaded.clone());
        enter(run, Stage::Downloaded)?;

        let transformer = &self.collaborators.transformer;
        let edited = match with_retry(
            "transform",
            &config.transform_retry(),
            config.call_timeout(),
            run.attempts_mut(Stage::Edited),
            |_| true,
            || transformer.process(&downloaded, &config.editing),
        )
        .await
        {
            Ok(edited) => edited,
            Err(e) => {
                release_artifacts(artifacts).await;
                return Err(RunOutcome::failed(FailReason::TransformFailed, e.to_string()));
            }
        };
        artifacts.push(edited.clone());
        enter(run, Stage::Edited)?;

        *run.attempts_mut(Stage::Captioned) += 1;
        let generate = self.collaborators.captioner.generate(candidate);
        let generated = match tokio::time::timeout(config.call_timeout(), generate).await {
            Ok(Ok(caption)) => caption,
            Ok(Err(e)) => {
                warn!(error = %e, "captioner failed, using template");
                template_caption(candidate, &config.category, &config.caption)
            }
            Err(_) => {
                warn!("captioner timed out, using template");
                template_caption(candidate, &config.category, &config.caption)
            }
        };
        let caption = finish_caption(generated, candidate, &config.caption);
        enter(run, Stage::Captioned)?;

        Ok(Prepared {
            artifact: edited,
            caption,
        })
    }

    async fn await_approval(
        &self,
        run: &mut PipelineRun,
        candidate: &Candidate,
        caption: &Caption,
        config: &PipelineConfig,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Step<()> {
        enter(run, Stage::PendingApproval)?;

        let mut ticket = self.approvals.request(ApprovalRequest {
            content_id: candidate.id.clone(),
            run_id: run.run_id,
            title: candidate.title.clone(),
            caption: caption.full_text(),
            requested_at: Utc::now(),
        });
        let timeout = config.approval.timeout();

        tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => Err(RunOutcome::failed(
                FailReason::AbortedByShutdown,
                "shutdown while awaiting approval",
            )),
            decision = tokio::time::timeout(timeout, ticket.decision()) => match decision {
                Ok(Some(Decision::Approve)) => Ok(()),
                Ok(Some(Decision::Reject)) | Ok(None) => Err(RunOutcome::Skipped(SkipReason::Rejected)),
                Err(_) => {
                    info!(timeout_secs = timeout.as_secs(), "no approval decision in time");
                    Err(RunOutcome::Skipped(SkipReason::ApprovalTimeout))
                }
            },
        }
    }

    async fn publish(
        &self,
        run: &mut PipelineRun,
        candidate: &Candidate,
        prepared: &Prepared,
        config: &PipelineConfig,
    ) -> Step<Receipt> {
        let publisher = &self.collaborators.publisher;
        let result = with_retry(
            "publish",
            &config.publish_retry,
            config.call_timeout(),
            run.attempts_mut(Stage::Published),
            |kind| kind == ErrorKind::Transient,
            || publisher.publish(&prepared.artifact, &prepared.caption.text, &prepared.caption.tags),
        )
        .await;

        let receipt = match result {
            Ok(receipt) => receipt,
            Err(e) => {
                return Err(match e.kind {
                    ErrorKind::AuthFailure => {
                        error!(error = %e, "publisher rejected credentials, operator attention needed");
                        run.needs_attention = true;
                        RunOutcome::failed(FailReason::PublisherAuth, e.to_string())
                    }
                    ErrorKind::Permanent => {
                        RunOutcome::failed(FailReason::PublishRejected, e.to_string())
                    }
                    ErrorKind::Transient => {
                        RunOutcome::failed(FailReason::PublishFailed, e.to_string())
                    }
                });
            }
        };

        let record = OutcomeRecord {
            content_id: candidate.id.clone(),
            external_id: receipt.external_id.clone(),
            url: receipt.url.clone(),
            source_title: candidate.title.clone(),
            source_url: candidate.url.clone(),
            caption: prepared.caption.text.clone(),
            tags: prepared.caption.tags.clone(),
            category: config.category.clone(),
            published_at: Utc::now(),
            engagement: Engagement::default(),
            engagement_updated_at: None,
        };
        if let Err(e) = self.store.append(record).await {
            error!(error = %e, external_id = %receipt.external_id, "published but outcome not recorded");
            run.needs_attention = true;
        }

        Ok(receipt)
    }

    /// Pull fresh engagement for the `limit` most recent posts.
    ///
    /// Per-post failures are logged and skipped. Returns how many were updated.
    #[instrument(skip(self, source))]
    pub async fn refresh_engagement(
        &self,
        source: &dyn EngagementSource,
        limit: usize,
    ) -> Result<usize, PipelineError> {
        let mut records = self.store.all().await?;
        records.sort_by(|a, b| b.published_at.cmp(&a.published_at));

        let mut updated = 0;
        for record in records.into_iter().take(limit) {
            match source.fetch(&record.external_id).await {
                Ok(engagement) => {
                    self.store
                        .update_engagement(&record.content_id, engagement)
                        .await?;
                    updated += 1;
                }
                Err(e) => {
                    warn!(content_id = %record.content_id, error = %e, "engagement fetch failed")
                }
            }
        }

        info!(updated, "refreshed engagement");
        Ok(updated)
    }
}

fn enter(run: &mut PipelineRun, stage: Stage) -> Step<()> {
    run.advance(stage)
        .map_err(|e| RunOutcome::failed(FailReason::Internal, e.to_string()))?;
    debug!(%stage, "entered stage");
    Ok(())
}

/// Run `work` until it finishes, the deadline passes or shutdown is requested.
async fn bounded<T>(
    shutdown: &mut watch::Receiver<bool>,
    deadline: Instant,
    work: impl Future<Output = Step<T>>,
) -> Step<T> {
    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => Err(RunOutcome::failed(
            FailReason::AbortedByShutdown,
            "shutdown requested",
        )),
        result = tokio::time::timeout_at(deadline, work) => result.unwrap_or_else(|_| {
            Err(RunOutcome::failed(FailReason::OverallTimeout, "run exceeded its time budget"))
        }),
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn release_artifacts(artifacts: &mut Vec<Artifact>) {
    for artifact in artifacts.drain(..) {
        match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => debug!(path = %artifact.path.display(), "removed artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %artifact.path.display(), error = %e, "failed to remove artifact"),
        }
    }
}
