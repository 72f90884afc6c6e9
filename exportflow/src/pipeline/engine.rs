//! The run orchestrator.
//!
//! A run is one [`PipelineContext`] driven through the five executable
//! stages in order. Failed attempts are retried in place under the same run
//! id until the retry bound is reached. Cancellation is cooperative: the
//! engine observes it before each stage, around every snapshot write and
//! during the backoff sleep, but never interrupts a stage in flight.

use super::registry::{ActiveRunRegistry, RunHandle};
use super::retry::{RetryDecision, RetryPolicy};
use crate::cleanup::{
    cleanup_temp_files, discard_run_dir, purge_older_than, spawn_detached_cleanup, CleanupFailure,
    CleanupFailureChannel,
};
use crate::config::{EngineConfig, RunConfig};
use crate::context::{PipelineContext, PipelineResult};
use crate::core::{PipelineStage, PipelineStatus};
use crate::errors::{PipelineError, PipelineFailure, StoreError};
use crate::observability::SpanTimer;
use crate::stages::ports::Collaborators;
use crate::stages::{StageContext, StageHandler, StageOutcome, StageSet};
use crate::store::StateStore;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Receives `(overall_percentage, message)` as a run advances.
pub type ProgressCallback = Arc<dyn Fn(f64, &str) + Send + Sync>;

/// Parameters of a single run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Who requested the run.
    pub owner: String,
    /// The source to export.
    pub source_id: String,
    /// Wire name of the source kind. Validated by the fetch stage.
    pub source_kind: String,
    /// Per-run options.
    pub config: RunConfig,
    /// Whether failed attempts may be retried.
    pub retry_enabled: bool,
}

impl RunRequest {
    /// Creates a request with default options and retries enabled.
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        source_id: impl Into<String>,
        source_kind: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            source_id: source_id.into(),
            source_kind: source_kind.into(),
            config: RunConfig::default(),
            retry_enabled: true,
        }
    }

    /// Sets the per-run options.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Disables retries for this run.
    #[must_use]
    pub const fn without_retry(mut self) -> Self {
        self.retry_enabled = false;
        self
    }
}

/// How the attempt loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Completed,
    Failed,
    Cancelled,
}

/// A registered run and everything needed to release it.
///
/// Created as soon as the run is registered. If it is dropped before
/// [`PipelineEngine::finish`] disarms it (the driving future was dropped or
/// its task aborted), the run is unregistered, its files are removed on a
/// detached task, and it is persisted as failed unless it was cancelled.
struct RunGuard {
    ctx: PipelineContext,
    handle: Arc<RunHandle>,
    registry: Arc<ActiveRunRegistry>,
    store: Arc<dyn StateStore>,
    failures: mpsc::Sender<CleanupFailure>,
    cleanup_timeout: Duration,
    run_dir: PathBuf,
    armed: bool,
}

impl RunGuard {
    /// Releases the run normally and returns its result.
    fn disarm(&mut self) -> PipelineResult {
        self.registry.unregister(self.ctx.id);
        self.armed = false;
        PipelineResult::from_context(&self.ctx)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.ctx.id;
        self.registry.unregister(id);
        warn!(
            run_id = %id,
            status = %self.ctx.status,
            panicking = std::thread::panicking(),
            "Run abandoned before finishing"
        );

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(run_id = %id, "No runtime to clean up abandoned run");
            return;
        };
        let _entered = runtime.enter();

        let completed = self.ctx.status == PipelineStatus::Completed;
        let mut paths = self.ctx.temp_files.clone();
        if !completed {
            paths.extend(self.ctx.output_files.iter().cloned());
        }
        let cleanup = spawn_detached_cleanup(id, paths, self.cleanup_timeout, self.failures.clone());
        let run_dir = (!completed).then(|| self.run_dir.clone());
        let store = Arc::clone(&self.store);
        let handle = Arc::clone(&self.handle);
        let mut ctx = self.ctx.clone();

        runtime.spawn(async move {
            let _ = cleanup.await;
            if let Some(dir) = run_dir {
                discard_run_dir(&dir).await;
            }
            let _guard = handle.lock_persist().await;
            if handle.is_cancelled() {
                return;
            }
            ctx.output_files.clear();
            ctx.mark_abandoned("Run abandoned before reaching a terminal state");
            if let Err(e) = store.save(&ctx).await {
                error!(run_id = %ctx.id, error = %e, "Failed to persist abandoned run");
            }
        });
    }
}

/// Drives runs, owns the active-run registry, and answers state queries.
pub struct PipelineEngine {
    store: Arc<dyn StateStore>,
    stages: StageSet,
    retry: RetryPolicy,
    config: EngineConfig,
    registry: Arc<ActiveRunRegistry>,
    cleanup_failures: Arc<CleanupFailureChannel>,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("store", &self.store.backend_name())
            .field("retry", &self.retry)
            .field("active_runs", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Creates an engine over a store and a stage table.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, stages: StageSet, config: EngineConfig) -> Self {
        Self {
            store,
            stages,
            retry: RetryPolicy::from_config(&config),
            config,
            registry: Arc::new(ActiveRunRegistry::new()),
            cleanup_failures: CleanupFailureChannel::new(),
        }
    }

    /// Creates an engine with the standard stages bound to `collaborators`.
    #[must_use]
    pub fn with_collaborators(
        store: Arc<dyn StateStore>,
        collaborators: &Collaborators,
        config: EngineConfig,
    ) -> Self {
        let stages = StageSet::standard(collaborators, config.compression_threshold_bytes);
        Self::new(store, stages, config)
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Replaces the channel that receives detached cleanup failures.
    #[must_use]
    pub fn with_cleanup_failures(mut self, channel: Arc<CleanupFailureChannel>) -> Self {
        self.cleanup_failures = channel;
        self
    }

    /// Returns the state store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs a pipeline to a terminal state.
    ///
    /// Never fails: every outcome, including store failures and
    /// cancellation, is reported through the returned [`PipelineResult`].
    /// Dropping the future before it resolves abandons the run: it leaves
    /// the registry at once and is cleaned up and persisted as failed in
    /// the background.
    pub async fn execute(
        &self,
        request: RunRequest,
        progress: Option<ProgressCallback>,
    ) -> PipelineResult {
        let retry_enabled = request.retry_enabled;
        let run = self.prepare(request).await;
        let span = run_span(&run.ctx);
        self.drive(run, retry_enabled, progress)
            .instrument(span)
            .await
    }

    /// Registers and persists a run, then drives it on its own task.
    ///
    /// The run id is available before the run finishes, which is what
    /// [`cancel`](Self::cancel) needs. Aborting the task abandons the run
    /// the same way dropping [`execute`](Self::execute) does.
    pub async fn start(
        self: &Arc<Self>,
        request: RunRequest,
        progress: Option<ProgressCallback>,
    ) -> (Uuid, JoinHandle<PipelineResult>) {
        let retry_enabled = request.retry_enabled;
        let run = self.prepare(request).await;
        let id = run.ctx.id;
        let span = run_span(&run.ctx);
        let engine = Arc::clone(self);
        let task = tokio::spawn(
            async move { engine.drive(run, retry_enabled, progress).await }.instrument(span),
        );
        (id, task)
    }

    /// Returns the persisted snapshot of a run.
    pub async fn get_status(&self, id: Uuid) -> Result<Option<PipelineContext>, StoreError> {
        self.store.get(id).await
    }

    /// Cancels a run on behalf of `owner`.
    ///
    /// Returns false if the run does not exist, belongs to someone else, or
    /// is already terminal. A stage already executing runs to its end; the
    /// engine stops at its next check.
    pub async fn cancel(&self, id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let handle = self.registry.get(id);
        let guard = match handle.as_deref() {
            Some(h) => Some(h.lock_persist().await),
            None => None,
        };

        let Some(mut snapshot) = self.store.get(id).await? else {
            return Ok(false);
        };
        if snapshot.owner != owner {
            warn!(run_id = %id, owner, "Cancel rejected: owner mismatch");
            return Ok(false);
        }
        if snapshot.status.is_terminal() {
            debug!(run_id = %id, status = %snapshot.status, "Cancel ignored: run already terminal");
            return Ok(false);
        }

        if let Some(h) = handle.as_deref() {
            h.request_cancel();
        }
        snapshot.mark_cancelled();
        // Artifacts of a cancelled run are discarded with its temp files.
        let outputs = std::mem::take(&mut snapshot.output_files);
        self.store.save(&snapshot).await?;
        drop(guard);

        if handle.is_some() {
            let mut paths = snapshot.temp_files.clone();
            paths.extend(outputs);
            spawn_detached_cleanup(
                id,
                paths,
                self.cleanup_timeout(),
                self.cleanup_failures.sender(),
            );
            self.registry.unregister(id);
        }
        info!(run_id = %id, owner, "Run cancelled");
        Ok(true)
    }

    /// Returns up to `limit` of `owner`'s runs, newest first.
    ///
    /// `limit` is capped by the configured history limit.
    pub async fn list_history(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<PipelineContext>, StoreError> {
        self.store
            .scan_by_owner(owner, limit.min(self.config.history_limit))
            .await
    }

    /// Deletes records created more than `max_age_hours` ago.
    pub async fn purge_expired(&self, max_age_hours: u32) -> Result<Vec<Uuid>, StoreError> {
        purge_older_than(
            self.store.as_ref(),
            chrono::Duration::hours(i64::from(max_age_hours)),
            Utc::now(),
        )
        .await
    }

    /// Returns the number of runs in flight.
    #[must_use]
    pub fn active_run_count(&self) -> usize {
        self.registry.len()
    }

    /// Returns true if the run is in flight.
    #[must_use]
    pub fn is_active(&self, id: Uuid) -> bool {
        self.registry.contains(id)
    }

    /// Failures reported by cleanup detached from cancelled or abandoned runs.
    ///
    /// The channel is bounded; reports beyond its capacity are only logged
    /// until it is drained.
    #[must_use]
    pub fn cleanup_failures(&self) -> Arc<CleanupFailureChannel> {
        Arc::clone(&self.cleanup_failures)
    }

    fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.cleanup_timeout_seconds.max(0.0))
    }

    async fn prepare(&self, request: RunRequest) -> RunGuard {
        let max_retries = request
            .config
            .max_retries
            .unwrap_or_else(|| self.retry.max_retries());
        let ctx = PipelineContext::new(
            request.owner,
            request.source_id,
            request.source_kind,
            max_retries,
        )
        .with_config(&request.config);

        let handle = self.registry.register(ctx.id, &ctx.owner);
        let run = RunGuard {
            run_dir: self.config.work_dir.join(ctx.id.to_string()),
            ctx,
            handle,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            failures: self.cleanup_failures.sender(),
            cleanup_timeout: self.cleanup_timeout(),
            armed: true,
        };
        if let Err(e) = self.store.save(&run.ctx).await {
            // The first attempt persists again and fails through the retry path.
            error!(run_id = %run.ctx.id, error = %e, "Failed to persist new run");
        }
        info!(
            run_id = %run.ctx.id,
            owner = %run.ctx.owner,
            source_kind = %run.ctx.source_kind,
            max_retries,
            "Run created"
        );
        run
    }

    async fn drive(
        &self,
        mut run: RunGuard,
        retry_enabled: bool,
        progress: Option<ProgressCallback>,
    ) -> PipelineResult {
        let timer = SpanTimer::start("pipeline_run");
        let end = loop {
            let attempt = self.run_attempt(&mut run.ctx, &run.handle, progress.as_ref()).await;
            let failure = match attempt {
                Ok(()) => break RunEnd::Completed,
                Err(failure) => failure,
            };
            if run.handle.is_cancelled() || matches!(failure.error, PipelineError::Cancelled(_)) {
                break RunEnd::Cancelled;
            }

            let ctx = &mut run.ctx;
            let decision = if retry_enabled {
                self.retry
                    .decide(ctx.retry_count, ctx.max_retries, failure.is_retryable())
            } else {
                RetryDecision::GiveUp
            };
            let RetryDecision::Retry(delay) = decision else {
                error!(
                    stage = failure.stage.as_str(),
                    retry_count = ctx.retry_count,
                    error = %failure.message,
                    "Run failed"
                );
                break RunEnd::Failed;
            };

            discard_outputs(ctx).await;
            ctx.mark_retrying();
            let note = format!(
                "Retry {}/{} scheduled in {}ms after: {}",
                ctx.retry_count,
                ctx.max_retries,
                delay.as_millis(),
                failure.message
            );
            ctx.add_error(failure.stage, note);
            warn!(
                stage = failure.stage.as_str(),
                attempt = ctx.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "Stage failed, retrying"
            );
            if let Err(e) = self.persist(&run.ctx, &run.handle).await {
                if matches!(e, PipelineError::Cancelled(_)) {
                    break RunEnd::Cancelled;
                }
                warn!(error = %e, "Failed to persist retry state");
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = run.handle.cancelled() => break RunEnd::Cancelled,
            }
            run.ctx.reset_for_retry();
        };

        let result = self.finish(&mut run, end).await;
        info!(
            success = result.success,
            status = %result.status,
            duration_ms = timer.finish(),
            "Run finished"
        );
        result
    }

    async fn run_attempt(
        &self,
        ctx: &mut PipelineContext,
        handle: &RunHandle,
        progress: Option<&ProgressCallback>,
    ) -> Result<(), PipelineFailure> {
        ctx.mark_running();
        let total = PipelineStage::EXECUTION_ORDER.len();

        for (index, (stage, handler)) in self.stages.iter().enumerate() {
            if handle.is_cancelled() {
                return Err(PipelineFailure::new(
                    stage,
                    PipelineError::Cancelled("cancellation requested".to_string()),
                ));
            }

            ctx.begin_stage(stage);
            if let Err(e) = self.persist(ctx, handle).await {
                return Err(stage_failed(ctx, stage, e));
            }

            let timer = SpanTimer::start(stage.as_str());
            let outcome = self.run_stage(ctx, stage, handler, index, progress).await;
            let duration_ms = timer.finish();
            match outcome {
                Ok(outcome) => outcome.apply_to(ctx, stage),
                Err(e) => return Err(stage_failed(ctx, stage, e)),
            }

            let overall = ctx.complete_stage(stage);
            debug!(stage = stage.as_str(), duration_ms, progress = overall, "Stage completed");
            if let Some(callback) = progress {
                callback(overall, &format!("Completed {}", stage.as_str()));
            }

            // 100% is only persisted together with Completed.
            if index + 1 < total {
                if let Err(e) = self.persist(ctx, handle).await {
                    return Err(stage_failed(ctx, stage, e));
                }
            }
            self.yield_between_stages().await;
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        ctx: &PipelineContext,
        stage: PipelineStage,
        handler: &Arc<dyn StageHandler>,
        index: usize,
        progress: Option<&ProgressCallback>,
    ) -> Result<StageOutcome, PipelineError> {
        let total = PipelineStage::EXECUTION_ORDER.len() as f64;
        let message = format!("Running {}", stage.as_str());
        let forward = |pct: f64| {
            if let Some(callback) = progress {
                callback((index as f64 + pct / 100.0) / total * 100.0, &message);
            }
        };
        let stage_ctx = StageContext::new(ctx, stage, &self.config.work_dir).with_progress(&forward);

        // A panicking handler fails its attempt instead of the whole run.
        let attempt = AssertUnwindSafe(handler.run(&stage_ctx))
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|payload| Err(handler_panicked(stage, payload.as_ref()))));

        match self.config.stage_timeout() {
            Some(limit) => tokio::time::timeout(limit, attempt)
                .await
                .unwrap_or_else(|_| Err(PipelineError::Timeout(limit.as_secs_f64()))),
            None => attempt.await,
        }
    }

    /// Writes a snapshot unless the run was cancelled.
    async fn persist(&self, ctx: &PipelineContext, handle: &RunHandle) -> Result<(), PipelineError> {
        let _guard = handle.lock_persist().await;
        if handle.is_cancelled() {
            return Err(PipelineError::Cancelled("cancellation requested".to_string()));
        }
        self.store.save(ctx).await?;
        Ok(())
    }

    async fn yield_between_stages(&self) {
        if self.config.stage_yield_ms == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(self.config.stage_yield_ms)).await;
        }
    }

    /// Cleans up files, records the terminal status, and unregisters.
    ///
    /// A run that did not complete leaves nothing behind in its run
    /// directory.
    async fn finish(&self, run: &mut RunGuard, end: RunEnd) -> PipelineResult {
        let warnings = cleanup_temp_files(&run.ctx.temp_files).await;
        for warning in warnings {
            run.ctx.add_warning(PipelineStage::Cleanup, warning);
        }
        if end != RunEnd::Completed {
            discard_attempt(&mut run.ctx, &run.run_dir).await;
        }

        {
            let _guard = run.handle.lock_persist().await;
            let ctx = &mut run.ctx;
            if end == RunEnd::Cancelled || run.handle.is_cancelled() {
                // `cancel` already wrote the terminal snapshot.
                ctx.mark_cancelled();
                match self.store.get(ctx.id).await {
                    Ok(Some(stored)) if stored.completed_at.is_some() => {
                        ctx.completed_at = stored.completed_at;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to read cancelled snapshot"),
                }
            } else {
                if end == RunEnd::Completed {
                    ctx.mark_completed();
                } else {
                    ctx.mark_failed();
                }
                if let Err(e) = self.store.save(ctx).await {
                    error!(error = %e, "Failed to persist final state");
                }
            }
        }

        // Cancelled after its last stage: the finished artifacts go too.
        if end == RunEnd::Completed && run.ctx.status == PipelineStatus::Cancelled {
            discard_attempt(&mut run.ctx, &run.run_dir).await;
        }
        run.disarm()
    }
}

fn run_span(ctx: &PipelineContext) -> tracing::Span {
    info_span!(
        "pipeline_run",
        run_id = %ctx.id,
        owner = %ctx.owner,
        source_id = %ctx.source_id
    )
}

/// Tags `error` with `stage` and records it on the run.
fn stage_failed(ctx: &mut PipelineContext, stage: PipelineStage, error: PipelineError) -> PipelineFailure {
    let failure = PipelineFailure::new(stage, error)
        .with_context_entry("attempt", serde_json::json!(ctx.retry_count + 1));
    if !matches!(failure.error, PipelineError::Cancelled(_)) {
        ctx.add_error_with(stage, failure.message.clone(), failure.context.clone());
    }
    failure
}

fn handler_panicked(stage: PipelineStage, payload: &(dyn Any + Send)) -> PipelineError {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    error!(stage = stage.as_str(), detail, "Stage handler panicked");
    PipelineError::Transient(format!("{} handler panicked: {detail}", stage.as_str()))
}

/// Deletes the artifacts of an attempt that will not complete.
async fn discard_outputs(ctx: &mut PipelineContext) {
    let outputs = std::mem::take(&mut ctx.output_files);
    for warning in cleanup_temp_files(&outputs).await {
        ctx.add_warning(PipelineStage::Cleanup, warning);
    }
}

/// Deletes a run's outputs and its run directory.
async fn discard_attempt(ctx: &mut PipelineContext, run_dir: &Path) {
    discard_outputs(ctx).await;
    if let Some(warning) = discard_run_dir(run_dir).await {
        ctx.add_warning(PipelineStage::Cleanup, warning);
    }
}
