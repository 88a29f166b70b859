//! Job runner service for processing background jobs.
//!
//! ```text
//! JobRunner
//!     │
//!     ├─► Acquire a slot (semaphore, `concurrency` permits)
//!     ├─► Claim one job of a registered type
//!     ├─► Execute via JobRegistry, heartbeating the lease meanwhile
//!     └─► Mark succeeded/failed (JobQueue handles retries)
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::ErrorKind;
use super::queue::{ClaimedJob, FailureOutcome, JobQueue};
use super::registry::SharedJobRegistry;
use crate::domains::ocr::OcrError;
use crate::domains::sync::errors::{AdapterError, PersistenceError, SyncError};
use crate::kernel::IngestDeps;

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Jobs processed in parallel by this worker.
    pub concurrency: usize,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// How often to extend the lease of a running job
    pub heartbeat_interval: Duration,
    /// How often finished jobs are pruned
    pub prune_interval: Duration,
    pub worker_id: String,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(20),
            prune_interval: Duration::from_secs(300),
            worker_id: format!("runner-{}", Uuid::new_v4()),
        }
    }
}

impl JobRunnerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Background service that processes jobs from the queue.
#[derive(Clone)]
pub struct JobRunner {
    job_queue: Arc<dyn JobQueue>,
    registry: SharedJobRegistry,
    deps: Arc<IngestDeps>,
    config: JobRunnerConfig,
    job_types: Arc<Vec<String>>,
}

impl JobRunner {
    pub fn new(job_queue: Arc<dyn JobQueue>, registry: SharedJobRegistry, deps: Arc<IngestDeps>) -> Self {
        Self::with_config(job_queue, registry, deps, JobRunnerConfig::default())
    }

    pub fn with_config(
        job_queue: Arc<dyn JobQueue>,
        registry: SharedJobRegistry,
        deps: Arc<IngestDeps>,
        config: JobRunnerConfig,
    ) -> Self {
        let job_types = Arc::new(registry.registered_types());
        Self {
            job_queue,
            registry,
            deps,
            config,
            job_types,
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            job_types = ?self.job_types,
            "job runner starting"
        );

        let concurrency = self.config.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut last_prune = Instant::now();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => permit?,
            };

            if last_prune.elapsed() >= self.config.prune_interval {
                last_prune = Instant::now();
                match self.job_queue.prune().await {
                    Ok(0) => {}
                    Ok(removed) => debug!(removed, "pruned finished jobs"),
                    Err(e) => warn!(error = %e, "failed to prune jobs"),
                }
            }

            let claimed = match self.claim_one().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            let Some(job) = claimed else {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            let runner = self.clone();
            let job_cancel = shutdown.child_token();
            tokio::spawn(async move {
                runner.process_job(job, job_cancel).await;
                drop(permit);
            });
        }

        // Wait for in-flight jobs before returning.
        let _ = slots.acquire_many(concurrency as u32).await;
        info!(worker_id = %self.config.worker_id, "job runner stopped");
        Ok(())
    }

    /// Process claimable jobs one at a time until none are due.
    ///
    /// Returns the number of jobs processed. Delayed retries are not waited
    /// for. Used by tests and one-shot maintenance runs.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.claim_one().await? {
            self.process_job(job, CancellationToken::new()).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn claim_one(&self) -> Result<Option<ClaimedJob>> {
        let mut jobs = self
            .job_queue
            .claim(&self.config.worker_id, &self.job_types, 1)
            .await?;
        Ok(jobs.pop())
    }

    async fn process_job(&self, job: ClaimedJob, cancel: CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type().to_string();

        debug!(job_id = %job_id, job_type = %job_type, attempt = job.attempt(), "executing job");

        let queue = self.job_queue.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_cancel = cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = queue.heartbeat(job_id).await {
                            warn!(job_id = %job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let result = self.registry.execute(&job, self.deps.clone()).await;

        cancel.cancel();
        let _ = heartbeat_handle.await;

        match result {
            Ok(()) => {
                info!(job_id = %job_id, job_type = %job_type, "job succeeded");
                if let Err(e) = self.job_queue.mark_succeeded(job_id).await {
                    error!(job_id = %job_id, error = %e, "failed to mark job as succeeded");
                }
            }
            Err(e) => {
                let error_kind = classify_error(&e);
                match self.job_queue.mark_failed(job_id, &format!("{:#}", e), error_kind).await {
                    Ok(FailureOutcome::Retrying { run_at }) => {
                        warn!(
                            job_id = %job_id,
                            job_type = %job_type,
                            error = %e,
                            retry_at = %run_at,
                            "job failed, retrying"
                        );
                    }
                    Ok(FailureOutcome::DeadLettered) => {
                        error!(
                            job_id = %job_id,
                            job_type = %job_type,
                            error = %e,
                            error_kind = ?error_kind,
                            "job dead-lettered"
                        );
                    }
                    Err(mark_err) => {
                        error!(job_id = %job_id, error = %mark_err, "failed to mark job as failed");
                    }
                }
            }
        }
    }
}

/// Classify an error to determine retry behavior.
///
/// Typed pipeline errors decide for themselves; anything else falls back
/// to message heuristics.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    for cause in error.chain() {
        let retryable = if let Some(e) = cause.downcast_ref::<SyncError>() {
            if matches!(e, SyncError::Cancelled) {
                return ErrorKind::Cancelled;
            }
            Some(e.is_retryable())
        } else if let Some(e) = cause.downcast_ref::<AdapterError>() {
            Some(e.is_retryable())
        } else if let Some(e) = cause.downcast_ref::<PersistenceError>() {
            Some(e.is_retryable())
        } else if let Some(e) = cause.downcast_ref::<OcrError>() {
            Some(e.is_retryable())
        } else {
            None
        };

        if let Some(retryable) = retryable {
            return if retryable {
                ErrorKind::Retryable
            } else {
                ErrorKind::NonRetryable
            };
        }
    }

    let error_str = error.to_string().to_lowercase();

    // Non-retryable: validation errors, not found, permission denied
    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
    {
        return ErrorKind::NonRetryable;
    }

    if error_str.contains("deserialize") || error_str.contains("parse") {
        return ErrorKind::NonRetryable;
    }

    ErrorKind::Retryable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_with_worker_id() {
        let config = JobRunnerConfig::with_worker_id("my-runner");
        assert_eq!(config.worker_id, "my-runner");
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn test_classify_error_retryable() {
        let error = anyhow::anyhow!("connection timeout");
        assert_eq!(classify_error(&error), ErrorKind::Retryable);
    }

    #[test]
    fn test_classify_error_deserialize() {
        let error = anyhow::anyhow!("failed to deserialize payload");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }

    #[test]
    fn typed_adapter_errors_decide_retryability() {
        let limited: anyhow::Error = SyncError::from(AdapterError::RateLimited { retry_after: None }).into();
        assert_eq!(classify_error(&limited), ErrorKind::Retryable);

        // "not found" in the message must not override the typed answer
        let missing: anyhow::Error = AdapterError::ChannelNotFound("C1".into()).into();
        assert_eq!(classify_error(&missing), ErrorKind::NonRetryable);

        let stalled: anyhow::Error = SyncError::StalledCursor {
            channel_id: "C1".into(),
        }
        .into();
        assert_eq!(classify_error(&stalled), ErrorKind::Retryable);
    }

    #[test]
    fn cancelled_sync_is_not_retried() {
        let error: anyhow::Error = SyncError::Cancelled.into();
        assert_eq!(classify_error(&error), ErrorKind::Cancelled);
    }

    #[test]
    fn typed_errors_are_found_behind_context() {
        let error = anyhow::Error::new(OcrError::InvalidImage("bad header".into()))
            .context("extracting attachment");
        assert_eq!(classify_error(&error), ErrorKind::NonRetryable);
    }
}
