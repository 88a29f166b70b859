//! Recurring sweep triggers using tokio-cron-scheduler.
//!
//! The cron scheduler never does work itself. Each tick enqueues a small
//! trigger job; the handler for that job enumerates the real work.
//!
//! ```text
//! SyncScheduler (every hour)
//!     │
//!     ├─► enqueue TenantSweepJob   → sweep_tenants()      → SyncTenantJob per tenant
//!     └─► enqueue OcrRetrySweepJob → sweep_ocr_retries()  → ExtractAttachmentJob per row
//! ```
//!
//! Repeatable definitions live in the job queue so every process agrees on
//! what is scheduled. Starting a schedule this process already runs is a
//! no-op; stopping removes the definition by name + pattern, and a trigger
//! already enqueued still runs to completion.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::domains::ocr::jobs::OcrRetrySweepJob;
use crate::domains::sync::jobs::TenantSweepJob;
use crate::kernel::jobs::{repeat_key, CommandMeta, EnqueueResult, JobOptions, JobQueue, JobQueueExt, RepeatableJob, Retention};

pub const TENANT_SYNC_SWEEP: &str = "tenant-sync-sweep";
pub const OCR_RETRY_SWEEP: &str = "ocr-retry-sweep";

#[derive(Default)]
struct SchedulerState {
    scheduler: Option<JobScheduler>,
    /// repeat key → cron job id in `scheduler`
    entries: HashMap<String, Uuid>,
}

pub struct SyncScheduler {
    job_queue: Arc<dyn JobQueue>,
    settings: SyncSettings,
    state: Mutex<SchedulerState>,
}

impl SyncScheduler {
    pub fn new(job_queue: Arc<dyn JobQueue>, settings: SyncSettings) -> Self {
        Self {
            job_queue,
            settings,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Hourly tenant sync sweep.
    pub async fn start_tenant_sync_sweep(&self) -> Result<bool> {
        let pattern = self.settings.sync_sweep_cron.clone();
        self.start(TENANT_SYNC_SWEEP, &pattern, TenantSweepJob::incremental).await
    }

    pub async fn stop_tenant_sync_sweep(&self) -> Result<bool> {
        let pattern = self.settings.sync_sweep_cron.clone();
        self.stop(TENANT_SYNC_SWEEP, &pattern).await
    }

    /// Hourly OCR retry sweep.
    pub async fn start_ocr_retry_sweep(&self) -> Result<bool> {
        let pattern = self.settings.ocr_sweep_cron.clone();
        self.start(OCR_RETRY_SWEEP, &pattern, OcrRetrySweepJob::now).await
    }

    pub async fn stop_ocr_retry_sweep(&self) -> Result<bool> {
        let pattern = self.settings.ocr_sweep_cron.clone();
        self.stop(OCR_RETRY_SWEEP, &pattern).await
    }

    /// Start a recurring trigger. Returns false if this scheduler already
    /// runs it.
    pub async fn start<C, F>(&self, name: &str, cron_pattern: &str, make_job: F) -> Result<bool>
    where
        C: CommandMeta + Serialize + Send + Sync + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let key = repeat_key(name, cron_pattern);
        let mut state = self.state.lock().await;

        if state.entries.contains_key(&key) {
            info!(name = %name, cron_pattern = %cron_pattern, "schedule already running, not starting again");
            return Ok(false);
        }

        let job_type = make_job().command_type();
        let created = self
            .job_queue
            .add_repeatable(RepeatableJob::new(name, cron_pattern, job_type))
            .await?;
        if !created {
            debug!(name = %name, "repeatable definition already stored");
        }

        let scheduler = match &state.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => {
                let scheduler = JobScheduler::new().await?;
                scheduler.start().await?;
                state.scheduler = Some(scheduler.clone());
                scheduler
            }
        };

        let queue = self.job_queue.clone();
        let make_job = Arc::new(make_job);
        let tick_name = name.to_string();
        let tick_pattern = cron_pattern.to_string();
        let cron_job = CronJob::new_async(cron_pattern, move |_uuid, _lock| {
            let queue = queue.clone();
            let make_job = make_job.clone();
            let name = tick_name.clone();
            let pattern = tick_pattern.clone();
            Box::pin(async move {
                let job = make_job();
                if let Err(e) = enqueue_tick(queue.as_ref(), &name, &pattern, &job).await {
                    error!(name = %name, error = %e, "scheduled trigger failed");
                }
            })
        })?;

        let id = scheduler.add(cron_job).await?;
        state.entries.insert(key, id);

        info!(name = %name, cron_pattern = %cron_pattern, job_type = %job_type, "schedule started");
        Ok(true)
    }

    /// Remove a recurring trigger by name + pattern. Enqueued trigger jobs
    /// still run. Returns false when nothing was scheduled.
    pub async fn stop(&self, name: &str, cron_pattern: &str) -> Result<bool> {
        let key = repeat_key(name, cron_pattern);
        let mut state = self.state.lock().await;

        let removed_definition = self.job_queue.remove_repeatable(name, cron_pattern).await?;
        let local = state.entries.remove(&key);

        if let (Some(id), Some(scheduler)) = (local, state.scheduler.as_ref()) {
            scheduler.remove(&id).await?;
        }

        let stopped = removed_definition || local.is_some();
        if stopped {
            info!(name = %name, cron_pattern = %cron_pattern, "schedule stopped");
        } else {
            debug!(name = %name, cron_pattern = %cron_pattern, "schedule not running, nothing to stop");
        }
        Ok(stopped)
    }

    pub async fn is_running(&self, name: &str, cron_pattern: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .contains_key(&repeat_key(name, cron_pattern))
    }

    /// Stop local cron timers at process exit. Stored definitions are kept
    /// for the next start.
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.entries.clear();
        if let Some(mut scheduler) = state.scheduler.take() {
            scheduler.shutdown().await?;
            info!("scheduler shut down");
        }
        Ok(())
    }
}

/// Enqueue one trigger for a tick, unless the definition was removed in
/// the meantime. Ticks in the same minute collapse into one job.
pub async fn enqueue_tick<C>(
    queue: &dyn JobQueue,
    name: &str,
    cron_pattern: &str,
    job: &C,
) -> Result<Option<EnqueueResult>>
where
    C: CommandMeta + Serialize + Sync,
{
    let defined = queue
        .repeatables()
        .await?
        .iter()
        .any(|r| r.name == name && r.cron_pattern == cron_pattern);
    if !defined {
        debug!(name = %name, "repeatable removed, skipping tick");
        return Ok(None);
    }

    let tick = Utc::now().format("%Y%m%d%H%M");
    let options = JobOptions::builder()
        .attempts(1u32)
        .dedup_key(format!("repeat:{}:{}", name, tick))
        .remove_on_complete(Retention::age_and_count(24 * 3600, 100))
        .remove_on_fail(Retention::age(7 * 24 * 3600))
        .build();

    let result = queue.enqueue_with(job, options).await?;
    info!(name = %name, job_id = %result.job_id(), created = result.is_created(), "scheduled trigger enqueued");
    Ok(Some(result))
}
