//! Scheduled sweep: start a sync for every active tenant.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use super::orchestrate::{fail_sync_run, start_tenant_sync};
use crate::domains::sync::errors::SyncResult;
use crate::domains::sync::jobs::TenantSweepJob;
use crate::domains::sync::models::{SyncJobData, SyncRun};
use crate::kernel::IngestDeps;

/// Error recorded on a run the sweep gave up on.
pub const ABANDONED_MESSAGE: &str = "abandoned: no progress before the stale deadline";

/// Start one sync per active tenant that has none running. Returns the
/// number of syncs started.
///
/// A tenant whose running sync has shown no activity (run start or any
/// channel state write) for `sync_run_stale_after` gets that run failed and
/// a fresh one started.
pub async fn sweep_tenants(job: &TenantSweepJob, deps: &IngestDeps) -> SyncResult<usize> {
    let tenants = deps.gateway.list_active_tenants().await?;
    let stale_after = ChronoDuration::from_std(deps.settings.sync_run_stale_after)
        .unwrap_or_else(|_| ChronoDuration::hours(6));
    let stale_before = Utc::now() - stale_after;

    info!(
        tenants = tenants.len(),
        sync_type = ?job.sync_type,
        triggered_at = %job.triggered_at,
        "Starting tenant sweep"
    );

    let mut started = 0;
    for tenant in tenants {
        if let Some(run) = deps.gateway.find_running_sync_run(tenant.id).await? {
            let last_activity = last_activity(&run, deps).await?;
            if last_activity >= stale_before {
                info!(tenant_id = %tenant.id, sync_job_id = %run.id, "Sync already running, skipping tenant");
                continue;
            }

            warn!(
                tenant_id = %tenant.id,
                sync_job_id = %run.id,
                started_at = %run.started_at,
                last_activity = %last_activity,
                "Abandoning stale sync"
            );
            fail_sync_run(run.id, ABANDONED_MESSAGE, deps).await?;
        }

        let data = SyncJobData {
            tenant_id: tenant.id,
            sync_type: job.sync_type,
            channel_ids: None,
            date_range: None,
        };
        match start_tenant_sync(data, deps).await {
            Ok(_) => started += 1,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => warn!(tenant_id = %tenant.id, error = %e, "Failed to start tenant sync"),
        }
    }

    info!(started, "Tenant sweep finished");
    Ok(started)
}

/// Newest sign of life of a running sync.
async fn last_activity(run: &SyncRun, deps: &IngestDeps) -> SyncResult<DateTime<Utc>> {
    let states = deps.gateway.list_channel_states(run.id).await?;
    Ok(states
        .iter()
        .map(|s| s.updated_at)
        .fold(run.started_at, |newest, t| newest.max(t)))
}
