//! Tenant sync orchestration
//!
//! A tenant sync is a sequence of short, re-entrant steps. Every step
//! re-derives outstanding work from persisted `ChannelSyncState` rows, so
//! restarting mid fan-out never reprocesses a finished channel.

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{aggregate_channel_states, SyncAggregate};
use crate::common::SyncJobId;
use crate::domains::sync::errors::{SyncError, SyncResult};
use crate::domains::sync::jobs::{SyncChannelJob, SyncTenantJob};
use crate::domains::sync::models::{
    ChannelSyncState, StoredChannel, SyncJobData, SyncJobResult, SyncRun, SyncRunStatus,
};
use crate::kernel::jobs::{JobQueueExt, JobStatus};
use crate::kernel::IngestDeps;

/// Error text recorded on channels of a cancelled sync.
pub const CANCELLED_MESSAGE: &str = "sync cancelled";

/// What one orchestration step did.
#[derive(Debug, Clone)]
pub enum SyncStep {
    /// Work is still outstanding.
    Dispatched {
        admitted: usize,
        in_flight: usize,
        remaining: usize,
    },
    /// Every channel is terminal; the aggregate was stored.
    Finished(SyncJobResult),
    /// The run was already finished by an earlier step.
    AlreadyFinished,
}

/// Record a new tenant sync and enqueue its first step.
pub async fn start_tenant_sync(data: SyncJobData, deps: &IngestDeps) -> SyncResult<SyncJobId> {
    let sync_job_id = SyncJobId::new();
    deps.gateway
        .create_sync_run(&SyncRun::start(sync_job_id, data.clone()))
        .await?;

    info!(
        sync_job_id = %sync_job_id,
        tenant_id = %data.tenant_id,
        sync_type = ?data.sync_type,
        "Starting tenant sync"
    );

    enqueue_step(sync_job_id, data, deps).await?;
    Ok(sync_job_id)
}

/// Ask a running sync to stop. Channel workers notice between pages.
pub async fn cancel_sync(sync_job_id: SyncJobId, deps: &IngestDeps) -> SyncResult<bool> {
    let Some(run) = deps.gateway.find_sync_run(sync_job_id).await? else {
        return Ok(false);
    };
    if !deps.gateway.request_cancel(sync_job_id).await? {
        return Ok(false);
    }

    info!(sync_job_id = %sync_job_id, "Cancellation requested");

    // A fresh step fails channels that were never dispatched.
    enqueue_step(sync_job_id, run.data.0, deps).await?;
    Ok(true)
}

/// Enqueue the next orchestration step for a sync. Collapses with a step
/// that is already waiting.
pub async fn enqueue_step(sync_job_id: SyncJobId, data: SyncJobData, deps: &IngestDeps) -> SyncResult<()> {
    let job = SyncTenantJob::new(sync_job_id, data);
    deps.job_queue
        .enqueue_with(&job, SyncTenantJob::options(&deps.settings))
        .await
        .map_err(SyncError::Queue)?;
    Ok(())
}

/// Enqueue a delayed step that re-checks in-flight channel jobs. Collapses
/// with a check that is already waiting, never with a regular step.
async fn enqueue_check(sync_job_id: SyncJobId, data: SyncJobData, deps: &IngestDeps) -> SyncResult<()> {
    let job = SyncTenantJob::new(sync_job_id, data);
    let mut options = SyncTenantJob::options(&deps.settings);
    options.delay_ms = deps.settings.sync_check_interval.as_millis() as u64;
    options.dedup_key = Some(SyncTenantJob::check_dedup_key(sync_job_id));

    deps.job_queue
        .enqueue_with(&job, options)
        .await
        .map_err(SyncError::Queue)?;
    Ok(())
}

/// Finish a sync as failed, keeping whatever channels already reported.
/// Returns false if the run was already finished.
pub async fn fail_sync_run(sync_job_id: SyncJobId, error: &str, deps: &IngestDeps) -> SyncResult<bool> {
    let Some(run) = deps.gateway.find_sync_run(sync_job_id).await? else {
        return Ok(false);
    };
    let states = deps.gateway.list_channel_states(sync_job_id).await?;

    let mut aggregate = SyncAggregate::new();
    for state in &states {
        aggregate.absorb(state);
    }
    aggregate.push_error(error);
    let result = aggregate.finalize(run.started_at, deps.settings.max_concurrent_channels);

    let finished = deps
        .gateway
        .finish_sync_run(sync_job_id, SyncRunStatus::Failed, Some(&result), Some(error))
        .await?;
    if finished {
        warn!(sync_job_id = %sync_job_id, tenant_id = %run.tenant_id, error, "Tenant sync failed");
    }
    Ok(finished)
}

/// Settle a step whose failure will not be redelivered.
///
/// Without a resolved channel set the sync cannot make progress and is
/// failed. Otherwise channels are already running and a check step picks
/// the sync back up later.
pub async fn settle_failed_step(job: &SyncTenantJob, error: &SyncError, deps: &IngestDeps) -> SyncResult<()> {
    let states = deps.gateway.list_channel_states(job.sync_job_id).await?;
    if states.is_empty() {
        fail_sync_run(job.sync_job_id, &error.to_string(), deps).await?;
    } else {
        enqueue_check(job.sync_job_id, job.data.clone(), deps).await?;
    }
    Ok(())
}

/// Run one orchestration step.
pub async fn run_sync_step(job: &SyncTenantJob, deps: &IngestDeps) -> SyncResult<SyncStep> {
    let sync_job_id = job.sync_job_id;

    deps.gateway
        .create_sync_run(&SyncRun::start(sync_job_id, job.data.clone()))
        .await?;
    let run = deps
        .gateway
        .find_sync_run(sync_job_id)
        .await?
        .ok_or_else(|| SyncError::ChannelSetUnresolved(format!("sync run {} vanished", sync_job_id)))?;

    if run.is_finished() {
        debug!(sync_job_id = %sync_job_id, "Sync already finished, skipping step");
        return Ok(SyncStep::AlreadyFinished);
    }

    let mut states = deps.gateway.list_channel_states(sync_job_id).await?;
    if states.is_empty() && !run.cancel_requested {
        let channel_ids = match resolve_channels(&job.data, deps).await {
            Ok(ids) => ids,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                fail_sync_run(sync_job_id, &e.to_string(), deps).await?;
                return Err(e);
            }
        };

        let pending: Vec<ChannelSyncState> = channel_ids
            .iter()
            .map(|c| ChannelSyncState::pending(sync_job_id, job.data.tenant_id, c))
            .collect();
        let inserted = deps.gateway.insert_channel_states(&pending).await?;
        info!(sync_job_id = %sync_job_id, channels = channel_ids.len(), inserted, "Resolved channel set");

        states = deps.gateway.list_channel_states(sync_job_id).await?;
    }

    reconcile_in_flight(&mut states, &job.data, deps).await?;

    if run.cancel_requested {
        for state in states.iter_mut().filter(|s| !s.is_dispatched() && !s.is_terminal()) {
            state.mark_failed(CANCELLED_MESSAGE);
            deps.gateway.save_channel_state(state).await?;
        }
    }

    let admitted = admit_channels(&mut states, &job.data, deps).await?;

    if states.iter().all(|s| s.is_terminal()) {
        return finish(&run, &states, deps).await;
    }

    let in_flight = states.iter().filter(|s| s.is_in_flight()).count();
    let remaining = states.iter().filter(|s| !s.is_dispatched()).count();
    debug!(sync_job_id = %sync_job_id, admitted, in_flight, remaining, "Sync step dispatched");

    // Channel jobs the queue dead-letters on its own (lease expiry on the
    // final attempt) never wake the orchestrator.
    enqueue_check(sync_job_id, job.data.clone(), deps).await?;

    Ok(SyncStep::Dispatched {
        admitted,
        in_flight,
        remaining,
    })
}

/// Explicit subset if given, otherwise every channel the platform reports.
async fn resolve_channels(data: &SyncJobData, deps: &IngestDeps) -> SyncResult<Vec<String>> {
    if let Some(ids) = &data.channel_ids {
        let mut unique: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }
        return Ok(unique);
    }

    let tenant = deps
        .gateway
        .find_tenant(data.tenant_id)
        .await?
        .ok_or_else(|| SyncError::ChannelSetUnresolved(format!("tenant {} not found", data.tenant_id)))?;

    let adapter = deps.adapters.ready(&tenant.platform).await?;
    let channels = adapter.fetch_channels(&tenant.platform_id).await?;

    for channel in &channels {
        deps.gateway
            .upsert_channel(&StoredChannel::from_platform(tenant.id, channel))
            .await?;
    }

    Ok(channels.into_iter().map(|c| c.id).collect())
}

/// Fail channels whose queue job is gone for good, re-enqueue lost ones.
async fn reconcile_in_flight(
    states: &mut [ChannelSyncState],
    data: &SyncJobData,
    deps: &IngestDeps,
) -> SyncResult<()> {
    for state in states.iter_mut().filter(|s| s.is_in_flight()) {
        let Some(child_job_id) = state.child_job_id else {
            continue;
        };
        let job = deps
            .job_queue
            .find(child_job_id)
            .await
            .map_err(SyncError::Queue)?;

        match job {
            None => {
                warn!(
                    sync_job_id = %state.sync_job_id,
                    channel_id = %state.channel_id,
                    child_job_id = %child_job_id,
                    "Channel job missing, re-enqueueing"
                );
                enqueue_channel(state, child_job_id, data, deps).await?;
            }
            Some(job) if matches!(job.status, JobStatus::DeadLetter | JobStatus::Cancelled) => {
                let reason = job
                    .error_message
                    .unwrap_or_else(|| "channel job did not complete".to_string());
                state.mark_failed(reason);
                deps.gateway.save_channel_state(state).await?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Dispatch undispatched channels while under the concurrency ceiling.
async fn admit_channels(
    states: &mut [ChannelSyncState],
    data: &SyncJobData,
    deps: &IngestDeps,
) -> SyncResult<usize> {
    let ceiling = deps.settings.max_concurrent_channels.max(1);
    let in_flight = states.iter().filter(|s| s.is_in_flight()).count();
    let mut capacity = ceiling.saturating_sub(in_flight);
    let mut admitted = 0;

    for state in states.iter_mut() {
        if capacity == 0 {
            break;
        }
        if state.is_dispatched() || state.is_terminal() {
            continue;
        }

        let child_job_id = Uuid::now_v7();
        if !deps
            .gateway
            .mark_channel_dispatched(state.sync_job_id, &state.channel_id, child_job_id)
            .await?
        {
            // Another step got there first; pick up its reservation.
            if let Some(current) = deps
                .gateway
                .find_channel_state(state.sync_job_id, &state.channel_id)
                .await?
            {
                *state = current;
            }
            continue;
        }

        state.child_job_id = Some(child_job_id);
        enqueue_channel(state, child_job_id, data, deps).await?;
        admitted += 1;
        capacity -= 1;
    }

    Ok(admitted)
}

async fn enqueue_channel(
    state: &ChannelSyncState,
    child_job_id: Uuid,
    data: &SyncJobData,
    deps: &IngestDeps,
) -> SyncResult<()> {
    let job = SyncChannelJob {
        sync_job_id: state.sync_job_id,
        tenant_id: state.tenant_id,
        channel_id: state.channel_id.clone(),
        sync_type: data.sync_type,
        date_range: data.date_range,
    };
    let mut options = SyncChannelJob::options(&deps.settings);
    options.job_id = Some(child_job_id);

    let result = deps
        .job_queue
        .enqueue_with(&job, options)
        .await
        .map_err(SyncError::Queue)?;

    debug!(
        sync_job_id = %state.sync_job_id,
        channel_id = %state.channel_id,
        job_id = %result.job_id(),
        "Dispatched channel sync"
    );
    Ok(())
}

async fn finish(run: &SyncRun, states: &[ChannelSyncState], deps: &IngestDeps) -> SyncResult<SyncStep> {
    let result = aggregate_channel_states(states, run.started_at, deps.settings.max_concurrent_channels);

    let (status, error) = if run.cancel_requested {
        (SyncRunStatus::Failed, Some(CANCELLED_MESSAGE))
    } else {
        (SyncRunStatus::Completed, None)
    };

    if !deps
        .gateway
        .finish_sync_run(run.id, status, Some(&result), error)
        .await?
    {
        return Ok(SyncStep::AlreadyFinished);
    }

    info!(
        sync_job_id = %run.id,
        tenant_id = %run.tenant_id,
        channels_processed = result.channels_processed,
        channels_failed = result.channels_failed,
        messages_processed = result.messages_processed,
        status = ?status,
        "Tenant sync finished"
    );

    Ok(SyncStep::Finished(result))
}
