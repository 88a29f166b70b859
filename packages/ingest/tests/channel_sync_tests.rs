//! Channel worker tests: cursors, checkpoints, retries and redelivery.

mod common;

use std::time::Duration;

use crate::common::*;
use ingest_core::common::SyncJobId;
use ingest_core::domains::sync::activities::{run_sync_step, sync_channel, ChannelOutcome};
use ingest_core::domains::sync::errors::AdapterError;
use ingest_core::domains::sync::jobs::{SyncChannelJob, SyncTenantJob};
use ingest_core::domains::sync::models::{ChannelSyncState, ChannelSyncStatus, SyncRunStatus, SyncType};
use ingest_core::kernel::jobs::{ErrorKind, FailureOutcome, JobQueue, JobStatus};
use ingest_core::kernel::{BasePersistenceGateway, MockPlatformAdapter};
use ingest_core::SyncSettings;
use test_context::test_context;

/// Run the first orchestration step outside the runner, leaving the
/// channel jobs it dispatches in the queue.
async fn dispatch_first_step(ctx: &TestHarness) -> SyncJobId {
    let sync_job_id = ctx.start(ctx.full()).await;
    let steps = ctx
        .queue
        .claim("orchestrator", &[SyncTenantJob::JOB_TYPE.to_string()], 1)
        .await
        .unwrap();
    assert_eq!(steps.len(), 1);
    run_sync_step(&steps[0].deserialize::<SyncTenantJob>().unwrap(), &ctx.deps)
        .await
        .unwrap();
    ctx.queue.mark_succeeded(steps[0].id).await.unwrap();
    sync_job_id
}

/// Lease the channel job and let the lease lapse, as if the worker died.
async fn lose_channel_delivery(ctx: &TestHarness) {
    let claimed = ctx
        .queue
        .claim("crashed-worker", &[SyncChannelJob::JOB_TYPE.to_string()], 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    ctx.queue.expire_lease(claimed[0].id);
}

async fn only_state(ctx: &TestHarness, sync_job_id: SyncJobId) -> ChannelSyncState {
    let mut states = ctx.gateway.list_channel_states(sync_job_id).await.unwrap();
    assert_eq!(states.len(), 1, "expected a single channel");
    states.remove(0)
}

#[tokio::test]
async fn overlapping_pages_do_not_duplicate_messages() {
    let ctx = TestHarness::builder()
        .settings(SyncSettings {
            page_size: 3,
            ..test_settings()
        })
        .adapter(MockPlatformAdapter::new(PLATFORM).with_overlap())
        .build();
    ctx.adapter.add_channel("general", messages("general", 10));

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(ctx.gateway.message_count(), 10);
    assert_eq!(ctx.gateway.message_writes(), 10);
    let state = only_state(&ctx, run.id).await;
    assert_eq!(state.messages_processed, 10);
    assert_eq!(state.last_message_id.as_deref(), Some("10"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rerunning_a_full_sync_writes_nothing_new(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 6));

    ctx.sync(ctx.full()).await;
    let writes = ctx.gateway.message_writes();

    let second = ctx.sync(ctx.full()).await;

    assert_eq!(second.status, SyncRunStatus::Completed);
    assert_eq!(ctx.gateway.message_count(), 6);
    assert_eq!(ctx.gateway.message_writes(), writes);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn edited_message_is_rewritten(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 3));
    ctx.sync(ctx.full()).await;
    let writes = ctx.gateway.message_writes();

    let mut history = messages("general", 3);
    history[1].content = "message 2, edited".to_string();
    history[1].edited_timestamp = Some(base_time() + chrono::Duration::minutes(5));
    ctx.adapter.set_messages("general", history);

    ctx.sync(ctx.full()).await;

    assert_eq!(ctx.gateway.message_count(), 3);
    assert_eq!(ctx.gateway.message_writes(), writes + 1);
    let stored = ctx.gateway.messages_in("general");
    assert!(stored.iter().any(|m| m.content == "message 2, edited"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn cursor_only_moves_forward(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 7));

    let run = ctx.sync(ctx.full()).await;

    let cursors: Vec<Option<u32>> = ctx
        .adapter
        .fetch_calls()
        .iter()
        .map(|c| c.options.after_message_id.as_ref().map(|id| id.parse().unwrap()))
        .collect();
    // page_size 2 over 7 messages: none, 2, 4, 6
    assert_eq!(cursors, vec![None, Some(2), Some(4), Some(6)]);

    let checkpoint = ctx.gateway.checkpoint(ctx.tenant.id, "general").unwrap();
    assert_eq!(checkpoint.last_message_id.as_deref(), Some("7"));
    assert_eq!(checkpoint.messages_processed, 7);
    let state = only_state(ctx, run.id).await;
    assert_eq!(state.api_calls, 4);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn incremental_sync_resumes_from_checkpoint(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 5));
    ctx.sync(ctx.full()).await;

    ctx.adapter.set_messages("general", messages("general", 8));
    let fetches_before = ctx.adapter.fetch_calls().len();

    let run = ctx.sync(ctx.incremental()).await;

    let calls = ctx.adapter.fetch_calls();
    let first = &calls[fetches_before];
    assert_eq!(first.options.after_message_id.as_deref(), Some("5"));

    let state = only_state(ctx, run.id).await;
    assert_eq!(state.messages_processed, 3);
    let checkpoint = ctx.gateway.checkpoint(ctx.tenant.id, "general").unwrap();
    assert_eq!(checkpoint.last_message_id.as_deref(), Some("8"));
    assert_eq!(ctx.gateway.message_count(), 8);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn full_sync_ignores_existing_checkpoint(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 4));
    ctx.sync(ctx.full()).await;
    let fetches_before = ctx.adapter.fetch_calls().len();

    ctx.sync(ctx.full()).await;

    let calls = ctx.adapter.fetch_calls();
    assert!(calls[fetches_before].options.after_message_id.is_none());
    // Re-walking history never moves the stored checkpoint back
    let checkpoint = ctx.gateway.checkpoint(ctx.tenant.id, "general").unwrap();
    assert_eq!(checkpoint.last_message_id.as_deref(), Some("4"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn date_range_bounds_the_fetch(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 10));

    let after = base_time() + chrono::Duration::seconds(3);
    let before = base_time() + chrono::Duration::seconds(8);
    let run = ctx.sync(ctx.full().with_date_range(Some(after), Some(before))).await;

    let state = only_state(ctx, run.id).await;
    // Messages 4..=7
    assert_eq!(state.messages_processed, 4);
    let stored: Vec<String> = ctx
        .gateway
        .messages_in("general")
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert!(stored.iter().all(|id| ["4", "5", "6", "7"].contains(&id.as_str())));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn retryable_failure_ends_failed_at_the_ceiling(ctx: &TestHarness) {
    ctx.adapter.add_channel("flaky", messages("flaky", 3));
    ctx.adapter
        .fail_always("flaky", AdapterError::Timeout("gateway timeout".to_string()));

    let run = ctx.sync(ctx.full()).await;

    let state = only_state(ctx, run.id).await;
    assert_eq!(state.status, ChannelSyncStatus::Failed);
    assert_eq!(state.retry_count, 3);
    assert!(state.error.unwrap().contains("gateway timeout"));
    assert_eq!(ctx.adapter.fetches_for("flaky"), 3);

    // The final delivery records the failure itself, so the queue job succeeds
    let jobs = ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Succeeded);
    assert_eq!(jobs[0].attempts_made, 3);

    assert_eq!(run.status, SyncRunStatus::Completed);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_failed, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn transient_failure_recovers_on_redelivery(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 3));
    ctx.adapter
        .fail_times("general", AdapterError::Transient("502 bad gateway".to_string()), 1);

    let run = ctx.sync(ctx.full()).await;

    let state = only_state(ctx, run.id).await;
    assert_eq!(state.status, ChannelSyncStatus::Completed);
    assert_eq!(state.retry_count, 1);
    assert!(state.error.is_none());
    assert_eq!(state.messages_processed, 3);
    assert_eq!(ctx.gateway.message_count(), 3);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rate_limits_back_off_within_one_delivery(ctx: &TestHarness) {
    ctx.adapter.add_channel("busy", messages("busy", 3));
    ctx.adapter.fail_times(
        "busy",
        AdapterError::RateLimited {
            retry_after: Some(Duration::from_millis(1)),
        },
        2,
    );

    let run = ctx.sync(ctx.full()).await;

    let state = only_state(ctx, run.id).await;
    assert_eq!(state.status, ChannelSyncStatus::Completed);
    assert_eq!(state.rate_limit_encounters, 2);
    assert_eq!(state.retry_count, 0);

    let jobs = ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE);
    assert_eq!(jobs[0].attempts_made, 1);

    let result = run.result.unwrap().0;
    assert_eq!(result.parallel_stats.rate_limit_encounters, 2);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn fatal_error_fails_without_retry(ctx: &TestHarness) {
    ctx.adapter.add_channel("private", messages("private", 3));
    ctx.adapter
        .fail_always("private", AdapterError::Unauthorized("missing access".to_string()));

    let run = ctx.sync(ctx.full()).await;

    let state = only_state(ctx, run.id).await;
    assert_eq!(state.status, ChannelSyncStatus::Failed);
    assert_eq!(state.retry_count, 0);
    assert_eq!(ctx.adapter.fetches_for("private"), 1);
}

#[tokio::test]
async fn stalled_cursor_is_not_an_endless_loop() {
    // Inclusive cursor with one-message pages returns only the cursor message
    let ctx = TestHarness::builder()
        .settings(SyncSettings {
            page_size: 1,
            ..test_settings()
        })
        .adapter(MockPlatformAdapter::new(PLATFORM).with_overlap())
        .build();
    ctx.adapter.add_channel("general", messages("general", 3));

    let run = ctx.sync(ctx.full()).await;

    let state = only_state(&ctx, run.id).await;
    assert_eq!(state.status, ChannelSyncStatus::Failed);
    assert!(state.error.unwrap().contains("cursor did not advance"));
    assert_eq!(ctx.gateway.message_count(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn expired_lease_is_redelivered_without_duplicates(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 5));
    let data = ctx.full();
    let sync_job_id = ctx.start(data.clone()).await;
    run_sync_step(&SyncTenantJob::new(sync_job_id, data), &ctx.deps)
        .await
        .unwrap();

    // A worker leases the channel job and dies without acknowledging it
    let claimed = ctx
        .queue
        .claim("crashed-worker", &[SyncChannelJob::JOB_TYPE.to_string()], 1)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    ctx.queue.expire_lease(claimed[0].id);

    ctx.drain().await;

    let run = ctx.run(sync_job_id);
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(ctx.gateway.message_count(), 5);
    assert_eq!(ctx.gateway.message_writes(), 5);

    let job = ctx.queue.find(claimed[0].id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.worker_id.as_deref(), Some("test-worker"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn redelivered_terminal_channel_is_a_no_op(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 3));
    let run = ctx.sync(ctx.full()).await;
    let fetches = ctx.adapter.fetch_calls().len();

    let job = SyncChannelJob {
        sync_job_id: run.id,
        tenant_id: ctx.tenant.id,
        channel_id: "general".to_string(),
        sync_type: SyncType::Full,
        date_range: None,
    };
    let outcome = sync_channel(&job, &ctx.deps).await.unwrap();

    assert_eq!(outcome, ChannelOutcome::AlreadyTerminal);
    assert_eq!(ctx.adapter.fetch_calls().len(), fetches);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn channel_lost_on_every_delivery_fails_only_that_channel(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 3));
    let sync_job_id = dispatch_first_step(ctx).await;

    for _ in 0..3 {
        lose_channel_delivery(ctx).await;
    }
    ctx.drain().await;

    // The queue dead-letters the job itself; the sync still finishes
    let jobs = ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::DeadLetter);

    let state = only_state(ctx, sync_job_id).await;
    assert_eq!(state.status, ChannelSyncStatus::Failed);
    assert!(state.error.unwrap().contains("lease expired"));

    let run = ctx.run(sync_job_id);
    assert_eq!(run.status, SyncRunStatus::Completed);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_failed, 1);
    assert_eq!(result.errors[0].channel_id.as_deref(), Some("general"));
    assert!(ctx.adapter.fetch_calls().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn channel_dead_lettered_after_its_step_ran_still_finishes(ctx: &TestHarness) {
    ctx.adapter.add_channel("flaky", messages("flaky", 3));
    ctx.adapter
        .fail_always("flaky", AdapterError::Timeout("gateway timeout".to_string()));
    let sync_job_id = dispatch_first_step(ctx).await;

    // Two deliveries die before the worker ever runs
    lose_channel_delivery(ctx).await;
    lose_channel_delivery(ctx).await;

    // The last delivery is under the channel's own ceiling, so it wakes the
    // orchestrator and hands the failure back to the queue
    let claimed = ctx
        .queue
        .claim("worker-a", &[SyncChannelJob::JOB_TYPE.to_string()], 1)
        .await
        .unwrap();
    let job: SyncChannelJob = claimed[0].deserialize().unwrap();
    assert!(sync_channel(&job, &ctx.deps).await.is_err());

    // That step runs while the channel job is still leased
    ctx.runner.run_until_idle().await.unwrap();
    assert_eq!(ctx.run(sync_job_id).status, SyncRunStatus::Running);

    let outcome = ctx
        .queue
        .mark_failed(claimed[0].id, "gateway timeout", ErrorKind::Retryable)
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::DeadLettered);

    ctx.drain().await;

    let state = only_state(ctx, sync_job_id).await;
    assert_eq!(state.status, ChannelSyncStatus::Failed);
    assert_eq!(state.retry_count, 1);
    assert!(state.error.unwrap().contains("gateway timeout"));

    let run = ctx.run(sync_job_id);
    assert_eq!(run.status, SyncRunStatus::Completed);
    assert_eq!(run.result.unwrap().0.channels_failed, 1);
}
