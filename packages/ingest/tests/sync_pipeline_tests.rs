//! End-to-end tenant sync tests against in-memory stores.

mod common;

use crate::common::*;
use ingest_core::domains::ocr::jobs::ExtractAttachmentJob;
use ingest_core::domains::sync::activities::{run_sync_step, SyncStep};
use ingest_core::domains::sync::errors::AdapterError;
use ingest_core::domains::sync::jobs::{SyncChannelJob, SyncTenantJob};
use ingest_core::domains::sync::models::{ChannelSyncStatus, SyncRunStatus};
use ingest_core::kernel::jobs::JobStatus;
use ingest_core::kernel::{BasePersistenceGateway, MockOcrExtractor, SpyAnalysisTrigger};
use ingest_core::SyncSettings;
use test_context::test_context;

#[test_context(TestHarness)]
#[tokio::test]
async fn full_sync_ingests_every_channel(ctx: &TestHarness) {
    for channel in ["general", "random", "help"] {
        ctx.adapter.add_channel(channel, messages(channel, 5));
    }

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Completed);
    assert!(run.error.is_none());
    let result = run.result.expect("finished run has a result").0;
    assert_eq!(result.channels_processed, 3);
    assert_eq!(result.channels_failed, 0);
    assert_eq!(result.messages_processed, 15);
    assert!(result.errors.is_empty());
    assert_eq!(result.channel_states.len(), 3);

    assert_eq!(ctx.gateway.message_count(), 15);
    assert_eq!(ctx.gateway.channel_count(), 3);
    for channel in ["general", "random", "help"] {
        let checkpoint = ctx.gateway.checkpoint(ctx.tenant.id, channel).unwrap();
        assert_eq!(checkpoint.last_message_id.as_deref(), Some("5"));
        assert!(!checkpoint.has_more_messages);
    }
}

#[test_context(TestHarness)]
#[tokio::test]
async fn reactions_and_attachments_are_counted(ctx: &TestHarness) {
    let mut history = messages("general", 3);
    history[0] = with_reaction(history[0].clone(), "👍", "user-9");
    history[1] = with_attachment(history[1].clone(), file_attachment("doc-1"));
    ctx.adapter.add_channel("general", history);

    let run = ctx.sync(ctx.full()).await;
    let result = run.result.unwrap().0;

    assert_eq!(result.messages_processed, 3);
    assert_eq!(result.reactions_processed, 1);
    assert_eq!(result.attachments_processed, 1);
    assert_eq!(ctx.gateway.reaction_count(), 1);
    assert_eq!(ctx.gateway.attachment_count(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failing_channel_does_not_fail_siblings(ctx: &TestHarness) {
    ctx.adapter.add_channel("a", messages("a", 3));
    ctx.adapter.add_channel("b", messages("b", 3));
    ctx.adapter.add_channel("c", messages("c", 3));
    ctx.adapter.fail_always("b", AdapterError::ChannelNotFound("b".to_string()));

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Completed);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_processed, 2);
    assert_eq!(result.channels_failed, 1);
    assert_eq!(result.messages_processed, 6);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].channel_id.as_deref(), Some("b"));
    assert!(result.is_partial());

    // Not retryable: one fetch, no redelivery
    assert_eq!(ctx.adapter.fetches_for("b"), 1);
}

#[tokio::test]
async fn fan_out_respects_concurrency_ceiling() {
    let ctx = TestHarness::builder()
        .settings(SyncSettings {
            max_concurrent_channels: 2,
            ..test_settings()
        })
        .build();
    for n in 1..=5 {
        let channel = format!("channel-{}", n);
        ctx.adapter.add_channel(&channel, messages(&channel, 2));
    }

    let data = ctx.full();
    let sync_job_id = ctx.start(data.clone()).await;
    let step = SyncTenantJob::new(sync_job_id, data);

    match run_sync_step(&step, &ctx.deps).await.unwrap() {
        SyncStep::Dispatched {
            admitted,
            in_flight,
            remaining,
        } => {
            assert_eq!(admitted, 2);
            assert_eq!(in_flight, 2);
            assert_eq!(remaining, 3);
        }
        other => panic!("expected dispatch, got {:?}", other),
    }
    assert_eq!(ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE).len(), 2);

    // Re-entry with the same channels still in flight admits nothing new
    match run_sync_step(&step, &ctx.deps).await.unwrap() {
        SyncStep::Dispatched { admitted, in_flight, .. } => {
            assert_eq!(admitted, 0);
            assert_eq!(in_flight, 2);
        }
        other => panic!("expected dispatch, got {:?}", other),
    }
    assert_eq!(ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE).len(), 2);

    ctx.drain().await;

    let run = ctx.run(sync_job_id);
    assert_eq!(run.status, SyncRunStatus::Completed);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_processed, 5);
    assert_eq!(result.parallel_stats.max_concurrent_channels, 2);
    assert_eq!(ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE).len(), 5);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn step_after_finish_reprocesses_nothing(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 4));

    let data = ctx.full();
    let sync_job_id = ctx.start(data.clone()).await;
    ctx.drain().await;
    let fetches = ctx.adapter.fetch_calls().len();

    let step = SyncTenantJob::new(sync_job_id, data);
    let outcome = run_sync_step(&step, &ctx.deps).await.unwrap();

    assert!(matches!(outcome, SyncStep::AlreadyFinished));
    assert_eq!(ctx.adapter.fetch_calls().len(), fetches);
    assert_eq!(ctx.queue.jobs_by_type(SyncChannelJob::JOB_TYPE).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn explicit_channel_subset_is_deduplicated(ctx: &TestHarness) {
    ctx.adapter.add_channel("a", messages("a", 2));
    ctx.adapter.add_channel("b", messages("b", 2));
    ctx.adapter.add_channel("c", messages("c", 2));

    let run = ctx.sync(ctx.full().with_channels(["a", "a", "b"])).await;

    let result = run.result.unwrap().0;
    assert_eq!(result.channels_processed, 2);
    let states = ctx.gateway.list_channel_states(run.id).await.unwrap();
    let mut channels: Vec<&str> = states.iter().map(|s| s.channel_id.as_str()).collect();
    channels.sort();
    assert_eq!(channels, vec!["a", "b"]);
    assert_eq!(ctx.adapter.fetches_for("c"), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn rejected_channel_listing_fails_the_run(ctx: &TestHarness) {
    ctx.adapter
        .fail_channel_listing(AdapterError::Unauthorized("token revoked".to_string()));

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert!(run.error.unwrap().contains("token revoked"));
    let result = run.result.unwrap().0;
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].channel_id.is_none());
    assert!(result.channel_states.is_empty());
    assert_eq!(ctx.queue.jobs_with_status(JobStatus::DeadLetter).len(), 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn unreachable_channel_listing_fails_the_run_on_the_last_attempt(ctx: &TestHarness) {
    ctx.adapter
        .fail_channel_listing(AdapterError::Timeout("channel listing timed out".to_string()));

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert!(run.error.unwrap().contains("channel listing timed out"));
    let result = run.result.unwrap().0;
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].channel_id.is_none());
    assert_eq!(result.channels_processed, 0);

    // Retried like any transient failure before giving up
    let steps = ctx.queue.jobs_by_type(SyncTenantJob::JOB_TYPE);
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, JobStatus::DeadLetter);
    assert_eq!(steps[0].attempts_made, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn empty_channel_completes(ctx: &TestHarness) {
    ctx.adapter.add_channel("quiet", vec![]);

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(run.status, SyncRunStatus::Completed);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_processed, 1);
    assert_eq!(result.messages_processed, 0);
    let state = &result.channel_states[0];
    assert_eq!(state.status, ChannelSyncStatus::Completed);
    assert_eq!(state.api_calls, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn new_messages_are_handed_to_analysis(ctx: &TestHarness) {
    ctx.adapter.add_channel("general", messages("general", 5));
    ctx.adapter.add_channel("random", messages("random", 3));

    ctx.sync(ctx.full()).await;
    assert_eq!(ctx.analysis.total_messages(), 8);

    // A second full sync stores nothing new, so there is nothing to hand off
    ctx.sync(ctx.full()).await;
    assert_eq!(ctx.analysis.total_messages(), 8);
    assert!(ctx.analysis.calls().iter().all(|c| c.tenant_id == ctx.tenant.id));
}

#[tokio::test]
async fn analysis_failure_does_not_fail_the_channel() {
    let ctx = TestHarness::builder()
        .analysis(SpyAnalysisTrigger::failing())
        .build();
    ctx.adapter.add_channel("general", messages("general", 3));

    let run = ctx.sync(ctx.full()).await;

    assert_eq!(ctx.analysis.calls().len(), 1);
    let result = run.result.unwrap().0;
    assert_eq!(result.channels_processed, 1);
    assert_eq!(result.channels_failed, 0);
}

#[tokio::test]
async fn image_attachments_are_queued_for_ocr() {
    let ctx = TestHarness::builder()
        .ocr(MockOcrExtractor::new().with_text("Food shelf open Tuesday", Some(0.9)))
        .build();
    let mut history = messages("general", 3);
    history[0] = with_attachment(history[0].clone(), image_attachment("img-1"));
    history[2] = with_attachment(history[2].clone(), file_attachment("doc-1"));
    ctx.adapter.add_channel("general", history);

    ctx.sync(ctx.full()).await;

    let extracts = ctx.queue.jobs_by_type(ExtractAttachmentJob::JOB_TYPE);
    assert_eq!(extracts.len(), 1);
    let rows = ctx.gateway.ocr_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attachment_id, "img-1");
    assert_eq!(rows[0].extracted_text.as_deref(), Some("Food shelf open Tuesday"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn no_ocr_without_an_extractor(ctx: &TestHarness) {
    let history = vec![with_attachment(message("general", 1), image_attachment("img-1"))];
    ctx.adapter.add_channel("general", history);

    ctx.sync(ctx.full()).await;

    assert!(ctx.queue.jobs_by_type(ExtractAttachmentJob::JOB_TYPE).is_empty());
    assert_eq!(ctx.gateway.attachment_count(), 1);
}
