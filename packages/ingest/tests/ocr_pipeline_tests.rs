//! OCR extraction and retry sweep tests.

mod common;

use chrono::{Duration, Utc};

use crate::common::*;
use ingest_core::domains::ocr::activities::{extract_attachment, sweep_ocr_retries};
use ingest_core::domains::ocr::errors::OcrError;
use ingest_core::domains::ocr::jobs::{ExtractAttachmentJob, OcrRetrySweepJob};
use ingest_core::domains::ocr::models::{OcrResult, OcrStatus};
use ingest_core::kernel::jobs::JobQueueExt;
use ingest_core::kernel::{BasePersistenceGateway, MockOcrExtractor};

const IMAGE_URL: &str = "https://cdn.example.com/attachments/flyer.png";

fn unavailable() -> OcrError {
    OcrError::Unavailable("vision endpoint returned 503".to_string())
}

async fn enqueue_extract(ctx: &TestHarness, attachment_id: &str) {
    let job = ExtractAttachmentJob::new(attachment_id, IMAGE_URL);
    ctx.queue
        .enqueue_with(&job, ExtractAttachmentJob::options(&ctx.deps.settings))
        .await
        .unwrap();
}

async fn sweep(ctx: &TestHarness) -> usize {
    let enqueued = sweep_ocr_retries(&OcrRetrySweepJob::now(), &ctx.deps).await.unwrap();
    ctx.drain().await;
    enqueued
}

#[tokio::test]
async fn every_attempt_is_a_new_row() {
    let ctx = TestHarness::builder()
        .ocr(
            MockOcrExtractor::new()
                .with_failure(unavailable())
                .with_failure(unavailable())
                .with_failure(unavailable())
                .with_failure(unavailable()),
        )
        .build();

    enqueue_extract(&ctx, "flyer").await;
    ctx.drain().await;
    let first = ctx.gateway.ocr_rows().remove(0);
    assert_eq!(first.status, OcrStatus::Failed);
    assert_eq!(first.retry_count, 0);

    for _ in 0..3 {
        assert_eq!(sweep(&ctx).await, 1);
    }

    let rows = ctx.gateway.list_ocr_results("flyer").await.unwrap();
    let retry_counts: Vec<i32> = rows.iter().map(|r| r.retry_count).collect();
    assert_eq!(retry_counts, vec![0, 1, 2, 3]);
    assert!(rows.iter().all(|r| r.status == OcrStatus::Failed));

    // Earlier attempts are never rewritten
    assert_eq!(rows[0].id, first.id);
    assert_eq!(rows[0].updated_at, first.updated_at);
    assert_eq!(rows[0].error_message, first.error_message);

    // Ceiling reached: nothing further is scheduled
    assert_eq!(sweep(&ctx).await, 0);
    assert_eq!(ctx.gateway.ocr_rows().len(), 4);
    assert_eq!(ctx.ocr.as_ref().unwrap().calls().len(), 4);
}

#[tokio::test]
async fn success_after_failure_stops_retries() {
    let ctx = TestHarness::builder()
        .ocr(
            MockOcrExtractor::new()
                .with_failure(unavailable())
                .with_text("Free meals every Friday", None),
        )
        .build();

    enqueue_extract(&ctx, "flyer").await;
    ctx.drain().await;
    assert_eq!(sweep(&ctx).await, 1);

    let latest = ctx.gateway.latest_ocr_result("flyer").await.unwrap().unwrap();
    assert_eq!(latest.status, OcrStatus::Completed);
    assert_eq!(latest.retry_count, 1);
    assert_eq!(latest.extracted_text.as_deref(), Some("Free meals every Friday"));
    assert_eq!(latest.confidence, Some(0.95));
    assert_eq!(latest.model_version, "mock-vision-1");

    assert_eq!(sweep(&ctx).await, 0);
    assert_eq!(ctx.gateway.ocr_rows().len(), 2);
}

#[tokio::test]
async fn completed_attachment_is_not_extracted_again() {
    let ctx = TestHarness::builder()
        .ocr(MockOcrExtractor::new().with_text("Meeting at 6pm", Some(0.88)))
        .build();

    let job = ExtractAttachmentJob::new("flyer", IMAGE_URL);
    let first = extract_attachment(&job, &ctx.deps).await.unwrap();
    let second = extract_attachment(&job, &ctx.deps).await.unwrap();

    assert_eq!(first.unwrap().confidence, Some(0.88));
    assert!(second.is_none());
    assert_eq!(ctx.gateway.ocr_rows().len(), 1);
}

#[tokio::test]
async fn stale_processing_attempt_is_retried() {
    let ctx = TestHarness::builder()
        .ocr(MockOcrExtractor::new().with_text("recovered", None))
        .build();

    // A worker crashed mid-extraction an hour ago
    let mut crashed = OcrResult::begin_attempt("flyer", IMAGE_URL, "mock-vision-1", None);
    crashed.created_at = Utc::now() - Duration::hours(1);
    crashed.updated_at = crashed.created_at;
    ctx.gateway.insert_ocr_result(&crashed).await.unwrap();

    assert_eq!(sweep(&ctx).await, 1);

    let rows = ctx.gateway.list_ocr_results("flyer").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].status, OcrStatus::Processing);
    assert_eq!(rows[1].status, OcrStatus::Completed);
    assert_eq!(rows[1].retry_count, 1);
}

#[tokio::test]
async fn recent_processing_attempt_is_left_alone() {
    let ctx = TestHarness::builder().ocr(MockOcrExtractor::new()).build();

    let in_progress = OcrResult::begin_attempt("flyer", IMAGE_URL, "mock-vision-1", None);
    ctx.gateway.insert_ocr_result(&in_progress).await.unwrap();

    assert_eq!(sweep(&ctx).await, 0);
    assert_eq!(ctx.gateway.ocr_rows().len(), 1);
}

#[tokio::test]
async fn sweep_enqueues_one_job_per_attachment() {
    let ctx = TestHarness::builder()
        .ocr(
            MockOcrExtractor::new()
                .with_failure(unavailable())
                .with_failure(OcrError::InvalidImage("truncated png".to_string())),
        )
        .build();

    enqueue_extract(&ctx, "flyer-a").await;
    enqueue_extract(&ctx, "flyer-b").await;
    ctx.drain().await;

    let enqueued = sweep_ocr_retries(&OcrRetrySweepJob::now(), &ctx.deps).await.unwrap();
    let again = sweep_ocr_retries(&OcrRetrySweepJob::now(), &ctx.deps).await.unwrap();

    assert_eq!(enqueued, 2);
    // Pending extractions collapse by attachment
    assert_eq!(again, 0);
}

#[test_context::test_context(TestHarness)]
#[tokio::test]
async fn extraction_without_extractor_is_skipped(ctx: &TestHarness) {
    let job = ExtractAttachmentJob::new("flyer", IMAGE_URL);

    let result = extract_attachment(&job, &ctx.deps).await.unwrap();

    assert!(result.is_none());
    assert!(ctx.gateway.ocr_rows().is_empty());
}
