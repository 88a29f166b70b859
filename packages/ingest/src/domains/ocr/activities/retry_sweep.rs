//! OCR retry sweep: find failed or stuck attempts and enqueue new ones.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::info;

use crate::domains::ocr::jobs::{ExtractAttachmentJob, OcrRetrySweepJob};
use crate::kernel::jobs::JobQueueExt;
use crate::kernel::IngestDeps;

/// Enqueue a fresh extraction for every attachment whose latest attempt
/// failed (or went stale in `processing`) under the retry ceiling. Returns
/// the number of jobs newly created.
pub async fn sweep_ocr_retries(job: &OcrRetrySweepJob, deps: &IngestDeps) -> Result<usize> {
    let stale_after = ChronoDuration::from_std(deps.settings.ocr_stale_after)
        .unwrap_or_else(|_| ChronoDuration::minutes(30));
    let stale_before = Utc::now() - stale_after;

    let candidates = deps
        .gateway
        .find_retryable_ocr_results(deps.settings.ocr_max_retries, stale_before)
        .await
        .context("Failed to query retryable OCR results")?;

    let mut enqueued = 0;
    for result in &candidates {
        let extract = ExtractAttachmentJob::new(&result.attachment_id, &result.image_url);
        let outcome = deps
            .job_queue
            .enqueue_with(&extract, ExtractAttachmentJob::options(&deps.settings))
            .await?;
        if outcome.is_created() {
            enqueued += 1;
        }
    }

    info!(
        triggered_at = %job.triggered_at,
        candidates = candidates.len(),
        enqueued,
        "OCR retry sweep finished"
    );
    Ok(enqueued)
}
