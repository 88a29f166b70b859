//! A single OCR extraction attempt.

use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::domains::ocr::jobs::ExtractAttachmentJob;
use crate::domains::ocr::models::{OcrResult, OcrStatus};
use crate::kernel::IngestDeps;

/// Run one attempt and record it as a new row.
///
/// Returns the recorded row, or `None` when nothing was attempted (already
/// extracted, or no extractor configured). Extractor failures are recorded
/// on the row and are not errors here; the retry sweep picks them up.
pub async fn extract_attachment(job: &ExtractAttachmentJob, deps: &IngestDeps) -> Result<Option<OcrResult>> {
    let Some(extractor) = deps.ocr_extractor.as_ref() else {
        debug!(attachment_id = %job.attachment_id, "No OCR extractor configured, skipping");
        return Ok(None);
    };

    let previous = deps
        .gateway
        .latest_ocr_result(&job.attachment_id)
        .await
        .context("Failed to load latest OCR result")?;

    if matches!(previous.as_ref().map(|p| p.status), Some(OcrStatus::Completed)) {
        debug!(attachment_id = %job.attachment_id, "Attachment already extracted");
        return Ok(None);
    }

    let mut row = OcrResult::begin_attempt(
        &job.attachment_id,
        &job.image_url,
        extractor.model_version(),
        previous.as_ref(),
    );
    deps.gateway
        .insert_ocr_result(&row)
        .await
        .context("Failed to record OCR attempt")?;

    let started = Instant::now();
    let outcome = extractor.extract(&job.image_url).await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(extraction) => {
            let ms = if extraction.processing_time_ms > 0 {
                extraction.processing_time_ms
            } else {
                elapsed_ms
            };
            row.complete(extraction.text, extraction.confidence, ms);
            info!(
                attachment_id = %job.attachment_id,
                retry_count = row.retry_count,
                model = %extraction.model_used,
                confidence = ?row.confidence,
                "OCR extraction completed"
            );
        }
        Err(e) => {
            row.fail(e.to_string(), elapsed_ms);
            warn!(
                attachment_id = %job.attachment_id,
                retry_count = row.retry_count,
                retryable = e.is_retryable(),
                error = %e,
                "OCR extraction failed"
            );
        }
    }

    deps.gateway
        .update_ocr_result(&row)
        .await
        .context("Failed to finalize OCR attempt")?;

    Ok(Some(row))
}
