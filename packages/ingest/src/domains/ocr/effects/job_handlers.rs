//! Job handlers for the OCR domain.
//!
//! ```text
//! OcrRetrySweepJob     → sweep_ocr_retries()  → enqueue ExtractAttachmentJob per candidate
//! ExtractAttachmentJob → extract_attachment() → terminal (one row per attempt)
//! ```

use std::sync::Arc;

use anyhow::Result;

use crate::domains::ocr::activities::{extract_attachment, sweep_ocr_retries};
use crate::domains::ocr::jobs::{ExtractAttachmentJob, OcrRetrySweepJob};
use crate::kernel::jobs::JobRegistry;
use crate::kernel::IngestDeps;

pub async fn handle_extract_attachment(job: ExtractAttachmentJob, deps: Arc<IngestDeps>) -> Result<()> {
    extract_attachment(&job, &deps).await?;
    Ok(())
}

pub async fn handle_ocr_retry_sweep(job: OcrRetrySweepJob, deps: Arc<IngestDeps>) -> Result<()> {
    sweep_ocr_retries(&job, &deps).await?;
    Ok(())
}

pub fn register_ocr_jobs(registry: &mut JobRegistry) {
    registry.register::<ExtractAttachmentJob, _, _>(ExtractAttachmentJob::JOB_TYPE, |job, deps| async move {
        handle_extract_attachment(job, deps).await
    });

    registry.register::<OcrRetrySweepJob, _, _>(OcrRetrySweepJob::JOB_TYPE, |job, deps| async move {
        handle_ocr_retry_sweep(job, deps).await
    });
}
