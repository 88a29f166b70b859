//! Pipeline dependencies passed to job handlers (traits for testability).
//!
//! Built once at process start and shared as `Arc<IngestDeps>`; nothing in
//! the pipeline reaches for process-wide globals.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::common::TenantId;
use crate::config::SyncSettings;
use crate::domains::sync::jobs::AnalyzeMessagesJob;
use crate::kernel::jobs::{JobQueue, JobQueueExt};
use crate::kernel::{AdapterRegistry, BaseAnalysisTrigger, BaseOcrExtractor, BasePersistenceGateway};

// =============================================================================
// QueueAnalysisTrigger (implements BaseAnalysisTrigger via the job queue)
// =============================================================================

/// Hands new messages to the analysis service as `analysis:messages` jobs.
pub struct QueueAnalysisTrigger(pub Arc<dyn JobQueue>);

impl QueueAnalysisTrigger {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self(queue)
    }
}

#[async_trait]
impl BaseAnalysisTrigger for QueueAnalysisTrigger {
    async fn messages_ingested(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
        message_ids: Vec<String>,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let count = message_ids.len();
        let job = AnalyzeMessagesJob {
            tenant_id,
            channel_id: channel_id.to_string(),
            message_ids,
        };
        let result = self.0.enqueue(&job).await?;
        debug!(job_id = %result.job_id(), channel_id = %channel_id, count, "queued message analysis");
        Ok(())
    }
}

// =============================================================================
// IngestDeps
// =============================================================================

#[derive(Clone)]
pub struct IngestDeps {
    pub job_queue: Arc<dyn JobQueue>,
    pub gateway: Arc<dyn BasePersistenceGateway>,
    pub adapters: Arc<AdapterRegistry>,
    pub analysis: Arc<dyn BaseAnalysisTrigger>,
    /// OCR is skipped entirely when no extractor is configured.
    pub ocr_extractor: Option<Arc<dyn BaseOcrExtractor>>,
    pub settings: SyncSettings,
    pub worker_id: String,
}

impl IngestDeps {
    pub fn new(
        job_queue: Arc<dyn JobQueue>,
        gateway: Arc<dyn BasePersistenceGateway>,
        adapters: Arc<AdapterRegistry>,
        settings: SyncSettings,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            analysis: Arc::new(QueueAnalysisTrigger::new(job_queue.clone())),
            job_queue,
            gateway,
            adapters,
            ocr_extractor: None,
            settings,
            worker_id: worker_id.into(),
        }
    }

    pub fn with_analysis(mut self, analysis: Arc<dyn BaseAnalysisTrigger>) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn with_ocr_extractor(mut self, extractor: Arc<dyn BaseOcrExtractor>) -> Self {
        self.ocr_extractor = Some(extractor);
        self
    }

    pub fn ocr_enabled(&self) -> bool {
        self.settings.ocr_enabled && self.ocr_extractor.is_some()
    }
}
