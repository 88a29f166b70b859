// Trait definitions for dependency injection
//
// These are INFRASTRUCTURE traits only - no business logic.
// Sync and OCR logic are domain activities that use these traits.
//
// Naming convention: Base* for trait names (e.g., BasePlatformAdapter)

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::{SyncJobId, TenantId};
use crate::domains::ocr::models::OcrResult;
use crate::domains::ocr::OcrError;
use crate::domains::sync::errors::{AdapterError, PersistenceError};
use crate::domains::sync::models::{
    ChannelSyncState, FetchMessagesOptions, FetchMessagesResult, PlatformChannel, StoredAttachment,
    StoredChannel, StoredMessage, StoredReaction, SyncCheckpoint, SyncJobResult, SyncRun,
    SyncRunStatus, Tenant, UpsertOutcome,
};

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
pub type PersistResult<T> = std::result::Result<T, PersistenceError>;

// =============================================================================
// Platform Adapter (Infrastructure - external chat platform)
// =============================================================================

#[async_trait]
pub trait BasePlatformAdapter: Send + Sync {
    /// Registry key, e.g. "discord".
    fn platform(&self) -> &str;

    fn display_name(&self) -> &str {
        self.platform()
    }

    /// Largest page the platform serves.
    fn max_page_size(&self) -> u32 {
        100
    }

    async fn initialize(&self) -> AdapterResult<()>;

    async fn cleanup(&self) -> AdapterResult<()>;

    async fn verify_connection(&self, platform_id: &str) -> AdapterResult<bool>;

    async fn fetch_channels(&self, platform_id: &str) -> AdapterResult<Vec<PlatformChannel>>;

    /// One page of messages, chronological ascending.
    async fn fetch_messages(
        &self,
        channel_id: &str,
        options: &FetchMessagesOptions,
    ) -> AdapterResult<FetchMessagesResult>;
}

// =============================================================================
// Persistence Gateway (Infrastructure - durable store)
// =============================================================================

/// Storage contract for ingested content and pipeline state.
///
/// Content upserts are idempotent, keyed by stable platform ids.
#[async_trait]
pub trait BasePersistenceGateway: Send + Sync {
    // Tenants
    async fn find_tenant(&self, tenant_id: TenantId) -> PersistResult<Option<Tenant>>;
    async fn list_active_tenants(&self) -> PersistResult<Vec<Tenant>>;

    // Content
    async fn upsert_channel(&self, channel: &StoredChannel) -> PersistResult<UpsertOutcome>;
    /// Same id and checksum is a no-op; a different checksum is an edit.
    async fn upsert_message(&self, message: &StoredMessage) -> PersistResult<UpsertOutcome>;
    async fn upsert_reaction(&self, reaction: &StoredReaction) -> PersistResult<UpsertOutcome>;
    async fn upsert_attachment(&self, attachment: &StoredAttachment) -> PersistResult<UpsertOutcome>;

    // Sync runs
    /// Insert if absent. Returns false when the run already exists.
    async fn create_sync_run(&self, run: &SyncRun) -> PersistResult<bool>;
    async fn find_sync_run(&self, sync_job_id: SyncJobId) -> PersistResult<Option<SyncRun>>;
    async fn find_running_sync_run(&self, tenant_id: TenantId) -> PersistResult<Option<SyncRun>>;
    /// Set the cooperative cancel flag on a running sync.
    async fn request_cancel(&self, sync_job_id: SyncJobId) -> PersistResult<bool>;
    /// Move a running sync to a terminal status. Returns false if it was
    /// already finished.
    async fn finish_sync_run(
        &self,
        sync_job_id: SyncJobId,
        status: SyncRunStatus,
        result: Option<&SyncJobResult>,
        error: Option<&str>,
    ) -> PersistResult<bool>;

    // Channel states
    /// Insert states that do not exist yet. Returns how many were inserted.
    async fn insert_channel_states(&self, states: &[ChannelSyncState]) -> PersistResult<u64>;
    async fn list_channel_states(&self, sync_job_id: SyncJobId) -> PersistResult<Vec<ChannelSyncState>>;
    async fn find_channel_state(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
    ) -> PersistResult<Option<ChannelSyncState>>;
    /// Record the queue job owning a channel, only if none is recorded yet.
    async fn mark_channel_dispatched(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
        child_job_id: uuid::Uuid,
    ) -> PersistResult<bool>;
    async fn save_channel_state(&self, state: &ChannelSyncState) -> PersistResult<()>;

    // Checkpoints
    async fn load_checkpoint(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
    ) -> PersistResult<Option<SyncCheckpoint>>;
    /// Persist channel progress and the channel checkpoint together.
    async fn save_progress(&self, state: &ChannelSyncState, checkpoint: &SyncCheckpoint) -> PersistResult<()>;

    // OCR results
    async fn insert_ocr_result(&self, result: &OcrResult) -> PersistResult<()>;
    async fn update_ocr_result(&self, result: &OcrResult) -> PersistResult<()>;
    async fn latest_ocr_result(&self, attachment_id: &str) -> PersistResult<Option<OcrResult>>;
    /// Every attempt for an attachment, oldest first.
    async fn list_ocr_results(&self, attachment_id: &str) -> PersistResult<Vec<OcrResult>>;
    /// Latest rows that failed (or went stale while processing) and are
    /// under the retry ceiling.
    async fn find_retryable_ocr_results(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> PersistResult<Vec<OcrResult>>;
}

// =============================================================================
// Analysis Trigger (Infrastructure - downstream pipeline hand-off)
// =============================================================================

#[async_trait]
pub trait BaseAnalysisTrigger: Send + Sync {
    /// Hand newly ingested messages to analysis. Not awaited for completion.
    async fn messages_ingested(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
        message_ids: Vec<String>,
    ) -> Result<()>;
}

// =============================================================================
// OCR Extractor (Infrastructure - vision model / OCR provider)
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct OcrExtraction {
    pub text: String,
    /// Vision models often report none.
    pub confidence: Option<f64>,
    pub model_used: String,
    pub processing_time_ms: i64,
}

#[async_trait]
pub trait BaseOcrExtractor: Send + Sync {
    fn model_version(&self) -> &str;

    async fn extract(&self, image_url: &str) -> std::result::Result<OcrExtraction, OcrError>;
}
