// TestDependencies - in-memory implementations of the infrastructure traits
//
// Used by the test suites and for embedding the pipeline without a database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    AdapterResult, BaseAnalysisTrigger, BaseOcrExtractor, BasePersistenceGateway, BasePlatformAdapter,
    OcrExtraction, PersistResult,
};
use crate::common::{SyncJobId, TenantId};
use crate::domains::ocr::models::OcrResult;
use crate::domains::ocr::OcrError;
use crate::domains::sync::errors::AdapterError;
use crate::domains::sync::models::{
    ChannelKind, ChannelSyncState, FetchMessagesOptions, FetchMessagesResult, PlatformChannel,
    PlatformMessage, StoredAttachment, StoredChannel, StoredMessage, StoredReaction, SyncCheckpoint,
    SyncJobResult, SyncRun, SyncRunStatus, Tenant, UpsertOutcome,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Mock Platform Adapter
// =============================================================================

/// How a scripted failure behaves.
#[derive(Debug, Clone)]
enum ScriptedFailure {
    /// Fail the next `n` fetches, then recover.
    Times(AdapterError, usize),
    /// Fail every fetch.
    Always(AdapterError),
}

/// A fetch recorded by the mock.
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub channel_id: String,
    pub options: FetchMessagesOptions,
}

/// Serves channels and chronologically ordered messages from memory.
pub struct MockPlatformAdapter {
    platform: String,
    page_size: u32,
    channels: Mutex<Vec<PlatformChannel>>,
    messages: Mutex<HashMap<String, Vec<PlatformMessage>>>,
    failures: Mutex<HashMap<String, VecDeque<ScriptedFailure>>>,
    channel_list_error: Mutex<Option<AdapterError>>,
    init_error: Mutex<Option<AdapterError>>,
    /// Repeat the cursor message at the head of every resumed page.
    overlap: bool,
    initialize_calls: Mutex<usize>,
    cleanup_calls: Mutex<usize>,
    fetch_calls: Mutex<Vec<FetchCall>>,
}

impl MockPlatformAdapter {
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
            page_size: 100,
            channels: Mutex::new(Vec::new()),
            messages: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            channel_list_error: Mutex::new(None),
            init_error: Mutex::new(None),
            overlap: false,
            initialize_calls: Mutex::new(0),
            cleanup_calls: Mutex::new(0),
            fetch_calls: Mutex::new(Vec::new()),
        }
    }

    /// Cap pages below the requested limit.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Re-send the last delivered message on every page, like platforms
    /// with inclusive cursors do.
    pub fn with_overlap(mut self) -> Self {
        self.overlap = true;
        self
    }

    pub fn with_channel(self, channel_id: &str, messages: Vec<PlatformMessage>) -> Self {
        self.add_channel(channel_id, messages);
        self
    }

    pub fn add_channel(&self, channel_id: &str, messages: Vec<PlatformMessage>) {
        lock(&self.channels).push(PlatformChannel {
            id: channel_id.to_string(),
            name: format!("#{}", channel_id),
            kind: ChannelKind::Text,
            parent_id: None,
            topic: None,
        });
        self.set_messages(channel_id, messages);
    }

    /// Replace a channel's history (e.g. to simulate new messages arriving).
    pub fn set_messages(&self, channel_id: &str, mut messages: Vec<PlatformMessage>) {
        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.len().cmp(&b.id.len()))
                .then_with(|| a.id.cmp(&b.id))
        });
        lock(&self.messages).insert(channel_id.to_string(), messages);
    }

    pub fn fail_times(&self, channel_id: &str, error: AdapterError, times: usize) {
        if times == 0 {
            return;
        }
        lock(&self.failures)
            .entry(channel_id.to_string())
            .or_default()
            .push_back(ScriptedFailure::Times(error, times));
    }

    pub fn fail_always(&self, channel_id: &str, error: AdapterError) {
        lock(&self.failures)
            .entry(channel_id.to_string())
            .or_default()
            .push_back(ScriptedFailure::Always(error));
    }

    pub fn fail_channel_listing(&self, error: AdapterError) {
        *lock(&self.channel_list_error) = Some(error);
    }

    pub fn fail_initialize(&self, error: AdapterError) {
        *lock(&self.init_error) = Some(error);
    }

    pub fn initialize_calls(&self) -> usize {
        *lock(&self.initialize_calls)
    }

    pub fn cleanup_calls(&self) -> usize {
        *lock(&self.cleanup_calls)
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        lock(&self.fetch_calls).clone()
    }

    pub fn fetches_for(&self, channel_id: &str) -> usize {
        lock(&self.fetch_calls)
            .iter()
            .filter(|c| c.channel_id == channel_id)
            .count()
    }

    fn next_failure(&self, channel_id: &str) -> Option<AdapterError> {
        let mut failures = lock(&self.failures);
        let queue = failures.get_mut(channel_id)?;
        match queue.front_mut()? {
            ScriptedFailure::Always(error) => Some(error.clone()),
            ScriptedFailure::Times(error, remaining) => {
                let error = error.clone();
                *remaining -= 1;
                if *remaining == 0 {
                    queue.pop_front();
                }
                Some(error)
            }
        }
    }
}

#[async_trait]
impl BasePlatformAdapter for MockPlatformAdapter {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn max_page_size(&self) -> u32 {
        self.page_size
    }

    async fn initialize(&self) -> AdapterResult<()> {
        *lock(&self.initialize_calls) += 1;
        match lock(&self.init_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn cleanup(&self) -> AdapterResult<()> {
        *lock(&self.cleanup_calls) += 1;
        Ok(())
    }

    async fn verify_connection(&self, _platform_id: &str) -> AdapterResult<bool> {
        Ok(lock(&self.init_error).is_none())
    }

    async fn fetch_channels(&self, _platform_id: &str) -> AdapterResult<Vec<PlatformChannel>> {
        if let Some(error) = lock(&self.channel_list_error).clone() {
            return Err(error);
        }
        Ok(lock(&self.channels).clone())
    }

    async fn fetch_messages(
        &self,
        channel_id: &str,
        options: &FetchMessagesOptions,
    ) -> AdapterResult<FetchMessagesResult> {
        lock(&self.fetch_calls).push(FetchCall {
            channel_id: channel_id.to_string(),
            options: options.clone(),
        });

        if let Some(error) = self.next_failure(channel_id) {
            return Err(error);
        }

        let messages = lock(&self.messages);
        let history = messages
            .get(channel_id)
            .ok_or_else(|| AdapterError::ChannelNotFound(channel_id.to_string()))?;

        let resume_at = options
            .after_message_id
            .as_ref()
            .and_then(|after| history.iter().position(|m| &m.id == after))
            .map(|i| if self.overlap { i } else { i + 1 });

        let eligible: Vec<&PlatformMessage> = match resume_at {
            Some(start) => history[start..].iter().collect(),
            None => history
                .iter()
                .filter(|m| options.after_timestamp.map_or(true, |after| m.timestamp > after))
                .collect(),
        };
        let eligible: Vec<&PlatformMessage> = eligible
            .into_iter()
            .filter(|m| options.before_timestamp.map_or(true, |before| m.timestamp < before))
            .collect();

        let limit = options.limit.min(self.page_size).max(1) as usize;
        let page: Vec<PlatformMessage> = eligible.iter().take(limit).map(|m| (*m).clone()).collect();
        let has_more = eligible.len() > limit;

        Ok(FetchMessagesResult {
            messages: page,
            has_more,
            checkpoint: None,
        })
    }
}

// =============================================================================
// In-memory Persistence Gateway
// =============================================================================

#[derive(Default)]
struct GatewayState {
    tenants: HashMap<TenantId, Tenant>,
    channels: HashMap<(TenantId, String), StoredChannel>,
    messages: HashMap<(TenantId, String), StoredMessage>,
    reactions: HashMap<(TenantId, String, String, String), StoredReaction>,
    attachments: HashMap<(TenantId, String), StoredAttachment>,
    runs: HashMap<SyncJobId, SyncRun>,
    channel_states: HashMap<(SyncJobId, String), ChannelSyncState>,
    checkpoints: HashMap<(TenantId, String), SyncCheckpoint>,
    ocr_results: Vec<OcrResult>,
    message_writes: usize,
}

#[derive(Default)]
pub struct InMemoryGateway {
    state: Mutex<GatewayState>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(&self, tenant: Tenant) {
        lock(&self.state).tenants.insert(tenant.id, tenant);
    }

    pub fn message_count(&self) -> usize {
        lock(&self.state).messages.len()
    }

    /// Inserts and updates that actually changed a message row.
    pub fn message_writes(&self) -> usize {
        lock(&self.state).message_writes
    }

    pub fn messages_in(&self, channel_id: &str) -> Vec<StoredMessage> {
        let mut messages: Vec<StoredMessage> = lock(&self.state)
            .messages
            .values()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.message_id.cmp(&b.message_id)));
        messages
    }

    pub fn reaction_count(&self) -> usize {
        lock(&self.state).reactions.len()
    }

    pub fn attachment_count(&self) -> usize {
        lock(&self.state).attachments.len()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.state).channels.len()
    }

    pub fn checkpoint(&self, tenant_id: TenantId, channel_id: &str) -> Option<SyncCheckpoint> {
        lock(&self.state)
            .checkpoints
            .get(&(tenant_id, channel_id.to_string()))
            .cloned()
    }

    pub fn sync_run(&self, sync_job_id: SyncJobId) -> Option<SyncRun> {
        lock(&self.state).runs.get(&sync_job_id).cloned()
    }

    pub fn sync_runs(&self) -> Vec<SyncRun> {
        let mut runs: Vec<SyncRun> = lock(&self.state).runs.values().cloned().collect();
        runs.sort_by_key(|r| r.started_at);
        runs
    }

    /// Overwrite a run, e.g. to age it for stale-run tests.
    pub fn put_sync_run(&self, run: SyncRun) {
        lock(&self.state).runs.insert(run.id, run);
    }

    pub fn ocr_rows(&self) -> Vec<OcrResult> {
        lock(&self.state).ocr_results.clone()
    }
}

#[async_trait]
impl BasePersistenceGateway for InMemoryGateway {
    async fn find_tenant(&self, tenant_id: TenantId) -> PersistResult<Option<Tenant>> {
        Ok(lock(&self.state).tenants.get(&tenant_id).cloned())
    }

    async fn list_active_tenants(&self) -> PersistResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = lock(&self.state)
            .tenants
            .values()
            .filter(|t| t.active)
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn upsert_channel(&self, channel: &StoredChannel) -> PersistResult<UpsertOutcome> {
        let mut state = lock(&self.state);
        let key = (channel.tenant_id, channel.channel_id.clone());
        Ok(upsert(&mut state.channels, key, channel))
    }

    async fn upsert_message(&self, message: &StoredMessage) -> PersistResult<UpsertOutcome> {
        let mut state = lock(&self.state);
        let key = (message.tenant_id, message.message_id.clone());
        let outcome = match state.messages.get(&key) {
            Some(existing) if existing.checksum == message.checksum => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        };
        if outcome != UpsertOutcome::Unchanged {
            state.messages.insert(key, message.clone());
            state.message_writes += 1;
        }
        Ok(outcome)
    }

    async fn upsert_reaction(&self, reaction: &StoredReaction) -> PersistResult<UpsertOutcome> {
        let mut state = lock(&self.state);
        let key = (
            reaction.tenant_id,
            reaction.message_id.clone(),
            reaction.emoji.clone(),
            reaction.user_id.clone(),
        );
        Ok(upsert(&mut state.reactions, key, reaction))
    }

    async fn upsert_attachment(&self, attachment: &StoredAttachment) -> PersistResult<UpsertOutcome> {
        let mut state = lock(&self.state);
        let key = (attachment.tenant_id, attachment.attachment_id.clone());
        Ok(upsert(&mut state.attachments, key, attachment))
    }

    async fn create_sync_run(&self, run: &SyncRun) -> PersistResult<bool> {
        let mut state = lock(&self.state);
        if state.runs.contains_key(&run.id) {
            return Ok(false);
        }
        state.runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn find_sync_run(&self, sync_job_id: SyncJobId) -> PersistResult<Option<SyncRun>> {
        Ok(lock(&self.state).runs.get(&sync_job_id).cloned())
    }

    async fn find_running_sync_run(&self, tenant_id: TenantId) -> PersistResult<Option<SyncRun>> {
        Ok(lock(&self.state)
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.status == SyncRunStatus::Running)
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn request_cancel(&self, sync_job_id: SyncJobId) -> PersistResult<bool> {
        let mut state = lock(&self.state);
        match state.runs.get_mut(&sync_job_id) {
            Some(run) if run.status == SyncRunStatus::Running => {
                run.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_sync_run(
        &self,
        sync_job_id: SyncJobId,
        status: SyncRunStatus,
        result: Option<&SyncJobResult>,
        error: Option<&str>,
    ) -> PersistResult<bool> {
        let mut state = lock(&self.state);
        match state.runs.get_mut(&sync_job_id) {
            Some(run) if run.status == SyncRunStatus::Running => {
                run.status = status;
                run.result = result.cloned().map(Json);
                run.error = error.map(str::to_string);
                run.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_channel_states(&self, states: &[ChannelSyncState]) -> PersistResult<u64> {
        let mut state = lock(&self.state);
        let mut inserted = 0;
        for channel_state in states {
            let key = (channel_state.sync_job_id, channel_state.channel_id.clone());
            if !state.channel_states.contains_key(&key) {
                state.channel_states.insert(key, channel_state.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_channel_states(&self, sync_job_id: SyncJobId) -> PersistResult<Vec<ChannelSyncState>> {
        let mut states: Vec<ChannelSyncState> = lock(&self.state)
            .channel_states
            .values()
            .filter(|s| s.sync_job_id == sync_job_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        Ok(states)
    }

    async fn find_channel_state(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
    ) -> PersistResult<Option<ChannelSyncState>> {
        Ok(lock(&self.state)
            .channel_states
            .get(&(sync_job_id, channel_id.to_string()))
            .cloned())
    }

    async fn mark_channel_dispatched(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
        child_job_id: Uuid,
    ) -> PersistResult<bool> {
        let mut state = lock(&self.state);
        match state.channel_states.get_mut(&(sync_job_id, channel_id.to_string())) {
            Some(s) if s.child_job_id.is_none() && !s.is_terminal() => {
                s.child_job_id = Some(child_job_id);
                s.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_channel_state(&self, channel_state: &ChannelSyncState) -> PersistResult<()> {
        let key = (channel_state.sync_job_id, channel_state.channel_id.clone());
        lock(&self.state).channel_states.insert(key, channel_state.clone());
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
    ) -> PersistResult<Option<SyncCheckpoint>> {
        Ok(self.checkpoint(tenant_id, channel_id))
    }

    async fn save_progress(&self, channel_state: &ChannelSyncState, checkpoint: &SyncCheckpoint) -> PersistResult<()> {
        let mut state = lock(&self.state);
        state.channel_states.insert(
            (channel_state.sync_job_id, channel_state.channel_id.clone()),
            channel_state.clone(),
        );
        state.checkpoints.insert(
            (checkpoint.tenant_id, checkpoint.channel_id.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn insert_ocr_result(&self, result: &OcrResult) -> PersistResult<()> {
        lock(&self.state).ocr_results.push(result.clone());
        Ok(())
    }

    async fn update_ocr_result(&self, result: &OcrResult) -> PersistResult<()> {
        let mut state = lock(&self.state);
        if let Some(row) = state.ocr_results.iter_mut().find(|r| r.id == result.id) {
            *row = result.clone();
        }
        Ok(())
    }

    async fn latest_ocr_result(&self, attachment_id: &str) -> PersistResult<Option<OcrResult>> {
        Ok(lock(&self.state)
            .ocr_results
            .iter()
            .rev()
            .find(|r| r.attachment_id == attachment_id)
            .cloned())
    }

    async fn list_ocr_results(&self, attachment_id: &str) -> PersistResult<Vec<OcrResult>> {
        Ok(lock(&self.state)
            .ocr_results
            .iter()
            .filter(|r| r.attachment_id == attachment_id)
            .cloned()
            .collect())
    }

    async fn find_retryable_ocr_results(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> PersistResult<Vec<OcrResult>> {
        let state = lock(&self.state);
        let mut latest: HashMap<&str, &OcrResult> = HashMap::new();
        for row in &state.ocr_results {
            latest.insert(row.attachment_id.as_str(), row);
        }

        let mut retryable: Vec<OcrResult> = latest
            .into_values()
            .filter(|r| r.needs_retry(max_retries, stale_before))
            .cloned()
            .collect();
        retryable.sort_by_key(|r| r.created_at);
        Ok(retryable)
    }
}

fn upsert<K, V>(map: &mut HashMap<K, V>, key: K, value: &V) -> UpsertOutcome
where
    K: std::hash::Hash + Eq,
    V: Clone + PartialEq,
{
    match map.get(&key) {
        Some(existing) if existing == value => UpsertOutcome::Unchanged,
        Some(_) => {
            map.insert(key, value.clone());
            UpsertOutcome::Updated
        }
        None => {
            map.insert(key, value.clone());
            UpsertOutcome::Inserted
        }
    }
}

// =============================================================================
// Spy Analysis Trigger
// =============================================================================

/// A hand-off recorded by the spy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisCall {
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub message_ids: Vec<String>,
}

#[derive(Default)]
pub struct SpyAnalysisTrigger {
    calls: Mutex<Vec<AnalysisCall>>,
    fail: bool,
}

impl SpyAnalysisTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record calls but report failure, to check the hand-off never fails a channel.
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<AnalysisCall> {
        lock(&self.calls).clone()
    }

    pub fn total_messages(&self) -> usize {
        lock(&self.calls).iter().map(|c| c.message_ids.len()).sum()
    }
}

#[async_trait]
impl BaseAnalysisTrigger for SpyAnalysisTrigger {
    async fn messages_ingested(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
        message_ids: Vec<String>,
    ) -> Result<()> {
        lock(&self.calls).push(AnalysisCall {
            tenant_id,
            channel_id: channel_id.to_string(),
            message_ids,
        });
        if self.fail {
            anyhow::bail!("analysis service unavailable");
        }
        Ok(())
    }
}

// =============================================================================
// Mock OCR Extractor
// =============================================================================

/// Returns scripted outcomes in order, then succeeds.
pub struct MockOcrExtractor {
    model_version: String,
    outcomes: Mutex<VecDeque<std::result::Result<OcrExtraction, OcrError>>>,
    calls: Mutex<Vec<String>>,
}

impl MockOcrExtractor {
    pub fn new() -> Self {
        Self {
            model_version: "mock-vision-1".to_string(),
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_failure(self, error: OcrError) -> Self {
        lock(&self.outcomes).push_back(Err(error));
        self
    }

    pub fn with_text(self, text: &str, confidence: Option<f64>) -> Self {
        lock(&self.outcomes).push_back(Ok(OcrExtraction {
            text: text.to_string(),
            confidence,
            model_used: self.model_version.clone(),
            processing_time_ms: 12,
        }));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

impl Default for MockOcrExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseOcrExtractor for MockOcrExtractor {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn extract(&self, image_url: &str) -> std::result::Result<OcrExtraction, OcrError> {
        lock(&self.calls).push(image_url.to_string());
        match lock(&self.outcomes).pop_front() {
            Some(outcome) => outcome,
            None => Ok(OcrExtraction {
                text: format!("text from {}", image_url),
                confidence: None,
                model_used: self.model_version.clone(),
                processing_time_ms: 12,
            }),
        }
    }
}
