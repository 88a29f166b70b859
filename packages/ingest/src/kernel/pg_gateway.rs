//! PostgreSQL implementation of [`BasePersistenceGateway`].
//!
//! Content upserts report what they did via `RETURNING (xmax = 0)`: a fresh
//! row has `xmax = 0`, an updated one does not, and a conflicting row whose
//! `WHERE` guard filtered the update returns nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use super::{BasePersistenceGateway, PersistResult};
use crate::common::{SyncJobId, TenantId};
use crate::domains::ocr::models::OcrResult;
use crate::domains::sync::models::{
    ChannelSyncState, StoredAttachment, StoredChannel, StoredMessage, StoredReaction, SyncCheckpoint,
    SyncJobResult, SyncRun, SyncRunStatus, Tenant, UpsertOutcome,
};

const CHANNEL_STATE_COLUMNS: &str = r#"
    sync_job_id, tenant_id, channel_id, status, worker_id, child_job_id, started_at,
    completed_at, messages_processed, reactions_processed, attachments_processed,
    api_calls, rate_limit_encounters, last_message_id, last_message_timestamp, error,
    retry_count, updated_at
"#;

const SYNC_RUN_COLUMNS: &str =
    "id, tenant_id, data, status, cancel_requested, result, error, started_at, finished_at";

const OCR_COLUMNS: &str = r#"
    id, attachment_id, image_url, model_version, extracted_text, confidence, status,
    error_message, retry_count, processing_time_ms, created_at, updated_at
"#;

pub struct PgPersistenceGateway {
    pool: PgPool,
}

impl PgPersistenceGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Register a tenant (or refresh its name/active flag).
    pub async fn upsert_tenant(&self, tenant: &Tenant) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, platform, platform_id, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, active = EXCLUDED.active
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(&tenant.platform)
        .bind(&tenant.platform_id)
        .bind(tenant.active)
        .bind(tenant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn outcome(inserted: Option<bool>) -> UpsertOutcome {
    match inserted {
        Some(true) => UpsertOutcome::Inserted,
        Some(false) => UpsertOutcome::Updated,
        None => UpsertOutcome::Unchanged,
    }
}

async fn write_channel_state<'e, E>(executor: E, state: &ChannelSyncState) -> PersistResult<()>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO channel_sync_states (
            sync_job_id, tenant_id, channel_id, status, worker_id, child_job_id, started_at,
            completed_at, messages_processed, reactions_processed, attachments_processed,
            api_calls, rate_limit_encounters, last_message_id, last_message_timestamp, error,
            retry_count, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (sync_job_id, channel_id) DO UPDATE SET
            status = EXCLUDED.status,
            worker_id = EXCLUDED.worker_id,
            child_job_id = COALESCE(channel_sync_states.child_job_id, EXCLUDED.child_job_id),
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            messages_processed = EXCLUDED.messages_processed,
            reactions_processed = EXCLUDED.reactions_processed,
            attachments_processed = EXCLUDED.attachments_processed,
            api_calls = EXCLUDED.api_calls,
            rate_limit_encounters = EXCLUDED.rate_limit_encounters,
            last_message_id = EXCLUDED.last_message_id,
            last_message_timestamp = EXCLUDED.last_message_timestamp,
            error = EXCLUDED.error,
            retry_count = EXCLUDED.retry_count,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(state.sync_job_id)
    .bind(state.tenant_id)
    .bind(&state.channel_id)
    .bind(state.status)
    .bind(&state.worker_id)
    .bind(state.child_job_id)
    .bind(state.started_at)
    .bind(state.completed_at)
    .bind(state.messages_processed)
    .bind(state.reactions_processed)
    .bind(state.attachments_processed)
    .bind(state.api_calls)
    .bind(state.rate_limit_encounters)
    .bind(&state.last_message_id)
    .bind(state.last_message_timestamp)
    .bind(&state.error)
    .bind(state.retry_count)
    .bind(state.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl BasePersistenceGateway for PgPersistenceGateway {
    async fn find_tenant(&self, tenant_id: TenantId) -> PersistResult<Option<Tenant>> {
        let tenant = sqlx::query_as::<_, Tenant>(
            "SELECT id, name, platform, platform_id, active, created_at FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn list_active_tenants(&self) -> PersistResult<Vec<Tenant>> {
        let tenants = sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, platform, platform_id, active, created_at
            FROM tenants
            WHERE active = TRUE
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tenants)
    }

    async fn upsert_channel(&self, channel: &StoredChannel) -> PersistResult<UpsertOutcome> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO channels (tenant_id, channel_id, name, parent_id, topic)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, channel_id) DO UPDATE SET
                name = EXCLUDED.name,
                parent_id = EXCLUDED.parent_id,
                topic = EXCLUDED.topic,
                updated_at = NOW()
            WHERE (channels.name, channels.parent_id, channels.topic)
                IS DISTINCT FROM (EXCLUDED.name, EXCLUDED.parent_id, EXCLUDED.topic)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(channel.tenant_id)
        .bind(&channel.channel_id)
        .bind(&channel.name)
        .bind(&channel.parent_id)
        .bind(&channel.topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn upsert_message(&self, message: &StoredMessage) -> PersistResult<UpsertOutcome> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO messages (
                tenant_id, message_id, channel_id, author_id, content, sent_at, edited_at,
                thread_id, checksum
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (tenant_id, message_id) DO UPDATE SET
                content = EXCLUDED.content,
                edited_at = EXCLUDED.edited_at,
                thread_id = EXCLUDED.thread_id,
                checksum = EXCLUDED.checksum,
                updated_at = NOW()
            WHERE messages.checksum <> EXCLUDED.checksum
            RETURNING (xmax = 0)
            "#,
        )
        .bind(message.tenant_id)
        .bind(&message.message_id)
        .bind(&message.channel_id)
        .bind(&message.author_id)
        .bind(&message.content)
        .bind(message.sent_at)
        .bind(message.edited_at)
        .bind(&message.thread_id)
        .bind(&message.checksum)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn upsert_reaction(&self, reaction: &StoredReaction) -> PersistResult<UpsertOutcome> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO reactions (tenant_id, message_id, emoji, user_id, count)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, message_id, emoji, user_id) DO UPDATE SET count = EXCLUDED.count
            WHERE reactions.count <> EXCLUDED.count
            RETURNING (xmax = 0)
            "#,
        )
        .bind(reaction.tenant_id)
        .bind(&reaction.message_id)
        .bind(&reaction.emoji)
        .bind(&reaction.user_id)
        .bind(reaction.count)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn upsert_attachment(&self, attachment: &StoredAttachment) -> PersistResult<UpsertOutcome> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO attachments (
                tenant_id, attachment_id, message_id, filename, url, content_type, size_bytes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, attachment_id) DO UPDATE SET
                filename = EXCLUDED.filename,
                url = EXCLUDED.url,
                content_type = EXCLUDED.content_type,
                size_bytes = EXCLUDED.size_bytes
            WHERE (attachments.filename, attachments.url, attachments.content_type, attachments.size_bytes)
                IS DISTINCT FROM (EXCLUDED.filename, EXCLUDED.url, EXCLUDED.content_type, EXCLUDED.size_bytes)
            RETURNING (xmax = 0)
            "#,
        )
        .bind(attachment.tenant_id)
        .bind(&attachment.attachment_id)
        .bind(&attachment.message_id)
        .bind(&attachment.filename)
        .bind(&attachment.url)
        .bind(&attachment.content_type)
        .bind(attachment.size_bytes)
        .fetch_optional(&self.pool)
        .await?;
        Ok(outcome(inserted))
    }

    async fn create_sync_run(&self, run: &SyncRun) -> PersistResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_runs (id, tenant_id, data, status, cancel_requested, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id)
        .bind(run.tenant_id)
        .bind(&run.data)
        .bind(run.status)
        .bind(run.cancel_requested)
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_sync_run(&self, sync_job_id: SyncJobId) -> PersistResult<Option<SyncRun>> {
        let query = format!("SELECT {} FROM sync_runs WHERE id = $1", SYNC_RUN_COLUMNS);
        let run = sqlx::query_as::<_, SyncRun>(&query)
            .bind(sync_job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    async fn find_running_sync_run(&self, tenant_id: TenantId) -> PersistResult<Option<SyncRun>> {
        let query = format!(
            r#"
            SELECT {}
            FROM sync_runs
            WHERE tenant_id = $1 AND status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
            SYNC_RUN_COLUMNS
        );
        let run = sqlx::query_as::<_, SyncRun>(&query)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(run)
    }

    async fn request_cancel(&self, sync_job_id: SyncJobId) -> PersistResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_runs SET cancel_requested = TRUE WHERE id = $1 AND status = 'running'",
        )
        .bind(sync_job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_sync_run(
        &self,
        sync_job_id: SyncJobId,
        status: SyncRunStatus,
        result: Option<&SyncJobResult>,
        error: Option<&str>,
    ) -> PersistResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = $2, result = $3, error = $4, finished_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(sync_job_id)
        .bind(status)
        .bind(result.map(Json))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn insert_channel_states(&self, states: &[ChannelSyncState]) -> PersistResult<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for state in states {
            let result = sqlx::query(
                r#"
                INSERT INTO channel_sync_states (sync_job_id, tenant_id, channel_id, status, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (sync_job_id, channel_id) DO NOTHING
                "#,
            )
            .bind(state.sync_job_id)
            .bind(state.tenant_id)
            .bind(&state.channel_id)
            .bind(state.status)
            .bind(state.updated_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_channel_states(&self, sync_job_id: SyncJobId) -> PersistResult<Vec<ChannelSyncState>> {
        let query = format!(
            "SELECT {} FROM channel_sync_states WHERE sync_job_id = $1 ORDER BY channel_id",
            CHANNEL_STATE_COLUMNS
        );
        let states = sqlx::query_as::<_, ChannelSyncState>(&query)
            .bind(sync_job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(states)
    }

    async fn find_channel_state(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
    ) -> PersistResult<Option<ChannelSyncState>> {
        let query = format!(
            "SELECT {} FROM channel_sync_states WHERE sync_job_id = $1 AND channel_id = $2",
            CHANNEL_STATE_COLUMNS
        );
        let state = sqlx::query_as::<_, ChannelSyncState>(&query)
            .bind(sync_job_id)
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state)
    }

    async fn mark_channel_dispatched(
        &self,
        sync_job_id: SyncJobId,
        channel_id: &str,
        child_job_id: Uuid,
    ) -> PersistResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE channel_sync_states
            SET child_job_id = $3, updated_at = NOW()
            WHERE sync_job_id = $1
              AND channel_id = $2
              AND child_job_id IS NULL
              AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(sync_job_id)
        .bind(channel_id)
        .bind(child_job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_channel_state(&self, state: &ChannelSyncState) -> PersistResult<()> {
        write_channel_state(&self.pool, state).await
    }

    async fn load_checkpoint(
        &self,
        tenant_id: TenantId,
        channel_id: &str,
    ) -> PersistResult<Option<SyncCheckpoint>> {
        let checkpoint = sqlx::query_as::<_, SyncCheckpoint>(
            r#"
            SELECT tenant_id, channel_id, last_message_id, last_message_timestamp,
                   messages_processed, has_more_messages, updated_at
            FROM sync_checkpoints
            WHERE tenant_id = $1 AND channel_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(checkpoint)
    }

    async fn save_progress(&self, state: &ChannelSyncState, checkpoint: &SyncCheckpoint) -> PersistResult<()> {
        let mut tx = self.pool.begin().await?;

        write_channel_state(&mut *tx, state).await?;

        sqlx::query(
            r#"
            INSERT INTO sync_checkpoints (
                tenant_id, channel_id, last_message_id, last_message_timestamp,
                messages_processed, has_more_messages, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tenant_id, channel_id) DO UPDATE SET
                last_message_id = EXCLUDED.last_message_id,
                last_message_timestamp = EXCLUDED.last_message_timestamp,
                messages_processed = EXCLUDED.messages_processed,
                has_more_messages = EXCLUDED.has_more_messages,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(checkpoint.tenant_id)
        .bind(&checkpoint.channel_id)
        .bind(&checkpoint.last_message_id)
        .bind(checkpoint.last_message_timestamp)
        .bind(checkpoint.messages_processed)
        .bind(checkpoint.has_more_messages)
        .bind(checkpoint.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_ocr_result(&self, result: &OcrResult) -> PersistResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ocr_results (
                id, attachment_id, image_url, model_version, extracted_text, confidence, status,
                error_message, retry_count, processing_time_ms, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(result.id)
        .bind(&result.attachment_id)
        .bind(&result.image_url)
        .bind(&result.model_version)
        .bind(&result.extracted_text)
        .bind(result.confidence)
        .bind(result.status)
        .bind(&result.error_message)
        .bind(result.retry_count)
        .bind(result.processing_time_ms)
        .bind(result.created_at)
        .bind(result.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_ocr_result(&self, result: &OcrResult) -> PersistResult<()> {
        sqlx::query(
            r#"
            UPDATE ocr_results
            SET extracted_text = $2,
                confidence = $3,
                status = $4,
                error_message = $5,
                processing_time_ms = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(result.id)
        .bind(&result.extracted_text)
        .bind(result.confidence)
        .bind(result.status)
        .bind(&result.error_message)
        .bind(result.processing_time_ms)
        .bind(result.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_ocr_result(&self, attachment_id: &str) -> PersistResult<Option<OcrResult>> {
        let query = format!(
            r#"
            SELECT {}
            FROM ocr_results
            WHERE attachment_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            OCR_COLUMNS
        );
        let row = sqlx::query_as::<_, OcrResult>(&query)
            .bind(attachment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_ocr_results(&self, attachment_id: &str) -> PersistResult<Vec<OcrResult>> {
        let query = format!(
            "SELECT {} FROM ocr_results WHERE attachment_id = $1 ORDER BY created_at, id",
            OCR_COLUMNS
        );
        let rows = sqlx::query_as::<_, OcrResult>(&query)
            .bind(attachment_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn find_retryable_ocr_results(
        &self,
        max_retries: i32,
        stale_before: DateTime<Utc>,
    ) -> PersistResult<Vec<OcrResult>> {
        let query = format!(
            r#"
            SELECT {cols}
            FROM (
                SELECT DISTINCT ON (attachment_id) {cols}
                FROM ocr_results
                ORDER BY attachment_id, created_at DESC, id DESC
            ) latest
            WHERE retry_count < $1
              AND (status = 'failed' OR (status = 'processing' AND updated_at < $2))
            ORDER BY created_at
            "#,
            cols = OCR_COLUMNS
        );
        let rows = sqlx::query_as::<_, OcrResult>(&query)
            .bind(max_retries)
            .bind(stale_before)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
