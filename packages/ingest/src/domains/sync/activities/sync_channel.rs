//! Channel sync worker
//!
//! Drives one channel from `pending` to `completed`/`failed`, paging the
//! adapter from the last persisted cursor and checkpointing after every
//! page. Deliveries are at-least-once: pages at or before the cursor are
//! dropped and content upserts are idempotent.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::orchestrate::{enqueue_step, CANCELLED_MESSAGE};
use crate::domains::ocr::jobs::ExtractAttachmentJob;
use crate::domains::sync::errors::{AdapterError, SyncError, SyncResult};
use crate::domains::sync::jobs::SyncChannelJob;
use crate::domains::sync::models::{
    ChannelSyncState, ChannelSyncStatus, DateWindow, FetchMessagesOptions, PlatformMessage,
    StoredAttachment, StoredMessage, StoredReaction, SyncCheckpoint, SyncType, UpsertOutcome,
};
use crate::kernel::jobs::JobQueueExt;
use crate::kernel::IngestDeps;

/// How a channel job delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Completed { messages: i64 },
    Failed { error: String },
    /// The channel was already terminal (redelivery after completion).
    AlreadyTerminal,
}

/// Position within a channel: the newest ingested message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Cursor {
    message_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

impl Cursor {
    fn of(message: &PlatformMessage) -> Self {
        Self {
            message_id: Some(message.id.clone()),
            timestamp: Some(message.timestamp),
        }
    }

    /// Strictly after the cursor in (timestamp, id) order.
    fn is_before(&self, message: &PlatformMessage) -> bool {
        if let Some(ts) = self.timestamp {
            match message.timestamp.cmp(&ts) {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => {}
            }
        }
        match &self.message_id {
            Some(id) => compare_ids(&message.id, id) == Ordering::Greater,
            None => true,
        }
    }
}

/// Platform ids are usually numeric snowflakes; compare by length first so
/// "10" sorts after "9".
fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Handle one delivery of a channel job.
///
/// Returns `Err` only for retryable failures under the retry ceiling, so the
/// queue redelivers; every terminal outcome is `Ok`.
pub async fn sync_channel(job: &SyncChannelJob, deps: &IngestDeps) -> SyncResult<ChannelOutcome> {
    let mut state = deps
        .gateway
        .find_channel_state(job.sync_job_id, &job.channel_id)
        .await?
        .ok_or_else(|| {
            SyncError::ChannelSetUnresolved(format!(
                "no state for channel {} in sync {}",
                job.channel_id, job.sync_job_id
            ))
        })?;

    if state.is_terminal() {
        debug!(
            sync_job_id = %job.sync_job_id,
            channel_id = %job.channel_id,
            status = ?state.status,
            "Channel already terminal"
        );
        notify_orchestrator(job, deps).await?;
        return Ok(ChannelOutcome::AlreadyTerminal);
    }

    let mut new_message_ids = Vec::new();
    let result = ingest_channel(job, &mut state, &mut new_message_ids, deps).await;
    // Pages stored before a failure sit behind the cursor on redelivery.
    trigger_analysis(job, new_message_ids, deps).await;

    let outcome = match result {
        Ok(()) => {
            state.mark_completed();
            deps.gateway.save_channel_state(&state).await?;
            info!(
                sync_job_id = %job.sync_job_id,
                channel_id = %job.channel_id,
                messages = state.messages_processed,
                api_calls = state.api_calls,
                "Channel sync completed"
            );
            ChannelOutcome::Completed {
                messages: state.messages_processed,
            }
        }
        Err(SyncError::Cancelled) => {
            state.mark_failed(CANCELLED_MESSAGE);
            deps.gateway.save_channel_state(&state).await?;
            info!(sync_job_id = %job.sync_job_id, channel_id = %job.channel_id, "Channel sync cancelled");
            ChannelOutcome::Failed {
                error: CANCELLED_MESSAGE.to_string(),
            }
        }
        Err(e) if e.is_retryable() => {
            state.retry_count += 1;
            let ceiling = deps.settings.channel_sync_attempts.max(1) as i32;

            if state.retry_count < ceiling {
                warn!(
                    sync_job_id = %job.sync_job_id,
                    channel_id = %job.channel_id,
                    retry_count = state.retry_count,
                    error = %e,
                    "Channel sync failed, will retry"
                );
                state.status = ChannelSyncStatus::Pending;
                state.error = Some(e.to_string());
                state.updated_at = Utc::now();
                deps.gateway.save_channel_state(&state).await?;
                // A redelivered job can run out of queue attempts first; the
                // step reconciles a dead-lettered channel job.
                if let Err(notify_err) = notify_orchestrator(job, deps).await {
                    warn!(sync_job_id = %job.sync_job_id, error = %notify_err, "Failed to enqueue sync step");
                }
                return Err(e);
            }

            warn!(
                sync_job_id = %job.sync_job_id,
                channel_id = %job.channel_id,
                retry_count = state.retry_count,
                error = %e,
                "Channel sync exhausted retries"
            );
            state.mark_failed(e.to_string());
            deps.gateway.save_channel_state(&state).await?;
            ChannelOutcome::Failed { error: e.to_string() }
        }
        Err(e) => {
            warn!(
                sync_job_id = %job.sync_job_id,
                channel_id = %job.channel_id,
                error = %e,
                "Channel sync failed"
            );
            state.mark_failed(e.to_string());
            deps.gateway.save_channel_state(&state).await?;
            ChannelOutcome::Failed { error: e.to_string() }
        }
    };

    notify_orchestrator(job, deps).await?;
    Ok(outcome)
}

async fn ingest_channel(
    job: &SyncChannelJob,
    state: &mut ChannelSyncState,
    new_message_ids: &mut Vec<String>,
    deps: &IngestDeps,
) -> SyncResult<()> {
    ensure_not_cancelled(job, deps).await?;

    let tenant = deps
        .gateway
        .find_tenant(job.tenant_id)
        .await?
        .ok_or_else(|| SyncError::ChannelSetUnresolved(format!("tenant {} not found", job.tenant_id)))?;
    let adapter = deps.adapters.ready(&tenant.platform).await?;

    state.status = ChannelSyncStatus::InProgress;
    state.worker_id = Some(deps.worker_id.clone());
    state.started_at.get_or_insert_with(Utc::now);
    state.error = None;
    state.updated_at = Utc::now();
    deps.gateway.save_channel_state(state).await?;

    let mut checkpoint = deps
        .gateway
        .load_checkpoint(job.tenant_id, &job.channel_id)
        .await?
        .unwrap_or_else(|| SyncCheckpoint::new(job.tenant_id, &job.channel_id));

    let mut cursor = resolve_cursor(job, state, &checkpoint);
    let window = job.date_range.unwrap_or(DateWindow {
        after: None,
        before: None,
    });
    let limit = deps.settings.page_size.min(adapter.max_page_size()).max(1);
    let mut rate_limit_hits: u32 = 0;

    loop {
        ensure_not_cancelled(job, deps).await?;

        let options = FetchMessagesOptions {
            after_message_id: cursor.message_id.clone(),
            after_timestamp: cursor.timestamp.or(window.after),
            before_timestamp: window.before,
            limit,
        };

        state.api_calls += 1;
        let page = match adapter.fetch_messages(&job.channel_id, &options).await {
            Ok(page) => page,
            Err(AdapterError::RateLimited { retry_after }) => {
                state.rate_limit_encounters += 1;
                rate_limit_hits += 1;
                if rate_limit_hits >= deps.settings.channel_sync_attempts.max(1) {
                    return Err(AdapterError::RateLimited { retry_after }.into());
                }

                let delay = retry_after
                    .unwrap_or_else(|| Duration::from_millis(deps.settings.rate_limit_backoff_ms));
                debug!(
                    channel_id = %job.channel_id,
                    delay_ms = delay.as_millis() as u64,
                    encounters = state.rate_limit_encounters,
                    "Rate limited, backing off"
                );
                state.updated_at = Utc::now();
                deps.gateway.save_channel_state(state).await?;
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let fresh: Vec<&PlatformMessage> = page
            .messages
            .iter()
            .filter(|m| cursor.is_before(m))
            .collect();

        if fresh.len() < page.messages.len() {
            debug!(
                channel_id = %job.channel_id,
                dropped = page.messages.len() - fresh.len(),
                "Dropped messages at or before cursor"
            );
        }

        if fresh.is_empty() && page.has_more {
            return Err(SyncError::StalledCursor {
                channel_id: job.channel_id.clone(),
            });
        }

        for message in &fresh {
            ingest_message(job, state, message, new_message_ids, deps).await?;
        }

        if let Some(last) = fresh.last() {
            cursor = Cursor::of(last);
            state.last_message_id = cursor.message_id.clone();
            state.last_message_timestamp = cursor.timestamp;
            advance_checkpoint(&mut checkpoint, last);
        }
        state.messages_processed += fresh.len() as i64;
        state.updated_at = Utc::now();
        checkpoint.messages_processed += fresh.len() as i64;
        checkpoint.has_more_messages = page.has_more;
        checkpoint.updated_at = Utc::now();

        deps.gateway.save_progress(state, &checkpoint).await?;

        debug!(
            channel_id = %job.channel_id,
            page_messages = fresh.len(),
            messages_processed = state.messages_processed,
            last_message_id = ?state.last_message_id,
            has_more = page.has_more,
            "Checkpoint saved"
        );

        if !page.has_more {
            return Ok(());
        }
    }
}

/// Resume from this job's own progress, then the channel checkpoint for
/// incremental syncs, otherwise from the beginning.
fn resolve_cursor(job: &SyncChannelJob, state: &ChannelSyncState, checkpoint: &SyncCheckpoint) -> Cursor {
    if state.last_message_id.is_some() {
        return Cursor {
            message_id: state.last_message_id.clone(),
            timestamp: state.last_message_timestamp,
        };
    }
    if job.sync_type == SyncType::Incremental && checkpoint.has_cursor() {
        return Cursor {
            message_id: checkpoint.last_message_id.clone(),
            timestamp: checkpoint.last_message_timestamp,
        };
    }
    Cursor::default()
}

/// Move the channel checkpoint forward. A full re-sync never moves it back.
fn advance_checkpoint(checkpoint: &mut SyncCheckpoint, last: &PlatformMessage) {
    let current = Cursor {
        message_id: checkpoint.last_message_id.clone(),
        timestamp: checkpoint.last_message_timestamp,
    };
    if !checkpoint.has_cursor() || current.is_before(last) {
        checkpoint.last_message_id = Some(last.id.clone());
        checkpoint.last_message_timestamp = Some(last.timestamp);
    }
}

async fn ingest_message(
    job: &SyncChannelJob,
    state: &mut ChannelSyncState,
    message: &PlatformMessage,
    new_message_ids: &mut Vec<String>,
    deps: &IngestDeps,
) -> SyncResult<()> {
    let outcome = deps
        .gateway
        .upsert_message(&StoredMessage::from_platform(job.tenant_id, message))
        .await?;
    if outcome != UpsertOutcome::Unchanged {
        new_message_ids.push(message.id.clone());
    }

    for reaction in &message.reactions {
        deps.gateway
            .upsert_reaction(&StoredReaction::from_platform(job.tenant_id, &message.id, reaction))
            .await?;
        state.reactions_processed += 1;
    }

    for attachment in &message.attachments {
        deps.gateway
            .upsert_attachment(&StoredAttachment::from_platform(job.tenant_id, &message.id, attachment))
            .await?;
        state.attachments_processed += 1;

        if attachment.is_image() && deps.ocr_enabled() {
            let ocr_job = ExtractAttachmentJob::new(&attachment.id, &attachment.url);
            deps.job_queue
                .enqueue_with(&ocr_job, ExtractAttachmentJob::options(&deps.settings))
                .await
                .map_err(SyncError::Queue)?;
        }
    }

    Ok(())
}

async fn ensure_not_cancelled(job: &SyncChannelJob, deps: &IngestDeps) -> SyncResult<()> {
    let run = deps.gateway.find_sync_run(job.sync_job_id).await?;
    match run {
        Some(run) if run.cancel_requested || run.is_finished() => Err(SyncError::Cancelled),
        _ => Ok(()),
    }
}

/// Hand new messages downstream. Failures are logged, never fatal.
async fn trigger_analysis(job: &SyncChannelJob, message_ids: Vec<String>, deps: &IngestDeps) {
    if message_ids.is_empty() {
        return;
    }
    if let Err(e) = deps
        .analysis
        .messages_ingested(job.tenant_id, &job.channel_id, message_ids)
        .await
    {
        warn!(channel_id = %job.channel_id, error = %e, "Analysis hand-off failed");
    }
}

/// Wake the orchestrator so it can admit more channels or finish.
async fn notify_orchestrator(job: &SyncChannelJob, deps: &IngestDeps) -> SyncResult<()> {
    let run = deps
        .gateway
        .find_sync_run(job.sync_job_id)
        .await?
        .ok_or_else(|| SyncError::ChannelSetUnresolved(format!("sync run {} vanished", job.sync_job_id)))?;
    if run.is_finished() {
        return Ok(());
    }
    enqueue_step(job.sync_job_id, run.data.0, deps).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn message(id: &str, ts: DateTime<Utc>) -> PlatformMessage {
        PlatformMessage {
            id: id.into(),
            channel_id: "c".into(),
            author_id: "u".into(),
            content: "hi".into(),
            timestamp: ts,
            edited_timestamp: None,
            thread_id: None,
            reactions: vec![],
            attachments: vec![],
        }
    }

    #[test]
    fn cursor_orders_by_timestamp_then_numeric_id() {
        let t = Utc::now();
        let cursor = Cursor::of(&message("9", t));

        assert!(cursor.is_before(&message("10", t)));
        assert!(!cursor.is_before(&message("9", t)));
        assert!(!cursor.is_before(&message("8", t)));
        assert!(cursor.is_before(&message("1", t + ChronoDuration::seconds(1))));
        assert!(!cursor.is_before(&message("99", t - ChronoDuration::seconds(1))));
    }

    #[test]
    fn empty_cursor_accepts_everything() {
        assert!(Cursor::default().is_before(&message("1", Utc::now())));
    }

    #[test]
    fn checkpoint_never_moves_back() {
        let t = Utc::now();
        let mut checkpoint = SyncCheckpoint::new(crate::common::TenantId::new(), "c");
        advance_checkpoint(&mut checkpoint, &message("20", t));
        advance_checkpoint(&mut checkpoint, &message("5", t - ChronoDuration::minutes(1)));
        assert_eq!(checkpoint.last_message_id.as_deref(), Some("20"));
    }
}
