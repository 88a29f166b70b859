use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::{SyncJobId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "channel_sync_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelSyncStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChannelSyncStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelSyncStatus::Completed | ChannelSyncStatus::Failed)
    }
}

/// Progress of one channel within one tenant sync.
///
/// Keyed by `(sync_job_id, channel_id)`. Only the worker holding the
/// channel job's lease writes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ChannelSyncState {
    pub sync_job_id: SyncJobId,
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub status: ChannelSyncStatus,
    pub worker_id: Option<String>,
    /// Queue job that owns this channel, set when the orchestrator admits it.
    pub child_job_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub messages_processed: i64,
    pub reactions_processed: i64,
    pub attachments_processed: i64,
    pub api_calls: i64,
    pub rate_limit_encounters: i64,
    pub last_message_id: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: i32,
    pub updated_at: DateTime<Utc>,
}

impl ChannelSyncState {
    pub fn pending(sync_job_id: SyncJobId, tenant_id: TenantId, channel_id: &str) -> Self {
        Self {
            sync_job_id,
            tenant_id,
            channel_id: channel_id.to_string(),
            status: ChannelSyncStatus::Pending,
            worker_id: None,
            child_job_id: None,
            started_at: None,
            completed_at: None,
            messages_processed: 0,
            reactions_processed: 0,
            attachments_processed: 0,
            api_calls: 0,
            rate_limit_encounters: 0,
            last_message_id: None,
            last_message_timestamp: None,
            error: None,
            retry_count: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Admitted to the queue but not yet finished.
    pub fn is_in_flight(&self) -> bool {
        self.child_job_id.is_some() && !self.is_terminal()
    }

    pub fn is_dispatched(&self) -> bool {
        self.child_job_id.is_some()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0)),
            _ => None,
        }
    }

    pub fn mark_completed(&mut self) {
        let now = Utc::now();
        self.status = ChannelSyncStatus::Completed;
        self.completed_at = Some(now);
        self.error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        let now = Utc::now();
        self.status = ChannelSyncStatus::Failed;
        self.completed_at = Some(now);
        self.error = Some(error.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatched_channel_is_in_flight_until_terminal() {
        let mut state = ChannelSyncState::pending(SyncJobId::new(), TenantId::new(), "C1");
        assert!(!state.is_in_flight());

        state.child_job_id = Some(Uuid::now_v7());
        assert!(state.is_in_flight());

        state.mark_failed("boom");
        assert!(!state.is_in_flight());
        assert_eq!(state.error.as_deref(), Some("boom"));
    }
}
