use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use super::channel_sync_state::ChannelSyncState;
use crate::common::{SyncJobId, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    #[default]
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

/// Input to a tenant sync. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobData {
    pub tenant_id: TenantId,
    pub sync_type: SyncType,
    /// Explicit channel subset; `None` syncs every channel of the tenant.
    pub channel_ids: Option<Vec<String>>,
    pub date_range: Option<DateWindow>,
}

impl SyncJobData {
    pub fn full(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            sync_type: SyncType::Full,
            channel_ids: None,
            date_range: None,
        }
    }

    pub fn incremental(tenant_id: TenantId) -> Self {
        Self {
            sync_type: SyncType::Incremental,
            ..Self::full(tenant_id)
        }
    }

    pub fn with_channels<I, S>(mut self, channel_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channel_ids = Some(channel_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_date_range(mut self, after: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> Self {
        self.date_range = Some(DateWindow { after, before });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub channel_id: Option<String>,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelStats {
    pub max_concurrent_channels: usize,
    pub average_channel_time_ms: f64,
    pub total_api_calls: i64,
    pub rate_limit_encounters: i64,
}

/// Output of a tenant sync. Per-channel failures are collected, not thrown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJobResult {
    pub channels_processed: i64,
    pub channels_failed: i64,
    pub messages_processed: i64,
    pub reactions_processed: i64,
    pub attachments_processed: i64,
    pub errors: Vec<SyncErrorEntry>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub parallel_stats: ParallelStats,
    pub channel_states: Vec<ChannelSyncState>,
}

impl SyncJobResult {
    pub fn is_partial(&self) -> bool {
        self.channels_failed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "sync_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

/// Header row for one tenant sync.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SyncRun {
    pub id: SyncJobId,
    pub tenant_id: TenantId,
    pub data: Json<SyncJobData>,
    pub status: SyncRunStatus,
    pub cancel_requested: bool,
    /// Final aggregate, or the failure that aborted the whole sync.
    pub result: Option<Json<SyncJobResult>>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncRun {
    pub fn start(id: SyncJobId, data: SyncJobData) -> Self {
        Self {
            id,
            tenant_id: data.tenant_id,
            data: Json(data),
            status: SyncRunStatus::Running,
            cancel_requested: false,
            result: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != SyncRunStatus::Running
    }
}
