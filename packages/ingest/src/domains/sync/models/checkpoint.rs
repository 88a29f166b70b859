use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::TenantId;

/// Resumable cursor for one channel of one tenant.
///
/// While `has_more_messages` is true, fetching after `last_message_id` /
/// `last_message_timestamp` yields the next messages with no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SyncCheckpoint {
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub last_message_id: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub messages_processed: i64,
    pub has_more_messages: bool,
    pub updated_at: DateTime<Utc>,
}

impl SyncCheckpoint {
    pub fn new(tenant_id: TenantId, channel_id: &str) -> Self {
        Self {
            tenant_id,
            channel_id: channel_id.to_string(),
            last_message_id: None,
            last_message_timestamp: None,
            messages_processed: 0,
            has_more_messages: true,
            updated_at: Utc::now(),
        }
    }

    /// True once at least one message has been persisted behind this cursor.
    pub fn has_cursor(&self) -> bool {
        self.last_message_id.is_some()
    }
}
