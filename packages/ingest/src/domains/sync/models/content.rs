//! Ingested content rows, keyed by stable platform ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::platform::{PlatformAttachment, PlatformChannel, PlatformMessage, PlatformReaction};
use crate::common::utils::message_checksum;
use crate::common::TenantId;

/// What an idempotent upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredChannel {
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub topic: Option<String>,
}

impl StoredChannel {
    pub fn from_platform(tenant_id: TenantId, channel: &PlatformChannel) -> Self {
        Self {
            tenant_id,
            channel_id: channel.id.clone(),
            name: channel.name.clone(),
            parent_id: channel.parent_id.clone(),
            topic: channel.topic.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredMessage {
    pub tenant_id: TenantId,
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub thread_id: Option<String>,
    /// Detects edits when the same message is upserted again.
    pub checksum: String,
}

impl StoredMessage {
    pub fn from_platform(tenant_id: TenantId, message: &PlatformMessage) -> Self {
        let edited = message.edited_timestamp.map(|t| t.to_rfc3339());
        let attachment_ids: Vec<&str> = message.attachments.iter().map(|a| a.id.as_str()).collect();

        Self {
            tenant_id,
            message_id: message.id.clone(),
            channel_id: message.channel_id.clone(),
            author_id: message.author_id.clone(),
            content: message.content.clone(),
            sent_at: message.timestamp,
            edited_at: message.edited_timestamp,
            thread_id: message.thread_id.clone(),
            checksum: message_checksum(&message.content, edited.as_deref(), &attachment_ids),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredReaction {
    pub tenant_id: TenantId,
    pub message_id: String,
    pub emoji: String,
    pub user_id: String,
    pub count: i32,
}

impl StoredReaction {
    pub fn from_platform(tenant_id: TenantId, message_id: &str, reaction: &PlatformReaction) -> Self {
        Self {
            tenant_id,
            message_id: message_id.to_string(),
            emoji: reaction.emoji.clone(),
            user_id: reaction.user_id.clone(),
            count: reaction.count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StoredAttachment {
    pub tenant_id: TenantId,
    pub attachment_id: String,
    pub message_id: String,
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

impl StoredAttachment {
    pub fn from_platform(tenant_id: TenantId, message_id: &str, attachment: &PlatformAttachment) -> Self {
        Self {
            tenant_id,
            attachment_id: attachment.id.clone(),
            message_id: message_id.to_string(),
            filename: attachment.filename.clone(),
            url: attachment.url.clone(),
            content_type: attachment.content_type.clone(),
            size_bytes: attachment.size_bytes,
        }
    }
}
