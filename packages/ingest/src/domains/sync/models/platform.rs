//! Platform-neutral shapes returned by adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checkpoint::SyncCheckpoint;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Thread,
    Forum,
    Announcement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformChannel {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    /// Parent channel for threads.
    pub parent_id: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformReaction {
    pub emoji: String,
    pub user_id: String,
    pub count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformAttachment {
    pub id: String,
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
}

impl PlatformAttachment {
    pub fn is_image(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub edited_timestamp: Option<DateTime<Utc>>,
    /// Thread root, if this message is a reply.
    pub thread_id: Option<String>,
    #[serde(default)]
    pub reactions: Vec<PlatformReaction>,
    #[serde(default)]
    pub attachments: Vec<PlatformAttachment>,
}

/// Paging options for `fetch_messages`. Results are chronological ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMessagesOptions {
    pub after_message_id: Option<String>,
    pub after_timestamp: Option<DateTime<Utc>>,
    pub before_timestamp: Option<DateTime<Utc>>,
    pub limit: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FetchMessagesResult {
    pub messages: Vec<PlatformMessage>,
    /// `false` is the only valid termination signal.
    pub has_more: bool,
    pub checkpoint: Option<SyncCheckpoint>,
}
