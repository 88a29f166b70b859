//! Test fixtures for creating platform data.

use chrono::{DateTime, Duration, TimeZone, Utc};
use ingest_core::domains::sync::models::{PlatformAttachment, PlatformMessage, PlatformReaction};
use ingest_core::SyncSettings;

/// Fixed epoch so message ordering is deterministic.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Settings tuned for fast tests: tiny pages and millisecond backoff.
pub fn test_settings() -> SyncSettings {
    SyncSettings {
        max_concurrent_channels: 2,
        channel_sync_attempts: 3,
        backoff_delay_ms: 1,
        page_size: 2,
        rate_limit_backoff_ms: 1,
        ..SyncSettings::default()
    }
}

/// Message `n` in a channel, `n` seconds after [`base_time`].
pub fn message(channel_id: &str, n: u32) -> PlatformMessage {
    PlatformMessage {
        id: n.to_string(),
        channel_id: channel_id.to_string(),
        author_id: format!("user-{}", n % 3),
        content: format!("message {} in {}", n, channel_id),
        timestamp: base_time() + Duration::seconds(n as i64),
        edited_timestamp: None,
        thread_id: None,
        reactions: vec![],
        attachments: vec![],
    }
}

/// Messages `1..=count` in a channel.
pub fn messages(channel_id: &str, count: u32) -> Vec<PlatformMessage> {
    (1..=count).map(|n| message(channel_id, n)).collect()
}

pub fn with_reaction(mut message: PlatformMessage, emoji: &str, user_id: &str) -> PlatformMessage {
    message.reactions.push(PlatformReaction {
        emoji: emoji.to_string(),
        user_id: user_id.to_string(),
        count: 1,
    });
    message
}

pub fn image_attachment(id: &str) -> PlatformAttachment {
    PlatformAttachment {
        id: id.to_string(),
        filename: format!("{}.png", id),
        url: format!("https://cdn.example.com/attachments/{}.png", id),
        content_type: Some("image/png".to_string()),
        size_bytes: Some(48_213),
    }
}

pub fn file_attachment(id: &str) -> PlatformAttachment {
    PlatformAttachment {
        id: id.to_string(),
        filename: format!("{}.pdf", id),
        url: format!("https://cdn.example.com/attachments/{}.pdf", id),
        content_type: Some("application/pdf".to_string()),
        size_bytes: Some(120_004),
    }
}

pub fn with_attachment(mut message: PlatformMessage, attachment: PlatformAttachment) -> PlatformMessage {
    message.attachments.push(attachment);
    message
}
