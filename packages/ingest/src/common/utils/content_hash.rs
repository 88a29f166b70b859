use sha2::{Digest, Sha256};

/// Checksum of a message's mutable content.
///
/// Stored next to each ingested message so a re-upsert of the same platform
/// message id can tell an edit (checksum differs) from a redelivered page
/// (checksum identical, no write). Attachment ids are part of the digest
/// because platforms allow removing an attachment without touching the text.
pub fn message_checksum(content: &str, edited_marker: Option<&str>, attachment_ids: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hasher.update([0u8]);
    if let Some(marker) = edited_marker {
        hasher.update(marker.as_bytes());
    }
    for id in attachment_ids {
        hasher.update([0u8]);
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
