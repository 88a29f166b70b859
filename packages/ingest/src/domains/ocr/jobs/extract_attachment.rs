//! ExtractAttachmentJob - one OCR extraction attempt for one image attachment.

use serde::{Deserialize, Serialize};

use crate::config::SyncSettings;
use crate::kernel::jobs::{CommandMeta, JobOptions, Retention};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractAttachmentJob {
    pub attachment_id: String,
    pub image_url: String,
}

impl ExtractAttachmentJob {
    pub const JOB_TYPE: &'static str = "ocr:extract";

    pub fn new(attachment_id: &str, image_url: &str) -> Self {
        Self {
            attachment_id: attachment_id.to_string(),
            image_url: image_url.to_string(),
        }
    }

    /// One delivery per attempt. Retries come from the sweep, which keeps
    /// every attempt as its own row.
    pub fn options(settings: &SyncSettings) -> JobOptions {
        JobOptions::builder()
            .attempts(1u32)
            .remove_on_complete(Retention::age_and_count(
                settings.completed_retention_secs,
                settings.completed_retention_count,
            ))
            .remove_on_fail(Retention::age(settings.failed_retention_secs))
            .build()
    }
}

impl CommandMeta for ExtractAttachmentJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("ocr:extract:{}", self.attachment_id))
    }
}
