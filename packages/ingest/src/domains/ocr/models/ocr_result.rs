use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::OcrResultId;

/// Confidence stamped on extractions whose model reports none.
pub const DEFAULT_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "ocr_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One extraction attempt for one attachment.
///
/// Rows are append-only per attempt: a retry inserts a new row and leaves
/// earlier rows untouched. The latest row (by `created_at`) is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OcrResult {
    pub id: OcrResultId,
    pub attachment_id: String,
    pub image_url: String,
    pub model_version: String,
    pub extracted_text: Option<String>,
    pub confidence: Option<f64>,
    pub status: OcrStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OcrResult {
    /// Start a new attempt. `previous` is the attachment's latest row, if any.
    pub fn begin_attempt(
        attachment_id: &str,
        image_url: &str,
        model_version: &str,
        previous: Option<&OcrResult>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OcrResultId::new(),
            attachment_id: attachment_id.to_string(),
            image_url: image_url.to_string(),
            model_version: model_version.to_string(),
            extracted_text: None,
            confidence: None,
            status: OcrStatus::Processing,
            error_message: None,
            retry_count: previous.map_or(0, |p| p.retry_count + 1),
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn complete(&mut self, text: String, confidence: Option<f64>, processing_time_ms: i64) {
        self.status = OcrStatus::Completed;
        self.extracted_text = Some(text);
        self.confidence = Some(confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0));
        self.processing_time_ms = Some(processing_time_ms);
        self.error_message = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>, processing_time_ms: i64) {
        self.status = OcrStatus::Failed;
        self.error_message = Some(error.into());
        self.processing_time_ms = Some(processing_time_ms);
        self.updated_at = Utc::now();
    }

    /// Failed, or stuck in `processing` since before `stale_before`.
    pub fn needs_retry(&self, max_retries: i32, stale_before: DateTime<Utc>) -> bool {
        let failed = match self.status {
            OcrStatus::Failed => true,
            OcrStatus::Processing => self.updated_at < stale_before,
            OcrStatus::Pending | OcrStatus::Completed => false,
        };
        failed && self.retry_count < max_retries
    }
}
