use std::time::Duration;

use thiserror::Error;

/// Failures from an OCR extractor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OcrError {
    #[error("OCR provider rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("OCR provider unavailable: {0}")]
    Unavailable(String),

    #[error("OCR extraction failed: {0}")]
    Failed(String),
}

impl OcrError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OcrError::RateLimited { .. } | OcrError::Unavailable(_))
    }
}
