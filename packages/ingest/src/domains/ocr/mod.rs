//! OCR domain - versioned, retryable text extraction for image attachments.

pub mod activities;
pub mod effects;
pub mod errors;
pub mod jobs;
pub mod models;

pub use effects::register_ocr_jobs;
pub use errors::OcrError;
