// Chat platform ingestion pipeline - core
//
// Pulls channel history from chat platforms for many tenants into a durable
// store, one resumable channel job at a time, plus a versioned OCR retry
// pipeline for image attachments. All work flows through the job queue.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
