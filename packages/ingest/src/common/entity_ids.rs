//! Typed ID definitions for the ingestion entities.

pub use super::id::Id;

/// Marker type for tenant workspaces.
pub struct Tenant;

/// Marker type for tenant-sync runs (one per enqueued tenant sync).
pub struct SyncJob;

/// Marker type for OCR extraction attempts.
pub struct OcrAttempt;

pub type TenantId = Id<Tenant>;
pub type SyncJobId = Id<SyncJob>;
pub type OcrResultId = Id<OcrAttempt>;
