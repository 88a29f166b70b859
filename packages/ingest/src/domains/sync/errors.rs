use std::time::Duration;

use thiserror::Error;

use crate::kernel::jobs::ErrorKind;

/// Failures surfaced by a platform adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("rate limited by platform")]
    RateLimited { retry_after: Option<Duration> },

    #[error("platform request timed out: {0}")]
    Timeout(String),

    #[error("transient platform error: {0}")]
    Transient(String),

    #[error("platform rejected credentials: {0}")]
    Unauthorized(String),

    #[error("channel {0} no longer exists")]
    ChannelNotFound(String),

    #[error("platform error: {0}")]
    Fatal(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::RateLimited { .. } | AdapterError::Timeout(_) | AdapterError::Transient(_)
        )
    }
}

/// Failures from the persistence gateway.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A constraint violation means the data model is wrong, not the network.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::Unavailable(_) => true,
            PersistenceError::Constraint(_) | PersistenceError::NotFound(_) => false,
            PersistenceError::Database(sqlx::Error::Database(db)) => !matches!(
                db.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            ),
            PersistenceError::Database(sqlx::Error::RowNotFound) => false,
            PersistenceError::Database(_) => true,
        }
    }
}

/// Errors raised by the sync pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("no adapter registered for platform {0}")]
    NoAdapter(String),

    #[error("could not resolve channels: {0}")]
    ChannelSetUnresolved(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("cursor did not advance for channel {channel_id}")]
    StalledCursor { channel_id: String },

    #[error("queue error: {0:#}")]
    Queue(anyhow::Error),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Adapter(e) => e.is_retryable(),
            SyncError::Persistence(e) => e.is_retryable(),
            SyncError::StalledCursor { .. } | SyncError::Queue(_) => true,
            SyncError::NoAdapter(_) | SyncError::ChannelSetUnresolved(_) | SyncError::Cancelled => false,
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            SyncError::Cancelled => ErrorKind::Cancelled,
            e if e.is_retryable() => ErrorKind::Retryable,
            _ => ErrorKind::NonRetryable,
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
