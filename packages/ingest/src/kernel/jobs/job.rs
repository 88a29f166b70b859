//! Job model for background work.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl JobPriority {
    /// Lower sorts first.
    pub fn as_i16(&self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Job was cancelled by user/system
    Cancelled,
    /// Job was interrupted by graceful shutdown - will retry
    Shutdown,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "backoff_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

// ============================================================================
// Options
// ============================================================================

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub delay_ms: u64,
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
        }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based). Exponential doubles per attempt, capped at one hour.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = match self.kind {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                self.delay_ms.saturating_mul(1u64 << shift)
            }
        };
        std::time::Duration::from_millis(ms.min(3_600_000))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000)
    }
}

/// How long finished jobs stay visible in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Retention {
    /// Maximum age in seconds after finishing.
    pub age_secs: Option<i64>,
    /// Maximum number of finished jobs of the same type to keep.
    pub count: Option<i64>,
}

impl Retention {
    pub fn age(age_secs: i64) -> Self {
        Self {
            age_secs: Some(age_secs),
            count: None,
        }
    }

    pub fn age_and_count(age_secs: i64, count: i64) -> Self {
        Self {
            age_secs: Some(age_secs),
            count: Some(count),
        }
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobOptions {
    /// Total delivery attempts before dead-lettering.
    #[builder(default = 3)]
    pub attempts: u32,
    #[builder(default)]
    pub backoff: Backoff,
    #[builder(default, setter(strip_option))]
    pub remove_on_complete: Option<Retention>,
    #[builder(default, setter(strip_option))]
    pub remove_on_fail: Option<Retention>,
    /// Initial delay before the job becomes claimable.
    #[builder(default = 0)]
    pub delay_ms: u64,
    /// Suppresses the enqueue while a job with the same key is still waiting.
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,
    #[builder(default)]
    pub priority: JobPriority,
    /// Explicit job id. Enqueueing an id that already exists is a duplicate.
    #[builder(default, setter(strip_option))]
    pub job_id: Option<Uuid>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

// ============================================================================
// Repeatable definitions
// ============================================================================

/// A cron-triggered job definition, identified by name + pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct RepeatableJob {
    pub name: String,
    pub cron_pattern: String,
    pub job_type: String,
    pub created_at: DateTime<Utc>,
}

impl RepeatableJob {
    pub fn new(name: &str, cron_pattern: &str, job_type: &str) -> Self {
        Self {
            name: name.to_string(),
            cron_pattern: cron_pattern.to_string(),
            job_type: job_type.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> String {
        repeat_key(&self.name, &self.cron_pattern)
    }
}

pub fn repeat_key(name: &str, cron_pattern: &str) -> String {
    format!("{}::{}", name, cron_pattern)
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub args: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,

    // Delivery
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_kind: BackoffKind,
    pub backoff_delay_ms: i64,
    pub run_at: DateTime<Utc>,

    // Lease management
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,

    pub dedup_key: Option<String>,

    // Error tracking
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,

    // Retention
    pub remove_on_complete_age: Option<i64>,
    pub remove_on_complete_count: Option<i64>,
    pub remove_on_fail_age: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a pending job from a serialized payload and its options.
    pub fn for_command(job_type: &str, args: serde_json::Value, options: &JobOptions) -> Self {
        let now = Utc::now();
        Self {
            id: options.job_id.unwrap_or_else(Uuid::now_v7),
            job_type: job_type.to_string(),
            args,
            status: JobStatus::Pending,
            priority: options.priority,
            attempts_made: 0,
            max_attempts: options.attempts.max(1) as i32,
            backoff_kind: options.backoff.kind,
            backoff_delay_ms: options.backoff.delay_ms as i64,
            run_at: now + Duration::milliseconds(options.delay_ms as i64),
            lease_expires_at: None,
            worker_id: None,
            dedup_key: options.dedup_key.clone(),
            error_message: None,
            error_kind: None,
            remove_on_complete_age: options.remove_on_complete.and_then(|r| r.age_secs),
            remove_on_complete_count: options.remove_on_complete.and_then(|r| r.count),
            remove_on_fail_age: options.remove_on_fail.and_then(|r| r.age_secs),
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            kind: self.backoff_kind,
            delay_ms: self.backoff_delay_ms.max(0) as u64,
        }
    }

    /// Pending and due.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }

    /// Leased, but the worker stopped heartbeating.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && self.lease_expires_at.is_some_and(|at| at < now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// When the next attempt should run after the current one failed, if any.
    pub fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.has_attempts_left() {
            return None;
        }
        let delay = self.backoff().delay_for(self.attempts_made.max(1) as u32);
        Some(now + Duration::milliseconds(delay.as_millis() as i64))
    }
}
