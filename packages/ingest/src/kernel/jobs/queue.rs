//! Job queue contract.
//!
//! The queue owns job lifecycle: enqueue → lease (claim) → ack/fail →
//! retry or dead-letter. Delivery is at-least-once: a worker that dies
//! between processing and ack has its lease expire and the job is claimed
//! again, so handlers must be idempotent.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobOptions, RepeatableJob};

/// Result type for enqueue operations that handles deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Job was enqueued, returns new job ID
    Created(Uuid),
    /// A waiting job with the same dedup key exists, returns its ID
    Duplicate(Uuid),
}

impl EnqueueResult {
    /// Get the job ID regardless of whether it was created or duplicate
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    /// Returns true if this was a newly created job
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What `mark_failed` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { run_at: DateTime<Utc> },
    DeadLettered,
}

/// A leased job ready for execution.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub job: Job,
}

impl ClaimedJob {
    /// Deserialize the job payload.
    pub fn deserialize<C: DeserializeOwned>(&self) -> Result<C> {
        serde_json::from_value(self.job.args.clone())
            .map_err(|e| anyhow!("failed to deserialize {} payload: {}", self.job.job_type, e))
    }

    pub fn job_type(&self) -> &str {
        &self.job.job_type
    }

    /// 1-based number of the current delivery.
    pub fn attempt(&self) -> i32 {
        self.job.attempts_made
    }

    pub fn max_attempts(&self) -> i32 {
        self.job.max_attempts
    }

    pub fn delivery(&self) -> JobDelivery {
        JobDelivery {
            job_id: self.id,
            attempt: self.attempt(),
            max_attempts: self.max_attempts(),
        }
    }
}

/// Which delivery of a job a handler is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDelivery {
    pub job_id: Uuid,
    /// 1-based.
    pub attempt: i32,
    pub max_attempts: i32,
}

impl JobDelivery {
    /// No redelivery follows a failure of this attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Metadata for typed job payloads.
pub trait CommandMeta {
    /// The job type name (used as job_type and for handler lookup).
    fn command_type(&self) -> &'static str;

    /// Optional dedup key applied when the enqueue options carry none.
    fn dedup_key(&self) -> Option<String> {
        None
    }
}

/// Trait for job queue operations.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a serialized payload.
    ///
    /// If `options.dedup_key` matches a job that is still waiting to be
    /// claimed, returns `EnqueueResult::Duplicate` with that job's ID.
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueueResult>;

    /// Lease up to `limit` due jobs of the given types.
    ///
    /// Jobs whose lease expired are claimable again (redelivery).
    async fn claim(&self, worker_id: &str, job_types: &[String], limit: usize) -> Result<Vec<ClaimedJob>>;

    /// Acknowledge a job.
    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()>;

    /// Record a failed attempt; retries with backoff while attempts remain
    /// and the kind is retryable, otherwise dead-letters.
    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailureOutcome>;

    /// Cancel a pending job. Running jobs are cancelled cooperatively.
    async fn cancel(&self, job_id: Uuid) -> Result<bool>;

    /// Extend the lease for a running job.
    async fn heartbeat(&self, job_id: Uuid) -> Result<()>;

    async fn find(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Store a repeatable definition. Returns false if it already exists.
    async fn add_repeatable(&self, definition: RepeatableJob) -> Result<bool>;

    /// Remove a repeatable definition by name + pattern.
    async fn remove_repeatable(&self, name: &str, cron_pattern: &str) -> Result<bool>;

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>>;

    /// Apply retention policies to finished jobs. Returns rows removed.
    async fn prune(&self) -> Result<u64>;
}

/// Typed enqueue helpers over any [`JobQueue`].
#[async_trait]
pub trait JobQueueExt: JobQueue {
    async fn enqueue<C>(&self, command: &C) -> Result<EnqueueResult>
    where
        C: Serialize + CommandMeta + Sync,
    {
        self.enqueue_with(command, JobOptions::default()).await
    }

    async fn enqueue_with<C>(&self, command: &C, mut options: JobOptions) -> Result<EnqueueResult>
    where
        C: Serialize + CommandMeta + Sync,
    {
        if options.dedup_key.is_none() {
            options.dedup_key = command.dedup_key();
        }
        let args = serde_json::to_value(command)?;
        self.enqueue_raw(command.command_type(), args, options).await
    }
}

impl<Q: JobQueue + ?Sized> JobQueueExt for Q {}
