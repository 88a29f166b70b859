//! In-process job queue.
//!
//! Same lifecycle semantics as [`PostgresJobQueue`](super::PostgresJobQueue)
//! without durability across restarts. Used by tests and single-process
//! deployments without a database.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobOptions, JobStatus, RepeatableJob};
use super::queue::{ClaimedJob, EnqueueResult, FailureOutcome, JobQueue};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, Job>,
    repeatables: Vec<RepeatableJob>,
}

pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    lease_ms: i64,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_lease_duration(60_000)
    }

    pub fn with_lease_duration(lease_ms: i64) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            lease_ms,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    pub fn jobs_by_type(&self, job_type: &str) -> Vec<Job> {
        self.jobs()
            .into_iter()
            .filter(|j| j.job_type == job_type)
            .collect()
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<Job> {
        self.jobs()
            .into_iter()
            .filter(|j| j.status == status)
            .collect()
    }

    /// Make every delayed pending job due now (test helper for backoff).
    pub fn advance_all_delays(&self) {
        let now = Utc::now();
        for job in self.state().jobs.values_mut() {
            if job.status == JobStatus::Pending && job.run_at > now {
                job.run_at = now;
            }
        }
    }

    /// Expire the lease of a running job, as if its worker crashed.
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(job) = self.state().jobs.get_mut(&job_id) {
            job.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueueResult> {
        let mut state = self.state();

        if let Some(id) = options.job_id {
            if state.jobs.contains_key(&id) {
                return Ok(EnqueueResult::Duplicate(id));
            }
        }

        if let Some(key) = &options.dedup_key {
            if let Some(existing) = state
                .jobs
                .values()
                .find(|j| j.status == JobStatus::Pending && j.dedup_key.as_deref() == Some(key))
            {
                return Ok(EnqueueResult::Duplicate(existing.id));
            }
        }

        let job = Job::for_command(job_type, args, &options);
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(&self, worker_id: &str, job_types: &[String], limit: usize) -> Result<Vec<ClaimedJob>> {
        let now = Utc::now();
        let mut state = self.state();

        // Stalled jobs with no attempts left cannot be redelivered.
        for job in state.jobs.values_mut() {
            if job.lease_expired(now) && !job.has_attempts_left() {
                warn!(job_id = %job.id, job_type = %job.job_type, "lease expired with no attempts left");
                job.status = JobStatus::DeadLetter;
                job.error_message = Some("lease expired after final attempt".to_string());
                job.error_kind = Some(ErrorKind::Retryable);
                job.finished_at = Some(now);
                job.updated_at = now;
            }
        }

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| job_types.iter().any(|t| t == &j.job_type))
            .filter(|j| j.is_ready(now) || j.lease_expired(now))
            .collect();
        candidates.sort_by_key(|j| (j.priority.as_i16(), j.run_at, j.created_at, j.id));
        let ids: Vec<Uuid> = candidates.iter().take(limit).map(|j| j.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            if job.lease_expired(now) {
                info!(
                    job_id = %job.id,
                    old_worker_id = ?job.worker_id,
                    new_worker_id = %worker_id,
                    "recovered job with expired lease"
                );
            }
            job.status = JobStatus::Running;
            job.attempts_made += 1;
            job.worker_id = Some(worker_id.to_string());
            job.lease_expires_at = Some(now + Duration::milliseconds(self.lease_ms));
            job.updated_at = now;
            claimed.push(ClaimedJob {
                id,
                job: job.clone(),
            });
        }

        Ok(claimed)
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;
        job.status = JobStatus::Succeeded;
        job.lease_expires_at = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailureOutcome> {
        let now = Utc::now();
        let mut state = self.state();
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;

        job.error_message = Some(error.to_string());
        job.error_kind = Some(kind);
        job.lease_expires_at = None;
        job.updated_at = now;

        let retry_at = if kind.should_retry() {
            job.next_retry_at(now)
        } else {
            None
        };

        match retry_at {
            Some(run_at) => {
                job.status = JobStatus::Pending;
                job.run_at = run_at;
                job.worker_id = None;
                Ok(FailureOutcome::Retrying { run_at })
            }
            None => {
                job.status = JobStatus::DeadLetter;
                job.finished_at = Some(now);
                Ok(FailureOutcome::DeadLettered)
            }
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let mut state = self.state();
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.error_kind = Some(ErrorKind::Cancelled);
                job.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let now = Utc::now();
        if let Some(job) = self.state().jobs.get_mut(&job_id) {
            if job.status == JobStatus::Running {
                job.lease_expires_at = Some(now + Duration::milliseconds(self.lease_ms));
                job.updated_at = now;
            }
        }
        Ok(())
    }

    async fn find(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&job_id).cloned())
    }

    async fn add_repeatable(&self, definition: RepeatableJob) -> Result<bool> {
        let mut state = self.state();
        let key = definition.key();
        if state.repeatables.iter().any(|r| r.key() == key) {
            return Ok(false);
        }
        state.repeatables.push(definition);
        Ok(true)
    }

    async fn remove_repeatable(&self, name: &str, cron_pattern: &str) -> Result<bool> {
        let mut state = self.state();
        let before = state.repeatables.len();
        state
            .repeatables
            .retain(|r| !(r.name == name && r.cron_pattern == cron_pattern));
        Ok(state.repeatables.len() < before)
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>> {
        Ok(self.state().repeatables.clone())
    }

    async fn prune(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state();
        let before = state.jobs.len();

        state.jobs.retain(|_, job| {
            let Some(finished_at) = job.finished_at else {
                return true;
            };
            let max_age = match job.status {
                JobStatus::Succeeded => job.remove_on_complete_age,
                JobStatus::DeadLetter | JobStatus::Cancelled => job.remove_on_fail_age,
                _ => None,
            };
            max_age.map_or(true, |age| finished_at + Duration::seconds(age) > now)
        });

        // Count-based retention keeps the newest N succeeded jobs per type.
        let mut succeeded: HashMap<String, Vec<(chrono::DateTime<Utc>, Uuid, i64)>> = HashMap::new();
        for job in state.jobs.values() {
            if let (JobStatus::Succeeded, Some(limit), Some(finished_at)) =
                (job.status, job.remove_on_complete_count, job.finished_at)
            {
                succeeded
                    .entry(job.job_type.clone())
                    .or_default()
                    .push((finished_at, job.id, limit));
            }
        }
        for (_, mut finished) in succeeded {
            finished.sort_by(|a, b| b.0.cmp(&a.0));
            for (index, (_, id, limit)) in finished.into_iter().enumerate() {
                if index as i64 >= limit {
                    state.jobs.remove(&id);
                }
            }
        }

        Ok((before - state.jobs.len()) as u64)
    }
}
