//! PostgreSQL-backed job queue implementation.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` so any number of worker
//! processes can poll the same table.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{ErrorKind, Job, JobOptions, RepeatableJob};
use super::queue::{ClaimedJob, EnqueueResult, FailureOutcome, JobQueue};

const JOB_COLUMNS: &str = r#"
    id, job_type, args, status, priority, attempts_made, max_attempts,
    backoff_kind, backoff_delay_ms, run_at, lease_expires_at, worker_id,
    dedup_key, error_message, error_kind, remove_on_complete_age,
    remove_on_complete_count, remove_on_fail_age, created_at, updated_at,
    finished_at
"#;

pub struct PostgresJobQueue {
    pool: PgPool,
    default_lease_ms: i64,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_lease_duration(pool, 60_000)
    }

    /// Create with a custom lease duration.
    pub fn with_lease_duration(pool: PgPool, lease_ms: i64) -> Self {
        Self {
            pool,
            default_lease_ms: lease_ms,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn find_pending_by_dedup_key(&self, key: &str) -> Result<Option<Uuid>> {
        let id = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM jobs WHERE dedup_key = $1 AND status = 'pending' LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn load(&self, job_id: Uuid) -> Result<Job> {
        self.find(job_id)
            .await?
            .ok_or_else(|| anyhow!("job {} not found", job_id))
    }

    /// Dead-letter running jobs whose lease ran out on their final attempt.
    async fn reap_exhausted_leases(&self) -> Result<()> {
        let reaped = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead_letter',
                error_message = 'lease expired after final attempt',
                error_kind = 'retryable',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
              AND attempts_made >= max_attempts
            "#,
        )
        .execute(&self.pool)
        .await?;

        if reaped.rows_affected() > 0 {
            warn!(count = reaped.rows_affected(), "dead-lettered jobs with expired final lease");
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue_raw(
        &self,
        job_type: &str,
        args: serde_json::Value,
        options: JobOptions,
    ) -> Result<EnqueueResult> {
        if let Some(key) = &options.dedup_key {
            if let Some(existing) = self.find_pending_by_dedup_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }

        let job = Job::for_command(job_type, args, &options);

        // The partial unique index on pending dedup keys settles races
        // between concurrent enqueuers.
        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO jobs (
                id, job_type, args, status, priority, attempts_made, max_attempts,
                backoff_kind, backoff_delay_ms, run_at, dedup_key,
                remove_on_complete_age, remove_on_complete_count, remove_on_fail_age,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, 'pending', $4, 0, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.args)
        .bind(job.priority)
        .bind(job.max_attempts)
        .bind(job.backoff_kind)
        .bind(job.backoff_delay_ms)
        .bind(job.run_at)
        .bind(&job.dedup_key)
        .bind(job.remove_on_complete_age)
        .bind(job.remove_on_complete_count)
        .bind(job.remove_on_fail_age)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(EnqueueResult::Created(id));
        }

        // Conflict: either a pending job holds the dedup key or the
        // explicit id is taken.
        if let Some(key) = &options.dedup_key {
            if let Some(existing) = self.find_pending_by_dedup_key(key).await? {
                return Ok(EnqueueResult::Duplicate(existing));
            }
        }
        if self.find(job.id).await?.is_some() {
            return Ok(EnqueueResult::Duplicate(job.id));
        }
        Err(anyhow!("failed to insert job {}", job.id))
    }

    async fn claim(&self, worker_id: &str, job_types: &[String], limit: usize) -> Result<Vec<ClaimedJob>> {
        self.reap_exhausted_leases().await?;

        let query = format!(
            r#"
            WITH next_jobs AS (
                SELECT id
                FROM jobs
                WHERE job_type = ANY($1)
                  AND (
                    (status = 'pending' AND run_at <= NOW())
                    OR (status = 'running' AND lease_expires_at < NOW())
                  )
                ORDER BY priority, run_at, created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET
                status = 'running',
                attempts_made = attempts_made + 1,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                worker_id = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_jobs)
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let jobs = sqlx::query_as::<_, Job>(&query)
            .bind(job_types)
            .bind(limit as i64)
            .bind(self.default_lease_ms.to_string())
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;

        if !jobs.is_empty() {
            debug!(worker_id = %worker_id, count = jobs.len(), "claimed jobs");
        }

        Ok(jobs
            .into_iter()
            .map(|job| ClaimedJob { id: job.id, job })
            .collect())
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<FailureOutcome> {
        let job = self.load(job_id).await?;
        let retry_at = if kind.should_retry() {
            job.next_retry_at(Utc::now())
        } else {
            None
        };

        match retry_at {
            Some(run_at) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'pending',
                        run_at = $1,
                        error_message = $2,
                        error_kind = $3,
                        lease_expires_at = NULL,
                        worker_id = NULL,
                        updated_at = NOW()
                    WHERE id = $4
                    "#,
                )
                .bind(run_at)
                .bind(error)
                .bind(kind)
                .bind(job_id)
                .execute(&self.pool)
                .await?;

                Ok(FailureOutcome::Retrying { run_at })
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'dead_letter',
                        error_message = $1,
                        error_kind = $2,
                        lease_expires_at = NULL,
                        finished_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(error)
                .bind(kind)
                .bind(job_id)
                .execute(&self.pool)
                .await?;

                Ok(FailureOutcome::DeadLettered)
            }
        }
    }

    async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                error_kind = 'cancelled',
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
        )
        .bind(self.default_lease_ms.to_string())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS);
        let job = sqlx::query_as::<_, Job>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn add_repeatable(&self, definition: RepeatableJob) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_repeatables (name, cron_pattern, job_type, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, cron_pattern) DO NOTHING
            "#,
        )
        .bind(&definition.name)
        .bind(&definition.cron_pattern)
        .bind(&definition.job_type)
        .bind(definition.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove_repeatable(&self, name: &str, cron_pattern: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM job_repeatables WHERE name = $1 AND cron_pattern = $2")
            .bind(name)
            .bind(cron_pattern)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn repeatables(&self) -> Result<Vec<RepeatableJob>> {
        let rows = sqlx::query_as::<_, RepeatableJob>(
            "SELECT name, cron_pattern, job_type, created_at FROM job_repeatables ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prune(&self) -> Result<u64> {
        let by_age = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE (status = 'succeeded'
                   AND remove_on_complete_age IS NOT NULL
                   AND finished_at + make_interval(secs => remove_on_complete_age) < NOW())
               OR (status IN ('dead_letter', 'cancelled')
                   AND remove_on_fail_age IS NOT NULL
                   AND finished_at + make_interval(secs => remove_on_fail_age) < NOW())
            "#,
        )
        .execute(&self.pool)
        .await?;

        let by_count = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM (
                    SELECT id, remove_on_complete_count,
                           ROW_NUMBER() OVER (PARTITION BY job_type ORDER BY finished_at DESC) AS rn
                    FROM jobs
                    WHERE status = 'succeeded' AND remove_on_complete_count IS NOT NULL
                ) ranked
                WHERE ranked.rn > ranked.remove_on_complete_count
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(by_age.rows_affected() + by_count.rows_affected())
    }
}
