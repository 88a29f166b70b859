//! SyncTenantJob - one orchestration step of a tenant sync.
//!
//! The first step resolves the channel set and admits the first channels;
//! each finished channel enqueues another step, which admits more work or
//! finalizes the aggregate result.

use serde::{Deserialize, Serialize};

use crate::common::SyncJobId;
use crate::config::SyncSettings;
use crate::domains::sync::models::SyncJobData;
use crate::kernel::jobs::{Backoff, CommandMeta, JobOptions, Retention};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTenantJob {
    pub sync_job_id: SyncJobId,
    pub data: SyncJobData,
}

impl SyncTenantJob {
    pub const JOB_TYPE: &'static str = "sync:tenant";

    pub fn new(sync_job_id: SyncJobId, data: SyncJobData) -> Self {
        Self { sync_job_id, data }
    }

    /// Dedup key of the delayed check step, distinct from regular steps.
    pub fn check_dedup_key(sync_job_id: SyncJobId) -> String {
        format!("sync:tenant-check:{}", sync_job_id)
    }

    pub fn options(settings: &SyncSettings) -> JobOptions {
        JobOptions::builder()
            .attempts(3u32)
            .backoff(Backoff::exponential(settings.backoff_delay_ms))
            .remove_on_complete(Retention::age_and_count(
                settings.completed_retention_secs,
                settings.completed_retention_count,
            ))
            .remove_on_fail(Retention::age(settings.failed_retention_secs))
            .build()
    }
}

impl CommandMeta for SyncTenantJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    /// Collapses concurrent re-entries of the same sync into one step.
    fn dedup_key(&self) -> Option<String> {
        Some(format!("sync:tenant:{}", self.sync_job_id))
    }
}
