//! SyncChannelJob - ingest one channel for one tenant sync.

use serde::{Deserialize, Serialize};

use crate::common::{SyncJobId, TenantId};
use crate::config::SyncSettings;
use crate::domains::sync::models::{DateWindow, SyncType};
use crate::kernel::jobs::{Backoff, CommandMeta, JobOptions, Retention};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChannelJob {
    pub sync_job_id: SyncJobId,
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub sync_type: SyncType,
    pub date_range: Option<DateWindow>,
}

impl SyncChannelJob {
    pub const JOB_TYPE: &'static str = "sync:channel";

    /// Queue attempts double as the channel's retry ceiling.
    pub fn options(settings: &SyncSettings) -> JobOptions {
        JobOptions::builder()
            .attempts(settings.channel_sync_attempts)
            .backoff(Backoff::exponential(settings.backoff_delay_ms))
            .remove_on_complete(Retention::age_and_count(
                settings.completed_retention_secs,
                settings.completed_retention_count,
            ))
            .remove_on_fail(Retention::age(settings.failed_retention_secs))
            .build()
    }
}

impl CommandMeta for SyncChannelJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }

    fn dedup_key(&self) -> Option<String> {
        Some(format!("sync:channel:{}:{}", self.sync_job_id, self.channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_settings() {
        let settings = SyncSettings {
            channel_sync_attempts: 5,
            backoff_delay_ms: 250,
            ..SyncSettings::default()
        };
        let options = SyncChannelJob::options(&settings);

        assert_eq!(options.attempts, 5);
        assert_eq!(options.backoff, Backoff::exponential(250));
        assert!(options.remove_on_fail.is_some());
    }
}
