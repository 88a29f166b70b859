//! TenantSweepJob - recurring trigger that starts a sync for every active tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domains::sync::models::SyncType;
use crate::kernel::jobs::CommandMeta;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSweepJob {
    pub sync_type: SyncType,
    pub triggered_at: DateTime<Utc>,
}

impl TenantSweepJob {
    pub const JOB_TYPE: &'static str = "sync:tenant-sweep";

    pub fn incremental() -> Self {
        Self {
            sync_type: SyncType::Incremental,
            triggered_at: Utc::now(),
        }
    }
}

impl CommandMeta for TenantSweepJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }
}
