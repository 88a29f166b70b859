//! AnalyzeMessagesJob - hand-off to the downstream analysis service.
//!
//! Produced here, consumed elsewhere: this crate never registers a handler
//! for it, so its runner leaves these jobs alone.

use serde::{Deserialize, Serialize};

use crate::common::TenantId;
use crate::kernel::jobs::CommandMeta;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzeMessagesJob {
    pub tenant_id: TenantId,
    pub channel_id: String,
    pub message_ids: Vec<String>,
}

impl AnalyzeMessagesJob {
    pub const JOB_TYPE: &'static str = "analysis:messages";
}

impl CommandMeta for AnalyzeMessagesJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }
}
