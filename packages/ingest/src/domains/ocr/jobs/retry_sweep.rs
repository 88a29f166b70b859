//! OcrRetrySweepJob - recurring trigger that re-enqueues failed extractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::jobs::CommandMeta;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrRetrySweepJob {
    pub triggered_at: DateTime<Utc>,
}

impl OcrRetrySweepJob {
    pub const JOB_TYPE: &'static str = "ocr:retry-sweep";

    pub fn now() -> Self {
        Self {
            triggered_at: Utc::now(),
        }
    }
}

impl CommandMeta for OcrRetrySweepJob {
    fn command_type(&self) -> &'static str {
        Self::JOB_TYPE
    }
}
