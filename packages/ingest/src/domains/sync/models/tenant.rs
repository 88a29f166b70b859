use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::TenantId;

/// A customer workspace whose content is synced independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// Adapter key, e.g. "discord".
    pub platform: String,
    /// The workspace id on the platform (guild, team, ...).
    pub platform_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: &str, platform: &str, platform_id: &str) -> Self {
        Self {
            id: TenantId::new(),
            name: name.to_string(),
            platform: platform.to_string(),
            platform_id: platform_id.to_string(),
            active: true,
            created_at: Utc::now(),
        }
    }
}
