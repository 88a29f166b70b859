//! Background job payloads for the sync domain.

mod analyze_messages;
mod sync_channel;
mod sync_tenant;
mod tenant_sweep;

pub use analyze_messages::AnalyzeMessagesJob;
pub use sync_channel::SyncChannelJob;
pub use sync_tenant::SyncTenantJob;
pub use tenant_sweep::TenantSweepJob;
