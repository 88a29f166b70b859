pub mod aggregate;
pub mod orchestrate;
pub mod sync_channel;
pub mod tenant_sweep;

pub use aggregate::{aggregate_channel_states, SyncAggregate};
pub use orchestrate::{
    cancel_sync, enqueue_step, fail_sync_run, run_sync_step, settle_failed_step, start_tenant_sync, SyncStep,
    CANCELLED_MESSAGE,
};
pub use sync_channel::{sync_channel, ChannelOutcome};
pub use tenant_sweep::{sweep_tenants, ABANDONED_MESSAGE};
