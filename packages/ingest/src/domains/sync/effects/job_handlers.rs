//! Job handlers for the sync domain.
//!
//! ## Pipeline Flow
//!
//! ```text
//! TenantSweepJob  → sweep_tenants()   → start_tenant_sync() per tenant
//! SyncTenantJob   → run_sync_step()   → enqueue SyncChannelJob (up to the ceiling)
//! SyncChannelJob  → sync_channel()    → enqueue SyncTenantJob (next step)
//! ```

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::domains::sync::activities::{
    run_sync_step, settle_failed_step, sweep_tenants, sync_channel, SyncStep,
};
use crate::domains::sync::jobs::{SyncChannelJob, SyncTenantJob, TenantSweepJob};
use crate::kernel::jobs::{JobDelivery, JobRegistry};
use crate::kernel::IngestDeps;

/// Handle SyncTenantJob: one orchestration step.
pub async fn handle_sync_tenant(job: SyncTenantJob, delivery: JobDelivery, deps: Arc<IngestDeps>) -> Result<()> {
    let step = match run_sync_step(&job, &deps).await {
        Ok(step) => step,
        Err(e) => {
            if delivery.is_final_attempt() || !e.is_retryable() {
                if let Err(settle_err) = settle_failed_step(&job, &e, &deps).await {
                    warn!(
                        sync_job_id = %job.sync_job_id,
                        error = %settle_err,
                        "Failed to settle exhausted sync step"
                    );
                }
            }
            return Err(e.into());
        }
    };

    match step {
        SyncStep::Finished(result) if result.is_partial() => {
            info!(
                sync_job_id = %job.sync_job_id,
                channels_failed = result.channels_failed,
                "Tenant sync finished with failed channels"
            );
        }
        _ => {}
    }
    Ok(())
}

/// Handle SyncChannelJob.
pub async fn handle_sync_channel(job: SyncChannelJob, deps: Arc<IngestDeps>) -> Result<()> {
    sync_channel(&job, &deps).await?;
    Ok(())
}

/// Handle TenantSweepJob.
pub async fn handle_tenant_sweep(job: TenantSweepJob, deps: Arc<IngestDeps>) -> Result<()> {
    sweep_tenants(&job, &deps).await?;
    Ok(())
}

pub fn register_sync_jobs(registry: &mut JobRegistry) {
    registry.register_with_delivery::<SyncTenantJob, _, _>(SyncTenantJob::JOB_TYPE, |job, delivery, deps| async move {
        handle_sync_tenant(job, delivery, deps).await
    });

    registry.register::<SyncChannelJob, _, _>(SyncChannelJob::JOB_TYPE, |job, deps| async move {
        handle_sync_channel(job, deps).await
    });

    registry.register::<TenantSweepJob, _, _>(TenantSweepJob::JOB_TYPE, |job, deps| async move {
        handle_tenant_sweep(job, deps).await
    });
}
