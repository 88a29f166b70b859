//! Job registry for deserializing and executing jobs.
//!
//! The registry maps job type strings (e.g., "sync:channel") to handlers
//! that reconstruct the typed payload from JSON and run it. The
//! [`JobRunner`](super::JobRunner) only claims types registered here, so
//! job types consumed by other services stay in the queue untouched.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

use super::queue::{ClaimedJob, CommandMeta, JobDelivery};
use crate::kernel::IngestDeps;

type BoxedHandler = Box<
    dyn Fn(serde_json::Value, JobDelivery, Arc<IngestDeps>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registry that maps job type strings to handlers.
///
/// ```ignore
/// let mut registry = JobRegistry::new();
/// registry.register::<SyncChannelJob, _, _>(SyncChannelJob::JOB_TYPE, |job, deps| async move {
///     sync_channel(job, &deps).await
/// });
/// registry.execute(&claimed_job, deps.clone()).await?;
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a job type with its handler.
    pub fn register<J, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        J: CommandMeta + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, Arc<IngestDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register_with_delivery::<J, _, _>(job_type, move |job, _delivery, deps| {
            let handler = handler.clone();
            async move { handler(job, deps).await }
        });
    }

    /// Register a handler that also sees which delivery it is running.
    pub fn register_with_delivery<J, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        J: CommandMeta + DeserializeOwned + Send + Sync + 'static,
        F: Fn(J, JobDelivery, Arc<IngestDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, delivery, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let job: J = serde_json::from_value(value)
                    .map_err(|e| anyhow!("failed to deserialize {}: {}", job_type, e))?;
                handler(job, delivery, deps).await
            })
        });

        self.handlers.insert(job_type, boxed);
    }

    /// Execute a claimed job using its registered handler.
    pub async fn execute(&self, job: &ClaimedJob, deps: Arc<IngestDeps>) -> Result<()> {
        let job_type = job.job_type();
        let handler = self
            .handlers
            .get(job_type)
            .ok_or_else(|| anyhow!("unknown job type: {}", job_type))?;

        handler(job.job.args.clone(), job.delivery(), deps).await
    }

    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// All registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().map(|t| t.to_string()).collect();
        types.sort();
        types
    }
}

pub type SharedJobRegistry = Arc<JobRegistry>;
