// IngestKernel - process-level wiring for the ingestion pipeline
//
// Built once at process start. Holds the dependency container, the job
// registry, the runner and the scheduler; nothing in the pipeline reaches
// for global state.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::jobs::{InMemoryJobQueue, JobQueue, JobRegistry, JobRunner, JobRunnerConfig, PostgresJobQueue, SharedJobRegistry};
use super::scheduled_tasks::SyncScheduler;
use super::test_dependencies::InMemoryGateway;
use super::{AdapterRegistry, BasePersistenceGateway, IngestDeps, PgPersistenceGateway};
use crate::common::SyncJobId;
use crate::config::Config;
use crate::domains::ocr::register_ocr_jobs;
use crate::domains::sync::activities::{cancel_sync, start_tenant_sync};
use crate::domains::sync::models::SyncJobData;
use crate::domains::sync::register_sync_jobs;

/// Every job type this service consumes.
pub fn build_job_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    register_sync_jobs(&mut registry);
    register_ocr_jobs(&mut registry);
    registry
}

pub struct IngestKernel {
    pub deps: Arc<IngestDeps>,
    pub registry: SharedJobRegistry,
    pub scheduler: SyncScheduler,
    runner_config: JobRunnerConfig,
    shutdown: CancellationToken,
    runner_handle: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl IngestKernel {
    pub fn new(deps: IngestDeps, runner_config: JobRunnerConfig) -> Self {
        let scheduler = SyncScheduler::new(deps.job_queue.clone(), deps.settings.clone());
        Self {
            deps: Arc::new(deps),
            registry: Arc::new(build_job_registry()),
            scheduler,
            runner_config,
            shutdown: CancellationToken::new(),
            runner_handle: Mutex::new(None),
        }
    }

    /// Wire stores from configuration: Postgres when `DATABASE_URL` is set,
    /// in-memory otherwise.
    pub async fn from_config(config: &Config, adapters: AdapterRegistry) -> Result<Self> {
        let (job_queue, gateway): (Arc<dyn JobQueue>, Arc<dyn BasePersistenceGateway>) =
            match &config.database_url {
                Some(url) => {
                    let pool = PgPoolOptions::new()
                        .max_connections(10)
                        .connect(url)
                        .await
                        .context("Failed to connect to database")?;
                    sqlx::migrate!("./migrations")
                        .run(&pool)
                        .await
                        .context("Failed to run migrations")?;
                    info!("connected to postgres, migrations applied");
                    (
                        Arc::new(PostgresJobQueue::with_lease_duration(pool.clone(), config.job_lease_ms)),
                        Arc::new(PgPersistenceGateway::new(pool)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set, using in-memory stores");
                    (
                        Arc::new(InMemoryJobQueue::with_lease_duration(config.job_lease_ms)),
                        Arc::new(InMemoryGateway::new()),
                    )
                }
            };

        let deps = IngestDeps::new(
            job_queue,
            gateway,
            Arc::new(adapters),
            config.sync.clone(),
            config.worker_id.clone(),
        );
        let runner_config = JobRunnerConfig {
            concurrency: config.worker_concurrency,
            ..JobRunnerConfig::with_worker_id(config.worker_id.clone())
        };

        Ok(Self::new(deps, runner_config))
    }

    pub fn runner(&self) -> JobRunner {
        JobRunner::with_config(
            self.deps.job_queue.clone(),
            self.registry.clone(),
            self.deps.clone(),
            self.runner_config.clone(),
        )
    }

    /// Initialize adapters, start the job runner and the sweep schedules.
    pub async fn start(&self) -> Result<()> {
        self.deps.adapters.initialize_all().await;

        let mut handle = self.runner_handle.lock().await;
        if handle.is_none() {
            let runner = self.runner();
            let token = self.shutdown.clone();
            *handle = Some(tokio::spawn(async move { runner.run(token).await }));
        }
        drop(handle);

        self.scheduler.start_tenant_sync_sweep().await?;
        if self.deps.ocr_enabled() {
            self.scheduler.start_ocr_retry_sweep().await?;
        }

        info!(worker_id = %self.deps.worker_id, "ingest kernel started");
        Ok(())
    }

    /// Stop accepting work, let in-flight jobs finish, release adapters.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.scheduler.shutdown().await?;

        if let Some(handle) = self.runner_handle.lock().await.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "job runner exited with error"),
                Err(e) => warn!(error = %e, "job runner task panicked"),
            }
        }

        self.deps.adapters.cleanup_all().await;
        info!(worker_id = %self.deps.worker_id, "ingest kernel stopped");
        Ok(())
    }

    /// Start a tenant sync now, outside the hourly sweep.
    pub async fn sync_tenant(&self, data: SyncJobData) -> Result<SyncJobId> {
        Ok(start_tenant_sync(data, &self.deps).await?)
    }

    /// Request cooperative cancellation of a running sync.
    pub async fn cancel_sync(&self, sync_job_id: SyncJobId) -> Result<bool> {
        Ok(cancel_sync(sync_job_id, &self.deps).await?)
    }
}
