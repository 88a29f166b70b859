//! Kernel module - pipeline infrastructure and dependencies.

pub mod adapters;
pub mod deps;
pub mod ingest_kernel;
pub mod jobs;
pub mod pg_gateway;
pub mod scheduled_tasks;
pub mod test_dependencies;
pub mod traits;

pub use adapters::AdapterRegistry;
pub use deps::{IngestDeps, QueueAnalysisTrigger};
pub use ingest_kernel::{build_job_registry, IngestKernel};
pub use pg_gateway::PgPersistenceGateway;
pub use scheduled_tasks::{SyncScheduler, OCR_RETRY_SWEEP, TENANT_SYNC_SWEEP};
pub use test_dependencies::{InMemoryGateway, MockOcrExtractor, MockPlatformAdapter, SpyAnalysisTrigger};
pub use traits::*;
