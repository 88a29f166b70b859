//! Test harnesses for integration testing.
//!
//! [`TestHarness`] wires the whole pipeline against in-memory stores and a
//! scripted platform adapter. [`PgHarness`] runs against a shared Postgres
//! container that is started once and reused by every test.

use std::sync::Arc;

use anyhow::{Context, Result};
use ingest_core::common::SyncJobId;
use ingest_core::domains::sync::models::{SyncJobData, SyncRun, Tenant};
use ingest_core::kernel::jobs::{InMemoryJobQueue, JobRunner, JobRunnerConfig, JobStatus};
use ingest_core::kernel::{
    build_job_registry, AdapterRegistry, InMemoryGateway, IngestDeps, MockOcrExtractor,
    MockPlatformAdapter, SpyAnalysisTrigger,
};
use ingest_core::{domains::sync::activities::start_tenant_sync, SyncSettings};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use super::test_settings;

pub const PLATFORM: &str = "mock";

/// Upper bound on drain rounds; a livelocked pipeline fails the test
/// instead of hanging it.
const MAX_DRAIN_ROUNDS: usize = 200;

fn init_test_tracing() {
    // Run tests with: RUST_LOG=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// In-memory harness
// =============================================================================

/// Full pipeline over in-memory stores.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     ctx.adapter.add_channel("general", messages("general", 5));
///     let run = ctx.sync(SyncJobData::full(ctx.tenant.id)).await;
/// }
/// ```
pub struct TestHarness {
    pub queue: Arc<InMemoryJobQueue>,
    pub gateway: Arc<InMemoryGateway>,
    pub adapter: Arc<MockPlatformAdapter>,
    pub analysis: Arc<SpyAnalysisTrigger>,
    pub ocr: Option<Arc<MockOcrExtractor>>,
    pub deps: Arc<IngestDeps>,
    pub runner: JobRunner,
    pub tenant: Tenant,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
    }

    async fn teardown(self) {
        // In-memory stores are dropped with the harness
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder {
            settings: test_settings(),
            adapter: MockPlatformAdapter::new(PLATFORM),
            analysis: Arc::new(SpyAnalysisTrigger::new()),
            ocr: None,
        }
    }

    /// Run queued jobs until nothing is left, skipping retry delays.
    ///
    /// Returns the number of jobs executed.
    pub async fn drain(&self) -> usize {
        let registered = build_job_registry().registered_types();
        let mut total = 0;

        for _ in 0..MAX_DRAIN_ROUNDS {
            let processed = self.runner.run_until_idle().await.unwrap();
            total += processed;

            let waiting = self
                .queue
                .jobs_with_status(JobStatus::Pending)
                .into_iter()
                .filter(|j| registered.contains(&j.job_type))
                .count();
            if processed == 0 && waiting == 0 {
                return total;
            }
            self.queue.advance_all_delays();
        }

        panic!("queue did not drain after {} rounds", MAX_DRAIN_ROUNDS);
    }

    /// Start a sync for the harness tenant without running it.
    pub async fn start(&self, data: SyncJobData) -> SyncJobId {
        start_tenant_sync(data, &self.deps).await.unwrap()
    }

    /// Start a sync, drain the queue and return the finished run.
    pub async fn sync(&self, data: SyncJobData) -> SyncRun {
        let sync_job_id = self.start(data).await;
        self.drain().await;
        self.run(sync_job_id)
    }

    pub fn run(&self, sync_job_id: SyncJobId) -> SyncRun {
        self.gateway
            .sync_run(sync_job_id)
            .unwrap_or_else(|| panic!("sync run {} not recorded", sync_job_id))
    }

    pub fn full(&self) -> SyncJobData {
        SyncJobData::full(self.tenant.id)
    }

    pub fn incremental(&self) -> SyncJobData {
        SyncJobData::incremental(self.tenant.id)
    }
}

pub struct TestHarnessBuilder {
    settings: SyncSettings,
    adapter: MockPlatformAdapter,
    analysis: Arc<SpyAnalysisTrigger>,
    ocr: Option<Arc<MockOcrExtractor>>,
}

impl TestHarnessBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn adapter(mut self, adapter: MockPlatformAdapter) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn analysis(mut self, analysis: SpyAnalysisTrigger) -> Self {
        self.analysis = Arc::new(analysis);
        self
    }

    pub fn ocr(mut self, extractor: MockOcrExtractor) -> Self {
        self.ocr = Some(Arc::new(extractor));
        self
    }

    pub fn build(self) -> TestHarness {
        init_test_tracing();

        let queue = Arc::new(InMemoryJobQueue::new());
        let gateway = Arc::new(InMemoryGateway::new());
        let adapter = Arc::new(self.adapter);

        let tenant = Tenant::new("Test Workspace", PLATFORM, "workspace-1");
        gateway.add_tenant(tenant.clone());

        let adapters = AdapterRegistry::new().with_adapter(adapter.clone());
        let mut deps = IngestDeps::new(
            queue.clone(),
            gateway.clone(),
            Arc::new(adapters),
            self.settings,
            "test-worker",
        )
        .with_analysis(self.analysis.clone());
        if let Some(ocr) = &self.ocr {
            deps = deps.with_ocr_extractor(ocr.clone());
        }
        let deps = Arc::new(deps);

        let runner = JobRunner::with_config(
            queue.clone(),
            Arc::new(build_job_registry()),
            deps.clone(),
            JobRunnerConfig::with_worker_id("test-worker"),
        );

        TestHarness {
            queue,
            gateway,
            adapter,
            analysis: self.analysis,
            ocr: self.ocr,
            deps,
            runner,
            tenant,
        }
    }
}

// =============================================================================
// Postgres harness
// =============================================================================

/// Shared Postgres container. Started once, migrated once.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        init_test_tracing();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", pg_host, pg_port);

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Database-backed harness. Each test gets its own pool on the shared
/// container; tests scope their rows by fresh tenant ids.
pub struct PgHarness {
    pub db_pool: PgPool,
}

impl AsyncTestContext for PgHarness {
    async fn setup() -> Self {
        let infra = SharedTestInfra::get().await;
        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .expect("Failed to connect to test database");
        Self { db_pool }
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
