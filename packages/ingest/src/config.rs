use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Cron pattern (with seconds) for "top of every hour".
pub const HOURLY: &str = "0 0 * * * *";

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. When unset the in-memory queue and
    /// gateway are used (single-process deployments and tests).
    pub database_url: Option<String>,
    pub worker_id: String,
    pub worker_concurrency: usize,
    pub job_lease_ms: i64,
    pub sync: SyncSettings,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = SyncSettings::default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 4)?,
            job_lease_ms: parse_or("JOB_LEASE_MS", 60_000)?,
            sync: SyncSettings {
                max_concurrent_channels: parse_or(
                    "MAX_CONCURRENT_CHANNELS",
                    defaults.max_concurrent_channels,
                )?,
                channel_sync_attempts: parse_or(
                    "CHANNEL_SYNC_ATTEMPTS",
                    defaults.channel_sync_attempts,
                )?,
                backoff_delay_ms: parse_or("SYNC_BACKOFF_MS", defaults.backoff_delay_ms)?,
                page_size: parse_or("SYNC_PAGE_SIZE", defaults.page_size)?,
                rate_limit_backoff_ms: parse_or(
                    "RATE_LIMIT_BACKOFF_MS",
                    defaults.rate_limit_backoff_ms,
                )?,
                ocr_enabled: parse_or("OCR_ENABLED", defaults.ocr_enabled)?,
                ocr_max_retries: parse_or("OCR_MAX_RETRIES", defaults.ocr_max_retries)?,
                ocr_stale_after: Duration::from_secs(parse_or(
                    "OCR_STALE_AFTER_SECS",
                    defaults.ocr_stale_after.as_secs(),
                )?),
                sync_run_stale_after: Duration::from_secs(parse_or(
                    "SYNC_RUN_STALE_AFTER_SECS",
                    defaults.sync_run_stale_after.as_secs(),
                )?),
                sync_check_interval: Duration::from_secs(parse_or(
                    "SYNC_CHECK_INTERVAL_SECS",
                    defaults.sync_check_interval.as_secs(),
                )?),
                sync_sweep_cron: env::var("SYNC_SWEEP_CRON")
                    .unwrap_or(defaults.sync_sweep_cron),
                ocr_sweep_cron: env::var("OCR_SWEEP_CRON").unwrap_or(defaults.ocr_sweep_cron),
                completed_retention_secs: defaults.completed_retention_secs,
                completed_retention_count: defaults.completed_retention_count,
                failed_retention_secs: parse_or(
                    "FAILED_JOB_RETENTION_SECS",
                    defaults.failed_retention_secs,
                )?,
            },
        })
    }
}

/// Tuning knobs for the sync and OCR pipelines.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Soft cap on dispatched-but-unfinished channel jobs per tenant sync.
    pub max_concurrent_channels: usize,
    /// Queue attempts per channel job; also the channel retry ceiling.
    pub channel_sync_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub backoff_delay_ms: u64,
    pub page_size: u32,
    /// Delay before the next page fetch when the adapter gives no retry-after.
    pub rate_limit_backoff_ms: u64,
    pub ocr_enabled: bool,
    pub ocr_max_retries: i32,
    /// `processing` OCR rows older than this are considered crashed attempts.
    pub ocr_stale_after: Duration,
    /// A running sync with no activity for this long is abandoned by the sweep.
    pub sync_run_stale_after: Duration,
    /// Delay of the check step that looks for channel jobs the queue gave up on.
    pub sync_check_interval: Duration,
    pub sync_sweep_cron: String,
    pub ocr_sweep_cron: String,
    pub completed_retention_secs: i64,
    pub completed_retention_count: i64,
    pub failed_retention_secs: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_concurrent_channels: 5,
            channel_sync_attempts: 3,
            backoff_delay_ms: 2_000,
            page_size: 100,
            rate_limit_backoff_ms: 1_000,
            ocr_enabled: true,
            ocr_max_retries: 3,
            ocr_stale_after: Duration::from_secs(30 * 60),
            sync_run_stale_after: Duration::from_secs(6 * 3600),
            sync_check_interval: Duration::from_secs(5 * 60),
            sync_sweep_cron: HOURLY.to_string(),
            ocr_sweep_cron: HOURLY.to_string(),
            completed_retention_secs: 24 * 3600,
            completed_retention_count: 1_000,
            failed_retention_secs: 7 * 24 * 3600,
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid value (got {:?})", key, raw)),
        Err(_) => Ok(default),
    }
}

/// Install the global tracing subscriber.
///
/// Respects `RUST_LOG`; falls back to debug output for this crate only.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ingest_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
