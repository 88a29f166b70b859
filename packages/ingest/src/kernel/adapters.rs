//! Platform adapter registry.
//!
//! Adapters are registered once at process start and looked up by the
//! tenant's `platform`. Initialization is lazy and happens at most once per
//! adapter; a failed initialization is retried on the next lookup.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::domains::sync::errors::SyncError;
use crate::kernel::BasePlatformAdapter;

struct AdapterEntry {
    adapter: Arc<dyn BasePlatformAdapter>,
    initialized: OnceCell<()>,
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, AdapterEntry>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its `platform()` key, replacing any
    /// previous one.
    pub fn register(&mut self, adapter: Arc<dyn BasePlatformAdapter>) {
        let key = adapter.platform().to_string();
        self.adapters.insert(
            key,
            AdapterEntry {
                adapter,
                initialized: OnceCell::new(),
            },
        );
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn BasePlatformAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn BasePlatformAdapter>> {
        self.adapters.get(platform).map(|e| e.adapter.clone())
    }

    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self.adapters.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    /// The adapter for `platform`, initialized.
    pub async fn ready(&self, platform: &str) -> Result<Arc<dyn BasePlatformAdapter>, SyncError> {
        let entry = self
            .adapters
            .get(platform)
            .ok_or_else(|| SyncError::NoAdapter(platform.to_string()))?;

        entry
            .initialized
            .get_or_try_init(|| async {
                entry.adapter.initialize().await?;
                info!(platform = %platform, adapter = %entry.adapter.display_name(), "adapter initialized");
                Ok::<(), SyncError>(())
            })
            .await?;

        Ok(entry.adapter.clone())
    }

    /// Initialize every adapter. Failures are logged and retried lazily.
    pub async fn initialize_all(&self) {
        let platforms = self.platforms();
        let results = join_all(platforms.iter().map(|p| self.ready(p))).await;
        for (platform, result) in platforms.iter().zip(results) {
            if let Err(e) = result {
                warn!(platform = %platform, error = %e, "adapter initialization failed");
            }
        }
    }

    /// Release adapter resources at shutdown.
    pub async fn cleanup_all(&self) {
        for (platform, entry) in &self.adapters {
            if entry.initialized.initialized() {
                if let Err(e) = entry.adapter.cleanup().await {
                    warn!(platform = %platform, error = %e, "adapter cleanup failed");
                }
            }
        }
    }
}
