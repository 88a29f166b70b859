//! Sync domain - pulling tenant channel history from chat platforms.
//!
//! # Components
//!
//! - `activities/` - orchestration steps, the channel worker, the tenant sweep
//! - `effects/` - job handlers registered with the `JobRegistry`
//! - `jobs/` - queue payloads
//! - `models/` - platform data, run state, checkpoints, stored content

pub mod activities;
pub mod effects;
pub mod errors;
pub mod jobs;
pub mod models;

pub use errors::{AdapterError, PersistenceError, SyncError, SyncResult};
pub use effects::register_sync_jobs;
