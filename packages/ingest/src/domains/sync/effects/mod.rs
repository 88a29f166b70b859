//! Effects for the sync domain: queue handlers that drive the activities.

pub mod job_handlers;

pub use job_handlers::register_sync_jobs;
