//! Job infrastructure for background work.
//!
//! - [`JobQueue`] - queue contract (enqueue, lease, ack/fail, repeatables)
//! - [`PostgresJobQueue`] / [`InMemoryJobQueue`] - implementations
//! - [`JobRegistry`] - job type → handler map
//! - [`JobRunner`] - polls, executes and acknowledges jobs
//!
//! # Architecture
//!
//! ```text
//! Activity calls deps.job_queue.enqueue(&job)
//!     │
//!     └─► JobQueue.enqueue_raw() (dedup by pending key)
//!
//! JobRunner
//!     │
//!     ├─► claim (lease + attempts_made += 1)
//!     ├─► JobRegistry.execute (deserialize + handler)
//!     └─► mark_succeeded / mark_failed (backoff or dead-letter)
//! ```
//!
//! Job payloads and handlers live in their domains; this module only
//! provides the plumbing.

mod job;
mod memory;
mod postgres;
mod queue;
mod registry;
mod runner;

pub use job::{
    repeat_key, Backoff, BackoffKind, ErrorKind, Job, JobOptions, JobPriority, JobStatus,
    RepeatableJob, Retention,
};
pub use memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;
pub use queue::{ClaimedJob, CommandMeta, EnqueueResult, FailureOutcome, JobDelivery, JobQueue, JobQueueExt};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use runner::{classify_error, JobRunner, JobRunnerConfig};
