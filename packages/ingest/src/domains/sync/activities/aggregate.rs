//! Folding per-channel states into a tenant-level `SyncJobResult`.
//!
//! Every step is commutative (sums, min/max, sorted lists), so the result
//! does not depend on the order in which channels finished.

use chrono::{DateTime, Utc};

use crate::domains::sync::models::{
    ChannelSyncState, ChannelSyncStatus, ParallelStats, SyncErrorEntry, SyncJobResult,
};

#[derive(Debug, Clone, Default)]
pub struct SyncAggregate {
    channels_processed: i64,
    channels_failed: i64,
    messages_processed: i64,
    reactions_processed: i64,
    attachments_processed: i64,
    total_api_calls: i64,
    rate_limit_encounters: i64,
    channel_time_ms: i64,
    timed_channels: i64,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    errors: Vec<SyncErrorEntry>,
    states: Vec<ChannelSyncState>,
}

impl SyncAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one terminal channel into the aggregate.
    pub fn absorb(&mut self, state: &ChannelSyncState) {
        match state.status {
            ChannelSyncStatus::Completed => self.channels_processed += 1,
            ChannelSyncStatus::Failed => {
                self.channels_failed += 1;
                self.errors.push(SyncErrorEntry {
                    channel_id: Some(state.channel_id.clone()),
                    error: state.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    timestamp: state.completed_at.unwrap_or(state.updated_at),
                });
            }
            ChannelSyncStatus::Pending | ChannelSyncStatus::InProgress => {}
        }

        self.messages_processed += state.messages_processed;
        self.reactions_processed += state.reactions_processed;
        self.attachments_processed += state.attachments_processed;
        self.total_api_calls += state.api_calls;
        self.rate_limit_encounters += state.rate_limit_encounters;

        if let Some(ms) = state.duration_ms() {
            self.channel_time_ms += ms;
            self.timed_channels += 1;
        }

        self.started_at = min_opt(self.started_at, state.started_at);
        self.completed_at = max_opt(self.completed_at, state.completed_at);
        self.states.push(state.clone());
    }

    /// Record a tenant-level error that is not tied to a channel.
    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(SyncErrorEntry {
            channel_id: None,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    /// Build the final result. `run_started_at` bounds `started_at` when no
    /// channel ever started.
    pub fn finalize(mut self, run_started_at: DateTime<Utc>, max_concurrent_channels: usize) -> SyncJobResult {
        self.errors.sort_by(|a, b| {
            (a.channel_id.as_deref(), &a.error, a.timestamp).cmp(&(b.channel_id.as_deref(), &b.error, b.timestamp))
        });
        self.states.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

        let average_channel_time_ms = if self.timed_channels > 0 {
            self.channel_time_ms as f64 / self.timed_channels as f64
        } else {
            0.0
        };

        let started_at = self.started_at.map_or(run_started_at, |s| s.min(run_started_at));

        SyncJobResult {
            channels_processed: self.channels_processed,
            channels_failed: self.channels_failed,
            messages_processed: self.messages_processed,
            reactions_processed: self.reactions_processed,
            attachments_processed: self.attachments_processed,
            errors: self.errors,
            started_at,
            completed_at: self.completed_at.unwrap_or(started_at).max(started_at),
            parallel_stats: ParallelStats {
                max_concurrent_channels,
                average_channel_time_ms,
                total_api_calls: self.total_api_calls,
                rate_limit_encounters: self.rate_limit_encounters,
            },
            channel_states: self.states,
        }
    }
}

/// Aggregate a full set of channel states.
pub fn aggregate_channel_states(
    states: &[ChannelSyncState],
    run_started_at: DateTime<Utc>,
    max_concurrent_channels: usize,
) -> SyncJobResult {
    let mut aggregate = SyncAggregate::new();
    for state in states {
        aggregate.absorb(state);
    }
    aggregate.finalize(run_started_at, max_concurrent_channels)
}

fn min_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_opt(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
