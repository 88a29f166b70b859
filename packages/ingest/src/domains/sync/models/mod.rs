pub mod channel_sync_state;
pub mod checkpoint;
pub mod content;
pub mod platform;
pub mod sync_job;
pub mod tenant;

pub use channel_sync_state::{ChannelSyncState, ChannelSyncStatus};
pub use checkpoint::SyncCheckpoint;
pub use content::{StoredAttachment, StoredChannel, StoredMessage, StoredReaction, UpsertOutcome};
pub use platform::{
    ChannelKind, FetchMessagesOptions, FetchMessagesResult, PlatformAttachment, PlatformChannel,
    PlatformMessage, PlatformReaction,
};
pub use sync_job::{
    DateWindow, ParallelStats, SyncErrorEntry, SyncJobData, SyncJobResult, SyncRun, SyncRunStatus,
    SyncType,
};
pub use tenant::Tenant;
