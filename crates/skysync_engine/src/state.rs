//! Engine state and statistics.

use std::time::Instant;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle.
    Idle,
    /// Engine is pulling changes from the remote store.
    Pulling,
    /// Engine is pushing local changes to the remote store.
    Pushing,
    /// Network work is paused after throttling.
    Paused,
    /// The last operation surfaced an error.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pulling | SyncState::Pushing)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Records applied to the local store.
    pub records_pulled: u64,
    /// Records saved remotely.
    pub records_pushed: u64,
    /// Records deleted remotely.
    pub records_deleted: u64,
    /// Stale writes rebased onto the server version.
    pub conflicts_resolved: u64,
    /// Pauses after throttling.
    pub pauses: u64,
    /// Zones provisioned.
    pub provisions: u64,
    /// Errors reported to the error sink.
    pub errors: u64,
    /// Last completed push or pull.
    pub last_sync_time: Option<Instant>,
    /// Last reported error message.
    pub last_error: Option<String>,
}
