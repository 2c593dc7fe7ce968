//! Lifecycle notifications and error reporting.

use crate::error::{ErrorModule, SyncError};
use tracing::error;

/// Lifecycle events broadcast to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// A pull is about to start.
    WillSyncFromCloud,
    /// A pull finished.
    DidSyncFromCloud,
    /// A push is about to start.
    WillSyncToCloud,
    /// A push finished.
    DidSyncToCloud,
}

/// Receives errors the engine does not recover from on its own.
pub trait ErrorSink: Send + Sync {
    /// Reports an error raised by `module`.
    fn report(&self, error: &SyncError, module: ErrorModule);
}

/// Logs reported errors at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, error: &SyncError, module: ErrorModule) {
        error!(%module, %error, "sync error");
    }
}
