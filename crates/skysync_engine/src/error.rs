//! Error types for the sync engine.

use skysync_cloud::RemoteError;
use skysync_store::StoreError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error (transaction save, schema violation).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Remote store error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The entity type has no resolvable service attributes.
    #[error("entity {entity} is not sync-enabled: missing service attributes")]
    MissingServiceAttributes {
        /// Entity name.
        entity: String,
    },

    /// Ordered to-many relationships cannot round-trip through references.
    #[error("unsupported relationship kind for {entity}.{relationship}: ordered to-many")]
    UnsupportedRelationshipKind {
        /// Entity name.
        entity: String,
        /// Relationship name.
        relationship: String,
    },

    /// The entity type has no cache attributes.
    #[error("entity {entity} is not cacheable")]
    NotCacheable {
        /// Entity name.
        entity: String,
    },

    /// Network operations are paused.
    #[error("sync paused for another {remaining:?}")]
    Paused {
        /// Time left until the pause lifts.
        remaining: Duration,
    },

    /// File system error (asset payloads, token storage).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

impl SyncError {
    /// Creates a missing service attributes error.
    pub fn missing_service_attributes(entity: impl Into<String>) -> Self {
        Self::MissingServiceAttributes {
            entity: entity.into(),
        }
    }

    /// Creates an invalid state transition error.
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl fmt::Display) -> Self {
        Self::Codec(message.to_string())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_retryable(),
            SyncError::Paused { .. } => true,
            _ => false,
        }
    }

    /// Returns true for schema errors, which never succeed on retry.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            SyncError::MissingServiceAttributes { .. }
                | SyncError::UnsupportedRelationshipKind { .. }
                | SyncError::NotCacheable { .. }
        )
    }

    /// Returns the underlying remote error, if any.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

/// The pipeline an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorModule {
    /// Push pipeline.
    PushToCloud,
    /// Pull pipeline.
    PullFromCloud,
    /// Asset uploads.
    CacheToCloud,
    /// Asset downloads.
    CacheFromCloud,
}

impl fmt::Display for ErrorModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorModule::PushToCloud => "push-to-cloud",
            ErrorModule::PullFromCloud => "pull-from-cloud",
            ErrorModule::CacheToCloud => "cache-to-cloud",
            ErrorModule::CacheFromCloud => "cache-from-cloud",
        };
        f.write_str(name)
    }
}
