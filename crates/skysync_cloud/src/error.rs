//! Error types reported by the remote store.

use crate::ids::{RecordId, ZoneId};
use crate::record::Record;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors a remote store can report.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    /// The zone was never created.
    #[error("zone not found: {zone}")]
    ZoneNotFound {
        /// Missing zone.
        zone: ZoneId,
    },

    /// The zone was deleted by the user on another device.
    #[error("zone deleted by user: {zone}")]
    UserDeletedZone {
        /// Purged zone.
        zone: ZoneId,
    },

    /// The change token is no longer valid.
    #[error("change token expired")]
    ChangeTokenExpired,

    /// Too many requests.
    #[error("request rate limited")]
    RequestRateLimited {
        /// Server-suggested delay.
        retry_after: Option<Duration>,
    },

    /// The service is temporarily unavailable.
    #[error("service unavailable")]
    ServiceUnavailable {
        /// Server-suggested delay.
        retry_after: Option<Duration>,
    },

    /// Another operation holds the zone.
    #[error("zone busy")]
    ZoneBusy {
        /// Server-suggested delay.
        retry_after: Option<Duration>,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    OperationCancelled,

    /// A conditional write lost against a newer server version.
    #[error("server record changed: {}", server_record.id())]
    ServerRecordChanged {
        /// The current server version.
        server_record: Box<Record>,
    },

    /// The item does not exist on the server.
    #[error("unknown item: {0}")]
    UnknownItem(String),

    /// Some items of a batch failed; none were applied.
    #[error("partial failure: {} item(s) failed", .0.len())]
    PartialFailure(BTreeMap<RecordId, RemoteError>),

    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// System-field blob could not be decoded.
    #[error("corrupt system fields: {0}")]
    CorruptSystemFields(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RemoteError {
    /// Creates a rate-limit error with a retry delay.
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::RequestRateLimited {
            retry_after: Some(retry_after),
        }
    }

    /// Returns the server-suggested retry delay.
    ///
    /// For partial failures this is the longest delay of any item.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RequestRateLimited { retry_after }
            | RemoteError::ServiceUnavailable { retry_after }
            | RemoteError::ZoneBusy { retry_after } => *retry_after,
            RemoteError::PartialFailure(items) => {
                items.values().filter_map(RemoteError::retry_after).max()
            }
            _ => None,
        }
    }

    /// Returns true if the request may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::RequestRateLimited { .. }
            | RemoteError::ServiceUnavailable { .. }
            | RemoteError::ZoneBusy { .. }
            | RemoteError::Network(_) => true,
            RemoteError::PartialFailure(items) => items.values().all(RemoteError::is_retryable),
            _ => false,
        }
    }

    /// Returns true for throttling errors that should pause sync.
    pub fn is_throttle(&self) -> bool {
        matches!(
            self,
            RemoteError::RequestRateLimited { .. }
                | RemoteError::ServiceUnavailable { .. }
                | RemoteError::ZoneBusy { .. }
        )
    }

    /// Returns the per-item errors of a partial failure.
    pub fn partial_errors(&self) -> Option<&BTreeMap<RecordId, RemoteError>> {
        match self {
            RemoteError::PartialFailure(items) => Some(items),
            _ => None,
        }
    }
}
