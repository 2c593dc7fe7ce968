//! Cache and availability states, stored as lowercase text on the object.

use crate::error::{SyncError, SyncResult};
use std::fmt;

/// Where an asset payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Only on this device.
    Local,
    /// Upload requested.
    Upload,
    /// Upload in flight.
    Uploading,
    /// Only remote; no local payload.
    Remote,
    /// Download requested.
    Download,
    /// Download in flight.
    Downloading,
    /// Eviction requested.
    Unload,
    /// Both local and remote.
    Cached,
}

impl CacheState {
    /// Every state.
    pub const ALL: [CacheState; 8] = [
        CacheState::Local,
        CacheState::Upload,
        CacheState::Uploading,
        CacheState::Remote,
        CacheState::Download,
        CacheState::Downloading,
        CacheState::Unload,
        CacheState::Cached,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Local => "local",
            CacheState::Upload => "upload",
            CacheState::Uploading => "uploading",
            CacheState::Remote => "remote",
            CacheState::Download => "download",
            CacheState::Downloading => "downloading",
            CacheState::Unload => "unload",
            CacheState::Cached => "cached",
        }
    }

    /// Parses the stored representation.
    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == text)
    }

    /// Returns true for states the manager is expected to drive.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CacheState::Upload | CacheState::Download | CacheState::Unload
        )
    }

    /// Returns true while a transfer is requested or running.
    pub fn is_transferring(&self) -> bool {
        matches!(
            self,
            CacheState::Upload
                | CacheState::Uploading
                | CacheState::Download
                | CacheState::Downloading
        )
    }

    /// Checks a transition made by the manager.
    ///
    /// Requests (`upload`, `download`, `unload`) come from the application
    /// and are accepted from any state.
    pub fn check_transition(self, to: CacheState) -> SyncResult<()> {
        use CacheState::*;
        let allowed = to.is_request()
            || matches!(
                (self, to),
                (Upload, Uploading)
                    | (Upload | Uploading, Cached | Local)
                    | (Download, Downloading)
                    | (Download | Downloading, Cached | Remote)
                    | (Unload, Remote)
            );
        if allowed {
            Ok(())
        } else {
            Err(SyncError::invalid_transition(self, to))
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the remote copy of a payload can be downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RemoteStatus {
    /// Not uploaded yet.
    #[default]
    Pending,
    /// Uploaded and downloadable.
    Available,
}

impl RemoteStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Pending => "pending",
            RemoteStatus::Available => "available",
        }
    }

    /// Parses the stored representation.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "pending" => Some(RemoteStatus::Pending),
            "available" => Some(RemoteStatus::Available),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        for state in CacheState::ALL {
            assert_eq!(CacheState::parse(state.as_str()), Some(state));
        }
        assert_eq!(CacheState::parse("evicted"), None);
        assert_eq!(RemoteStatus::parse("available"), Some(RemoteStatus::Available));
        assert_eq!(RemoteStatus::parse("nope"), None);
    }

    #[test]
    fn manager_transitions() {
        assert!(CacheState::Upload.check_transition(CacheState::Uploading).is_ok());
        assert!(CacheState::Uploading.check_transition(CacheState::Cached).is_ok());
        assert!(CacheState::Uploading.check_transition(CacheState::Local).is_ok());
        assert!(CacheState::Downloading.check_transition(CacheState::Remote).is_ok());
        assert!(CacheState::Unload.check_transition(CacheState::Remote).is_ok());
        assert!(CacheState::Cached.check_transition(CacheState::Unload).is_ok());

        let err = CacheState::Remote
            .check_transition(CacheState::Cached)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert!(CacheState::Local.check_transition(CacheState::Uploading).is_err());
    }
}
