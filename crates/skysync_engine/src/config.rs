//! Configuration for the sync engine.

use skysync_cloud::{DatabaseScope, SavePolicy, ZoneId};
use std::path::PathBuf;
use std::time::Duration;

/// Default attribute names used when an attribute carries no role metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeNames {
    /// Stable record name.
    pub record_name: String,
    /// Owner of the record's zone.
    pub owner_name: String,
    /// System blob for private and shared records.
    pub private_record_data: String,
    /// System blob for public records.
    pub public_record_data: String,
    /// Cache state.
    pub cache_state: String,
    /// Remote availability of the cached asset.
    pub remote_status: String,
    /// Upload progress fraction.
    pub upload_progress: String,
    /// Download progress fraction.
    pub download_progress: String,
    /// Long-lived operation ID.
    pub operation_id: String,
    /// Last transfer error message.
    pub last_error: String,
    /// Remote field that carries the cached asset.
    pub asset_field: String,
}

impl Default for AttributeNames {
    fn default() -> Self {
        Self {
            record_name: "recordName".into(),
            owner_name: "ownerName".into(),
            private_record_data: "privateRecordData".into(),
            public_record_data: "publicRecordData".into(),
            cache_state: "cacheState".into(),
            remote_status: "remoteStatus".into(),
            upload_progress: "uploadProgress".into(),
            download_progress: "downloadProgress".into(),
            operation_id: "operationID".into(),
            last_error: "lastErrorMessage".into(),
            asset_field: "asset".into(),
        }
    }
}

/// Configuration for the global pause after throttling errors.
#[derive(Debug, Clone)]
pub struct PauseConfig {
    /// Delay used when the server suggests none.
    pub default_delay: Duration,
    /// Upper bound for any pause.
    pub max_delay: Duration,
}

impl PauseConfig {
    /// Creates a pause configuration.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            max_delay: Duration::from_secs(3600),
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the pause to apply for a server-suggested delay.
    pub fn delay_for(&self, suggested: Option<Duration>) -> Duration {
        suggested.unwrap_or(self.default_delay).min(self.max_delay)
    }
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Name of the private zone records are written to.
    pub zone_name: String,
    /// Database scopes to pull from.
    pub scopes: Vec<DatabaseScope>,
    /// Storage key of the persisted change tokens.
    pub token_storage_key: String,
    /// Default service and cache attribute names.
    pub attributes: AttributeNames,
    /// Binary attributes larger than this are sent as assets.
    pub asset_threshold: usize,
    /// Directory for externalised asset temp files.
    pub temp_dir: PathBuf,
    /// Directory holding cached asset payloads.
    pub cache_dir: PathBuf,
    /// Maximum records per pull page.
    pub pull_page_size: usize,
    /// Maximum records per atomic push.
    pub push_batch_size: usize,
    /// Save policy for pushes.
    pub save_policy: SavePolicy,
    /// Pause configuration.
    pub pause: PauseConfig,
    /// Interval between polls of a long-lived operation.
    pub poll_interval: Duration,
}

impl SyncConfig {
    /// Creates a configuration writing to the given private zone.
    pub fn new(zone_name: impl Into<String>) -> Self {
        let base = std::env::temp_dir().join("skysync");
        Self {
            zone_name: zone_name.into(),
            scopes: vec![DatabaseScope::Private],
            token_storage_key: "skysync.tokens".into(),
            attributes: AttributeNames::default(),
            asset_threshold: 100 * 1024,
            temp_dir: base.join("tmp"),
            cache_dir: base.join("cache"),
            pull_page_size: 200,
            push_batch_size: 400,
            save_policy: SavePolicy::IfServerRecordUnchanged,
            pause: PauseConfig::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Sets the database scopes to pull from.
    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = DatabaseScope>) -> Self {
        self.scopes = scopes.into_iter().collect();
        self
    }

    /// Sets the token storage key.
    pub fn with_token_storage_key(mut self, key: impl Into<String>) -> Self {
        self.token_storage_key = key.into();
        self
    }

    /// Sets the default attribute names.
    pub fn with_attributes(mut self, attributes: AttributeNames) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the asset externalisation threshold in bytes.
    pub fn with_asset_threshold(mut self, bytes: usize) -> Self {
        self.asset_threshold = bytes;
        self
    }

    /// Places temp and cache directories under `dir`.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.temp_dir = dir.join("tmp");
        self.cache_dir = dir.join("cache");
        self
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: usize) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the save policy.
    pub fn with_save_policy(mut self, policy: SavePolicy) -> Self {
        self.save_policy = policy;
        self
    }

    /// Sets the pause configuration.
    pub fn with_pause(mut self, pause: PauseConfig) -> Self {
        self.pause = pause;
        self
    }

    /// Sets the long-lived operation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The private zone owned by the current user.
    pub fn zone(&self) -> ZoneId {
        ZoneId::owned(&self.zone_name)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("SkySync")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("Notes")
            .with_pull_page_size(50)
            .with_push_batch_size(0)
            .with_scopes([DatabaseScope::Private, DatabaseScope::Public])
            .with_data_dir("/var/lib/app");

        assert_eq!(config.zone(), ZoneId::owned("Notes"));
        assert_eq!(config.pull_page_size, 50);
        assert_eq!(config.push_batch_size, 1);
        assert_eq!(config.scopes.len(), 2);
        assert_eq!(config.cache_dir, PathBuf::from("/var/lib/app/cache"));
    }

    #[test]
    fn pause_delay() {
        let pause = PauseConfig::new(Duration::from_secs(10)).with_max_delay(Duration::from_secs(60));
        assert_eq!(pause.delay_for(None), Duration::from_secs(10));
        assert_eq!(pause.delay_for(Some(Duration::from_secs(3))), Duration::from_secs(3));
        assert_eq!(pause.delay_for(Some(Duration::from_secs(600))), Duration::from_secs(60));
    }

    #[test]
    fn default_names() {
        let names = AttributeNames::default();
        assert_eq!(names.record_name, "recordName");
        assert_eq!(names.private_record_data, "privateRecordData");
    }
}
