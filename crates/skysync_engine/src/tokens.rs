//! Change-token bookkeeping.
//!
//! One cursor per partition. A missing token means "fetch from the start of
//! the partition". Tokens are persisted as one CBOR blob under a configurable
//! storage key; a blob that fails to decode is treated as empty so that the
//! next pull falls back to a full resync.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use skysync_cloud::{ChangeToken, Partition, ZoneId};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Durable key-value storage for small engine state.
pub trait KeyValueStorage: Send + Sync {
    /// Loads the value stored under `key`.
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`.
    fn store(&self, key: &str, value: &[u8]) -> SyncResult<()>;

    /// Removes the value under `key`.
    fn remove(&self, key: &str) -> SyncResult<()>;
}

/// Process-local storage, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn store(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.values.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// File-backed storage: one file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the file that holds `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.cbor"))
    }
}

impl KeyValueStorage for FileStorage {
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        // Readers never observe a partially written blob.
        let target = self.path_for(key);
        let temp = target.with_extension("cbor.tmp");
        std::fs::write(&temp, value)?;
        std::fs::rename(&temp, &target)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Thread-safe map of partition cursors.
#[derive(Debug, Default)]
pub struct ChangeTokenStore {
    tokens: Mutex<BTreeMap<Partition, ChangeToken>>,
}

impl ChangeTokenStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cursor of a partition.
    pub fn get(&self, partition: &Partition) -> Option<ChangeToken> {
        self.tokens.lock().get(partition).cloned()
    }

    /// Sets or clears the cursor of a partition.
    pub fn set(&self, partition: Partition, token: Option<ChangeToken>) {
        let mut tokens = self.tokens.lock();
        match token {
            Some(token) => {
                tokens.insert(partition, token);
            }
            None => {
                debug!(%partition, "cleared change token");
                tokens.remove(&partition);
            }
        }
    }

    /// Clears the cursors of one zone.
    pub fn remove_zone(&self, zone: &ZoneId) {
        self.tokens
            .lock()
            .retain(|partition, _| partition.zone() != Some(zone));
    }

    /// Clears all cursors.
    pub fn clear(&self) {
        self.tokens.lock().clear();
    }

    /// Number of stored cursors.
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Returns true if no cursor is stored.
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }

    /// Returns all cursors in partition order.
    pub fn entries(&self) -> Vec<(Partition, ChangeToken)> {
        self.tokens
            .lock()
            .iter()
            .map(|(p, t)| (p.clone(), t.clone()))
            .collect()
    }

    /// Encodes all cursors as a CBOR blob.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let entries = self.entries();
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&entries, &mut buf).map_err(SyncError::codec)?;
        Ok(buf)
    }

    /// Decodes a blob made by [`ChangeTokenStore::encode`].
    pub fn decode(blob: &[u8]) -> SyncResult<Self> {
        let entries: Vec<(Partition, ChangeToken)> =
            ciborium::de::from_reader(blob).map_err(SyncError::codec)?;
        Ok(Self {
            tokens: Mutex::new(entries.into_iter().collect()),
        })
    }

    /// Loads the cursors stored under `key`.
    ///
    /// Missing or undecodable blobs yield an empty store.
    pub fn load(storage: &dyn KeyValueStorage, key: &str) -> Self {
        match storage.load(key) {
            Ok(Some(blob)) => Self::decode(&blob).unwrap_or_else(|e| {
                warn!(key, error = %e, "discarding undecodable change tokens");
                Self::new()
            }),
            Ok(None) => Self::new(),
            Err(e) => {
                warn!(key, error = %e, "change tokens unavailable, starting fresh");
                Self::new()
            }
        }
    }

    /// Persists the cursors under `key`.
    pub fn save(&self, storage: &dyn KeyValueStorage, key: &str) -> SyncResult<()> {
        storage.store(key, &self.encode()?)
    }
}
