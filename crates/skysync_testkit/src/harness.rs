//! A local store, an in-memory cloud and an engine wired together.

use crate::sink::CollectingErrorSink;
use skysync_cloud::{DatabaseScope, MemoryCloud, Record, RemoteStore, ZoneId};
use skysync_engine::{MemoryStorage, SyncConfig, SyncEngine};
use skysync_store::{LocalStore, Object, ObjectId, Predicate, Schema, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Name of the private zone every harness writes to.
pub const ZONE_NAME: &str = "Main";

/// One device syncing with a shared in-memory cloud.
pub struct Harness {
    /// The remote store.
    pub cloud: Arc<MemoryCloud>,
    /// The engine under test.
    pub engine: Arc<SyncEngine>,
    /// Errors the engine reported.
    pub sink: Arc<CollectingErrorSink>,
    /// Token storage of this device.
    pub storage: Arc<MemoryStorage>,
    dir: TempDir,
}

impl Harness {
    /// Creates a device with the default test configuration.
    pub fn new(schema: Schema) -> Self {
        Self::with_config(schema, |config| config)
    }

    /// Creates a device, letting the caller adjust the test configuration.
    pub fn with_config(schema: Schema, configure: impl FnOnce(SyncConfig) -> SyncConfig) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let cloud = Arc::new(MemoryCloud::with_asset_dir(dir.path().join("cloud")));
        Self::build(schema, cloud, dir, configure)
    }

    /// Creates a second device on the same cloud.
    pub fn another_device(&self, schema: Schema) -> Self {
        self.another_device_with(schema, |config| config)
    }

    /// Creates a second device on the same cloud with an adjusted
    /// configuration.
    pub fn another_device_with(
        &self,
        schema: Schema,
        configure: impl FnOnce(SyncConfig) -> SyncConfig,
    ) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::build(schema, Arc::clone(&self.cloud), dir, configure)
    }

    fn build(
        schema: Schema,
        cloud: Arc<MemoryCloud>,
        dir: TempDir,
        configure: impl FnOnce(SyncConfig) -> SyncConfig,
    ) -> Self {
        let store = LocalStore::new(schema).expect("Invalid fixture schema");
        let config = configure(
            SyncConfig::new(ZONE_NAME)
                .with_data_dir(dir.path().join("device"))
                .with_poll_interval(Duration::from_millis(5)),
        );
        let sink = Arc::new(CollectingErrorSink::new());
        let storage = Arc::new(MemoryStorage::new());
        let remote: Arc<dyn RemoteStore> = cloud.clone();
        let engine = SyncEngine::builder(store, remote)
            .with_config(config)
            .with_storage(storage.clone())
            .with_error_sink(sink.clone())
            .build()
            .expect("Failed to build engine");
        Self {
            cloud,
            engine: Arc::new(engine),
            sink,
            storage,
            dir,
        }
    }

    /// The private zone of this harness.
    pub fn zone() -> ZoneId {
        ZoneId::owned(ZONE_NAME)
    }

    /// The device's local store.
    pub fn store(&self) -> &LocalStore {
        self.engine.store()
    }

    /// Scratch directory of this device.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Creates the private zone remotely, as an earlier session would have.
    pub fn create_zone(&self) {
        self.cloud
            .create_zone_now(DatabaseScope::Private, &Self::zone())
            .expect("Failed to create zone");
    }

    /// Inserts an object from an application context.
    pub fn insert(&self, entity: &str, fields: &[(&str, Value)]) -> ObjectId {
        let mut ctx = self.store().new_context();
        let id = ctx.insert(entity).expect("Failed to insert");
        for (key, value) in fields {
            ctx.set(id, key, value.clone()).expect("Failed to set field");
        }
        ctx.save().expect("Failed to save");
        id
    }

    /// Sets one field from an application context.
    pub fn update(&self, id: ObjectId, key: &str, value: impl Into<Value>) {
        let mut ctx = self.store().new_context();
        ctx.set(id, key, value).expect("Failed to set field");
        ctx.save().expect("Failed to save");
    }

    /// Deletes an object from an application context.
    pub fn delete(&self, id: ObjectId) {
        let mut ctx = self.store().new_context();
        ctx.delete(id).expect("Failed to delete");
        ctx.save().expect("Failed to save");
    }

    /// Finds the objects of an entity whose text field equals `value`.
    pub fn find(&self, entity: &str, key: &str, value: &str) -> Vec<Object> {
        self.store()
            .fetch(entity, &Predicate::eq(key, value))
            .expect("Failed to fetch")
    }

    /// Finds exactly one object.
    pub fn find_one(&self, entity: &str, key: &str, value: &str) -> Object {
        let mut found = self.find(entity, key, value);
        assert_eq!(found.len(), 1, "expected one {entity} with {key} = {value}");
        found.remove(0)
    }

    /// Every record in the private zone.
    pub fn remote_records(&self) -> Vec<Record> {
        self.cloud.records(DatabaseScope::Private, &Self::zone())
    }

    /// Records of one type in the private zone.
    pub fn remote_records_of(&self, record_type: &str) -> Vec<Record> {
        self.remote_records()
            .into_iter()
            .filter(|r| r.record_type() == record_type)
            .collect()
    }
}
