//! The sync engine facade.

use crate::attributes::SyncSchema;
use crate::cache::CacheManager;
use crate::config::SyncConfig;
use crate::convert::Converter;
use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::events::{ErrorSink, SyncEvent, TracingErrorSink};
use crate::graph::{DependencyGraph, GraphOrder};
use crate::pause::PauseGate;
use crate::pull::{PullReport, Puller};
use crate::push::{PushReport, Pusher};
use crate::setup;
use crate::shared::Shared;
use crate::state::{SyncState, SyncStats};
use crate::tokens::{ChangeTokenStore, KeyValueStorage, MemoryStorage};
use parking_lot::{Mutex, RwLock};
use skysync_cloud::{DatabaseScope, RemoteStore, ZoneId};
use skysync_store::{ContextOrigin, LocalStore, SaveEvent, SavePhase};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of a pull followed by a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Pull half.
    pub pull: PullReport,
    /// Push half.
    pub push: PushReport,
}

/// Builds a [`SyncEngine`].
pub struct SyncEngineBuilder {
    store: LocalStore,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    storage: Option<Arc<dyn KeyValueStorage>>,
    sink: Option<Arc<dyn ErrorSink>>,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets where change tokens are persisted. Defaults to memory.
    pub fn with_storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Sets the error-reporting collaborator. Defaults to [`TracingErrorSink`].
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resolves the schema, loads the change tokens and subscribes to the
    /// local change feed.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let config = Arc::new(self.config);
        let schema = SyncSchema::resolve(self.store.schema(), &config.attributes);
        for entity in schema.excluded() {
            info!(entity = %entity, "entity excluded from sync");
        }
        let graph = DependencyGraph::from_schema(self.store.schema(), &schema).analyze();
        if graph.is_cyclic() {
            debug!(cyclic = ?graph.cyclic, passes = graph.passes(), "cyclic entity graph");
        }
        std::fs::create_dir_all(&config.temp_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let tokens = ChangeTokenStore::load(storage.as_ref(), &config.token_storage_key);
        let feed = self.store.subscribe();
        let (events, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            converter: Converter::new(Arc::new(schema), Arc::clone(&config)),
            store: self.store,
            remote: self.remote,
            config,
            graph,
            tokens,
            storage,
            pause: PauseGate::new(),
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingErrorSink)),
            events,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            identity_lock: Mutex::new(()),
        });

        Ok(SyncEngine {
            pusher: Pusher::new(Arc::clone(&shared)),
            puller: Puller::new(Arc::clone(&shared)),
            cache: CacheManager::new(Arc::clone(&shared)),
            feed: tokio::sync::Mutex::new(feed),
            provisions: Mutex::new(Vec::new()),
            shared,
        })
    }
}

enum Wake {
    Event(Option<SaveEvent>),
    Resumed,
}

/// Keeps a local store and a remote store in sync.
///
/// Local saves are picked up from the store's change feed, either by
/// [`SyncEngine::spawn`] or by calling [`SyncEngine::process_local_changes`].
/// Pulls run on demand.
pub struct SyncEngine {
    shared: Arc<Shared>,
    pusher: Pusher,
    puller: Puller,
    cache: Arc<CacheManager>,
    feed: tokio::sync::Mutex<UnboundedReceiver<SaveEvent>>,
    /// Zones whose provisioning was held back by a pause.
    provisions: Mutex<Vec<(DatabaseScope, ZoneId)>>,
}

impl SyncEngine {
    /// Starts building an engine for `store` and `remote`.
    pub fn builder(store: LocalStore, remote: Arc<dyn RemoteStore>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            store,
            remote,
            config: SyncConfig::default(),
            storage: None,
            sink: None,
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// The asset cache manager.
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// The global pause gate.
    pub fn pause(&self) -> &Arc<PauseGate> {
        &self.shared.pause
    }

    /// The change tokens.
    pub fn tokens(&self) -> &ChangeTokenStore {
        &self.shared.tokens
    }

    /// The resolved sync schema.
    pub fn sync_schema(&self) -> &SyncSchema {
        self.shared.converter.schema()
    }

    /// The analysed dependency graph.
    pub fn graph(&self) -> &GraphOrder {
        &self.shared.graph
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// The local store.
    pub fn store(&self) -> &LocalStore {
        &self.shared.store
    }

    /// Returns true if local changes wait for the pause gate to reopen.
    pub fn has_deferred_changes(&self) -> bool {
        self.pusher.has_deferred()
    }

    /// Re-drives interrupted cache transfers and pulls.
    pub async fn start(&self) -> PullReport {
        info!(zone = %self.shared.config.zone_name, "starting sync engine");
        self.cache.recover();
        self.pull().await
    }

    /// Pulls every configured database, provisioning zones found missing.
    pub async fn pull(&self) -> PullReport {
        let mut report = self.puller.pull().await;
        let zones = std::mem::take(&mut report.needs_provision);
        let mut push = PushReport::default();
        self.provision_all(zones, &mut push).await;
        report.errors += push.errors;
        report
    }

    /// Drains the local change feed and pushes what it carries.
    pub async fn process_local_changes(&self) -> PushReport {
        let mut report = PushReport::default();
        let mut feed = self.feed.lock().await;
        while let Ok(event) = feed.try_recv() {
            report.merge(self.handle_event(&event).await);
        }
        drop(feed);
        self.finish_push(report).await
    }

    /// Uploads every sync-enabled object, ignoring known change tags.
    pub async fn upload_all(&self) -> PushReport {
        let report = self.pusher.upload_all(None).await;
        self.finish_push(report).await
    }

    /// Pushes changes deferred while sync was paused.
    pub async fn flush(&self) -> PushReport {
        let report = self.pusher.flush_deferred().await;
        self.finish_push(report).await
    }

    /// Creates a zone with its subscriptions and uploads its objects.
    pub async fn provision(&self, scope: DatabaseScope, zone: &ZoneId) -> SyncResult<PushReport> {
        setup::provision(&self.shared, &self.pusher, scope, zone).await
    }

    /// Pulls, then pushes pending local changes.
    pub async fn sync(&self) -> SyncReport {
        let pull = self.pull().await;
        let mut push = self.process_local_changes().await;
        push.merge(self.flush().await);
        SyncReport { pull, push }
    }

    /// Re-drives work held back by a pause: deferred pushes, a pull and the
    /// cache transfers.
    pub async fn resume(&self) -> SyncReport {
        info!("resuming sync after pause");
        let push = self.flush().await;
        let pull = self.pull().await;
        self.cache.recover();
        SyncReport { pull, push }
    }

    /// Runs the engine on a background task until the task is aborted.
    ///
    /// The task owns the change feed while it waits; do not combine it with
    /// [`SyncEngine::process_local_changes`].
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        info!("sync engine running");
        loop {
            let wake = {
                let mut feed = self.feed.lock().await;
                tokio::select! {
                    event = feed.recv() => Wake::Event(event),
                    _ = self.shared.pause.resumed() => Wake::Resumed,
                }
            };
            match wake {
                Wake::Event(Some(event)) => {
                    let report = self.handle_event(&event).await;
                    self.finish_push(report).await;
                }
                Wake::Event(None) => break,
                Wake::Resumed => {
                    self.resume().await;
                }
            }
        }
        info!("change feed closed, sync engine stopped");
    }

    async fn handle_event(&self, event: &SaveEvent) -> PushReport {
        match event.phase {
            SavePhase::WillSave => {
                if event.origin == ContextOrigin::Application {
                    self.pusher.will_save(event);
                }
                PushReport::default()
            }
            SavePhase::DidSave => {
                self.cache.observe(event);
                if event.origin == ContextOrigin::Application {
                    self.pusher.did_save(event).await
                } else {
                    PushReport::default()
                }
            }
        }
    }

    async fn finish_push(&self, mut report: PushReport) -> PushReport {
        let zones = std::mem::take(&mut report.needs_provision);
        self.provision_all(zones, &mut report).await;
        report
    }

    /// Provisions each zone once. Failures of the follow-up upload stay in
    /// the merged report instead of triggering another round.
    async fn provision_all(&self, mut zones: Vec<(DatabaseScope, ZoneId)>, report: &mut PushReport) {
        let held = std::mem::take(&mut *self.provisions.lock());
        for held in held {
            if !zones.contains(&held) {
                zones.push(held);
            }
        }
        for (scope, zone) in zones {
            match setup::provision(&self.shared, &self.pusher, scope, &zone).await {
                Ok(upload) => report.merge(upload),
                Err(e) if is_pause(&e) => {
                    debug!(%zone, error = %e, "provisioning deferred by pause");
                    self.provisions.lock().push((scope, zone));
                    report.deferred = true;
                }
                Err(e) => {
                    // Remote failures were already classified and reported.
                    if e.as_remote().is_none() {
                        self.shared.report(&e, ErrorModule::PushToCloud);
                    }
                    warn!(%scope, %zone, error = %e, "provisioning failed");
                    report.errors += 1;
                }
            }
        }
    }
}

/// The gate was closed, or the attempt itself was throttled and closed it.
fn is_pause(error: &SyncError) -> bool {
    matches!(error, SyncError::Paused { .. }) || error.as_remote().is_some_and(|e| e.is_throttle())
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("shared", &self.shared)
            .field("pusher", &self.pusher)
            .field("cache", &self.cache)
            .finish()
    }
}
