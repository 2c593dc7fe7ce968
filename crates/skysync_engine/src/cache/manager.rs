//! Asset cache manager.
//!
//! Watches the change feed for writes to the cache state of cacheable
//! objects and drives the matching transfer:
//!
//! ```text
//! local  -> upload   -> uploading   -> cached | local
//! remote -> download -> downloading -> cached | remote
//! any    -> unload   -> remote
//! ```
//!
//! Transfers are long-lived remote operations whose ID is stored on the
//! object, so a restarted process reattaches instead of starting over. All
//! writes of the manager go through one writer lock and a sync context.

use super::state::{CacheState, RemoteStatus};
use crate::attributes::CacheAttributes;
use crate::convert::Placement;
use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::shared::Shared;
use parking_lot::Mutex;
use skysync_cloud::{
    Asset, DatabaseScope, LongLivedRequest, OperationId, OperationStatus, Record, RecordValue,
    RemoteError,
};
use skysync_store::{Context, Object, ObjectId, Predicate, SaveEvent, SavePhase, StoreError, Value};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Upload,
    Download,
}

impl Transfer {
    fn module(self) -> ErrorModule {
        match self {
            Transfer::Upload => ErrorModule::CacheToCloud,
            Transfer::Download => ErrorModule::CacheFromCloud,
        }
    }
}

fn state_of(object: &Object, cache: &CacheAttributes) -> Option<CacheState> {
    object.text(&cache.cache_state).and_then(CacheState::parse)
}

/// Drives the cache state machine of cacheable objects.
pub struct CacheManager {
    shared: Arc<Shared>,
    writer: Mutex<()>,
    active: Mutex<HashSet<ObjectId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            writer: Mutex::new(()),
            active: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Current cache state of an object.
    pub fn state(&self, id: ObjectId) -> Option<CacheState> {
        let object = self.shared.store.get(id)?;
        let cache = self.attributes(object.entity()).ok()?;
        state_of(&object, &cache)
    }

    /// Current remote availability of an object's payload.
    pub fn remote_status(&self, id: ObjectId) -> Option<RemoteStatus> {
        let object = self.shared.store.get(id)?;
        let cache = self.attributes(object.entity()).ok()?;
        object.text(&cache.remote_status).and_then(RemoteStatus::parse)
    }

    /// Requests a transition by writing the cache state from an application
    /// context, the same way an application would.
    pub fn request(&self, id: ObjectId, state: CacheState) -> SyncResult<()> {
        let object = self
            .shared
            .store
            .get(id)
            .ok_or(StoreError::ObjectNotFound(id))?;
        let cache = self.attributes(object.entity())?;
        let mut ctx = self.shared.store.new_context();
        ctx.set(id, &cache.cache_state, state.as_str())?;
        ctx.save()?;
        Ok(())
    }

    /// Where the local payload of an object lives.
    ///
    /// Mints the object's record identity if it has none yet.
    pub fn payload_path(&self, id: ObjectId) -> SyncResult<PathBuf> {
        let placement = self.placement(id)?;
        Ok(self.shared.config.cache_dir.join(&placement.record.id().name))
    }

    /// Writes the local payload of an object.
    pub fn store_payload(&self, id: ObjectId, payload: &[u8]) -> SyncResult<PathBuf> {
        let path = self.payload_path(id)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, payload)?;
        Ok(path)
    }

    /// Reacts to a completed save.
    pub(crate) fn observe(self: &Arc<Self>, event: &SaveEvent) {
        if event.phase != SavePhase::DidSave {
            return;
        }
        let schema = self.shared.converter.schema();

        for snapshot in &event.changes.deleted {
            let Some(entity) = schema.entity(snapshot.entity()) else {
                continue;
            };
            if entity.cache.is_none() {
                continue;
            }
            if let Some(name) = snapshot.text(&entity.service.record_name) {
                self.remove_payload(name);
            }
        }

        let mut fresh = Vec::new();
        let mut triggered = Vec::new();
        for id in &event.changes.inserted {
            let Some(object) = self.shared.store.get(*id) else {
                continue;
            };
            let Some(entity) = schema.entity(object.entity()) else {
                continue;
            };
            let Some(cache) = &entity.cache else {
                continue;
            };
            if object.text(&entity.service.record_name).is_none()
                || object.value(&cache.cache_state).is_none_or(Value::is_null)
            {
                fresh.push(*id);
            }
            triggered.push(*id);
        }
        for (id, keys) in &event.changes.updated {
            let Some(object) = self.shared.store.get(*id) else {
                continue;
            };
            let Ok(cache) = self.attributes(object.entity()) else {
                continue;
            };
            if keys.contains(&cache.cache_state) || keys.contains(&cache.remote_status) {
                triggered.push(*id);
            }
        }

        if !fresh.is_empty() {
            if let Err(e) = self.init(&fresh) {
                self.shared.report(&e, ErrorModule::CacheToCloud);
            }
        }
        for id in triggered {
            self.dispatch(id);
        }
    }

    /// Gives new cacheable objects a record name and the `local` state.
    fn init(&self, ids: &[ObjectId]) -> SyncResult<()> {
        let _identity = self.shared.identity_lock.lock();
        let _writer = self.writer.lock();
        let mut ctx = self.shared.store.new_background_context();
        for id in ids {
            let Some(object) = ctx.object(*id) else {
                continue;
            };
            let cache = self.attributes(object.entity())?;
            self.shared.converter.mint_identity(&mut ctx, *id)?;
            if object.value(&cache.cache_state).is_none_or(Value::is_null) {
                ctx.set(*id, &cache.cache_state, CacheState::Local.as_str())?;
            }
        }
        ctx.save()?;
        Ok(())
    }

    /// Starts whatever the current state requests.
    fn dispatch(self: &Arc<Self>, id: ObjectId) {
        match self.state(id) {
            Some(CacheState::Upload) => self.spawn(id, Transfer::Upload),
            Some(CacheState::Download) => {
                if self.remote_status(id) == Some(RemoteStatus::Available) {
                    self.spawn(id, Transfer::Download);
                } else {
                    debug!(%id, "download waits for remote availability");
                }
            }
            Some(CacheState::Unload) => {
                if let Err(e) = self.unload(id) {
                    self.shared.report(&e, ErrorModule::CacheFromCloud);
                }
            }
            _ => {}
        }
    }

    fn spawn(self: &Arc<Self>, id: ObjectId, transfer: Transfer) {
        if !self.active.lock().insert(id) {
            trace!(%id, ?transfer, "transfer already running");
            return;
        }
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = match transfer {
                Transfer::Upload => manager.upload(id).await,
                Transfer::Download => manager.download(id).await,
            };
            manager.active.lock().remove(&id);
            if let Err(e) = result {
                manager.shared.report(&e, transfer.module());
            }
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Re-drives transfers interrupted by a previous process exit and
    /// re-arms failed uploads. Returns the number of objects picked up.
    pub(crate) fn recover(self: &Arc<Self>) -> usize {
        let mut driven = 0;
        for (entity, cache) in self.shared.converter.schema().cacheable() {
            let objects = match self.shared.store.fetch(&entity.name, &Predicate::All) {
                Ok(objects) => objects,
                Err(e) => {
                    self.shared.report(&e.into(), ErrorModule::CacheToCloud);
                    continue;
                }
            };
            for object in objects {
                match state_of(&object, cache) {
                    Some(CacheState::Upload | CacheState::Uploading) => {
                        self.spawn(object.id(), Transfer::Upload);
                        driven += 1;
                    }
                    Some(CacheState::Download | CacheState::Downloading) => {
                        self.spawn(object.id(), Transfer::Download);
                        driven += 1;
                    }
                    Some(CacheState::Unload) => {
                        self.dispatch(object.id());
                        driven += 1;
                    }
                    _ => {}
                }
            }
        }
        match self.retry_failed_uploads() {
            Ok(rearmed) => driven += rearmed,
            Err(e) => self.shared.report(&e, ErrorModule::CacheToCloud),
        }
        if driven > 0 {
            info!(driven, "recovered cache transfers");
        }
        driven
    }

    /// Moves objects whose upload failed back to `upload` and starts them.
    pub fn retry_failed_uploads(self: &Arc<Self>) -> SyncResult<usize> {
        let mut rearmed = Vec::new();
        {
            let _writer = self.writer.lock();
            let mut ctx = self.shared.store.new_background_context();
            for (entity, cache) in self.shared.converter.schema().cacheable() {
                let failed = Predicate::eq(cache.cache_state.as_str(), CacheState::Local.as_str())
                    .and(Predicate::not_null(cache.last_error.as_str()));
                for object in ctx.fetch(&entity.name, &failed)? {
                    ctx.set(object.id(), &cache.cache_state, CacheState::Upload.as_str())?;
                    ctx.set(object.id(), &cache.last_error, Value::Null)?;
                    rearmed.push(object.id());
                }
            }
            ctx.save()?;
        }
        for id in &rearmed {
            self.spawn(*id, Transfer::Upload);
        }
        Ok(rearmed.len())
    }

    /// Waits until every spawned transfer finished.
    pub async fn wait_idle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "cache transfer task failed");
                }
            }
        }
    }

    /// Number of transfers currently running.
    pub fn active_transfers(&self) -> usize {
        self.active.lock().len()
    }

    async fn upload(&self, id: ObjectId) -> SyncResult<()> {
        let shared = &self.shared;
        let Some(object) = shared.store.get(id) else {
            return Ok(());
        };
        let cache = self.attributes(object.entity())?;
        if !matches!(
            state_of(&object, &cache),
            Some(CacheState::Upload | CacheState::Uploading)
        ) {
            return Ok(());
        }
        if let Err(e) = shared.pause.check() {
            debug!(%id, error = %e, "upload waits for the pause to lift");
            return Ok(());
        }
        let placement = self.placement(id)?;

        let operation = match object.text(&cache.operation_id) {
            Some(operation) => {
                debug!(%id, operation, "reattaching to upload");
                self.transition(id, CacheState::Uploading, |_, _| Ok(()))?;
                OperationId::new(operation)
            }
            None => {
                let path = self.payload_path(id)?;
                if !path.exists() {
                    let missing = io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no payload at {}", path.display()),
                    );
                    return self.fail(id, Transfer::Upload, missing.into());
                }
                self.transition(id, CacheState::Uploading, |ctx, cache| {
                    ctx.set(id, &cache.upload_progress, 0.0)?;
                    Ok(())
                })?;
                let mut record = placement.record.system_fields_only();
                record.set(&cache.asset_field, RecordValue::Asset(Asset::new(path)));
                record.set(
                    &cache.remote_status,
                    RecordValue::Text(RemoteStatus::Available.as_str().into()),
                );
                let request = LongLivedRequest::Upload {
                    scope: placement.scope,
                    record,
                };
                match shared.remote.start_operation(request).await {
                    Ok(operation) => {
                        self.write(id, |ctx, _, cache| {
                            ctx.set(id, &cache.operation_id, operation.as_str())?;
                            Ok(())
                        })?;
                        operation
                    }
                    Err(e) => return self.fail(id, Transfer::Upload, e.into()),
                }
            }
        };

        loop {
            let status = match shared.remote.poll_operation(&operation).await {
                Ok(status) => status,
                Err(e) => return self.fail(id, Transfer::Upload, e.into()),
            };
            match status {
                OperationStatus::Pending { progress } => {
                    self.raise_progress(id, Transfer::Upload, progress)?;
                    tokio::time::sleep(shared.config.poll_interval).await;
                }
                OperationStatus::Uploaded(record) => {
                    return self.finish_upload(id, placement.scope, &record);
                }
                OperationStatus::Downloaded(_) => {
                    let error = RemoteError::Internal("upload finished as a download".into());
                    return self.fail(id, Transfer::Upload, error.into());
                }
                OperationStatus::Failed(e) => return self.fail(id, Transfer::Upload, e.into()),
            }
        }
    }

    async fn download(&self, id: ObjectId) -> SyncResult<()> {
        let shared = &self.shared;
        let Some(object) = shared.store.get(id) else {
            return Ok(());
        };
        let cache = self.attributes(object.entity())?;
        if !matches!(
            state_of(&object, &cache),
            Some(CacheState::Download | CacheState::Downloading)
        ) {
            return Ok(());
        }
        if object.text(&cache.remote_status).and_then(RemoteStatus::parse)
            != Some(RemoteStatus::Available)
        {
            debug!(%id, "download waits for remote availability");
            return Ok(());
        }
        if let Err(e) = shared.pause.check() {
            debug!(%id, error = %e, "download waits for the pause to lift");
            return Ok(());
        }
        let Some(placement) = shared.converter.placement(&object)? else {
            let error = RemoteError::UnknownItem(format!("object {id} has no record"));
            return self.fail(id, Transfer::Download, error.into());
        };

        let operation = match object.text(&cache.operation_id) {
            Some(operation) => {
                debug!(%id, operation, "reattaching to download");
                self.transition(id, CacheState::Downloading, |_, _| Ok(()))?;
                OperationId::new(operation)
            }
            None => {
                self.transition(id, CacheState::Downloading, |ctx, cache| {
                    ctx.set(id, &cache.download_progress, 0.0)?;
                    Ok(())
                })?;
                let request = LongLivedRequest::Download {
                    scope: placement.scope,
                    record_id: placement.record.id().clone(),
                    field: cache.asset_field.clone(),
                };
                match shared.remote.start_operation(request).await {
                    Ok(operation) => {
                        self.write(id, |ctx, _, cache| {
                            ctx.set(id, &cache.operation_id, operation.as_str())?;
                            Ok(())
                        })?;
                        operation
                    }
                    Err(e) => return self.fail(id, Transfer::Download, e.into()),
                }
            }
        };

        loop {
            let status = match shared.remote.poll_operation(&operation).await {
                Ok(status) => status,
                Err(e) => return self.fail(id, Transfer::Download, e.into()),
            };
            match status {
                OperationStatus::Pending { progress } => {
                    self.raise_progress(id, Transfer::Download, progress)?;
                    tokio::time::sleep(shared.config.poll_interval).await;
                }
                OperationStatus::Downloaded(path) => {
                    let target = shared.config.cache_dir.join(&placement.record.id().name);
                    if let Err(e) = move_file(&path, &target) {
                        return self.fail(id, Transfer::Download, e.into());
                    }
                    return self.finish_download(id);
                }
                OperationStatus::Uploaded(_) => {
                    let error = RemoteError::Internal("download finished as an upload".into());
                    return self.fail(id, Transfer::Download, error.into());
                }
                OperationStatus::Failed(e) => return self.fail(id, Transfer::Download, e.into()),
            }
        }
    }

    /// Evicts the local payload. Always ends in `remote`.
    fn unload(&self, id: ObjectId) -> SyncResult<()> {
        let Some(object) = self.shared.store.get(id) else {
            return Ok(());
        };
        let entity = self.shared.converter.schema().require(object.entity())?;
        if let Some(name) = object.text(&entity.service.record_name) {
            self.remove_payload(name);
        }
        self.write(id, |ctx, object, cache| {
            if state_of(object, cache) == Some(CacheState::Unload) {
                ctx.set(id, &cache.cache_state, CacheState::Remote.as_str())?;
            }
            ctx.set(id, &cache.upload_progress, 0.0)?;
            ctx.set(id, &cache.download_progress, 0.0)?;
            ctx.set(id, &cache.operation_id, Value::Null)?;
            Ok(())
        })?;
        debug!(%id, "payload unloaded");
        Ok(())
    }

    fn finish_upload(&self, id: ObjectId, scope: DatabaseScope, record: &Record) -> SyncResult<()> {
        let converter = &self.shared.converter;
        self.write(id, |ctx, object, cache| {
            // An unload issued meanwhile wins over the finished upload.
            if matches!(
                state_of(object, cache),
                Some(CacheState::Upload | CacheState::Uploading)
            ) {
                ctx.set(id, &cache.cache_state, CacheState::Cached.as_str())?;
                ctx.set(id, &cache.upload_progress, 1.0)?;
            }
            ctx.set(id, &cache.remote_status, RemoteStatus::Available.as_str())?;
            ctx.set(id, &cache.operation_id, Value::Null)?;
            ctx.set(id, &cache.last_error, Value::Null)?;
            converter.write_system_fields(ctx, id, scope, record)
        })?;
        info!(%id, record = %record.id(), "asset uploaded");
        Ok(())
    }

    fn finish_download(&self, id: ObjectId) -> SyncResult<()> {
        self.write(id, |ctx, object, cache| {
            if matches!(
                state_of(object, cache),
                Some(CacheState::Download | CacheState::Downloading)
            ) {
                ctx.set(id, &cache.cache_state, CacheState::Cached.as_str())?;
                ctx.set(id, &cache.download_progress, 1.0)?;
            }
            ctx.set(id, &cache.operation_id, Value::Null)?;
            ctx.set(id, &cache.last_error, Value::Null)?;
            Ok(())
        })?;
        info!(%id, "asset downloaded");
        Ok(())
    }

    /// Records a failed transfer on the object and reports it.
    ///
    /// Failed uploads fall back to `local` with the error message kept, so
    /// the next retry scan picks them up. Failed downloads fall back to
    /// `remote`. Throttles close the pause gate instead of being reported.
    fn fail(&self, id: ObjectId, transfer: Transfer, error: SyncError) -> SyncResult<()> {
        let throttled = error.as_remote().is_some_and(RemoteError::is_throttle);
        if throttled {
            self.shared
                .pause_for(error.as_remote().and_then(RemoteError::retry_after));
        } else if let Some(delay) = error.as_remote().and_then(RemoteError::retry_after) {
            self.shared.pause_for(Some(delay));
        }
        let message = error.to_string();
        self.write(id, |ctx, object, cache| {
            let state = state_of(object, cache);
            let (active, fallback, progress) = match transfer {
                Transfer::Upload => (
                    matches!(state, Some(CacheState::Upload | CacheState::Uploading)),
                    CacheState::Local,
                    &cache.upload_progress,
                ),
                Transfer::Download => (
                    matches!(state, Some(CacheState::Download | CacheState::Downloading)),
                    CacheState::Remote,
                    &cache.download_progress,
                ),
            };
            if active {
                ctx.set(id, &cache.cache_state, fallback.as_str())?;
            }
            ctx.set(id, &cache.last_error, message.as_str())?;
            ctx.set(id, &cache.operation_id, Value::Null)?;
            ctx.set(id, progress, 0.0)?;
            Ok(())
        })?;
        warn!(%id, ?transfer, error = %message, "cache transfer failed");
        let cancelled = matches!(error.as_remote(), Some(RemoteError::OperationCancelled));
        if !throttled && !cancelled {
            self.shared.report(&error, transfer.module());
        }
        Ok(())
    }

    /// Stores a higher progress fraction; progress never goes backwards.
    fn raise_progress(&self, id: ObjectId, transfer: Transfer, progress: f64) -> SyncResult<()> {
        self.write(id, |ctx, object, cache| {
            let (running, key) = match transfer {
                Transfer::Upload => (CacheState::Uploading, &cache.upload_progress),
                Transfer::Download => (CacheState::Downloading, &cache.download_progress),
            };
            if state_of(object, cache) != Some(running) {
                return Ok(());
            }
            let current = object.value(key).and_then(Value::as_double).unwrap_or(0.0);
            let progress = progress.clamp(0.0, 1.0);
            if progress > current {
                ctx.set(id, key, progress)?;
            }
            Ok(())
        })
    }

    /// Moves the cache state to `to` and applies `f` in the same write.
    fn transition<F>(&self, id: ObjectId, to: CacheState, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut Context, &CacheAttributes) -> SyncResult<()>,
    {
        self.write(id, |ctx, object, cache| {
            match state_of(object, cache) {
                Some(from) if from == to => {}
                Some(from) => {
                    from.check_transition(to)?;
                    ctx.set(id, &cache.cache_state, to.as_str())?;
                }
                None => ctx.set(id, &cache.cache_state, to.as_str())?,
            }
            f(ctx, cache)
        })
    }

    /// Single-writer access to one object's cache fields.
    fn write<F>(&self, id: ObjectId, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut Context, &Object, &CacheAttributes) -> SyncResult<()>,
    {
        let _writer = self.writer.lock();
        let mut ctx = self.shared.store.new_background_context();
        let Some(object) = ctx.object(id) else {
            return Ok(());
        };
        let cache = self.attributes(object.entity())?;
        f(&mut ctx, &object, &cache)?;
        ctx.save()?;
        Ok(())
    }

    fn placement(&self, id: ObjectId) -> SyncResult<Placement> {
        let object = self
            .shared
            .store
            .get(id)
            .ok_or(StoreError::ObjectNotFound(id))?;
        if let Some(placement) = self.shared.converter.placement(&object)? {
            return Ok(placement);
        }
        let _identity = self.shared.identity_lock.lock();
        let mut ctx = self.shared.store.new_background_context();
        let placement = self.shared.converter.mint_identity(&mut ctx, id)?;
        ctx.save()?;
        Ok(placement)
    }

    fn attributes(&self, entity: &str) -> SyncResult<CacheAttributes> {
        self.shared
            .converter
            .schema()
            .require(entity)?
            .cache
            .clone()
            .ok_or_else(|| SyncError::NotCacheable {
                entity: entity.to_string(),
            })
    }

    fn remove_payload(&self, record_name: &str) {
        let path = self.shared.config.cache_dir.join(record_name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed cached payload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove cached payload"),
        }
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("active", &self.active.lock().len())
            .finish()
    }
}

/// Moves a file, falling back to copy and remove across file systems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("download");
        std::fs::write(&from, b"payload").unwrap();
        let to = dir.path().join("cache").join("nested").join("rec-1");

        move_file(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(std::fs::read(&to).unwrap(), b"payload");
    }

    #[test]
    fn transfers_report_to_their_module() {
        assert_eq!(Transfer::Upload.module(), ErrorModule::CacheToCloud);
        assert_eq!(Transfer::Download.module(), ErrorModule::CacheFromCloud);
    }
}
