//! Push pipeline.
//!
//! Application saves are snapshotted on will-save and pushed on did-save:
//!
//! 1. Objects without a record identity get one, saved in a sync context
//! 2. Changed objects are converted to records, deletions to record IDs
//! 3. Work is grouped by partition and chunked into atomic writes
//! 4. Partitions are submitted concurrently; chunks of one partition in order
//! 5. Fresh system fields are written back in a sync context
//!
//! The caller's save never waits for any of this. While the pause gate is
//! closed, changes are folded into a deferred change set that is pushed when
//! the gate reopens.

use crate::convert::{Outbound, Placement};
use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::recovery::RecoveryAction;
use crate::shared::Shared;
use crate::state::SyncState;
use parking_lot::Mutex;
use skysync_cloud::{
    DatabaseScope, ModifyResult, Partition, Record, RecordId, RemoteError, RemoteStore, SavePolicy,
    ZoneId,
};
use skysync_store::{ChangeSet, ContextOrigin, Object, ObjectId, Predicate, SaveEvent, SavePhase, SequenceNumber};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Records saved remotely.
    pub saved: usize,
    /// Records deleted remotely.
    pub deleted: usize,
    /// Stale writes rebased onto the server version and resubmitted.
    pub conflicts: usize,
    /// Errors reported to the error sink.
    pub errors: usize,
    /// Some work was deferred until the pause gate reopens.
    pub deferred: bool,
    /// Zones that must be provisioned before the work can succeed.
    pub needs_provision: Vec<(DatabaseScope, ZoneId)>,
}

impl PushReport {
    /// Folds another report into this one.
    pub fn merge(&mut self, other: PushReport) {
        self.saved += other.saved;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.errors += other.errors;
        self.deferred |= other.deferred;
        for zone in other.needs_provision {
            if !self.needs_provision.contains(&zone) {
                self.needs_provision.push(zone);
            }
        }
    }
}

struct PendingSave {
    id: ObjectId,
    keys: Option<BTreeSet<String>>,
    outbound: Outbound,
}

#[derive(Default)]
struct Chunk {
    saves: Vec<PendingSave>,
    deletes: Vec<(RecordId, Object)>,
}

impl Chunk {
    fn len(&self) -> usize {
        self.saves.len() + self.deletes.len()
    }

    /// The work of this chunk as a change set, for requeueing.
    fn into_changes(self, into: &mut ChangeSet) {
        for save in self.saves {
            match save.keys {
                Some(keys) => {
                    into.updated.entry(save.id).or_default().extend(keys);
                }
                None => {
                    into.inserted.insert(save.id);
                }
            }
        }
        into.deleted.extend(self.deletes.into_iter().map(|(_, object)| object));
    }
}

struct BatchOutcome {
    partition: Partition,
    saved: Vec<(ObjectId, Record)>,
    deleted: usize,
    conflicts: usize,
    /// Records the server refused; their siblings were sent without them.
    rejected: Vec<(RecordId, RemoteError)>,
    failure: Option<(RemoteError, ChangeSet)>,
}

struct ChunkResult {
    result: ModifyResult,
    conflicts: usize,
    rejected: Vec<(RecordId, RemoteError)>,
}

/// The push side of the engine.
pub(crate) struct Pusher {
    shared: Arc<Shared>,
    snapshots: Mutex<BTreeMap<SequenceNumber, Arc<ChangeSet>>>,
    deferred: Mutex<ChangeSet>,
    gate: tokio::sync::Mutex<()>,
}

impl Pusher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            snapshots: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(ChangeSet::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshots an application save before it is applied.
    pub(crate) fn will_save(&self, event: &SaveEvent) {
        if event.phase != SavePhase::WillSave
            || event.origin != ContextOrigin::Application
            || event.changes.is_empty()
        {
            return;
        }
        self.snapshots
            .lock()
            .insert(event.sequence, Arc::clone(&event.changes));
    }

    /// Pushes the snapshot taken for a completed save.
    pub(crate) async fn did_save(&self, event: &SaveEvent) -> PushReport {
        let snapshot = self.snapshots.lock().remove(&event.sequence);
        match snapshot {
            Some(changes) => self.push(ChangeSet::clone(&changes), false).await,
            None => PushReport::default(),
        }
    }

    /// Returns true if work waits for the pause gate.
    pub(crate) fn has_deferred(&self) -> bool {
        !self.deferred.lock().is_empty()
    }

    /// Pushes deferred work.
    pub(crate) async fn flush_deferred(&self) -> PushReport {
        self.push(ChangeSet::default(), false).await
    }

    /// Uploads every sync-enabled object, optionally only those of one zone.
    ///
    /// Known change tags are ignored; records that exist remotely are
    /// rebased onto the server version.
    pub(crate) async fn upload_all(&self, zone: Option<(DatabaseScope, &ZoneId)>) -> PushReport {
        let mut work = ChangeSet::default();
        for entity in self.shared.converter.schema().entities() {
            let objects = match self.shared.store.fetch(&entity.name, &Predicate::All) {
                Ok(objects) => objects,
                Err(e) => {
                    self.shared.report(&e.into(), ErrorModule::PushToCloud);
                    continue;
                }
            };
            for object in objects {
                let in_zone = match zone {
                    None => true,
                    Some((scope, zone)) => match self.shared.converter.placement(&object) {
                        Ok(Some(p)) => p.scope == scope && &p.record.id().zone == zone,
                        Ok(None) => self.shared.converter.home_zone(entity) == (scope, zone.clone()),
                        Err(_) => false,
                    },
                };
                if in_zone {
                    work.inserted.insert(object.id());
                }
            }
        }
        info!(objects = work.inserted.len(), "uploading all objects");
        self.push(work, true).await
    }

    async fn push(&self, changes: ChangeSet, fresh: bool) -> PushReport {
        let _guard = self.gate.lock().await;
        let work = {
            let mut deferred = self.deferred.lock();
            if self.shared.pause.is_paused() {
                deferred.merge(changes);
                debug!(pending = deferred.len(), "push deferred while paused");
                return PushReport {
                    deferred: true,
                    ..PushReport::default()
                };
            }
            let mut work = std::mem::take(&mut *deferred);
            work.merge(changes);
            work
        };
        if work.is_empty() {
            return PushReport::default();
        }
        self.run(work, fresh).await
    }

    async fn run(&self, work: ChangeSet, fresh: bool) -> PushReport {
        let shared = &self.shared;
        shared.set_state(SyncState::Pushing);
        shared.emit(SyncEvent::WillSyncToCloud);
        let mut report = PushReport::default();

        let (saves, deletes) = self.select(&work);
        let minted = self.mint(&saves, &mut report);

        let batches = self.convert(saves, deletes, &minted, fresh, &mut report);
        let mut temp_files: Vec<PathBuf> = batches
            .values()
            .flat_map(|b| b.saves.iter().flat_map(|s| s.outbound.temp_files.clone()))
            .collect();
        let mut tasks = JoinSet::new();
        for (partition, batch) in batches {
            let remote = Arc::clone(&shared.remote);
            let size = shared.config.push_batch_size;
            let policy = shared.config.save_policy;
            tasks.spawn(submit(remote, partition, batch, size, policy));
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    let error = SyncError::Remote(RemoteError::Internal(format!("push task: {e}")));
                    shared.report(&error, ErrorModule::PushToCloud);
                    report.errors += 1;
                }
            }
        }

        if let Err(e) = self.write_back(&outcomes) {
            shared.report(&e, ErrorModule::PushToCloud);
            report.errors += 1;
        }
        temp_files.sort();
        temp_files.dedup();
        for path in temp_files {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove asset temp file");
                }
            }
        }

        for outcome in outcomes {
            report.saved += outcome.saved.len();
            report.deleted += outcome.deleted;
            report.conflicts += outcome.conflicts;
            for (record, error) in outcome.rejected {
                warn!(partition = %outcome.partition, %record, %error, "record rejected by the server");
                shared.report(&SyncError::Remote(error), ErrorModule::PushToCloud);
                report.errors += 1;
            }
            let Some((error, unsent)) = outcome.failure else {
                continue;
            };
            match shared.handle_remote_error(&error, &outcome.partition, ErrorModule::PushToCloud) {
                RecoveryAction::Pause(_) => {
                    self.deferred.lock().merge(unsent);
                    report.deferred = true;
                }
                RecoveryAction::Provision { scope, zone } => {
                    if !report.needs_provision.contains(&(scope, zone.clone())) {
                        report.needs_provision.push((scope, zone));
                    }
                }
                // Transient failures keep their work for the next flush.
                RecoveryAction::Surface if error.is_retryable() => {
                    self.deferred.lock().merge(unsent);
                    report.deferred = true;
                    report.errors += 1;
                }
                RecoveryAction::Surface => report.errors += 1,
                _ => {}
            }
        }

        {
            let mut stats = shared.stats.write();
            stats.records_pushed += report.saved as u64;
            stats.records_deleted += report.deleted as u64;
            stats.conflicts_resolved += report.conflicts as u64;
        }
        info!(
            saved = report.saved,
            deleted = report.deleted,
            conflicts = report.conflicts,
            errors = report.errors,
            "push finished"
        );
        shared.emit(SyncEvent::DidSyncToCloud);
        shared.settle(report.errors > 0);
        report
    }

    /// Converts the selected work into per-partition batches.
    fn convert(
        &self,
        saves: Vec<(ObjectId, Option<BTreeSet<String>>)>,
        deletes: Vec<(Placement, Object)>,
        minted: &HashMap<ObjectId, (Placement, bool)>,
        fresh: bool,
        report: &mut PushReport,
    ) -> BTreeMap<Partition, Chunk> {
        let shared = &self.shared;
        let mut batches: BTreeMap<Partition, Chunk> = BTreeMap::new();
        let ctx = shared.store.new_background_context();
        for (id, keys) in saves {
            let (Some(object), Some((placement, new))) = (ctx.object(id), minted.get(&id)) else {
                continue;
            };
            let base = if fresh {
                Placement {
                    scope: placement.scope,
                    record: Record::new(placement.record.record_type(), placement.record.id().clone()),
                }
            } else {
                placement.clone()
            };
            let convert_keys = if *new || fresh { None } else { keys.as_ref() };
            match shared.converter.to_record(&ctx, &object, base, convert_keys) {
                Ok(outbound) => {
                    batches
                        .entry(outbound.placement.partition())
                        .or_default()
                        .saves
                        .push(PendingSave { id, keys, outbound });
                }
                Err(e) => {
                    shared.report(&e, ErrorModule::PushToCloud);
                    report.errors += 1;
                }
            }
        }
        for (placement, snapshot) in deletes {
            batches
                .entry(placement.partition())
                .or_default()
                .deletes
                .push((placement.record.id().clone(), snapshot));
        }
        batches
    }

    /// Picks the objects and deletions that concern the remote store.
    fn select(
        &self,
        work: &ChangeSet,
    ) -> (
        Vec<(ObjectId, Option<BTreeSet<String>>)>,
        Vec<(Placement, Object)>,
    ) {
        let shared = &self.shared;
        let schema = shared.converter.schema();
        let mut saves = Vec::new();
        for id in &work.inserted {
            if let Some(object) = shared.store.get(*id) {
                if schema.is_enabled(object.entity()) {
                    saves.push((*id, None));
                }
            }
        }
        for (id, keys) in &work.updated {
            if let Some(object) = shared.store.get(*id) {
                if shared.converter.has_upload_changes(object.entity(), keys) {
                    saves.push((*id, Some(keys.clone())));
                }
            }
        }

        let mut deletes = Vec::new();
        for snapshot in &work.deleted {
            if !schema.is_enabled(snapshot.entity()) {
                continue;
            }
            match shared.converter.placement(snapshot) {
                Ok(Some(placement)) => deletes.push((placement, snapshot.clone())),
                // Never pushed, nothing to delete remotely.
                Ok(None) => {}
                Err(e) => shared.report(&e, ErrorModule::PushToCloud),
            }
        }
        (saves, deletes)
    }

    /// Ensures every object has a record identity.
    ///
    /// The flag is true for objects whose identity was minted just now.
    fn mint(
        &self,
        saves: &[(ObjectId, Option<BTreeSet<String>>)],
        report: &mut PushReport,
    ) -> HashMap<ObjectId, (Placement, bool)> {
        let shared = &self.shared;
        let _identity = shared.identity_lock.lock();
        let mut ctx = shared.store.new_background_context();
        let mut placements = HashMap::new();
        for (id, _) in saves {
            let Some(object) = ctx.object(*id) else {
                continue;
            };
            let result = match shared.converter.placement(&object) {
                Ok(Some(placement)) => Ok((placement, false)),
                Ok(None) => shared
                    .converter
                    .mint_identity(&mut ctx, *id)
                    .map(|placement| (placement, true)),
                Err(e) => Err(e),
            };
            match result {
                Ok(entry) => {
                    placements.insert(*id, entry);
                }
                Err(e) => {
                    shared.report(&e, ErrorModule::PushToCloud);
                    report.errors += 1;
                }
            }
        }
        if let Err(e) = ctx.save() {
            shared.report(&e.into(), ErrorModule::PushToCloud);
            report.errors += 1;
            placements.clear();
        }
        placements
    }

    fn write_back(&self, outcomes: &[BatchOutcome]) -> SyncResult<()> {
        let shared = &self.shared;
        let mut ctx = shared.store.new_background_context();
        for outcome in outcomes {
            for (id, record) in &outcome.saved {
                if ctx.exists(*id) {
                    shared
                        .converter
                        .write_system_fields(&mut ctx, *id, outcome.partition.scope(), record)?;
                }
            }
        }
        ctx.save()?;
        Ok(())
    }
}

impl std::fmt::Debug for Pusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pusher")
            .field("snapshots", &self.snapshots.lock().len())
            .field("deferred", &self.deferred.lock().len())
            .finish()
    }
}

/// Submits one partition's work chunk by chunk. Stops at the first failure
/// that concerns the whole partition and hands the unsent work back.
async fn submit(
    remote: Arc<dyn RemoteStore>,
    partition: Partition,
    batch: Chunk,
    size: usize,
    policy: SavePolicy,
) -> BatchOutcome {
    let scope = partition.scope();
    let mut chunks = Vec::new();
    let mut current = Chunk::default();
    for save in batch.saves {
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
        current.saves.push(save);
    }
    for delete in batch.deletes {
        if current.len() == size {
            chunks.push(std::mem::take(&mut current));
        }
        current.deletes.push(delete);
    }
    if current.len() > 0 {
        chunks.push(current);
    }

    let mut outcome = BatchOutcome {
        partition,
        saved: Vec::new(),
        deleted: 0,
        conflicts: 0,
        rejected: Vec::new(),
        failure: None,
    };
    let mut chunks = chunks.into_iter();
    while let Some(chunk) = chunks.next() {
        match submit_chunk(remote.as_ref(), scope, &chunk, policy).await {
            Ok(ChunkResult {
                result,
                conflicts,
                rejected,
            }) => {
                let by_record: HashMap<&RecordId, ObjectId> = chunk
                    .saves
                    .iter()
                    .map(|s| (s.outbound.record.id(), s.id))
                    .collect();
                for record in result.saved {
                    if let Some(id) = by_record.get(record.id()) {
                        outcome.saved.push((*id, record));
                    }
                }
                outcome.deleted += result.deleted.len();
                outcome.conflicts += conflicts;
                outcome.rejected.extend(rejected);
            }
            Err(error) => {
                debug!(partition = %outcome.partition, %error, "push chunk failed");
                let mut unsent = ChangeSet::default();
                chunk.into_changes(&mut unsent);
                for rest in chunks.by_ref() {
                    rest.into_changes(&mut unsent);
                }
                outcome.failure = Some((error, unsent));
                break;
            }
        }
    }
    outcome
}

/// Writes one chunk atomically.
///
/// Record-level failures do not sink the chunk. Stale change tags are
/// resolved last-writer-wins: the locally changed fields are reapplied on
/// top of the server version, once per record. Any other refused record is
/// taken out of the chunk. What is left is resubmitted until the server
/// takes it.
async fn submit_chunk(
    remote: &dyn RemoteStore,
    scope: DatabaseScope,
    chunk: &Chunk,
    policy: SavePolicy,
) -> Result<ChunkResult, RemoteError> {
    let mut records: Vec<Record> = chunk.saves.iter().map(|s| s.outbound.record.clone()).collect();
    let mut deletes: Vec<RecordId> = chunk.deletes.iter().map(|(id, _)| id.clone()).collect();
    let mut rebased: BTreeSet<RecordId> = BTreeSet::new();
    let mut rejected = Vec::new();

    loop {
        if records.is_empty() && deletes.is_empty() {
            return Ok(ChunkResult {
                result: ModifyResult::default(),
                conflicts: rebased.len(),
                rejected,
            });
        }
        let items = match remote
            .modify_records(scope, records.clone(), deletes.clone(), policy)
            .await
        {
            Ok(result) => {
                return Ok(ChunkResult {
                    result,
                    conflicts: rebased.len(),
                    rejected,
                })
            }
            Err(RemoteError::PartialFailure(items))
                if !items.is_empty() && items.values().all(is_record_level) =>
            {
                items
            }
            Err(e) => return Err(e),
        };

        let mut progressed = false;
        for (id, error) in items {
            match error {
                RemoteError::ServerRecordChanged { server_record }
                    if !rebased.contains(&id) && records.iter().any(|r| r.id() == &id) =>
                {
                    for record in records.iter_mut().filter(|r| r.id() == &id) {
                        *record = rebase(record, &server_record);
                    }
                    rebased.insert(id);
                    progressed = true;
                }
                error => {
                    let before = records.len() + deletes.len();
                    records.retain(|r| r.id() != &id);
                    deletes.retain(|d| d != &id);
                    if records.len() + deletes.len() < before {
                        rejected.push((id, error));
                        progressed = true;
                    }
                }
            }
        }
        if !progressed {
            return Err(RemoteError::Internal(
                "partial failure names no record of the chunk".into(),
            ));
        }
        debug!(
            rebased = rebased.len(),
            rejected = rejected.len(),
            left = records.len() + deletes.len(),
            "resubmitting chunk"
        );
    }
}

/// Failures that concern one record and leave its siblings sendable.
fn is_record_level(error: &RemoteError) -> bool {
    matches!(
        error,
        RemoteError::ServerRecordChanged { .. }
            | RemoteError::UnknownItem(_)
            | RemoteError::CorruptSystemFields(_)
            | RemoteError::Internal(_)
    )
}

/// Puts the fields of `local` on top of the server's system fields.
fn rebase(local: &Record, server: &Record) -> Record {
    let mut record = server.system_fields_only();
    for (key, value) in local.fields() {
        record.set(key, value.clone());
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_cloud::{RecordValue, ZoneId};

    #[test]
    fn rebase_keeps_server_tag_and_local_fields() {
        let zone = ZoneId::owned("Main");
        let mut local = Record::new("Company", RecordId::new("c1", zone.clone()));
        local.set("name", RecordValue::Text("Local".into()));
        let mut server = Record::new("Company", RecordId::new("c1", zone));
        server.set("name", RecordValue::Text("Server".into()));
        server.set("city", RecordValue::Text("Oslo".into()));

        let rebased = rebase(&local, &server);
        assert_eq!(rebased.change_tag(), server.change_tag());
        assert_eq!(rebased.get("name"), Some(&RecordValue::Text("Local".into())));
        assert!(rebased.get("city").is_none());
    }

    #[test]
    fn report_merge_dedupes_zones() {
        let zone = (DatabaseScope::Private, ZoneId::owned("Main"));
        let mut a = PushReport {
            saved: 1,
            needs_provision: vec![zone.clone()],
            ..PushReport::default()
        };
        a.merge(PushReport {
            saved: 2,
            deferred: true,
            needs_provision: vec![zone],
            ..PushReport::default()
        });
        assert_eq!(a.saved, 3);
        assert!(a.deferred);
        assert_eq!(a.needs_provision.len(), 1);
    }
}
