//! In-memory remote store.
//!
//! `MemoryCloud` keeps one change log per zone and one per database. Tokens
//! encode a store epoch and a log sequence number; bumping the epoch expires
//! every outstanding token. Asset payloads are copied into a private directory
//! on save so that the caller's temp files can be removed right after.

use crate::error::{RemoteError, RemoteResult};
use crate::ids::{ChangeToken, DatabaseScope, OperationId, RecordId, ZoneId};
use crate::record::{Asset, Record, RecordValue, ReferenceAction};
use crate::remote::{
    DatabaseChanges, LongLivedRequest, ModifyResult, NotificationBatch, NotificationKind,
    OperationStatus, RecordNotification, RemoteStore, SavePolicy, Subscription, ZoneChanges,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Remote calls that can be counted and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    /// `fetch_database_changes`
    FetchDatabaseChanges,
    /// `fetch_zone_changes`
    FetchZoneChanges,
    /// `fetch_notifications`
    FetchNotifications,
    /// `fetch_records`
    FetchRecords,
    /// `modify_records`
    ModifyRecords,
    /// `create_zone`
    CreateZone,
    /// `save_subscription`
    SaveSubscription,
    /// `start_operation`
    StartOperation,
    /// `poll_operation`
    PollOperation,
}

#[derive(Debug, Clone)]
enum LogEntry {
    Saved(String),
    Deleted(String),
}

#[derive(Debug, Clone)]
enum ZoneEvent {
    Changed(ZoneId),
    Deleted(ZoneId),
    Purged(ZoneId),
}

#[derive(Debug, Default)]
struct ZoneState {
    records: BTreeMap<String, Record>,
    log: Vec<(u64, LogEntry)>,
    user_deleted: bool,
}

#[derive(Debug, Default)]
struct DatabaseState {
    zones: BTreeMap<ZoneId, ZoneState>,
    log: Vec<(u64, ZoneEvent)>,
    notifications: Vec<(u64, RecordNotification)>,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug)]
struct Operation {
    request: LongLivedRequest,
    progress: f64,
    outcome: Option<OperationStatus>,
}

#[derive(Debug, Default)]
struct CloudState {
    databases: HashMap<DatabaseScope, DatabaseState>,
    next_seq: u64,
    next_tag: u64,
    epoch: u64,
    operations: HashMap<OperationId, Operation>,
    faults: HashMap<RemoteCall, VecDeque<RemoteError>>,
    calls: HashMap<RemoteCall, usize>,
}

impl CloudState {
    fn database(&mut self, scope: DatabaseScope) -> &mut DatabaseState {
        self.databases.entry(scope).or_default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn next_tag(&mut self) -> String {
        self.next_tag += 1;
        self.next_tag.to_string()
    }

    fn token(&self, seq: u64) -> ChangeToken {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&self.epoch.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        ChangeToken::from_bytes(bytes)
    }

    fn cursor(&self, token: Option<&ChangeToken>) -> RemoteResult<u64> {
        let Some(token) = token else { return Ok(0) };
        let bytes = token.as_bytes();
        if bytes.len() != 16 {
            return Err(RemoteError::ChangeTokenExpired);
        }
        let mut epoch = [0u8; 8];
        let mut seq = [0u8; 8];
        epoch.copy_from_slice(&bytes[..8]);
        seq.copy_from_slice(&bytes[8..]);
        if u64::from_be_bytes(epoch) != self.epoch {
            return Err(RemoteError::ChangeTokenExpired);
        }
        Ok(u64::from_be_bytes(seq))
    }

    fn check(&mut self, call: RemoteCall) -> RemoteResult<()> {
        *self.calls.entry(call).or_default() += 1;
        match self.faults.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns the zone if it is usable for record operations. Default zones
    /// exist implicitly.
    fn usable_zone(&mut self, scope: DatabaseScope, zone: &ZoneId) -> RemoteResult<()> {
        let database = self.database(scope);
        if zone.name == ZoneId::DEFAULT_ZONE_NAME {
            database.zones.entry(zone.clone()).or_default();
        }
        match database.zones.get(zone) {
            None => Err(RemoteError::ZoneNotFound { zone: zone.clone() }),
            Some(state) if state.user_deleted => {
                Err(RemoteError::UserDeletedZone { zone: zone.clone() })
            }
            Some(_) => Ok(()),
        }
    }
}

/// An in-memory [`RemoteStore`] for tests, demos and offline development.
pub struct MemoryCloud {
    state: Mutex<CloudState>,
    asset_dir: PathBuf,
    operation_step: f64,
}

impl MemoryCloud {
    /// Creates an empty cloud storing assets under the system temp directory.
    pub fn new() -> Self {
        Self::with_asset_dir(std::env::temp_dir().join(format!("skysync-cloud-{}", Uuid::new_v4())))
    }

    /// Creates an empty cloud storing assets under `dir`.
    pub fn with_asset_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            asset_dir: dir.into(),
            operation_step: 0.5,
        }
    }

    /// Sets how far a long-lived operation advances per poll.
    pub fn with_operation_step(mut self, step: f64) -> Self {
        self.operation_step = step.clamp(0.01, 1.0);
        self
    }

    /// Queues an error returned by the next call of the given kind.
    pub fn inject(&self, call: RemoteCall, error: RemoteError) {
        self.state
            .lock()
            .faults
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Number of calls of the given kind so far.
    pub fn call_count(&self, call: RemoteCall) -> usize {
        self.state.lock().calls.get(&call).copied().unwrap_or(0)
    }

    /// Number of calls of any kind so far.
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// Invalidates every outstanding change token.
    pub fn expire_tokens(&self) {
        self.state.lock().epoch += 1;
    }

    /// Wipes a zone as if the user deleted the app's data from settings.
    pub fn purge_zone(&self, scope: DatabaseScope, zone: &ZoneId) {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        let database = state.database(scope);
        let entry = database.zones.entry(zone.clone()).or_default();
        entry.records.clear();
        entry.log.clear();
        entry.user_deleted = true;
        database.log.push((seq, ZoneEvent::Purged(zone.clone())));
    }

    /// Deletes a zone as another client would.
    pub fn delete_zone(&self, scope: DatabaseScope, zone: &ZoneId) {
        let mut state = self.state.lock();
        let seq = state.next_seq();
        let database = state.database(scope);
        if database.zones.remove(zone).is_some() {
            database.log.push((seq, ZoneEvent::Deleted(zone.clone())));
        }
    }

    /// Returns true if the zone exists and was not purged.
    pub fn has_zone(&self, scope: DatabaseScope, zone: &ZoneId) -> bool {
        self.state
            .lock()
            .databases
            .get(&scope)
            .and_then(|db| db.zones.get(zone))
            .map(|z| !z.user_deleted)
            .unwrap_or(false)
    }

    /// Reads a stored record.
    pub fn record(&self, scope: DatabaseScope, id: &RecordId) -> Option<Record> {
        self.state
            .lock()
            .databases
            .get(&scope)
            .and_then(|db| db.zones.get(&id.zone))
            .and_then(|z| z.records.get(&id.name))
            .cloned()
    }

    /// Returns every record stored in a zone.
    pub fn records(&self, scope: DatabaseScope, zone: &ZoneId) -> Vec<Record> {
        self.state
            .lock()
            .databases
            .get(&scope)
            .and_then(|db| db.zones.get(zone))
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns saved subscriptions.
    pub fn subscriptions(&self, scope: DatabaseScope) -> Vec<Subscription> {
        self.state
            .lock()
            .databases
            .get(&scope)
            .map(|db| db.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Writes records as another client would, without counting the call.
    pub fn write(
        &self,
        scope: DatabaseScope,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
    ) -> RemoteResult<ModifyResult> {
        let mut state = self.state.lock();
        self.modify(&mut state, scope, saves, deletes, SavePolicy::ChangedKeys)
    }

    /// Creates a zone without counting the call.
    pub fn create_zone_now(&self, scope: DatabaseScope, zone: &ZoneId) -> RemoteResult<()> {
        let mut state = self.state.lock();
        Self::create(&mut state, scope, zone)
    }

    /// Makes a pending long-lived operation fail.
    pub fn fail_operation(&self, id: &OperationId, error: RemoteError) {
        if let Some(op) = self.state.lock().operations.get_mut(id) {
            op.outcome = Some(OperationStatus::Failed(error));
        }
    }

    fn create(state: &mut CloudState, scope: DatabaseScope, zone: &ZoneId) -> RemoteResult<()> {
        if scope == DatabaseScope::Public {
            return Err(RemoteError::Internal(
                "public database does not support custom zones".into(),
            ));
        }
        let seq = state.next_seq();
        let database = state.database(scope);
        let entry = database.zones.entry(zone.clone()).or_default();
        if entry.user_deleted {
            *entry = ZoneState::default();
        }
        database.log.push((seq, ZoneEvent::Changed(zone.clone())));
        Ok(())
    }

    fn store_asset(&self, source: &Path) -> RemoteResult<PathBuf> {
        std::fs::create_dir_all(&self.asset_dir)
            .map_err(|e| RemoteError::Internal(format!("asset storage: {e}")))?;
        let target = self.asset_dir.join(Uuid::new_v4().to_string());
        std::fs::copy(source, &target).map_err(|e| {
            RemoteError::Internal(format!("asset {} unreadable: {e}", source.display()))
        })?;
        Ok(target)
    }

    fn modify(
        &self,
        state: &mut CloudState,
        scope: DatabaseScope,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyResult> {
        let zones: BTreeSet<ZoneId> = saves
            .iter()
            .map(|r| r.id().zone.clone())
            .chain(deletes.iter().map(|id| id.zone.clone()))
            .collect();
        for zone in &zones {
            state.usable_zone(scope, zone)?;
        }

        let mut failures = BTreeMap::new();
        {
            let database = state.database(scope);
            for save in &saves {
                let existing = database
                    .zones
                    .get(&save.id().zone)
                    .and_then(|z| z.records.get(&save.id().name));
                match existing {
                    Some(existing)
                        if policy == SavePolicy::IfServerRecordUnchanged
                            && existing.change_tag() != save.change_tag() =>
                    {
                        failures.insert(
                            save.id().clone(),
                            RemoteError::ServerRecordChanged {
                                server_record: Box::new(existing.clone()),
                            },
                        );
                    }
                    None if policy == SavePolicy::IfServerRecordUnchanged
                        && save.change_tag().is_some() =>
                    {
                        failures.insert(
                            save.id().clone(),
                            RemoteError::UnknownItem(save.id().to_string()),
                        );
                    }
                    _ => {}
                }
                for (_, value) in save.fields() {
                    if let RecordValue::Asset(asset) = value {
                        if !asset.path.exists() {
                            failures.insert(
                                save.id().clone(),
                                RemoteError::Internal(format!(
                                    "asset {} missing",
                                    asset.path.display()
                                )),
                            );
                        }
                    }
                }
            }
        }
        if !failures.is_empty() {
            return Err(RemoteError::PartialFailure(failures));
        }

        let mut result = ModifyResult::default();
        for save in saves {
            let mut fields = Vec::new();
            for (key, value) in save.fields() {
                let value = match value {
                    RecordValue::Asset(asset) => {
                        RecordValue::Asset(Asset::new(self.store_asset(&asset.path)?))
                    }
                    other => other.clone(),
                };
                fields.push((key.to_string(), value));
            }

            let tag = state.next_tag();
            let seq = state.next_seq();
            let id = save.id().clone();
            let database = state.database(scope);
            let zone = database.zones.entry(id.zone.clone()).or_default();
            let created = !zone.records.contains_key(&id.name);
            let record = zone
                .records
                .entry(id.name.clone())
                .or_insert_with(|| save.system_fields_only());
            for (key, value) in fields {
                if value.is_null() {
                    record.remove(&key);
                } else {
                    record.set(key, value);
                }
            }
            record.set_change_tag(tag);
            result.saved.push(record.clone());
            zone.log.push((seq, LogEntry::Saved(id.name.clone())));
            database.log.push((seq, ZoneEvent::Changed(id.zone.clone())));
            if scope == DatabaseScope::Public {
                let kind = if created {
                    NotificationKind::Created
                } else {
                    NotificationKind::Updated
                };
                database.notifications.push((
                    seq,
                    RecordNotification {
                        record_id: id,
                        kind,
                    },
                ));
            }
        }

        let mut queue: VecDeque<RecordId> = deletes.into();
        while let Some(id) = queue.pop_front() {
            let seq = state.next_seq();
            let database = state.database(scope);
            let Some(zone) = database.zones.get_mut(&id.zone) else {
                continue;
            };
            if zone.records.remove(&id.name).is_none() {
                continue;
            }
            zone.log.push((seq, LogEntry::Deleted(id.name.clone())));
            // Records holding a delete-self reference to the target go too.
            for record in zone.records.values() {
                let owned_by_target = record.fields().any(|(_, value)| match value {
                    RecordValue::Reference(r) => {
                        r.record_id == id && r.action == ReferenceAction::DeleteSelf
                    }
                    RecordValue::ReferenceList(list) => list
                        .iter()
                        .any(|r| r.record_id == id && r.action == ReferenceAction::DeleteSelf),
                    _ => false,
                });
                if owned_by_target {
                    queue.push_back(record.id().clone());
                }
            }
            database.log.push((seq, ZoneEvent::Changed(id.zone.clone())));
            if scope == DatabaseScope::Public {
                database.notifications.push((
                    seq,
                    RecordNotification {
                        record_id: id.clone(),
                        kind: NotificationKind::Deleted,
                    },
                ));
            }
            result.deleted.push(id);
        }

        debug!(
            %scope,
            saved = result.saved.len(),
            deleted = result.deleted.len(),
            "modified records"
        );
        Ok(result)
    }

    fn advance(&self, state: &mut CloudState, id: &OperationId) -> RemoteResult<OperationStatus> {
        let op = state
            .operations
            .get_mut(id)
            .ok_or_else(|| RemoteError::UnknownItem(format!("operation {id}")))?;
        if let Some(outcome) = &op.outcome {
            return Ok(outcome.clone());
        }
        op.progress = (op.progress + self.operation_step).min(1.0);
        if op.progress < 1.0 {
            return Ok(OperationStatus::Pending {
                progress: op.progress,
            });
        }

        let request = op.request.clone();
        let outcome = match request {
            LongLivedRequest::Upload { scope, record } => {
                match self.modify(state, scope, vec![record], Vec::new(), SavePolicy::ChangedKeys) {
                    Ok(mut result) => match result.saved.pop() {
                        Some(saved) => OperationStatus::Uploaded(saved),
                        None => OperationStatus::Failed(RemoteError::Internal(
                            "upload saved nothing".into(),
                        )),
                    },
                    Err(e) => OperationStatus::Failed(e),
                }
            }
            LongLivedRequest::Download {
                scope,
                record_id,
                field,
            } => {
                let source = state
                    .databases
                    .get(&scope)
                    .and_then(|db| db.zones.get(&record_id.zone))
                    .and_then(|z| z.records.get(&record_id.name))
                    .and_then(|r| match r.get(&field) {
                        Some(RecordValue::Asset(asset)) => Some(asset.path.clone()),
                        _ => None,
                    });
                match source {
                    Some(path) => match self.store_asset(&path) {
                        Ok(copy) => OperationStatus::Downloaded(copy),
                        Err(e) => OperationStatus::Failed(e),
                    },
                    None => OperationStatus::Failed(RemoteError::UnknownItem(format!(
                        "{record_id}.{field}"
                    ))),
                }
            }
        };

        if let Some(op) = state.operations.get_mut(id) {
            op.outcome = Some(outcome.clone());
        }
        Ok(outcome)
    }
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCloud")
            .field("asset_dir", &self.asset_dir)
            .field("calls", &self.total_calls())
            .finish()
    }
}

#[async_trait]
impl RemoteStore for MemoryCloud {
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<DatabaseChanges> {
        let mut state = self.state.lock();
        state.check(RemoteCall::FetchDatabaseChanges)?;
        if scope == DatabaseScope::Public {
            return Err(RemoteError::Internal(
                "public database has no database changes".into(),
            ));
        }
        let cursor = state.cursor(since.as_ref())?;
        let database = state.database(scope);
        let pending: Vec<(u64, ZoneEvent)> = database
            .log
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .cloned()
            .collect();
        let page = &pending[..pending.len().min(limit.max(1))];

        let mut changes = DatabaseChanges::default();
        let mut changed = BTreeSet::new();
        for (_, event) in page {
            match event {
                ZoneEvent::Changed(zone) => {
                    changed.insert(zone.clone());
                }
                ZoneEvent::Deleted(zone) => {
                    changed.remove(zone);
                    changes.deleted_zones.push(zone.clone());
                }
                ZoneEvent::Purged(zone) => {
                    changed.remove(zone);
                    changes.purged_zones.push(zone.clone());
                }
            }
        }
        changes.changed_zones = changed.into_iter().collect();
        changes.more_coming = pending.len() > page.len();
        let last = page.last().map(|(seq, _)| *seq).unwrap_or(cursor);
        changes.token = Some(state.token(last));
        Ok(changes)
    }

    async fn fetch_zone_changes(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<ZoneChanges> {
        let mut state = self.state.lock();
        state.check(RemoteCall::FetchZoneChanges)?;
        if scope == DatabaseScope::Public {
            return Err(RemoteError::Internal(
                "public database has no zone change feed".into(),
            ));
        }
        state.usable_zone(scope, zone)?;
        let cursor = state.cursor(since.as_ref())?;
        let database = state.database(scope);
        let Some(zone_state) = database.zones.get(zone) else {
            return Err(RemoteError::ZoneNotFound { zone: zone.clone() });
        };

        let pending: Vec<&(u64, LogEntry)> = zone_state
            .log
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .collect();
        let page = &pending[..pending.len().min(limit.max(1))];

        let mut latest: BTreeMap<&str, bool> = BTreeMap::new();
        for (_, entry) in page {
            match entry {
                LogEntry::Saved(name) => latest.insert(name, true),
                LogEntry::Deleted(name) => latest.insert(name, false),
            };
        }

        let mut changes = ZoneChanges::default();
        for (name, saved) in latest {
            if saved {
                if let Some(record) = zone_state.records.get(name) {
                    changes.changed.push(record.clone());
                }
            } else {
                changes.deleted.push(RecordId::new(name, zone.clone()));
            }
        }
        changes.more_coming = pending.len() > page.len();
        let last = page.last().map(|(seq, _)| *seq).unwrap_or(cursor);
        changes.token = Some(state.token(last));
        Ok(changes)
    }

    async fn fetch_notifications(
        &self,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<NotificationBatch> {
        let mut state = self.state.lock();
        state.check(RemoteCall::FetchNotifications)?;
        let cursor = state.cursor(since.as_ref())?;
        let database = state.database(DatabaseScope::Public);
        let pending: Vec<(u64, RecordNotification)> = database
            .notifications
            .iter()
            .filter(|(seq, _)| *seq > cursor)
            .cloned()
            .collect();
        let page = &pending[..pending.len().min(limit.max(1))];

        let last = page.last().map(|(seq, _)| *seq).unwrap_or(cursor);
        Ok(NotificationBatch {
            notifications: page.iter().map(|(_, n)| n.clone()).collect(),
            more_coming: pending.len() > page.len(),
            token: Some(state.token(last)),
        })
    }

    async fn fetch_records(
        &self,
        scope: DatabaseScope,
        ids: &[RecordId],
        desired_keys: Option<&[String]>,
    ) -> RemoteResult<Vec<Record>> {
        let mut state = self.state.lock();
        state.check(RemoteCall::FetchRecords)?;
        let database = state.database(scope);
        Ok(ids
            .iter()
            .filter_map(|id| {
                let record = database
                    .zones
                    .get(&id.zone)
                    .and_then(|z| z.records.get(&id.name))?;
                Some(match desired_keys {
                    Some(keys) => record.project(keys),
                    None => record.clone(),
                })
            })
            .collect())
    }

    async fn modify_records(
        &self,
        scope: DatabaseScope,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyResult> {
        let mut state = self.state.lock();
        state.check(RemoteCall::ModifyRecords)?;
        self.modify(&mut state, scope, saves, deletes, policy)
    }

    async fn create_zone(&self, scope: DatabaseScope, zone: &ZoneId) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.check(RemoteCall::CreateZone)?;
        Self::create(&mut state, scope, zone)
    }

    async fn save_subscription(
        &self,
        scope: DatabaseScope,
        subscription: Subscription,
    ) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.check(RemoteCall::SaveSubscription)?;
        let database = state.database(scope);
        database.subscriptions.retain(|s| s.id != subscription.id);
        database.subscriptions.push(subscription);
        Ok(())
    }

    async fn start_operation(&self, request: LongLivedRequest) -> RemoteResult<OperationId> {
        let mut state = self.state.lock();
        state.check(RemoteCall::StartOperation)?;
        let id = OperationId::generate();
        state.operations.insert(
            id.clone(),
            Operation {
                request,
                progress: 0.0,
                outcome: None,
            },
        );
        Ok(id)
    }

    async fn poll_operation(&self, id: &OperationId) -> RemoteResult<OperationStatus> {
        let mut state = self.state.lock();
        state.check(RemoteCall::PollOperation)?;
        self.advance(&mut state, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn zone() -> ZoneId {
        ZoneId::owned("Main")
    }

    fn company(name: &str) -> Record {
        let mut record = Record::new("Company", RecordId::generate(zone()));
        record.set("name", RecordValue::Text(name.into()));
        record
    }

    #[tokio::test]
    async fn missing_zone_is_reported() {
        let cloud = MemoryCloud::new();
        let err = cloud
            .modify_records(
                DatabaseScope::Private,
                vec![company("Acme")],
                vec![],
                SavePolicy::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ZoneNotFound { .. }));
    }

    #[tokio::test]
    async fn save_then_fetch_changes() {
        let cloud = MemoryCloud::new();
        cloud.create_zone(DatabaseScope::Private, &zone()).await.unwrap();
        let saved = cloud
            .modify_records(
                DatabaseScope::Private,
                vec![company("Acme")],
                vec![],
                SavePolicy::default(),
            )
            .await
            .unwrap();
        assert!(saved.saved[0].change_tag().is_some());

        let db = cloud
            .fetch_database_changes(DatabaseScope::Private, None, 10)
            .await
            .unwrap();
        assert_eq!(db.changed_zones, vec![zone()]);

        let changes = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), None, 10)
            .await
            .unwrap();
        assert_eq!(changes.changed.len(), 1);
        assert!(!changes.more_coming);

        let again = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), changes.token, 10)
            .await
            .unwrap();
        assert!(again.changed.is_empty());
    }

    #[tokio::test]
    async fn paging() {
        let cloud = MemoryCloud::new();
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();
        cloud
            .write(
                DatabaseScope::Private,
                vec![company("a"), company("b"), company("c")],
                vec![],
            )
            .unwrap();

        let first = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), None, 2)
            .await
            .unwrap();
        assert_eq!(first.changed.len(), 2);
        assert!(first.more_coming);
        let second = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), first.token, 2)
            .await
            .unwrap();
        assert_eq!(second.changed.len(), 1);
        assert!(!second.more_coming);
    }

    #[tokio::test]
    async fn stale_change_tag_conflicts() {
        let cloud = MemoryCloud::new();
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();
        let original = cloud
            .write(DatabaseScope::Private, vec![company("Acme")], vec![])
            .unwrap()
            .saved
            .remove(0);

        let mut newer = original.system_fields_only();
        newer.set("name", RecordValue::Text("Acme Corp".into()));
        cloud
            .modify_records(DatabaseScope::Private, vec![newer], vec![], SavePolicy::default())
            .await
            .unwrap();

        let mut stale = original.system_fields_only();
        stale.set("name", RecordValue::Text("Stale".into()));
        let err = cloud
            .modify_records(DatabaseScope::Private, vec![stale], vec![], SavePolicy::default())
            .await
            .unwrap_err();
        let items = err.partial_errors().unwrap();
        assert!(matches!(
            items.values().next(),
            Some(RemoteError::ServerRecordChanged { .. })
        ));
    }

    #[tokio::test]
    async fn expired_tokens() {
        let cloud = MemoryCloud::new();
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();
        let changes = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), None, 10)
            .await
            .unwrap();
        cloud.expire_tokens();
        let err = cloud
            .fetch_zone_changes(DatabaseScope::Private, &zone(), changes.token, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::ChangeTokenExpired));
    }

    #[tokio::test]
    async fn injected_faults_and_counts() {
        let cloud = MemoryCloud::new();
        cloud.inject(
            RemoteCall::CreateZone,
            RemoteError::rate_limited(Duration::from_secs(5)),
        );
        assert!(cloud.create_zone(DatabaseScope::Private, &zone()).await.is_err());
        assert!(cloud.create_zone(DatabaseScope::Private, &zone()).await.is_ok());
        assert_eq!(cloud.call_count(RemoteCall::CreateZone), 2);
    }

    #[tokio::test]
    async fn purged_zone() {
        let cloud = MemoryCloud::new();
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();
        cloud.purge_zone(DatabaseScope::Private, &zone());

        let db = cloud
            .fetch_database_changes(DatabaseScope::Private, None, 10)
            .await
            .unwrap();
        assert_eq!(db.purged_zones, vec![zone()]);
        let err = cloud
            .modify_records(
                DatabaseScope::Private,
                vec![company("x")],
                vec![],
                SavePolicy::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::UserDeletedZone { .. }));
    }

    #[tokio::test]
    async fn delete_self_references_cascade() {
        let cloud = MemoryCloud::new();
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();
        let parent = company("Acme");
        let mut child = Record::new("Employee", RecordId::generate(zone()));
        child.set(
            "company",
            RecordValue::Reference(crate::Reference::new(
                parent.id().clone(),
                ReferenceAction::DeleteSelf,
            )),
        );
        cloud
            .write(DatabaseScope::Private, vec![parent.clone(), child.clone()], vec![])
            .unwrap();

        let result = cloud
            .write(DatabaseScope::Private, vec![], vec![parent.id().clone()])
            .unwrap();
        assert_eq!(result.deleted.len(), 2);
        assert!(cloud.record(DatabaseScope::Private, child.id()).is_none());
    }

    #[tokio::test]
    async fn public_notifications() {
        let cloud = MemoryCloud::new();
        let mut record = Record::new("Post", RecordId::generate(ZoneId::default_zone()));
        record.set("title", RecordValue::Text("hi".into()));
        cloud
            .modify_records(DatabaseScope::Public, vec![record.clone()], vec![], SavePolicy::default())
            .await
            .unwrap();

        let batch = cloud.fetch_notifications(None, 10).await.unwrap();
        assert_eq!(batch.notifications.len(), 1);
        assert_eq!(batch.notifications[0].kind, NotificationKind::Created);

        let records = cloud
            .fetch_records(DatabaseScope::Public, &[record.id().clone()], None)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("title"), Some(&RecordValue::Text("hi".into())));

        let keys: Vec<String> = Vec::new();
        let projected = cloud
            .fetch_records(DatabaseScope::Public, &[record.id().clone()], Some(keys.as_slice()))
            .await
            .unwrap();
        assert!(projected[0].get("title").is_none());
        assert_eq!(projected[0].change_tag(), records[0].change_tag());
    }

    #[tokio::test]
    async fn long_lived_upload_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = MemoryCloud::with_asset_dir(dir.path().join("cloud"));
        cloud.create_zone_now(DatabaseScope::Private, &zone()).unwrap();

        let payload = dir.path().join("payload.bin");
        std::fs::write(&payload, b"pixels").unwrap();
        let mut record = Record::new("Photo", RecordId::generate(zone()));
        record.set("data", RecordValue::Asset(Asset::new(&payload)));

        let id = cloud
            .start_operation(LongLivedRequest::Upload {
                scope: DatabaseScope::Private,
                record: record.clone(),
            })
            .await
            .unwrap();
        assert!(matches!(
            cloud.poll_operation(&id).await.unwrap(),
            OperationStatus::Pending { .. }
        ));
        assert!(matches!(
            cloud.poll_operation(&id).await.unwrap(),
            OperationStatus::Uploaded(_)
        ));

        let id = cloud
            .start_operation(LongLivedRequest::Download {
                scope: DatabaseScope::Private,
                record_id: record.id().clone(),
                field: "data".into(),
            })
            .await
            .unwrap();
        cloud.poll_operation(&id).await.unwrap();
        match cloud.poll_operation(&id).await.unwrap() {
            OperationStatus::Downloaded(path) => {
                assert_eq!(std::fs::read(path).unwrap(), b"pixels");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
