//! The remote store collaborator.

use crate::error::{RemoteError, RemoteResult};
use crate::ids::{ChangeToken, DatabaseScope, OperationId, RecordId, ZoneId};
use crate::record::Record;
use async_trait::async_trait;
use std::path::PathBuf;

/// Database-level changes since a cursor.
#[derive(Debug, Clone, Default)]
pub struct DatabaseChanges {
    /// Zones with record changes.
    pub changed_zones: Vec<ZoneId>,
    /// Zones deleted by this or another client.
    pub deleted_zones: Vec<ZoneId>,
    /// Zones the user wiped from outside the app.
    pub purged_zones: Vec<ZoneId>,
    /// Cursor to resume from.
    pub token: Option<ChangeToken>,
    /// True if another page is available.
    pub more_coming: bool,
}

/// Record changes in one zone since a cursor.
#[derive(Debug, Clone, Default)]
pub struct ZoneChanges {
    /// Changed records, full field sets.
    pub changed: Vec<Record>,
    /// Deleted record IDs.
    pub deleted: Vec<RecordId>,
    /// Cursor to resume from.
    pub token: Option<ChangeToken>,
    /// True if another page is available.
    pub more_coming: bool,
}

/// Kind of a record notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Record was created.
    Created,
    /// Record was updated.
    Updated,
    /// Record was deleted.
    Deleted,
}

/// A change notification for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordNotification {
    /// Affected record.
    pub record_id: RecordId,
    /// What happened.
    pub kind: NotificationKind,
}

/// A page of notifications (the public database has no zone change feed).
#[derive(Debug, Clone, Default)]
pub struct NotificationBatch {
    /// Notifications in server order.
    pub notifications: Vec<RecordNotification>,
    /// Cursor to resume from.
    pub token: Option<ChangeToken>,
    /// True if another page is available.
    pub more_coming: bool,
}

/// How the server treats a save that targets an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavePolicy {
    /// Fail with `ServerRecordChanged` if the change tag is stale.
    #[default]
    IfServerRecordUnchanged,
    /// Overwrite the sent keys regardless of the change tag.
    ChangedKeys,
}

/// Outcome of a successful modify.
#[derive(Debug, Clone, Default)]
pub struct ModifyResult {
    /// Saved records with fresh change tags.
    pub saved: Vec<Record>,
    /// Deleted IDs.
    pub deleted: Vec<RecordId>,
}

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Any change in the database.
    Database,
    /// Changes in one zone.
    Zone(ZoneId),
    /// Changes to records of a type (public database).
    Query(String),
}

/// A push-notification subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Stable subscription ID; saving the same ID twice replaces it.
    pub id: String,
    /// What to watch.
    pub kind: SubscriptionKind,
}

/// A long-lived transfer, addressable by ID after a restart.
#[derive(Debug, Clone)]
pub enum LongLivedRequest {
    /// Saves a record whose asset fields are uploaded.
    Upload {
        /// Target database.
        scope: DatabaseScope,
        /// Record to save, typically only system fields plus the asset.
        record: Record,
    },
    /// Downloads one asset field of a record.
    Download {
        /// Source database.
        scope: DatabaseScope,
        /// Record to read.
        record_id: RecordId,
        /// Asset field name.
        field: String,
    },
}

/// State of a long-lived operation.
#[derive(Debug, Clone)]
pub enum OperationStatus {
    /// Still running.
    Pending {
        /// Completed fraction in `0.0..=1.0`.
        progress: f64,
    },
    /// Upload finished; the saved record.
    Uploaded(Record),
    /// Download finished; where the payload was written.
    Downloaded(PathBuf),
    /// The operation failed.
    Failed(RemoteError),
}

/// The remote, record-oriented store.
///
/// Every method is a network round trip and a suspension point. Implementations
/// must be safe to call from concurrent tasks.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetches zone-level changes of a private or shared database.
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<DatabaseChanges>;

    /// Fetches record changes in one zone.
    async fn fetch_zone_changes(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<ZoneChanges>;

    /// Fetches record notifications of the public database.
    async fn fetch_notifications(
        &self,
        since: Option<ChangeToken>,
        limit: usize,
    ) -> RemoteResult<NotificationBatch>;

    /// Fetches records by ID; missing records are omitted.
    ///
    /// With `desired_keys` set, only those fields are returned.
    async fn fetch_records(
        &self,
        scope: DatabaseScope,
        ids: &[RecordId],
        desired_keys: Option<&[String]>,
    ) -> RemoteResult<Vec<Record>>;

    /// Saves and deletes records in one zone atomically.
    async fn modify_records(
        &self,
        scope: DatabaseScope,
        saves: Vec<Record>,
        deletes: Vec<RecordId>,
        policy: SavePolicy,
    ) -> RemoteResult<ModifyResult>;

    /// Creates a zone. Creating an existing zone succeeds.
    async fn create_zone(&self, scope: DatabaseScope, zone: &ZoneId) -> RemoteResult<()>;

    /// Saves a subscription.
    async fn save_subscription(
        &self,
        scope: DatabaseScope,
        subscription: Subscription,
    ) -> RemoteResult<()>;

    /// Starts a long-lived operation.
    async fn start_operation(&self, request: LongLivedRequest) -> RemoteResult<OperationId>;

    /// Looks up a long-lived operation by ID.
    async fn poll_operation(&self, id: &OperationId) -> RemoteResult<OperationStatus>;
}
