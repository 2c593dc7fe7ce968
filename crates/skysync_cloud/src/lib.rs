//! # skysync cloud
//!
//! Remote record model and the remote store collaborator for skysync.
//!
//! This crate provides:
//! - Record identity types (`DatabaseScope`, `ZoneId`, `RecordId`, `Partition`)
//! - `Record` and `RecordValue`, including references and externalised assets
//! - System-field blobs (CBOR) carrying the version info needed for safe writes
//! - Opaque `ChangeToken` cursors
//! - The async `RemoteStore` trait
//! - `MemoryCloud`, an in-memory remote with change logs and fault injection
//!
//! Only `MemoryCloud` touches the file system (for asset payloads); the rest
//! of the crate is pure data.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod ids;
mod memory;
mod record;
mod remote;

pub use error::{RemoteError, RemoteResult};
pub use ids::{ChangeToken, DatabaseScope, OperationId, Partition, RecordId, ZoneId, DEFAULT_OWNER};
pub use memory::{MemoryCloud, RemoteCall};
pub use record::{Asset, Record, RecordValue, Reference, ReferenceAction};
pub use remote::{
    DatabaseChanges, LongLivedRequest, ModifyResult, NotificationBatch, NotificationKind,
    OperationStatus, RecordNotification, RemoteStore, SavePolicy, Subscription,
    SubscriptionKind, ZoneChanges,
};
