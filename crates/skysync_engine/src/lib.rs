//! # skysync engine
//!
//! Bidirectional sync between a local object graph and a remote record
//! store.
//!
//! This crate provides:
//! - Per-partition change tokens with durable persistence
//! - Service-attribute resolution from schema metadata
//! - Object to record conversion, with deferred reference resolution
//! - A dependency graph ordering entity types for pulls
//! - Push and pull pipelines with zone provisioning and error recovery
//! - A global pause gate honouring remote throttling
//! - An asset cache manager driving uploads, downloads and evictions
//!
//! ## Architecture
//!
//! Application saves are observed on the store's change feed and pushed in
//! the background; the caller's save never waits for the network. Pulls run
//! on demand and apply remote changes through a sync context, so they are
//! never echoed back. Large payloads of cacheable entities move separately,
//! driven by the state stored on each object.
//!
//! ## Key Invariants
//!
//! - Only application-origin saves are pushed
//! - A change token advances only after its page was saved locally
//! - An object is given one record name, never two
//! - No remote call is made while the pause gate is closed
//! - Pending references never outlive the pull that created them

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod attributes;
mod cache;
mod config;
mod convert;
mod engine;
mod error;
mod events;
mod graph;
mod pause;
mod pull;
mod push;
mod recovery;
mod setup;
mod shared;
mod state;
mod tokens;

pub use attributes::{
    AttributeRole, CacheAttributes, FieldKind, ServiceAttributes, SyncEntity, SyncField,
    SyncSchema, MASK_KEY, ROLE_KEY,
};
pub use cache::{CacheManager, CacheState, RemoteStatus};
pub use config::{AttributeNames, PauseConfig, SyncConfig};
pub use convert::{
    Converter, Outbound, PendingReference, PendingReferences, Placement, ResolveOutcome, Upsert,
};
pub use engine::{SyncEngine, SyncEngineBuilder, SyncReport};
pub use error::{ErrorModule, SyncError, SyncResult};
pub use events::{ErrorSink, SyncEvent, TracingErrorSink};
pub use graph::{DependencyGraph, GraphOrder};
pub use pause::PauseGate;
pub use pull::PullReport;
pub use push::PushReport;
pub use recovery::{classify, RecoveryAction};
pub use setup::{database_subscription_id, query_subscription_id};
pub use state::{SyncState, SyncStats};
pub use tokens::{ChangeTokenStore, FileStorage, KeyValueStorage, MemoryStorage};
