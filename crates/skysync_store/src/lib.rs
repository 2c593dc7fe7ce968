//! # skysync store
//!
//! In-memory local object graph store used as the local side of skysync.
//!
//! This crate provides:
//! - Schema descriptors with declarative per-field metadata (`user_info`)
//! - Typed attribute values and object relationships
//! - Transactional contexts with property-level merge on save
//! - Predicate-based fetches
//! - A change feed emitting will-save / did-save events
//!
//! ## Key Invariants
//!
//! - Changes become visible to other contexts only after `save()`
//! - Save events are emitted in commit order with increasing sequence numbers
//! - Deleting an object never leaves dangling relationships behind
//! - Every event carries the origin of the context that produced it

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod context;
mod error;
mod object;
mod predicate;
mod schema;
mod store;
mod types;
mod value;

pub use change_feed::{ChangeFeed, ChangeSet, SaveEvent, SavePhase};
pub use context::Context;
pub use error::{StoreError, StoreResult};
pub use object::Object;
pub use predicate::Predicate;
pub use schema::{
    AttributeDescriptor, AttributeType, DeleteRule, EntityDescriptor, FieldKind,
    RelationshipDescriptor, Schema,
};
pub use store::LocalStore;
pub use types::{ContextOrigin, ObjectId, SequenceNumber};
pub use value::Value;
