//! Change feed for observing saves.
//!
//! The change feed emits two events per save: `WillSave` before the changes
//! are applied and `DidSave` after. Both carry the same [`ChangeSet`]. Deleted
//! objects are included as full snapshots because they can no longer be read
//! from the store once the save completes.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = LocalStore::new(schema)?;
//! let mut events = store.subscribe();
//!
//! let mut ctx = store.new_context();
//! let id = ctx.insert("Company")?;
//! ctx.set(id, "name", "Acme")?;
//! ctx.save()?;
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{:?} {}", event.phase, event.changes.len());
//! }
//! ```

use crate::object::Object;
use crate::types::{ContextOrigin, ObjectId, SequenceNumber};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Phase of a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    /// Emitted before the changes are applied.
    WillSave,
    /// Emitted after the changes are applied.
    DidSave,
}

/// The objects touched by one save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Newly inserted objects.
    pub inserted: BTreeSet<ObjectId>,
    /// Updated objects with the keys that changed.
    pub updated: BTreeMap<ObjectId, BTreeSet<String>>,
    /// Snapshots of deleted objects, taken before deletion.
    pub deleted: Vec<Object>,
}

impl ChangeSet {
    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of touched objects.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    /// Returns true if the object was inserted or updated.
    pub fn touches(&self, id: ObjectId) -> bool {
        self.inserted.contains(&id) || self.updated.contains_key(&id)
    }

    /// Folds a later change set into this one.
    ///
    /// Inserted-then-updated stays inserted, anything deleted later is
    /// dropped from the inserted and updated sets.
    pub fn merge(&mut self, later: ChangeSet) {
        self.inserted.extend(later.inserted);
        for (id, keys) in later.updated {
            if !self.inserted.contains(&id) {
                self.updated.entry(id).or_default().extend(keys);
            }
        }
        for object in later.deleted {
            let id = object.id();
            let was_inserted = self.inserted.remove(&id);
            self.updated.remove(&id);
            if !was_inserted && !self.deleted.iter().any(|o| o.id() == id) {
                self.deleted.push(object);
            }
        }
    }
}

/// A single event from the change feed.
#[derive(Debug, Clone)]
pub struct SaveEvent {
    /// Sequence number of the commit.
    pub sequence: SequenceNumber,
    /// Phase of the save.
    pub phase: SavePhase,
    /// Origin of the saving context.
    pub origin: ContextOrigin,
    /// What changed.
    pub changes: Arc<ChangeSet>,
}

/// A change feed that distributes save events to subscribers.
///
/// The change feed:
/// - Emits events in commit order
/// - Supports multiple subscribers
/// - Never blocks the saving thread
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<SaveEvent>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the change feed.
    ///
    /// The receiver sees every event emitted after this call.
    pub fn subscribe(&self) -> UnboundedReceiver<SaveEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits an event to all subscribers, dropping disconnected ones.
    pub fn emit(&self, event: SaveEvent) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> SaveEvent {
        let mut changes = ChangeSet::default();
        changes.inserted.insert(ObjectId::new());
        SaveEvent {
            sequence: SequenceNumber::new(seq),
            phase: SavePhase::DidSave,
            origin: ContextOrigin::Application,
            changes: Arc::new(changes),
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::new();
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();

        feed.emit(event(1));

        assert_eq!(rx1.try_recv().unwrap().sequence.as_u64(), 1);
        assert_eq!(rx2.try_recv().unwrap().sequence.as_u64(), 1);
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(event(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn merge_drops_deleted_inserts() {
        let entity = crate::schema::EntityDescriptor::new("A");
        let id = ObjectId::new();
        let mut first = ChangeSet::default();
        first.inserted.insert(id);

        let mut later = ChangeSet::default();
        later.updated.insert(id, ["name".to_string()].into());
        first.merge(later);
        assert!(first.inserted.contains(&id));
        assert!(first.updated.is_empty());

        let mut deletion = ChangeSet::default();
        deletion.deleted.push(Object::new(id, &entity));
        first.merge(deletion);
        assert!(first.is_empty());
    }
}
