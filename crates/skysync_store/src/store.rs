//! The local store.

use crate::change_feed::{ChangeFeed, ChangeSet, SaveEvent, SavePhase};
use crate::context::{Context, Pending};
use crate::error::{StoreError, StoreResult};
use crate::object::Object;
use crate::predicate::Predicate;
use crate::schema::{DeleteRule, Schema};
use crate::types::{ContextOrigin, ObjectId, SequenceNumber};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;

/// An in-memory object graph store.
///
/// The store provides:
/// - Single-writer commits ordered by sequence number
/// - Property-level merge: a save only overwrites the keys its context changed
/// - Cascade and nullify delete rules
/// - A change feed with will-save / did-save events
///
/// Cloning a `LocalStore` is cheap; clones share the same state.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    schema: Arc<Schema>,
    objects: RwLock<HashMap<ObjectId, Object>>,
    feed: ChangeFeed,
    sequence: AtomicU64,
    commit_lock: Mutex<()>,
    injected_failures: AtomicU32,
}

impl LocalStore {
    /// Creates an empty store for the given schema.
    pub fn new(schema: Schema) -> StoreResult<Self> {
        schema.validate()?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                schema: Arc::new(schema),
                objects: RwLock::new(HashMap::new()),
                feed: ChangeFeed::new(),
                sequence: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                injected_failures: AtomicU32::new(0),
            }),
        })
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Opens a context on behalf of the host application.
    pub fn new_context(&self) -> Context {
        Context::new(self.clone(), ContextOrigin::Application)
    }

    /// Opens a background context owned by the sync engine.
    pub fn new_background_context(&self) -> Context {
        Context::new(self.clone(), ContextOrigin::Sync)
    }

    /// Subscribes to save events.
    pub fn subscribe(&self) -> UnboundedReceiver<SaveEvent> {
        self.inner.feed.subscribe()
    }

    /// Reads a committed object.
    pub fn get(&self, id: ObjectId) -> Option<Object> {
        self.inner.objects.read().get(&id).cloned()
    }

    /// Fetches committed objects of an entity matching a predicate.
    pub fn fetch(&self, entity: &str, predicate: &Predicate) -> StoreResult<Vec<Object>> {
        self.new_context().fetch(entity, predicate)
    }

    /// Counts committed objects of an entity.
    pub fn count(&self, entity: &str) -> usize {
        self.inner
            .objects
            .read()
            .values()
            .filter(|o| o.entity() == entity)
            .count()
    }

    /// Returns the sequence number of the last commit.
    pub fn committed_sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.sequence.load(Ordering::SeqCst))
    }

    /// Makes the next `count` saves fail with [`StoreError::SaveFailed`].
    pub fn fail_next_saves(&self, count: u32) {
        self.inner.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Returns committed objects of an entity.
    pub(crate) fn snapshot_entity(&self, entity: &str) -> Vec<Object> {
        self.inner
            .objects
            .read()
            .values()
            .filter(|o| o.entity() == entity)
            .cloned()
            .collect()
    }

    /// Commits a context's pending changes.
    pub(crate) fn commit(
        &self,
        origin: ContextOrigin,
        pending: &Pending,
    ) -> StoreResult<SequenceNumber> {
        let _guard = self.inner.commit_lock.lock();

        if self
            .inner
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::save_failed("injected save failure"));
        }

        let mut objects = self.inner.objects.write();
        let schema = &self.inner.schema;

        // Expand deletions through cascade rules.
        let mut doomed = BTreeSet::new();
        let mut queue: Vec<ObjectId> = pending.deleted.iter().copied().collect();
        while let Some(id) = queue.pop() {
            let Some(object) = pending.working.get(&id).or_else(|| objects.get(&id)) else {
                continue;
            };
            if !doomed.insert(id) {
                continue;
            }
            if let Some(entity) = schema.entity(object.entity()) {
                for (key, target) in object.targets() {
                    let cascades = entity
                        .relationship(key)
                        .map(|r| r.delete_rule == DeleteRule::Cascade)
                        .unwrap_or(false);
                    if cascades {
                        queue.push(target);
                    }
                }
            }
        }

        let mut changes = ChangeSet::default();
        let mut staged: HashMap<ObjectId, Object> = HashMap::new();

        for id in &doomed {
            if let Some(object) = objects.get(id) {
                changes.deleted.push(object.clone());
            }
        }

        for id in &pending.inserted {
            if doomed.contains(id) {
                continue;
            }
            if let Some(object) = pending.working.get(id) {
                staged.insert(*id, object.clone());
                changes.inserted.insert(*id);
            }
        }

        for (id, keys) in &pending.changed {
            if doomed.contains(id) {
                continue;
            }
            // Property-level trump: only the keys this context touched win.
            let (Some(committed), Some(working)) = (objects.get(id), pending.working.get(id))
            else {
                continue;
            };
            let mut merged = committed.clone();
            for key in keys {
                merged.copy_field(working, key);
            }
            staged.insert(*id, merged);
            changes.updated.insert(*id, keys.clone());
        }

        if !doomed.is_empty() {
            let candidates: Vec<ObjectId> = objects
                .keys()
                .chain(staged.keys())
                .copied()
                .filter(|id| !doomed.contains(id))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            for id in candidates {
                let current = staged.get(&id).or_else(|| objects.get(&id));
                let Some(current) = current else { continue };
                if !current.targets().any(|(_, t)| doomed.contains(&t)) {
                    continue;
                }
                let mut updated = current.clone();
                let mut keys = BTreeSet::new();
                for target in &doomed {
                    keys.extend(updated.remove_references(*target));
                }
                staged.insert(id, updated);
                if !changes.inserted.contains(&id) {
                    changes.updated.entry(id).or_default().extend(keys);
                }
            }
        }

        let sequence =
            SequenceNumber::new(self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let changes = Arc::new(changes);

        self.inner.feed.emit(SaveEvent {
            sequence,
            phase: SavePhase::WillSave,
            origin,
            changes: Arc::clone(&changes),
        });

        for id in &doomed {
            objects.remove(id);
        }
        objects.extend(staged);
        drop(objects);

        debug!(
            %sequence,
            ?origin,
            inserted = changes.inserted.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "committed context"
        );

        self.inner.feed.emit(SaveEvent {
            sequence,
            phase: SavePhase::DidSave,
            origin,
            changes,
        });

        Ok(sequence)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("objects", &self.inner.objects.read().len())
            .field("sequence", &self.committed_sequence())
            .finish()
    }
}
