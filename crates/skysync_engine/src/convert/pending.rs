//! References that arrived before their targets.

use super::Converter;
use crate::error::SyncResult;
use skysync_store::{Context, ObjectId};
use tracing::{debug, trace, warn};

/// A relationship whose target record was not materialised yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReference {
    /// Source object.
    pub object: ObjectId,
    /// Source entity.
    pub entity: String,
    /// Relationship name.
    pub field: String,
    /// Destination entity.
    pub destination: String,
    /// Record name of the target.
    pub target: String,
    /// Whether the relationship is to-many.
    pub to_many: bool,
}

/// Result of resolving pending references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// References attached.
    pub resolved: usize,
    /// References whose targets are still missing.
    pub unresolved: usize,
}

/// Pending references collected while pulling one partition. Never persisted.
#[derive(Debug, Default)]
pub struct PendingReferences {
    entries: Vec<PendingReference>,
}

impl PendingReferences {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending reference.
    pub fn push(&mut self, reference: PendingReference) {
        self.entries.push(reference);
    }

    /// Number of pending references.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops the entries recorded for one object, before it is converted again.
    pub fn forget(&mut self, object: ObjectId) {
        self.entries.retain(|e| e.object != object);
    }

    /// Moves every entry of `other` into this list.
    pub fn append(&mut self, mut other: PendingReferences) {
        self.entries.append(&mut other.entries);
    }

    /// Iterates over pending references.
    pub fn iter(&self) -> impl Iterator<Item = &PendingReference> {
        self.entries.iter()
    }

    /// Attaches every pending reference whose target now exists and keeps
    /// the rest for a later page. Entries whose source object is gone are
    /// dropped. Returns the number attached.
    pub fn attach(&mut self, ctx: &mut Context, converter: &Converter) -> SyncResult<usize> {
        let mut attached = 0;
        let mut waiting = Vec::new();
        for entry in std::mem::take(&mut self.entries) {
            if !ctx.exists(entry.object) {
                continue;
            }
            if link(ctx, converter, &entry)? {
                attached += 1;
            } else {
                waiting.push(entry);
            }
        }
        self.entries = waiting;
        trace!(attached, waiting = self.entries.len(), "attached pending references");
        Ok(attached)
    }

    /// Attaches every pending reference whose target now exists.
    ///
    /// Unresolved references are logged and dropped; the next pull that
    /// touches the source record tries again.
    pub fn resolve(&mut self, ctx: &mut Context, converter: &Converter) -> SyncResult<ResolveOutcome> {
        let mut outcome = ResolveOutcome::default();
        for entry in std::mem::take(&mut self.entries) {
            if !ctx.exists(entry.object) {
                continue;
            }
            if link(ctx, converter, &entry)? {
                outcome.resolved += 1;
            } else {
                warn!(
                    entity = %entry.entity,
                    field = %entry.field,
                    target = %entry.target,
                    "unresolved reference"
                );
                outcome.unresolved += 1;
            }
        }
        debug!(
            resolved = outcome.resolved,
            unresolved = outcome.unresolved,
            "resolved pending references"
        );
        Ok(outcome)
    }
}

/// Sets the relationship if the target exists. Returns false otherwise.
fn link(ctx: &mut Context, converter: &Converter, entry: &PendingReference) -> SyncResult<bool> {
    let Some(target) = converter.lookup(ctx, &entry.destination, &entry.target)? else {
        return Ok(false);
    };
    if entry.to_many {
        ctx.add_to_many(entry.object, &entry.field, target.id())?;
    } else {
        ctx.set_to_one(entry.object, &entry.field, Some(target.id()))?;
    }
    Ok(true)
}
