//! Transactional contexts.
//!
//! A context is a private working set over the store. Objects are copied on
//! first touch; reads see the working copy laid over committed state. Nothing
//! is visible to other contexts until [`Context::save`] succeeds.

use crate::error::{StoreError, StoreResult};
use crate::object::Object;
use crate::predicate::Predicate;
use crate::schema::RelationshipDescriptor;
use crate::store::LocalStore;
use crate::types::{ContextOrigin, ObjectId};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Uncommitted changes held by a context.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    pub(crate) working: HashMap<ObjectId, Object>,
    pub(crate) inserted: BTreeSet<ObjectId>,
    pub(crate) changed: BTreeMap<ObjectId, BTreeSet<String>>,
    pub(crate) deleted: BTreeSet<ObjectId>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A unit of work against a [`LocalStore`].
pub struct Context {
    store: LocalStore,
    origin: ContextOrigin,
    pending: Pending,
}

impl Context {
    pub(crate) fn new(store: LocalStore, origin: ContextOrigin) -> Self {
        Self {
            store,
            origin,
            pending: Pending::default(),
        }
    }

    /// Returns who owns this context.
    pub fn origin(&self) -> ContextOrigin {
        self.origin
    }

    /// Returns the store this context belongs to.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Returns true if the context holds unsaved changes.
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Inserts a new object of the given entity with default values.
    pub fn insert(&mut self, entity: &str) -> StoreResult<ObjectId> {
        self.insert_with_id(entity, ObjectId::new())
    }

    /// Inserts a new object with a caller-chosen ID.
    pub fn insert_with_id(&mut self, entity: &str, id: ObjectId) -> StoreResult<ObjectId> {
        let descriptor = self.store.schema().require(entity)?;
        let object = Object::new(id, descriptor);
        self.pending.working.insert(id, object);
        self.pending.inserted.insert(id);
        Ok(id)
    }

    /// Reads an object as seen by this context.
    pub fn object(&self, id: ObjectId) -> Option<Object> {
        if self.pending.deleted.contains(&id) {
            return None;
        }
        match self.pending.working.get(&id) {
            Some(object) => Some(object.clone()),
            None => self.store.get(id),
        }
    }

    /// Returns true if the object exists in this context.
    pub fn exists(&self, id: ObjectId) -> bool {
        if self.pending.deleted.contains(&id) {
            return false;
        }
        self.pending.working.contains_key(&id) || self.store.get(id).is_some()
    }

    /// Sets an attribute. `Value::Null` clears it.
    pub fn set(&mut self, id: ObjectId, key: &str, value: impl Into<Value>) -> StoreResult<()> {
        let value = value.into();
        let schema = self.store.schema().clone();
        let object = self.working_mut(id)?;
        let entity = schema.require(object.entity())?;
        let attribute = entity
            .attribute(key)
            .ok_or_else(|| StoreError::unknown_field(&entity.name, key))?;
        if !value.fits(attribute.attribute_type) {
            return Err(StoreError::TypeMismatch {
                entity: entity.name.clone(),
                field: key.to_string(),
                expected: attribute.attribute_type.name().to_string(),
                actual: value.type_name().to_string(),
            });
        }
        object.set_value(key, value);
        self.mark_changed(id, key);
        Ok(())
    }

    /// Sets or clears a to-one relationship.
    pub fn set_to_one(
        &mut self,
        id: ObjectId,
        key: &str,
        target: Option<ObjectId>,
    ) -> StoreResult<()> {
        let relationship = self.relationship(id, key, false)?;
        if let Some(target) = target {
            self.check_destination(&relationship, id, target)?;
        }
        self.working_mut(id)?.set_to_one(key, target);
        self.mark_changed(id, key);
        Ok(())
    }

    /// Replaces the contents of a to-many relationship.
    pub fn set_to_many(
        &mut self,
        id: ObjectId,
        key: &str,
        targets: BTreeSet<ObjectId>,
    ) -> StoreResult<()> {
        let relationship = self.relationship(id, key, true)?;
        for target in &targets {
            self.check_destination(&relationship, id, *target)?;
        }
        *self.working_mut(id)?.to_many_mut(key) = targets;
        self.mark_changed(id, key);
        Ok(())
    }

    /// Adds a target to a to-many relationship.
    pub fn add_to_many(&mut self, id: ObjectId, key: &str, target: ObjectId) -> StoreResult<()> {
        let relationship = self.relationship(id, key, true)?;
        self.check_destination(&relationship, id, target)?;
        if self.working_mut(id)?.to_many_mut(key).insert(target) {
            self.mark_changed(id, key);
        }
        Ok(())
    }

    /// Removes a target from a to-many relationship.
    pub fn remove_from_many(
        &mut self,
        id: ObjectId,
        key: &str,
        target: ObjectId,
    ) -> StoreResult<()> {
        self.relationship(id, key, true)?;
        if self.working_mut(id)?.to_many_mut(key).remove(&target) {
            self.mark_changed(id, key);
        }
        Ok(())
    }

    /// Deletes an object. Delete rules are applied on save.
    pub fn delete(&mut self, id: ObjectId) -> StoreResult<()> {
        if self.pending.inserted.remove(&id) {
            self.pending.working.remove(&id);
            return Ok(());
        }
        if self.pending.deleted.contains(&id) || self.store.get(id).is_none() {
            return Err(StoreError::ObjectNotFound(id));
        }
        self.pending.working.remove(&id);
        self.pending.changed.remove(&id);
        self.pending.deleted.insert(id);
        Ok(())
    }

    /// Fetches objects of an entity matching a predicate, as seen by this
    /// context. Results are ordered by object ID.
    pub fn fetch(&self, entity: &str, predicate: &Predicate) -> StoreResult<Vec<Object>> {
        self.store.schema().require(entity)?;

        let mut results: BTreeMap<ObjectId, Object> = self
            .store
            .snapshot_entity(entity)
            .into_iter()
            .filter(|o| !self.pending.deleted.contains(&o.id()))
            .map(|o| (o.id(), o))
            .collect();

        for object in self.pending.working.values() {
            if object.entity() == entity {
                results.insert(object.id(), object.clone());
            }
        }

        Ok(results
            .into_values()
            .filter(|o| predicate.matches(o))
            .collect())
    }

    /// Fetches the first object matching a predicate.
    pub fn fetch_one(&self, entity: &str, predicate: &Predicate) -> StoreResult<Option<Object>> {
        Ok(self.fetch(entity, predicate)?.into_iter().next())
    }

    /// Commits pending changes to the store.
    ///
    /// On failure the pending changes are kept so the caller can retry or
    /// roll back.
    pub fn save(&mut self) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.store.commit(self.origin, &self.pending)?;
        self.pending = Pending::default();
        Ok(())
    }

    /// Discards pending changes.
    pub fn rollback(&mut self) {
        self.pending = Pending::default();
    }

    fn working_mut(&mut self, id: ObjectId) -> StoreResult<&mut Object> {
        if self.pending.deleted.contains(&id) {
            return Err(StoreError::ObjectNotFound(id));
        }
        if !self.pending.working.contains_key(&id) {
            let committed = self.store.get(id).ok_or(StoreError::ObjectNotFound(id))?;
            self.pending.working.insert(id, committed);
        }
        self.pending
            .working
            .get_mut(&id)
            .ok_or(StoreError::ObjectNotFound(id))
    }

    fn mark_changed(&mut self, id: ObjectId, key: &str) {
        if !self.pending.inserted.contains(&id) {
            self.pending
                .changed
                .entry(id)
                .or_default()
                .insert(key.to_string());
        }
    }

    fn relationship(
        &self,
        id: ObjectId,
        key: &str,
        to_many: bool,
    ) -> StoreResult<RelationshipDescriptor> {
        let object = self.object(id).ok_or(StoreError::ObjectNotFound(id))?;
        let entity = self.store.schema().require(object.entity())?;
        let relationship = entity
            .relationship(key)
            .ok_or_else(|| StoreError::unknown_field(&entity.name, key))?;
        if relationship.to_many != to_many {
            return Err(StoreError::Cardinality {
                entity: entity.name.clone(),
                field: key.to_string(),
                expected: if relationship.to_many {
                    "to-one"
                } else {
                    "to-many"
                },
            });
        }
        Ok(relationship.clone())
    }

    fn check_destination(
        &self,
        relationship: &RelationshipDescriptor,
        source: ObjectId,
        target: ObjectId,
    ) -> StoreResult<()> {
        let target = self.object(target).ok_or(StoreError::ObjectNotFound(target))?;
        if target.entity() != relationship.destination {
            let entity = self
                .object(source)
                .map(|o| o.entity().to_string())
                .unwrap_or_default();
            return Err(StoreError::WrongDestination {
                entity,
                field: relationship.name.clone(),
                expected: relationship.destination.clone(),
                actual: target.entity().to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("origin", &self.origin)
            .field("inserted", &self.pending.inserted.len())
            .field("changed", &self.pending.changed.len())
            .field("deleted", &self.pending.deleted.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, AttributeType, EntityDescriptor, Schema};

    fn store() -> LocalStore {
        let schema = Schema::new()
            .with_entity(
                EntityDescriptor::new("Company")
                    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                    .with_attribute(
                        AttributeDescriptor::new("size", AttributeType::Integer).with_default(1i64),
                    )
                    .with_relationship(RelationshipDescriptor::to_many("employees", "Employee")),
            )
            .with_entity(
                EntityDescriptor::new("Employee")
                    .with_relationship(RelationshipDescriptor::to_one("company", "Company")),
            );
        LocalStore::new(schema).unwrap()
    }

    #[test]
    fn reads_see_working_copy() {
        let store = store();
        let mut ctx = store.new_context();
        let id = ctx.insert("Company").unwrap();
        ctx.set(id, "name", "Acme").unwrap();

        let object = ctx.object(id).unwrap();
        assert_eq!(object.text("name"), Some("Acme"));
        assert_eq!(object.value("size"), Some(&Value::Integer(1)));

        let found = ctx
            .fetch("Company", &Predicate::eq("name", "Acme"))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.fetch("Company", &Predicate::All).unwrap().is_empty());
    }

    #[test]
    fn type_checks() {
        let store = store();
        let mut ctx = store.new_context();
        let id = ctx.insert("Company").unwrap();

        assert!(matches!(
            ctx.set(id, "name", 5i64),
            Err(StoreError::TypeMismatch { .. })
        ));
        assert!(matches!(
            ctx.set(id, "nope", "x"),
            Err(StoreError::UnknownField { .. })
        ));
        assert!(matches!(
            ctx.set_to_one(id, "employees", None),
            Err(StoreError::Cardinality { .. })
        ));

        let other = ctx.insert("Company").unwrap();
        assert!(matches!(
            ctx.add_to_many(id, "employees", other),
            Err(StoreError::WrongDestination { .. })
        ));
    }

    #[test]
    fn insert_then_delete_is_a_no_op() {
        let store = store();
        let mut ctx = store.new_context();
        let id = ctx.insert("Company").unwrap();
        ctx.delete(id).unwrap();
        assert!(!ctx.has_changes());
        assert!(!ctx.exists(id));
    }

    #[test]
    fn rollback_discards() {
        let store = store();
        let mut ctx = store.new_context();
        ctx.insert("Company").unwrap();
        ctx.rollback();
        ctx.save().unwrap();
        assert_eq!(store.count("Company"), 0);
    }

    #[test]
    fn deleted_objects_hidden_from_fetch() {
        let store = store();
        let mut ctx = store.new_context();
        let id = ctx.insert("Company").unwrap();
        ctx.save().unwrap();

        let mut ctx = store.new_context();
        ctx.delete(id).unwrap();
        assert!(ctx.fetch("Company", &Predicate::All).unwrap().is_empty());
        assert!(matches!(
            ctx.set(id, "name", "x"),
            Err(StoreError::ObjectNotFound(_))
        ));
    }
}
