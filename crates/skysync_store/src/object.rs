//! Object instances.

use crate::schema::EntityDescriptor;
use crate::types::ObjectId;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// An instance of an entity.
///
/// Objects are plain data. Reads hand out clones; mutation goes through a
/// [`Context`](crate::Context) so that the store can track changed keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    id: ObjectId,
    entity: String,
    attributes: BTreeMap<String, Value>,
    to_one: BTreeMap<String, ObjectId>,
    to_many: BTreeMap<String, BTreeSet<ObjectId>>,
}

impl Object {
    /// Creates an object seeded with the entity's default values.
    pub(crate) fn new(id: ObjectId, entity: &EntityDescriptor) -> Self {
        let attributes = entity
            .attributes
            .iter()
            .filter_map(|a| {
                a.default_value
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .map(|v| (a.name.clone(), v.clone()))
            })
            .collect();

        Self {
            id,
            entity: entity.name.clone(),
            attributes,
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    /// Returns the object ID.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Returns an attribute value, or `None` when unset.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns a text attribute.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.value(key).and_then(Value::as_text)
    }

    /// Returns a binary attribute.
    pub fn bytes(&self, key: &str) -> Option<&bytes::Bytes> {
        self.value(key).and_then(Value::as_bytes)
    }

    /// Returns the target of a to-one relationship.
    pub fn to_one(&self, key: &str) -> Option<ObjectId> {
        self.to_one.get(key).copied()
    }

    /// Returns the targets of a to-many relationship.
    pub fn to_many(&self, key: &str) -> BTreeSet<ObjectId> {
        self.to_many.get(key).cloned().unwrap_or_default()
    }

    /// Iterates over set attributes.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn set_value(&mut self, key: &str, value: Value) {
        if value.is_null() {
            self.attributes.remove(key);
        } else {
            self.attributes.insert(key.to_string(), value);
        }
    }

    pub(crate) fn set_to_one(&mut self, key: &str, target: Option<ObjectId>) {
        match target {
            Some(target) => {
                self.to_one.insert(key.to_string(), target);
            }
            None => {
                self.to_one.remove(key);
            }
        }
    }

    pub(crate) fn to_many_mut(&mut self, key: &str) -> &mut BTreeSet<ObjectId> {
        self.to_many.entry(key.to_string()).or_default()
    }

    /// Copies one field (attribute or relationship) from `other`.
    pub(crate) fn copy_field(&mut self, other: &Object, key: &str) {
        match other.attributes.get(key) {
            Some(v) => {
                self.attributes.insert(key.to_string(), v.clone());
            }
            None => {
                self.attributes.remove(key);
            }
        }
        match other.to_one.get(key) {
            Some(t) => {
                self.to_one.insert(key.to_string(), *t);
            }
            None => {
                self.to_one.remove(key);
            }
        }
        match other.to_many.get(key) {
            Some(set) => {
                self.to_many.insert(key.to_string(), set.clone());
            }
            None => {
                self.to_many.remove(key);
            }
        }
    }

    /// Returns every object this object points at.
    pub(crate) fn targets(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.to_one
            .iter()
            .map(|(k, t)| (k.as_str(), *t))
            .chain(
                self.to_many
                    .iter()
                    .flat_map(|(k, set)| set.iter().map(move |t| (k.as_str(), *t))),
            )
    }

    /// Removes every reference to `target`, returning the keys that changed.
    pub(crate) fn remove_references(&mut self, target: ObjectId) -> Vec<String> {
        let mut changed = Vec::new();
        self.to_one.retain(|k, t| {
            if *t == target {
                changed.push(k.clone());
                false
            } else {
                true
            }
        });
        for (k, set) in self.to_many.iter_mut() {
            if set.remove(&target) {
                changed.push(k.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDescriptor, AttributeType};

    #[test]
    fn defaults_are_applied() {
        let entity = EntityDescriptor::new("Photo")
            .with_attribute(
                AttributeDescriptor::new("cacheState", AttributeType::Text).with_default("local"),
            )
            .with_attribute(AttributeDescriptor::new("title", AttributeType::Text));
        let object = Object::new(ObjectId::new(), &entity);
        assert_eq!(object.text("cacheState"), Some("local"));
        assert_eq!(object.value("title"), None);
    }

    #[test]
    fn remove_references() {
        let entity = EntityDescriptor::new("A");
        let mut object = Object::new(ObjectId::new(), &entity);
        let target = ObjectId::new();
        object.set_to_one("parent", Some(target));
        object.to_many_mut("friends").insert(target);
        object.to_many_mut("friends").insert(ObjectId::new());

        let mut changed = object.remove_references(target);
        changed.sort();
        assert_eq!(changed, vec!["friends".to_string(), "parent".to_string()]);
        assert_eq!(object.to_one("parent"), None);
        assert_eq!(object.to_many("friends").len(), 1);
    }
}
