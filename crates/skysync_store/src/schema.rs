//! Schema descriptors.
//!
//! A schema is a static table of entity descriptors. Each attribute and
//! relationship carries a free-form `user_info` map so that layers above the
//! store (the sync engine in particular) can attach declarative metadata
//! without the store knowing what it means.

use crate::error::{StoreError, StoreResult};
use crate::value::Value;
use std::collections::BTreeMap;

/// Storage type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    /// Boolean.
    Bool,
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Double,
    /// UTF-8 text.
    Text,
    /// Timestamp in epoch milliseconds.
    Date,
    /// Binary payload.
    Bytes,
    /// UUID.
    Uuid,
}

impl AttributeType {
    /// Returns a short name for the type.
    pub fn name(&self) -> &'static str {
        match self {
            AttributeType::Bool => "bool",
            AttributeType::Integer => "integer",
            AttributeType::Double => "double",
            AttributeType::Text => "text",
            AttributeType::Date => "date",
            AttributeType::Bytes => "bytes",
            AttributeType::Uuid => "uuid",
        }
    }
}

/// Describes one attribute of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDescriptor {
    /// Attribute name.
    pub name: String,
    /// Storage type.
    pub attribute_type: AttributeType,
    /// Value assigned on insertion.
    pub default_value: Option<Value>,
    /// Declarative metadata.
    pub user_info: BTreeMap<String, String>,
}

impl AttributeDescriptor {
    /// Creates a new attribute descriptor.
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
            default_value: None,
            user_info: BTreeMap::new(),
        }
    }

    /// Sets the default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }
}

/// What happens to related objects when an object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeleteRule {
    /// Remove the reference from the related objects.
    #[default]
    Nullify,
    /// Delete the related objects as well.
    Cascade,
    /// Leave related objects untouched (references are still cleared).
    NoAction,
}

/// Describes one relationship of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipDescriptor {
    /// Relationship name.
    pub name: String,
    /// Destination entity name.
    pub destination: String,
    /// Whether the relationship holds a set of objects.
    pub to_many: bool,
    /// Whether the to-many set is ordered.
    pub ordered: bool,
    /// Delete rule applied when the source object is deleted.
    pub delete_rule: DeleteRule,
    /// Name of the inverse relationship on the destination entity.
    pub inverse: Option<String>,
    /// Declarative metadata.
    pub user_info: BTreeMap<String, String>,
}

impl RelationshipDescriptor {
    /// Creates a to-one relationship.
    pub fn to_one(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            to_many: false,
            ordered: false,
            delete_rule: DeleteRule::Nullify,
            inverse: None,
            user_info: BTreeMap::new(),
        }
    }

    /// Creates a to-many relationship.
    pub fn to_many(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            to_many: true,
            ..Self::to_one(name, destination)
        }
    }

    /// Marks the to-many relationship as ordered.
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Sets the delete rule.
    pub fn with_delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Sets the inverse relationship name.
    pub fn with_inverse(mut self, inverse: impl Into<String>) -> Self {
        self.inverse = Some(inverse.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }
}

/// The kind of a named field on an entity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind<'a> {
    /// A scalar attribute.
    Attribute(&'a AttributeDescriptor),
    /// A relationship.
    Relationship(&'a RelationshipDescriptor),
}

/// Describes an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    /// Entity name.
    pub name: String,
    /// Attributes in declaration order.
    pub attributes: Vec<AttributeDescriptor>,
    /// Relationships in declaration order.
    pub relationships: Vec<RelationshipDescriptor>,
    /// Declarative metadata.
    pub user_info: BTreeMap<String, String>,
}

impl EntityDescriptor {
    /// Creates an empty entity descriptor.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            user_info: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    pub fn with_attribute(mut self, attribute: AttributeDescriptor) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Adds a relationship.
    pub fn with_relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Adds a metadata entry.
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    /// Looks up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescriptor> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Looks up a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Looks up any field by name.
    pub fn field(&self, name: &str) -> Option<FieldKind<'_>> {
        self.attribute(name)
            .map(FieldKind::Attribute)
            .or_else(|| self.relationship(name).map(FieldKind::Relationship))
    }
}

/// A set of entity descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entities: BTreeMap<String, EntityDescriptor>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity descriptor, replacing any with the same name.
    pub fn with_entity(mut self, entity: EntityDescriptor) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    /// Looks up an entity by name.
    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entities.get(name)
    }

    /// Looks up an entity by name, failing if it is not declared.
    pub fn require(&self, name: &str) -> StoreResult<&EntityDescriptor> {
        self.entity(name)
            .ok_or_else(|| StoreError::unknown_entity(name))
    }

    /// Iterates over all entities in name order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.entities.values()
    }

    /// Checks that field names are unique and that relationships point at
    /// declared entities with matching inverses.
    pub fn validate(&self) -> StoreResult<()> {
        for entity in self.entities.values() {
            let mut seen = std::collections::BTreeSet::new();
            let names = entity
                .attributes
                .iter()
                .map(|a| &a.name)
                .chain(entity.relationships.iter().map(|r| &r.name));
            for name in names {
                if !seen.insert(name) {
                    return Err(StoreError::invalid_schema(format!(
                        "duplicate field {}.{}",
                        entity.name, name
                    )));
                }
            }

            for attribute in &entity.attributes {
                if let Some(default) = &attribute.default_value {
                    if !default.fits(attribute.attribute_type) {
                        return Err(StoreError::invalid_schema(format!(
                            "default for {}.{} is not a {}",
                            entity.name,
                            attribute.name,
                            attribute.attribute_type.name()
                        )));
                    }
                }
            }

            for relationship in &entity.relationships {
                let destination = self.entity(&relationship.destination).ok_or_else(|| {
                    StoreError::invalid_schema(format!(
                        "{}.{} points at unknown entity {}",
                        entity.name, relationship.name, relationship.destination
                    ))
                })?;
                if let Some(inverse) = &relationship.inverse {
                    if destination.relationship(inverse).is_none() {
                        return Err(StoreError::invalid_schema(format!(
                            "inverse {}.{} of {}.{} is not declared",
                            destination.name, inverse, entity.name, relationship.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new()
            .with_entity(
                EntityDescriptor::new("Company")
                    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                    .with_relationship(
                        RelationshipDescriptor::to_many("employees", "Employee")
                            .with_inverse("company")
                            .with_delete_rule(DeleteRule::Cascade),
                    ),
            )
            .with_entity(
                EntityDescriptor::new("Employee")
                    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                    .with_relationship(
                        RelationshipDescriptor::to_one("company", "Company")
                            .with_inverse("employees"),
                    ),
            )
    }

    #[test]
    fn valid_schema() {
        schema().validate().unwrap();
    }

    #[test]
    fn field_lookup() {
        let schema = schema();
        let company = schema.entity("Company").unwrap();
        assert!(matches!(company.field("name"), Some(FieldKind::Attribute(_))));
        assert!(matches!(
            company.field("employees"),
            Some(FieldKind::Relationship(r)) if r.to_many
        ));
        assert!(company.field("missing").is_none());
    }

    #[test]
    fn unknown_destination_rejected() {
        let schema = Schema::new().with_entity(
            EntityDescriptor::new("A")
                .with_relationship(RelationshipDescriptor::to_one("b", "B")),
        );
        assert!(matches!(
            schema.validate(),
            Err(StoreError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn bad_default_rejected() {
        let schema = Schema::new().with_entity(
            EntityDescriptor::new("A")
                .with_attribute(AttributeDescriptor::new("n", AttributeType::Integer).with_default("x")),
        );
        assert!(schema.validate().is_err());
    }
}
