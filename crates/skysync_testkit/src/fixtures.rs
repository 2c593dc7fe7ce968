//! Schema fixtures.
//!
//! Every synced fixture entity carries the default service attributes
//! (`recordName`, `ownerName`, `privateRecordData`) unless noted otherwise.

use skysync_store::{
    AttributeDescriptor, AttributeType, DeleteRule, EntityDescriptor, RelationshipDescriptor,
    Schema,
};

/// Adds the default private service attributes to an entity.
pub fn synced(entity: EntityDescriptor) -> EntityDescriptor {
    entity
        .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new("ownerName", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new(
            "privateRecordData",
            AttributeType::Bytes,
        ))
}

/// Adds the default cache attributes to an entity.
pub fn cacheable(entity: EntityDescriptor) -> EntityDescriptor {
    entity
        .with_attribute(AttributeDescriptor::new("cacheState", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new("remoteStatus", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new("uploadProgress", AttributeType::Double))
        .with_attribute(AttributeDescriptor::new(
            "downloadProgress",
            AttributeType::Double,
        ))
        .with_attribute(AttributeDescriptor::new("operationID", AttributeType::Text))
        .with_attribute(AttributeDescriptor::new(
            "lastErrorMessage",
            AttributeType::Text,
        ))
}

/// Companies and their employees, plus a local-only `Draft` entity.
///
/// Deleting a company cascades to its employees, so the employee's
/// remote reference is "delete self".
pub fn business_schema() -> Schema {
    Schema::new()
        .with_entity(
            synced(EntityDescriptor::new("Company"))
                .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                .with_attribute(AttributeDescriptor::new("logo", AttributeType::Bytes))
                .with_relationship(
                    RelationshipDescriptor::to_many("employees", "Employee")
                        .with_inverse("company")
                        .with_delete_rule(DeleteRule::Cascade),
                ),
        )
        .with_entity(
            synced(EntityDescriptor::new("Employee"))
                .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                .with_relationship(
                    RelationshipDescriptor::to_one("company", "Company").with_inverse("employees"),
                ),
        )
        .with_entity(
            EntityDescriptor::new("Draft")
                .with_attribute(AttributeDescriptor::new("body", AttributeType::Text)),
        )
}

/// Authors and books referencing each other without inverses: a cycle of
/// two entity types.
pub fn cyclic_schema() -> Schema {
    Schema::new()
        .with_entity(
            synced(EntityDescriptor::new("Author"))
                .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                .with_relationship(RelationshipDescriptor::to_one("favorite", "Book")),
        )
        .with_entity(
            synced(EntityDescriptor::new("Book"))
                .with_attribute(AttributeDescriptor::new("title", AttributeType::Text))
                .with_relationship(RelationshipDescriptor::to_one("author", "Author")),
        )
}

/// Cacheable photos with a caption.
pub fn photo_schema() -> Schema {
    Schema::new().with_entity(
        cacheable(synced(EntityDescriptor::new("Photo")))
            .with_attribute(AttributeDescriptor::new("caption", AttributeType::Text)),
    )
}

/// Public posts: a record name and a public system blob only.
pub fn public_schema() -> Schema {
    Schema::new().with_entity(
        EntityDescriptor::new("Post")
            .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new(
                "publicRecordData",
                AttributeType::Bytes,
            ))
            .with_attribute(AttributeDescriptor::new("title", AttributeType::Text)),
    )
}

/// A playlist with an ordered to-many relationship, which cannot sync.
pub fn ordered_schema() -> Schema {
    Schema::new()
        .with_entity(
            synced(EntityDescriptor::new("Playlist"))
                .with_attribute(AttributeDescriptor::new("title", AttributeType::Text))
                .with_relationship(RelationshipDescriptor::to_many("songs", "Song").ordered()),
        )
        .with_entity(
            synced(EntityDescriptor::new("Song"))
                .with_attribute(AttributeDescriptor::new("title", AttributeType::Text)),
        )
}
