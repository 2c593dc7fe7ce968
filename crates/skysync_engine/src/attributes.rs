//! Service-attribute resolution.
//!
//! Every entity type is described once, when the engine starts, by a
//! [`SyncEntity`]: which attributes carry the stable record name, owner and
//! system blobs, which fields are synced in which direction, and whether the
//! type takes part in asset caching. Attributes declare their role with the
//! `sync.role` metadata key; otherwise the configured default name is used.
//! The `sync.mask` key (`upload`, `download`, or both, comma separated)
//! excludes a field from one or both directions.

use crate::config::AttributeNames;
use crate::error::{SyncError, SyncResult};
use skysync_store::{AttributeType, DeleteRule, EntityDescriptor, Schema};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Metadata key naming an attribute's sync role.
pub const ROLE_KEY: &str = "sync.role";

/// Metadata key masking a field from upload and/or download.
pub const MASK_KEY: &str = "sync.mask";

/// Roles an attribute can play for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeRole {
    /// Stable record name.
    RecordName,
    /// Zone owner.
    OwnerName,
    /// System blob for private and shared records.
    PrivateRecordData,
    /// System blob for public records.
    PublicRecordData,
    /// Cache state.
    CacheState,
    /// Remote availability.
    RemoteStatus,
    /// Upload progress.
    UploadProgress,
    /// Download progress.
    DownloadProgress,
    /// Long-lived operation ID.
    OperationId,
    /// Last transfer error.
    LastError,
}

impl AttributeRole {
    /// Returns the metadata value for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeRole::RecordName => "recordName",
            AttributeRole::OwnerName => "ownerName",
            AttributeRole::PrivateRecordData => "privateRecordData",
            AttributeRole::PublicRecordData => "publicRecordData",
            AttributeRole::CacheState => "cacheState",
            AttributeRole::RemoteStatus => "remoteStatus",
            AttributeRole::UploadProgress => "uploadProgress",
            AttributeRole::DownloadProgress => "downloadProgress",
            AttributeRole::OperationId => "operationID",
            AttributeRole::LastError => "lastErrorMessage",
        }
    }

    fn default_name<'a>(&self, names: &'a AttributeNames) -> &'a str {
        match self {
            AttributeRole::RecordName => &names.record_name,
            AttributeRole::OwnerName => &names.owner_name,
            AttributeRole::PrivateRecordData => &names.private_record_data,
            AttributeRole::PublicRecordData => &names.public_record_data,
            AttributeRole::CacheState => &names.cache_state,
            AttributeRole::RemoteStatus => &names.remote_status,
            AttributeRole::UploadProgress => &names.upload_progress,
            AttributeRole::DownloadProgress => &names.download_progress,
            AttributeRole::OperationId => &names.operation_id,
            AttributeRole::LastError => &names.last_error,
        }
    }

    fn expected_type(&self) -> AttributeType {
        match self {
            AttributeRole::PrivateRecordData | AttributeRole::PublicRecordData => {
                AttributeType::Bytes
            }
            AttributeRole::UploadProgress | AttributeRole::DownloadProgress => {
                AttributeType::Double
            }
            _ => AttributeType::Text,
        }
    }
}

/// The service attributes of a sync-enabled entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAttributes {
    /// Stable record name.
    pub record_name: String,
    /// Zone owner.
    pub owner_name: Option<String>,
    /// System blob for private and shared records.
    pub private_record_data: Option<String>,
    /// System blob for public records.
    pub public_record_data: Option<String>,
}

impl ServiceAttributes {
    /// Returns true if `key` is one of the service attributes.
    pub fn contains(&self, key: &str) -> bool {
        self.record_name == key
            || self.owner_name.as_deref() == Some(key)
            || self.private_record_data.as_deref() == Some(key)
            || self.public_record_data.as_deref() == Some(key)
    }
}

/// Cache attributes of a cacheable entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheAttributes {
    /// Cache state.
    pub cache_state: String,
    /// Remote availability.
    pub remote_status: String,
    /// Upload progress.
    pub upload_progress: String,
    /// Download progress.
    pub download_progress: String,
    /// Long-lived operation ID.
    pub operation_id: String,
    /// Last transfer error.
    pub last_error: String,
    /// Remote asset field.
    pub asset_field: String,
}

impl CacheAttributes {
    /// Local-only bookkeeping fields.
    pub fn local_fields(&self) -> [&str; 5] {
        [
            &self.cache_state,
            &self.upload_progress,
            &self.download_progress,
            &self.operation_id,
            &self.last_error,
        ]
    }
}

/// How a synced field is converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalar attribute.
    Attribute(AttributeType),
    /// Relationship to another entity.
    Relationship {
        /// Destination entity.
        destination: String,
        /// Holds a set of objects.
        to_many: bool,
        /// The set is ordered.
        ordered: bool,
        /// The target owns this object: deleting the target deletes it.
        owned_by_target: bool,
    },
}

/// One synced field with its direction mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncField {
    /// Field name.
    pub name: String,
    /// Conversion kind.
    pub kind: FieldKind,
    /// Sent to the remote store.
    pub upload: bool,
    /// Applied from the remote store.
    pub download: bool,
}

/// The sync description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntity {
    /// Entity name.
    pub name: String,
    /// Service attributes.
    pub service: ServiceAttributes,
    /// Synced fields in declaration order (attributes, then relationships).
    pub fields: Vec<SyncField>,
    /// Cache attributes, if the type is cacheable.
    pub cache: Option<CacheAttributes>,
}

impl SyncEntity {
    /// Looks up a synced field.
    pub fn field(&self, name: &str) -> Option<&SyncField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Fields sent to the remote store.
    pub fn upload_fields(&self) -> impl Iterator<Item = &SyncField> {
        self.fields.iter().filter(|f| f.upload)
    }

    /// Fields applied from the remote store.
    pub fn download_fields(&self) -> impl Iterator<Item = &SyncField> {
        self.fields.iter().filter(|f| f.download)
    }

    /// Keys to request in a partial fetch: every downloadable attribute and
    /// every relationship.
    pub fn desired_keys(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.download || matches!(f.kind, FieldKind::Relationship { .. }))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Returns true if the key is synced in the upload direction.
    pub fn uploads(&self, key: &str) -> bool {
        self.field(key).map(|f| f.upload).unwrap_or(false)
    }

    /// Destinations of all relationships.
    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(|f| match &f.kind {
            FieldKind::Relationship { destination, .. } => Some(destination.as_str()),
            FieldKind::Attribute(_) => None,
        })
    }
}

/// Sync descriptions for every entity of a schema, built once.
#[derive(Debug, Clone, Default)]
pub struct SyncSchema {
    entities: BTreeMap<String, SyncEntity>,
    excluded: Vec<String>,
}

impl SyncSchema {
    /// Resolves every entity of the schema.
    ///
    /// Entities whose service attributes do not resolve are excluded from
    /// sync without error.
    pub fn resolve(schema: &Schema, names: &AttributeNames) -> Self {
        let mut resolved = Self::default();
        for entity in schema.entities() {
            match resolve_entity(schema, entity, names) {
                Some(sync) => {
                    debug!(entity = %entity.name, cacheable = sync.cache.is_some(), "sync-enabled");
                    resolved.entities.insert(entity.name.clone(), sync);
                }
                None => {
                    debug!(entity = %entity.name, "not sync-enabled");
                    resolved.excluded.push(entity.name.clone());
                }
            }
        }
        resolved
    }

    /// Looks up a sync-enabled entity.
    pub fn entity(&self, name: &str) -> Option<&SyncEntity> {
        self.entities.get(name)
    }

    /// Looks up a sync-enabled entity, failing if it is not enabled.
    pub fn require(&self, name: &str) -> SyncResult<&SyncEntity> {
        self.entity(name)
            .ok_or_else(|| SyncError::missing_service_attributes(name))
    }

    /// Returns true if the entity is sync-enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Iterates over sync-enabled entities in name order.
    pub fn entities(&self) -> impl Iterator<Item = &SyncEntity> {
        self.entities.values()
    }

    /// Union of every entity's desired keys, for fetches that span types.
    pub fn desired_keys(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self.entities().flat_map(SyncEntity::desired_keys).collect();
        keys.into_iter().collect()
    }

    /// Iterates over cacheable entities.
    pub fn cacheable(&self) -> impl Iterator<Item = (&SyncEntity, &CacheAttributes)> {
        self.entities
            .values()
            .filter_map(|e| e.cache.as_ref().map(|c| (e, c)))
    }

    /// Entities excluded from sync.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }
}

fn resolve_role(
    entity: &EntityDescriptor,
    role: AttributeRole,
    names: &AttributeNames,
) -> Option<String> {
    let explicit = entity
        .attributes
        .iter()
        .find(|a| a.user_info.get(ROLE_KEY).map(String::as_str) == Some(role.as_str()));
    let attribute = explicit.or_else(|| entity.attribute(role.default_name(names)))?;

    if attribute.attribute_type != role.expected_type() {
        warn!(
            entity = %entity.name,
            attribute = %attribute.name,
            role = role.as_str(),
            "attribute type does not fit its sync role"
        );
        return None;
    }
    Some(attribute.name.clone())
}

fn parse_mask(user_info: &BTreeMap<String, String>) -> (bool, bool) {
    let Some(mask) = user_info.get(MASK_KEY) else {
        return (true, true);
    };
    let mut upload = true;
    let mut download = true;
    for part in mask.split(',').map(str::trim) {
        match part {
            "upload" => upload = false,
            "download" => download = false,
            _ => {}
        }
    }
    (upload, download)
}

fn resolve_entity(
    schema: &Schema,
    entity: &EntityDescriptor,
    names: &AttributeNames,
) -> Option<SyncEntity> {
    let record_name = resolve_role(entity, AttributeRole::RecordName, names)?;
    let private_record_data = resolve_role(entity, AttributeRole::PrivateRecordData, names);
    let public_record_data = resolve_role(entity, AttributeRole::PublicRecordData, names);
    if private_record_data.is_none() && public_record_data.is_none() {
        return None;
    }
    let service = ServiceAttributes {
        record_name,
        owner_name: resolve_role(entity, AttributeRole::OwnerName, names),
        private_record_data,
        public_record_data,
    };

    let cache = (|| {
        Some(CacheAttributes {
            cache_state: resolve_role(entity, AttributeRole::CacheState, names)?,
            remote_status: resolve_role(entity, AttributeRole::RemoteStatus, names)?,
            upload_progress: resolve_role(entity, AttributeRole::UploadProgress, names)?,
            download_progress: resolve_role(entity, AttributeRole::DownloadProgress, names)?,
            operation_id: resolve_role(entity, AttributeRole::OperationId, names)?,
            last_error: resolve_role(entity, AttributeRole::LastError, names)?,
            asset_field: names.asset_field.clone(),
        })
    })();

    let mut fields = Vec::new();
    for attribute in &entity.attributes {
        if service.contains(&attribute.name) {
            continue;
        }
        let (mut upload, mut download) = parse_mask(&attribute.user_info);
        if let Some(cache) = &cache {
            if cache.local_fields().contains(&attribute.name.as_str()) {
                upload = false;
                download = false;
            }
        }
        fields.push(SyncField {
            name: attribute.name.clone(),
            kind: FieldKind::Attribute(attribute.attribute_type),
            upload,
            download,
        });
    }

    for relationship in &entity.relationships {
        let (upload, download) = parse_mask(&relationship.user_info);
        // The remote reference is "delete self" when deleting the target
        // cascades to this object locally.
        let owned_by_target = relationship
            .inverse
            .as_deref()
            .and_then(|inverse| schema.entity(&relationship.destination)?.relationship(inverse))
            .map(|inverse| inverse.delete_rule == DeleteRule::Cascade)
            .unwrap_or(false);
        fields.push(SyncField {
            name: relationship.name.clone(),
            kind: FieldKind::Relationship {
                destination: relationship.destination.clone(),
                to_many: relationship.to_many,
                ordered: relationship.ordered,
                owned_by_target,
            },
            upload,
            download,
        });
    }

    Some(SyncEntity {
        name: entity.name.clone(),
        service,
        fields,
        cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_store::{AttributeDescriptor, RelationshipDescriptor};

    fn service_attributes(entity: EntityDescriptor) -> EntityDescriptor {
        entity
            .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new("ownerName", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new(
                "privateRecordData",
                AttributeType::Bytes,
            ))
    }

    fn schema() -> Schema {
        Schema::new()
            .with_entity(
                service_attributes(EntityDescriptor::new("Company"))
                    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                    .with_attribute(
                        AttributeDescriptor::new("draft", AttributeType::Text)
                            .with_user_info(MASK_KEY, "upload"),
                    )
                    .with_relationship(
                        RelationshipDescriptor::to_many("employees", "Employee")
                            .with_inverse("company")
                            .with_delete_rule(DeleteRule::Cascade),
                    ),
            )
            .with_entity(
                service_attributes(EntityDescriptor::new("Employee"))
                    .with_attribute(AttributeDescriptor::new("name", AttributeType::Text))
                    .with_relationship(
                        RelationshipDescriptor::to_one("company", "Company")
                            .with_inverse("employees"),
                    ),
            )
            .with_entity(
                EntityDescriptor::new("Scratch")
                    .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text)),
            )
            .with_entity(
                EntityDescriptor::new("Tagged")
                    .with_attribute(
                        AttributeDescriptor::new("uid", AttributeType::Text)
                            .with_user_info(ROLE_KEY, "recordName"),
                    )
                    .with_attribute(
                        AttributeDescriptor::new("blob", AttributeType::Bytes)
                            .with_user_info(ROLE_KEY, "publicRecordData"),
                    ),
            )
    }

    #[test]
    fn resolution_by_default_name_and_metadata() {
        let sync = SyncSchema::resolve(&schema(), &AttributeNames::default());

        let company = sync.entity("Company").unwrap();
        assert_eq!(company.service.record_name, "recordName");
        assert_eq!(company.service.owner_name.as_deref(), Some("ownerName"));
        assert!(company.cache.is_none());

        let tagged = sync.entity("Tagged").unwrap();
        assert_eq!(tagged.service.record_name, "uid");
        assert_eq!(tagged.service.public_record_data.as_deref(), Some("blob"));
        assert_eq!(tagged.service.private_record_data, None);
    }

    #[test]
    fn unresolved_entities_are_excluded() {
        let sync = SyncSchema::resolve(&schema(), &AttributeNames::default());
        assert!(!sync.is_enabled("Scratch"));
        assert_eq!(sync.excluded(), &["Scratch".to_string()]);
        assert!(matches!(
            sync.require("Scratch"),
            Err(SyncError::MissingServiceAttributes { .. })
        ));
    }

    #[test]
    fn masks_and_desired_keys() {
        let sync = SyncSchema::resolve(&schema(), &AttributeNames::default());
        let company = sync.entity("Company").unwrap();

        assert!(company.uploads("name"));
        assert!(!company.uploads("draft"));
        assert!(!company.uploads("recordName"));
        assert_eq!(
            company.desired_keys(),
            vec!["name".to_string(), "draft".to_string(), "employees".to_string()]
        );
        let all = sync.desired_keys();
        assert!(all.contains(&"employees".to_string()));
        assert!(all.contains(&"company".to_string()));
        assert!(all.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cascade_inverse_marks_reference_owned() {
        let sync = SyncSchema::resolve(&schema(), &AttributeNames::default());
        let employee = sync.entity("Employee").unwrap();
        assert!(matches!(
            employee.field("company").unwrap().kind,
            FieldKind::Relationship {
                owned_by_target: true,
                ..
            }
        ));
        let company = sync.entity("Company").unwrap();
        assert!(matches!(
            company.field("employees").unwrap().kind,
            FieldKind::Relationship {
                owned_by_target: false,
                ..
            }
        ));
    }

    #[test]
    fn wrong_type_does_not_resolve() {
        let schema = Schema::new().with_entity(
            EntityDescriptor::new("Odd")
                .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Integer))
                .with_attribute(AttributeDescriptor::new(
                    "privateRecordData",
                    AttributeType::Bytes,
                )),
        );
        let sync = SyncSchema::resolve(&schema, &AttributeNames::default());
        assert!(!sync.is_enabled("Odd"));
    }
}
