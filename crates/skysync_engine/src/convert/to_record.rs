//! Object to record direction.

use super::{Converter, Placement};
use crate::attributes::{FieldKind, SyncEntity, SyncField};
use crate::error::{SyncError, SyncResult};
use sha2::{Digest, Sha256};
use skysync_cloud::{Asset, Record, RecordValue, Reference, ReferenceAction};
use skysync_store::{Context, Object, Value};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::error;

/// A record ready to be sent, with the temp files backing its assets.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Placement of the record.
    pub placement: Placement,
    /// Record carrying system fields plus the converted fields.
    pub record: Record,
    /// Externalised payloads to remove once the write completes.
    pub temp_files: Vec<PathBuf>,
}

impl Converter {
    /// Converts an object into an outbound record.
    ///
    /// `base` carries the latest known system fields. With `changed` set only
    /// those keys are converted; `None` converts every uploadable field.
    pub fn to_record(
        &self,
        ctx: &Context,
        object: &Object,
        base: Placement,
        changed: Option<&BTreeSet<String>>,
    ) -> SyncResult<Outbound> {
        let entity = self.schema.require(object.entity())?;
        check_unordered(entity)?;

        let mut record = base.record.system_fields_only();
        let mut temp_files = Vec::new();
        for field in entity.upload_fields() {
            if changed.is_some_and(|keys| !keys.contains(&field.name)) {
                continue;
            }
            match &field.kind {
                FieldKind::Attribute(_) => {
                    let value = object.value(&field.name).cloned().unwrap_or(Value::Null);
                    let value = self.attribute_to_remote(&record, field, value, &mut temp_files)?;
                    record.set(&field.name, value);
                }
                FieldKind::Relationship { .. } => {
                    if let Some(value) = self.relationship_to_remote(ctx, object, field)? {
                        record.set(&field.name, value);
                    }
                }
            }
        }

        Ok(Outbound {
            placement: base,
            record,
            temp_files,
        })
    }

    /// Returns true if any of the changed keys is sent to the remote store.
    pub fn has_upload_changes(&self, entity: &str, changed: &BTreeSet<String>) -> bool {
        self.schema
            .entity(entity)
            .map(|e| changed.iter().any(|key| e.uploads(key)))
            .unwrap_or(false)
    }

    fn attribute_to_remote(
        &self,
        record: &Record,
        field: &SyncField,
        value: Value,
        temp_files: &mut Vec<PathBuf>,
    ) -> SyncResult<RecordValue> {
        Ok(match value {
            Value::Null => RecordValue::Null,
            Value::Bool(b) => RecordValue::Bool(b),
            Value::Integer(n) => RecordValue::Integer(n),
            Value::Double(n) => RecordValue::Double(n),
            Value::Text(s) => RecordValue::Text(s),
            Value::Date(ms) => RecordValue::Date(ms),
            Value::Uuid(u) => RecordValue::Text(u.to_string()),
            Value::Bytes(bytes) if bytes.len() > self.config.asset_threshold => {
                let path = self.externalise(record, &field.name, &bytes)?;
                temp_files.push(path.clone());
                RecordValue::Asset(Asset::new(path))
            }
            Value::Bytes(bytes) => RecordValue::Bytes(bytes),
        })
    }

    fn externalise(&self, record: &Record, field: &str, payload: &[u8]) -> SyncResult<PathBuf> {
        let digest = Sha256::digest(payload);
        let mut name = format!("{}-{}-", record.id().name, field);
        for byte in digest.iter() {
            let _ = write!(name, "{byte:02x}");
        }
        std::fs::create_dir_all(&self.config.temp_dir)?;
        let path = self.config.temp_dir.join(name);
        std::fs::write(&path, payload)?;
        Ok(path)
    }

    fn relationship_to_remote(
        &self,
        ctx: &Context,
        object: &Object,
        field: &SyncField,
    ) -> SyncResult<Option<RecordValue>> {
        let FieldKind::Relationship {
            to_many,
            owned_by_target,
            ..
        } = &field.kind
        else {
            return Ok(None);
        };
        let action = if *owned_by_target {
            ReferenceAction::DeleteSelf
        } else {
            ReferenceAction::None
        };

        if *to_many {
            let mut references = Vec::new();
            for target in object.to_many(&field.name) {
                if let Some(reference) = self.reference_to(ctx, object, field, target, action)? {
                    references.push(reference);
                }
            }
            return Ok(Some(RecordValue::ReferenceList(references)));
        }

        match object.to_one(&field.name) {
            None => Ok(Some(RecordValue::Null)),
            Some(target) => Ok(self
                .reference_to(ctx, object, field, target, action)?
                .map(RecordValue::Reference)),
        }
    }

    fn reference_to(
        &self,
        ctx: &Context,
        object: &Object,
        field: &SyncField,
        target: skysync_store::ObjectId,
        action: ReferenceAction,
    ) -> SyncResult<Option<Reference>> {
        let placement = match ctx.object(target) {
            Some(target) => self.placement(&target)?,
            None => None,
        };
        match placement {
            Some(placement) => Ok(Some(Reference::new(placement.record.id().clone(), action))),
            None => {
                error!(
                    entity = %object.entity(),
                    field = %field.name,
                    %target,
                    "relationship target has no record identity, reference skipped"
                );
                Ok(None)
            }
        }
    }
}

/// Fails for entities with an ordered relationship, which references
/// cannot carry.
pub(super) fn check_unordered(entity: &SyncEntity) -> SyncResult<()> {
    let ordered = entity.fields.iter().find(|f| {
        matches!(
            f.kind,
            FieldKind::Relationship { ordered: true, .. }
        ) && (f.upload || f.download)
    });
    match ordered {
        Some(field) => Err(SyncError::UnsupportedRelationshipKind {
            entity: entity.name.clone(),
            relationship: field.name.clone(),
        }),
        None => Ok(()),
    }
}
