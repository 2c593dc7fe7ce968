//! Record to object direction.

use super::pending::{PendingReference, PendingReferences};
use super::to_record::check_unordered;
use super::Converter;
use crate::attributes::{FieldKind, SyncField};
use crate::cache::CacheState;
use crate::error::SyncResult;
use bytes::Bytes;
use skysync_cloud::{DatabaseScope, Record, RecordValue, Reference};
use skysync_store::{AttributeType, Context, ObjectId, Predicate, Value};
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// What [`Converter::to_entity`] did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new object was inserted.
    Inserted(ObjectId),
    /// An existing object was updated.
    Updated(ObjectId),
    /// The object already holds this server version.
    Unchanged(ObjectId),
}

impl Upsert {
    /// The affected object.
    pub fn id(&self) -> ObjectId {
        match self {
            Upsert::Inserted(id) | Upsert::Updated(id) | Upsert::Unchanged(id) => *id,
        }
    }
}

impl Converter {
    /// Upserts a record into the context, matching objects by record name.
    ///
    /// References whose targets are not in the context yet are recorded in
    /// `pending` instead of failing the conversion.
    pub fn to_entity(
        &self,
        ctx: &mut Context,
        record: &Record,
        scope: DatabaseScope,
        pending: &mut PendingReferences,
    ) -> SyncResult<Upsert> {
        let entity = self.schema.require(record.record_type())?;
        check_unordered(entity)?;
        let name = record.id().name.as_str();

        if let Some(id) = self.already_applied(ctx, record)? {
            trace!(record = %record.id(), "server version already applied");
            return Ok(Upsert::Unchanged(id));
        }

        let (id, inserted) = match self.lookup(ctx, &entity.name, name)? {
            Some(object) => (object.id(), false),
            None => {
                let id = ctx.insert(&entity.name)?;
                if let Some(cache) = &entity.cache {
                    ctx.set(id, &cache.cache_state, CacheState::Remote.as_str())?;
                }
                (id, true)
            }
        };

        for field in entity.download_fields() {
            match &field.kind {
                FieldKind::Attribute(ty) => {
                    let value = match record.get(&field.name) {
                        None | Some(RecordValue::Null) => Value::Null,
                        Some(remote) => match attribute_from_remote(remote, *ty)? {
                            Some(value) => value,
                            None => {
                                warn!(
                                    record = %record.id(),
                                    field = %field.name,
                                    expected = ty.name(),
                                    "remote value does not fit the attribute type"
                                );
                                continue;
                            }
                        },
                    };
                    ctx.set(id, &field.name, value)?;
                }
                FieldKind::Relationship { .. } => {
                    self.relationship_from_remote(ctx, id, &entity.name, field, record, pending)?;
                }
            }
        }

        self.write_system_fields(ctx, id, scope, record)?;
        Ok(if inserted {
            Upsert::Inserted(id)
        } else {
            Upsert::Updated(id)
        })
    }

    /// Returns the object if its committed system blob already carries the
    /// record's change tag.
    fn already_applied(&self, ctx: &Context, record: &Record) -> SyncResult<Option<ObjectId>> {
        let Some(tag) = record.change_tag() else {
            return Ok(None);
        };
        let entity = self.schema.require(record.record_type())?;
        let committed = ctx.store().fetch(
            &entity.name,
            &Predicate::eq(entity.service.record_name.as_str(), record.id().name.as_str()),
        )?;
        let Some(object) = committed.into_iter().next() else {
            return Ok(None);
        };
        if !ctx.exists(object.id()) {
            return Ok(None);
        }
        let current = self.placement(&object)?;
        Ok(current
            .filter(|p| p.record.change_tag() == Some(tag))
            .map(|_| object.id()))
    }

    fn relationship_from_remote(
        &self,
        ctx: &mut Context,
        id: ObjectId,
        entity: &str,
        field: &SyncField,
        record: &Record,
        pending: &mut PendingReferences,
    ) -> SyncResult<()> {
        let FieldKind::Relationship {
            destination,
            to_many,
            ..
        } = &field.kind
        else {
            return Ok(());
        };

        let references: Vec<&Reference> = match record.get(&field.name) {
            Some(RecordValue::Reference(r)) => vec![r],
            Some(RecordValue::ReferenceList(list)) => list.iter().collect(),
            _ => Vec::new(),
        };

        let mut resolved = BTreeSet::new();
        for reference in references {
            let target = reference.record_id.name.as_str();
            match self.lookup(ctx, destination, target)? {
                Some(object) => {
                    resolved.insert(object.id());
                }
                None => pending.push(PendingReference {
                    object: id,
                    entity: entity.to_string(),
                    field: field.name.clone(),
                    destination: destination.clone(),
                    target: target.to_string(),
                    to_many: *to_many,
                }),
            }
        }

        if *to_many {
            ctx.set_to_many(id, &field.name, resolved)?;
        } else {
            ctx.set_to_one(id, &field.name, resolved.into_iter().next())?;
        }
        Ok(())
    }
}

/// Converts a remote scalar to a local value of the given type.
///
/// Returns `Ok(None)` when the remote value does not fit the type.
fn attribute_from_remote(remote: &RecordValue, ty: AttributeType) -> SyncResult<Option<Value>> {
    let value = match (remote, ty) {
        (RecordValue::Bool(b), AttributeType::Bool) => Value::Bool(*b),
        (RecordValue::Integer(n), AttributeType::Integer) => Value::Integer(*n),
        (RecordValue::Double(n), AttributeType::Double) => Value::Double(*n),
        (RecordValue::Integer(n), AttributeType::Double) => Value::Double(*n as f64),
        (RecordValue::Text(s), AttributeType::Text) => Value::Text(s.clone()),
        (RecordValue::Text(s), AttributeType::Uuid) => match uuid::Uuid::parse_str(s) {
            Ok(u) => Value::Uuid(u),
            Err(_) => return Ok(None),
        },
        (RecordValue::Date(ms), AttributeType::Date) => Value::Date(*ms),
        (RecordValue::Bytes(b), AttributeType::Bytes) => Value::Bytes(b.clone()),
        (RecordValue::Asset(asset), AttributeType::Bytes) => {
            Value::Bytes(Bytes::from(std::fs::read(&asset.path)?))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}
