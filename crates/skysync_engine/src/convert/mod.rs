//! Object and record conversion.
//!
//! The converter is the only place that knows how local fields map onto
//! remote record fields. Both pipelines go through it:
//!
//! - [`Converter::to_record`] turns a changed object into an outbound record
//! - [`Converter::to_entity`] upserts an inbound record into a context
//!
//! Identity lives on the object itself: the record name, the owner and the
//! encoded system fields of the last known server version. Objects that were
//! never pushed get an identity minted by [`Converter::mint_identity`].

mod pending;
mod to_entity;
mod to_record;

pub use pending::{PendingReference, PendingReferences, ResolveOutcome};
pub use to_entity::Upsert;
pub use to_record::Outbound;

use crate::attributes::{SyncEntity, SyncSchema};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use skysync_cloud::{DatabaseScope, Partition, Record, RecordId, ZoneId};
use skysync_store::{Context, Object, ObjectId, Predicate, Value};
use std::sync::Arc;
use tracing::debug;

/// Where a record lives remotely, decoded from an object's system blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    /// Database scope.
    pub scope: DatabaseScope,
    /// Record with system fields only.
    pub record: Record,
}

impl Placement {
    /// The partition the record belongs to.
    pub fn partition(&self) -> Partition {
        Partition::Zone(self.scope, self.record.id().zone.clone())
    }
}

/// Converts between local objects and remote records.
#[derive(Debug, Clone)]
pub struct Converter {
    schema: Arc<SyncSchema>,
    config: Arc<SyncConfig>,
}

impl Converter {
    /// Creates a converter.
    pub fn new(schema: Arc<SyncSchema>, config: Arc<SyncConfig>) -> Self {
        Self { schema, config }
    }

    /// The resolved sync schema.
    pub fn schema(&self) -> &SyncSchema {
        &self.schema
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Scope and zone new records of an entity are created in.
    ///
    /// Entities with a private blob go to the configured private zone;
    /// public-only entities go to the public default zone.
    pub fn home_zone(&self, entity: &SyncEntity) -> (DatabaseScope, ZoneId) {
        if entity.service.private_record_data.is_some() {
            (DatabaseScope::Private, self.config.zone())
        } else {
            (DatabaseScope::Public, ZoneId::default_zone())
        }
    }

    /// Decodes an object's remote placement from its system blob.
    ///
    /// Returns `None` for objects that were never given an identity.
    pub fn placement(&self, object: &Object) -> SyncResult<Option<Placement>> {
        let entity = self.schema.require(object.entity())?;
        let service = &entity.service;

        if let Some(blob) = service
            .private_record_data
            .as_deref()
            .and_then(|key| object.bytes(key))
        {
            let record = Record::from_system_fields(blob)?;
            let scope = if record.id().zone.is_owned() {
                DatabaseScope::Private
            } else {
                DatabaseScope::Shared
            };
            return Ok(Some(Placement { scope, record }));
        }
        if let Some(blob) = service
            .public_record_data
            .as_deref()
            .and_then(|key| object.bytes(key))
        {
            return Ok(Some(Placement {
                scope: DatabaseScope::Public,
                record: Record::from_system_fields(blob)?,
            }));
        }
        Ok(None)
    }

    /// Gives an object a stable record name, owner and system blob.
    ///
    /// A record name that is already set is kept; objects that already carry
    /// a blob are returned unchanged.
    pub fn mint_identity(&self, ctx: &mut Context, id: ObjectId) -> SyncResult<Placement> {
        let object = ctx
            .object(id)
            .ok_or(skysync_store::StoreError::ObjectNotFound(id))?;
        if let Some(placement) = self.placement(&object)? {
            return Ok(placement);
        }

        let entity = self.schema.require(object.entity())?;
        let service = &entity.service;
        let (scope, zone) = self.home_zone(entity);
        let name = object
            .text(&service.record_name)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = Record::new(&entity.name, RecordId::new(name.clone(), zone.clone()));

        ctx.set(id, &service.record_name, name.as_str())?;
        if let Some(owner) = &service.owner_name {
            ctx.set(id, owner, zone.owner.as_str())?;
        }
        let blob_key = match scope {
            DatabaseScope::Public => service.public_record_data.as_deref(),
            _ => service.private_record_data.as_deref(),
        };
        if let Some(key) = blob_key {
            ctx.set(id, key, Value::Bytes(record.encode_system_fields()?))?;
        }
        debug!(entity = %entity.name, record = %record.id(), "minted record identity");
        Ok(Placement { scope, record })
    }

    /// Stores the system fields of a server version on an object.
    pub fn write_system_fields(
        &self,
        ctx: &mut Context,
        id: ObjectId,
        scope: DatabaseScope,
        record: &Record,
    ) -> SyncResult<()> {
        let object = ctx
            .object(id)
            .ok_or(skysync_store::StoreError::ObjectNotFound(id))?;
        let entity = self.schema.require(object.entity())?;
        let service = &entity.service;

        ctx.set(id, &service.record_name, record.id().name.as_str())?;
        if let Some(owner) = &service.owner_name {
            ctx.set(id, owner, record.owner())?;
        }
        let (preferred, fallback) = match scope {
            DatabaseScope::Public => (&service.public_record_data, &service.private_record_data),
            _ => (&service.private_record_data, &service.public_record_data),
        };
        if let Some(key) = preferred.as_deref().or(fallback.as_deref()) {
            ctx.set(id, key, Value::Bytes(record.encode_system_fields()?))?;
        }
        Ok(())
    }

    /// Finds the object of an entity with the given record name.
    pub fn lookup(
        &self,
        ctx: &Context,
        entity: &str,
        record_name: &str,
    ) -> SyncResult<Option<Object>> {
        let sync = self.schema.require(entity)?;
        Ok(ctx.fetch_one(
            entity,
            &Predicate::eq(sync.service.record_name.as_str(), record_name),
        )?)
    }
}
