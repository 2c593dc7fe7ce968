//! Remote records.

use crate::error::{RemoteError, RemoteResult};
use crate::ids::{RecordId, ZoneId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// What the server does to a referencing record when its target is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceAction {
    /// Nothing happens.
    None,
    /// The referencing record is deleted too.
    DeleteSelf,
}

/// A pointer from one record to another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Target record.
    pub record_id: RecordId,
    /// Delete behavior.
    pub action: ReferenceAction,
}

impl Reference {
    /// Creates a reference.
    pub fn new(record_id: RecordId, action: ReferenceAction) -> Self {
        Self { record_id, action }
    }
}

/// A binary payload transferred out of band from the record body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    /// Location of the payload on the local file system.
    pub path: PathBuf,
}

impl Asset {
    /// Creates an asset backed by a file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// A field value on a remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    /// Explicitly cleared field.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Double(f64),
    /// String.
    Text(String),
    /// Timestamp in epoch milliseconds.
    Date(i64),
    /// Inline binary data.
    Bytes(Bytes),
    /// Single reference.
    Reference(Reference),
    /// List of references.
    ReferenceList(Vec<Reference>),
    /// Externalised binary data.
    Asset(Asset),
}

impl RecordValue {
    /// Returns true for [`RecordValue::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, RecordValue::Null)
    }
}

/// The version metadata of a record, persisted locally as an opaque blob.
#[derive(Serialize, Deserialize)]
struct SystemFields {
    record_type: String,
    record_name: String,
    zone: ZoneId,
    change_tag: Option<String>,
}

/// A typed, field-keyed remote document.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    record_type: String,
    id: RecordId,
    change_tag: Option<String>,
    fields: BTreeMap<String, RecordValue>,
}

impl Record {
    /// Creates a record that the server has never seen.
    pub fn new(record_type: impl Into<String>, id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            id,
            change_tag: None,
            fields: BTreeMap::new(),
        }
    }

    /// Returns the record type.
    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    /// Returns the record ID.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Returns the owner of the record's zone.
    pub fn owner(&self) -> &str {
        &self.id.zone.owner
    }

    /// Returns the server change tag, `None` for never-saved records.
    pub fn change_tag(&self) -> Option<&str> {
        self.change_tag.as_deref()
    }

    pub(crate) fn set_change_tag(&mut self, tag: impl Into<String>) {
        self.change_tag = Some(tag.into());
    }

    /// Returns a field value.
    pub fn get(&self, key: &str) -> Option<&RecordValue> {
        self.fields.get(key)
    }

    /// Sets a field value.
    pub fn set(&mut self, key: impl Into<String>, value: RecordValue) {
        self.fields.insert(key.into(), value);
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<RecordValue> {
        self.fields.remove(key)
    }

    /// Iterates over fields in key order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &RecordValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the set field names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns a copy carrying only the system fields.
    pub fn system_fields_only(&self) -> Record {
        Record {
            record_type: self.record_type.clone(),
            id: self.id.clone(),
            change_tag: self.change_tag.clone(),
            fields: BTreeMap::new(),
        }
    }

    /// Returns a copy carrying the system fields and only the given keys.
    pub fn project(&self, keys: &[String]) -> Record {
        let mut record = self.system_fields_only();
        for key in keys {
            if let Some(value) = self.fields.get(key) {
                record.fields.insert(key.clone(), value.clone());
            }
        }
        record
    }

    /// Encodes type, identity and change tag into an opaque blob.
    pub fn encode_system_fields(&self) -> RemoteResult<Bytes> {
        let fields = SystemFields {
            record_type: self.record_type.clone(),
            record_name: self.id.name.clone(),
            zone: self.id.zone.clone(),
            change_tag: self.change_tag.clone(),
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&fields, &mut buf)
            .map_err(|e| RemoteError::CorruptSystemFields(e.to_string()))?;
        Ok(Bytes::from(buf))
    }

    /// Rebuilds an empty record from a blob made by [`Record::encode_system_fields`].
    pub fn from_system_fields(blob: &[u8]) -> RemoteResult<Record> {
        let fields: SystemFields = ciborium::de::from_reader(blob)
            .map_err(|e| RemoteError::CorruptSystemFields(e.to_string()))?;
        Ok(Record {
            record_type: fields.record_type,
            id: RecordId::new(fields.record_name, fields.zone),
            change_tag: fields.change_tag,
            fields: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_fields_round_trip() {
        let mut record = Record::new("Company", RecordId::generate(ZoneId::owned("Main")));
        record.set_change_tag("7");
        record.set("name", RecordValue::Text("Acme".into()));

        let blob = record.encode_system_fields().unwrap();
        let restored = Record::from_system_fields(&blob).unwrap();

        assert_eq!(restored.record_type(), "Company");
        assert_eq!(restored.id(), record.id());
        assert_eq!(restored.change_tag(), Some("7"));
        assert_eq!(restored.get("name"), None);
        assert_eq!(restored, record.system_fields_only());
    }

    #[test]
    fn corrupt_blob_is_an_error() {
        let err = Record::from_system_fields(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, RemoteError::CorruptSystemFields(_)));
    }

    #[test]
    fn field_access() {
        let mut record = Record::new("Photo", RecordId::generate(ZoneId::default_zone()));
        record.set("title", RecordValue::Text("sunset".into()));
        record.set("data", RecordValue::Asset(Asset::new("/tmp/a")));
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["data", "title"]);
        assert!(record.remove("title").is_some());
        assert_eq!(record.owner(), crate::DEFAULT_OWNER);
    }
}
