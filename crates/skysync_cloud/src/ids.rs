//! Identity types for remote records.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Owner name used for zones owned by the current user.
pub const DEFAULT_OWNER: &str = "__defaultOwner__";

/// A remote database scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DatabaseScope {
    /// The current user's private database.
    Private,
    /// Zones shared with the current user by others.
    Shared,
    /// The world-readable public database.
    Public,
}

impl DatabaseScope {
    /// Returns a short name for the scope.
    pub fn name(&self) -> &'static str {
        match self {
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
            DatabaseScope::Public => "public",
        }
    }

    /// Parses a scope name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "private" => Some(DatabaseScope::Private),
            "shared" => Some(DatabaseScope::Shared),
            "public" => Some(DatabaseScope::Public),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies a record zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    /// Zone name.
    pub name: String,
    /// Owner of the zone.
    pub owner: String,
}

impl ZoneId {
    /// Name of the implicit zone every database has.
    pub const DEFAULT_ZONE_NAME: &'static str = "_defaultZone";

    /// Creates a zone ID.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Creates a zone ID owned by the current user.
    pub fn owned(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_OWNER)
    }

    /// The default zone of a database.
    pub fn default_zone() -> Self {
        Self::owned(Self::DEFAULT_ZONE_NAME)
    }

    /// Returns true if the current user owns the zone.
    pub fn is_owned(&self) -> bool {
        self.owner == DEFAULT_OWNER
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.owner)
    }
}

/// Identifies a record: a stable name inside a zone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Stable record name.
    pub name: String,
    /// Zone the record lives in.
    pub zone: ZoneId,
}

impl RecordId {
    /// Creates a record ID.
    pub fn new(name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }

    /// Mints a record ID with a fresh random name.
    pub fn generate(zone: ZoneId) -> Self {
        Self::new(Uuid::new_v4().to_string(), zone)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.zone)
    }
}

/// A unit of incremental fetch: a whole database scope or one zone in it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Partition {
    /// Database-level changes (or public notifications).
    Database(DatabaseScope),
    /// Changes in one zone.
    Zone(DatabaseScope, ZoneId),
}

impl Partition {
    /// Returns the database scope of the partition.
    pub fn scope(&self) -> DatabaseScope {
        match self {
            Partition::Database(scope) | Partition::Zone(scope, _) => *scope,
        }
    }

    /// Returns the zone, if this is a zone partition.
    pub fn zone(&self) -> Option<&ZoneId> {
        match self {
            Partition::Database(_) => None,
            Partition::Zone(_, zone) => Some(zone),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Database(scope) => write!(f, "db:{scope}"),
            Partition::Zone(scope, zone) => write!(f, "zone:{scope}:{zone}"),
        }
    }
}

/// An opaque server cursor.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeToken(Vec<u8>);

impl ChangeToken {
    /// Wraps raw token bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ChangeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeToken(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Correlation ID of a long-lived remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(String);

impl OperationId {
    /// Generates a new random operation ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps a persisted operation ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
