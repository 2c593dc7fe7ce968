//! Error types for the local store.

use crate::types::ObjectId;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Entity type is not declared in the schema.
    #[error("unknown entity: {name}")]
    UnknownEntity {
        /// Name of the entity.
        name: String,
    },

    /// Field is not declared on the entity.
    #[error("unknown field {field} on entity {entity}")]
    UnknownField {
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
    },

    /// Object does not exist (or was deleted).
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),

    /// Value type does not match the declared attribute type.
    #[error("type mismatch for {entity}.{field}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Entity name.
        entity: String,
        /// Field name.
        field: String,
        /// Declared type.
        expected: String,
        /// Type of the offered value.
        actual: String,
    },

    /// Relationship was used with the wrong cardinality.
    #[error("relationship {entity}.{field} is not {expected}")]
    Cardinality {
        /// Entity name.
        entity: String,
        /// Relationship name.
        field: String,
        /// Expected cardinality ("to-one" or "to-many").
        expected: &'static str,
    },

    /// Relationship target has the wrong entity type.
    #[error("relationship {entity}.{field} expects {expected}, got {actual}")]
    WrongDestination {
        /// Entity name.
        entity: String,
        /// Relationship name.
        field: String,
        /// Declared destination entity.
        expected: String,
        /// Actual target entity.
        actual: String,
    },

    /// Schema is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// Saving the context failed.
    #[error("save failed: {message}")]
    SaveFailed {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates an unknown entity error.
    pub fn unknown_entity(name: impl Into<String>) -> Self {
        Self::UnknownEntity { name: name.into() }
    }

    /// Creates an unknown field error.
    pub fn unknown_field(entity: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            entity: entity.into(),
            field: field.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a save failed error.
    pub fn save_failed(message: impl Into<String>) -> Self {
        Self::SaveFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::unknown_field("Company", "nmae");
        assert_eq!(err.to_string(), "unknown field nmae on entity Company");

        let err = StoreError::save_failed("disk full");
        assert!(err.to_string().contains("disk full"));
    }
}
