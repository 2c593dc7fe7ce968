//! Dynamic attribute value type.

use crate::schema::AttributeType;
use bytes::Bytes;
use uuid::Uuid;

/// A dynamic attribute value.
///
/// `Null` is the absence of a value and is accepted by every attribute type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Double(f64),
    /// UTF-8 text.
    Text(String),
    /// Point in time, milliseconds since the Unix epoch.
    Date(i64),
    /// Binary payload.
    Bytes(Bytes),
    /// UUID value.
    Uuid(Uuid),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a double, if it is one.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a date in epoch milliseconds, if it is one.
    pub fn as_date(&self) -> Option<i64> {
        match self {
            Value::Date(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a binary payload.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a UUID, if it is one.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    /// Returns a short name for the value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Uuid(_) => "uuid",
        }
    }

    /// Returns true if this value may be stored in an attribute of type `ty`.
    pub fn fits(&self, ty: AttributeType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Bool(_), AttributeType::Bool)
                | (Value::Integer(_), AttributeType::Integer)
                | (Value::Double(_), AttributeType::Double)
                | (Value::Text(_), AttributeType::Text)
                | (Value::Date(_), AttributeType::Date)
                | (Value::Bytes(_), AttributeType::Bytes)
                | (Value::Uuid(_), AttributeType::Uuid)
        )
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

impl From<Uuid> for Value {
    fn from(u: Uuid) -> Self {
        Value::Uuid(u)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors() {
        assert_eq!(Value::from("acme").as_text(), Some("acme"));
        assert_eq!(Value::from(7i64).as_integer(), Some(7));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::Date(1_000).as_date(), Some(1_000));
        assert!(Value::from(None::<String>).is_null());
        assert_eq!(Value::from(vec![1u8, 2]).as_bytes().map(|b| b.len()), Some(2));
    }

    #[test]
    fn null_fits_every_type() {
        assert!(Value::Null.fits(AttributeType::Bytes));
        assert!(Value::Null.fits(AttributeType::Text));
        assert!(Value::from("x").fits(AttributeType::Text));
        assert!(!Value::from("x").fits(AttributeType::Integer));
        assert!(!Value::from(1.5).fits(AttributeType::Integer));
    }
}
