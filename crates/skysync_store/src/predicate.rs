//! In-process fetch predicates.

use crate::object::Object;
use crate::value::Value;

/// A filter evaluated against objects of one entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches every object.
    All,
    /// Attribute equals the value.
    Eq(String, Value),
    /// Attribute equals one of the values.
    In(String, Vec<Value>),
    /// Attribute is unset.
    IsNull(String),
    /// Attribute is set.
    NotNull(String),
    /// All sub-predicates match.
    And(Vec<Predicate>),
    /// At least one sub-predicate matches.
    Or(Vec<Predicate>),
}

impl Predicate {
    /// `key == value`.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::Eq(key.into(), value.into())
    }

    /// `key IN values`.
    pub fn any_of<V: Into<Value>>(key: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In(key.into(), values.into_iter().map(Into::into).collect())
    }

    /// `key != nil`.
    pub fn not_null(key: impl Into<String>) -> Self {
        Predicate::NotNull(key.into())
    }

    /// `key == nil`.
    pub fn is_null(key: impl Into<String>) -> Self {
        Predicate::IsNull(key.into())
    }

    /// Conjunction of `self` and `other`.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Evaluates the predicate against an object.
    pub fn matches(&self, object: &Object) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq(key, value) => Self::lookup(object, key) == value,
            Predicate::In(key, values) => {
                let actual = Self::lookup(object, key);
                values.iter().any(|v| v == actual)
            }
            Predicate::IsNull(key) => Self::lookup(object, key).is_null(),
            Predicate::NotNull(key) => !Self::lookup(object, key).is_null(),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(object)),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(object)),
        }
    }

    fn lookup<'a>(object: &'a Object, key: &str) -> &'a Value {
        const NULL: &Value = &Value::Null;
        object.value(key).unwrap_or(NULL)
    }
}
