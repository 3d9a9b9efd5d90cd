//! Attribute values carried by events.
//!
//! A [`Value`] is what an event stores per attribute: a primitive, an
//! [`ObjectReference`], or a structured configuration value kept as JSON.
//! [`KeyPart`] is the hashable projection used by the indexer, and
//! [`SqlValue`] is the cell type of persisted rows.

use super::identity::{ObjectId, ObjectIdentity, ObjectReference};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Raw object identifier (not a full reference).
    Id(ObjectId),
    Reference(ObjectReference),
    /// Nested configuration value, passed through untouched.
    Structured(serde_json::Value),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn reference(object: ObjectIdentity) -> Self {
        Value::Reference(ObjectReference::current(object))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ObjectReference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Hashable projection for index keys. References key by identity only.
    pub fn key_part(&self) -> KeyPart {
        match self {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(n) => KeyPart::Int(*n),
            Value::Float(f) => KeyPart::Float(f.to_bits()),
            Value::Text(s) => KeyPart::Text(s.clone()),
            Value::Id(id) => KeyPart::Id(*id),
            Value::Reference(r) => KeyPart::Object(r.object.clone()),
            Value::Structured(v) => KeyPart::Structured(v.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Id(id) => write!(f, "{}", id),
            Value::Reference(r) => write!(f, "{}", r),
            Value::Structured(v) => write!(f, "{}", v),
        }
    }
}

/// Hashable form of a [`Value`], used as index key component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    /// IEEE bits, so NaN keys compare by representation.
    Float(u64),
    Text(String),
    Id(ObjectId),
    Object(ObjectIdentity),
    Structured(String),
}

/// Compute the key for a list of values.
pub fn key_of(values: &[Value]) -> Vec<KeyPart> {
    values.iter().map(Value::key_part).collect()
}

/// A single cell of a persisted row.
///
/// Serialized untagged so load scripts stay compact: `null`, `true`, `12`,
/// `1.5`, `"text"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::HistoryPosition;

    #[test]
    fn test_value_json_shape() {
        let json = serde_json::to_string(&Value::text("abc")).unwrap();
        assert_eq!(json, r#"{"t":"text","v":"abc"}"#);
        let null = serde_json::to_string(&Value::Null).unwrap();
        assert_eq!(null, r#"{"t":"null"}"#);
        let back: Value = serde_json::from_str(&null).unwrap();
        assert!(back.is_null());
    }

    #[test]
    fn test_reference_key_ignores_position() {
        let object = ObjectIdentity::new(1, "Person", 3);
        let current = Value::reference(object.clone());
        let historic = Value::Reference(ObjectReference {
            object,
            position: HistoryPosition::Revision(5),
        });
        assert_eq!(current.key_part(), historic.key_part());
    }

    #[test]
    fn test_structured_passes_through() {
        let v = Value::Structured(serde_json::json!({"a": [1, 2]}));
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_sql_value_untagged() {
        let row = vec![
            SqlValue::Null,
            SqlValue::Bool(true),
            SqlValue::I64(12),
            SqlValue::F64(1.5),
            SqlValue::Text("x".into()),
        ];
        let json = serde_json::to_string(&row).unwrap();
        assert_eq!(json, r#"[null,true,12,1.5,"x"]"#);
        let back: Vec<SqlValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }
}
