//! Attribute values to and from row cells.
//!
//! Errors are plain messages; callers attach revision and object context.

use super::event::Attributes;
use super::identity::{HistoryPosition, ObjectIdentity, ObjectReference};
use super::schema::{AttributeDef, AttributeKind, TypeDef};
use super::value::{SqlValue, Value};
use std::collections::HashMap;

/// Encode attribute values in declaration order. Missing attributes are null.
pub fn encode_attributes(def: &TypeDef, values: &Attributes) -> Result<Vec<SqlValue>, String> {
    if let Some(unknown) = values.keys().find(|name| def.attribute(name).is_none()) {
        return Err(format!("type {} has no attribute '{}'", def.name, unknown));
    }
    let mut cells = Vec::new();
    for attribute in &def.attributes {
        let value = values.get(&attribute.name).unwrap_or(&Value::Null);
        cells.extend(encode_value(attribute, value)?);
    }
    Ok(cells)
}

/// Decode attribute values of one row. `columns` names the row's cells.
pub fn decode_attributes(
    def: &TypeDef,
    columns: &[String],
    row: &[SqlValue],
) -> Result<Attributes, String> {
    let positions: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();

    let mut values = Attributes::new();
    for attribute in &def.attributes {
        let mut cells = Vec::new();
        for column in attribute.columns() {
            let cell = positions
                .get(column.name.as_str())
                .and_then(|&i| row.get(i))
                .cloned()
                .unwrap_or(SqlValue::Null);
            cells.push(cell);
        }
        let value = decode_value(attribute, &cells)?;
        if !value.is_null() {
            values.insert(attribute.name.clone(), value);
        }
    }
    Ok(values)
}

fn mismatch(attribute: &AttributeDef, value: &dyn std::fmt::Debug) -> String {
    format!(
        "attribute '{}' of kind {:?} cannot hold {:?}",
        attribute.name, attribute.kind, value
    )
}

fn encode_value(attribute: &AttributeDef, value: &Value) -> Result<Vec<SqlValue>, String> {
    let cell = match (attribute.kind, value) {
        (AttributeKind::Reference, Value::Null) => return Ok(vec![SqlValue::Null; 4]),
        (AttributeKind::Reference, Value::Reference(r)) => {
            return Ok(vec![
                SqlValue::I64(r.object.branch),
                SqlValue::Text(r.object.type_name.clone()),
                SqlValue::I64(r.object.id),
                r.position
                    .as_revision()
                    .map(SqlValue::I64)
                    .unwrap_or(SqlValue::Null),
            ]);
        }
        (_, Value::Null) => SqlValue::Null,
        (AttributeKind::Bool, Value::Bool(b)) => SqlValue::Bool(*b),
        (AttributeKind::Int, Value::Int(n)) => SqlValue::I64(*n),
        (AttributeKind::Id, Value::Id(id)) => SqlValue::I64(*id),
        (AttributeKind::Float, Value::Float(x)) => SqlValue::F64(*x),
        (AttributeKind::Float, Value::Int(n)) => SqlValue::F64(*n as f64),
        (AttributeKind::Text, Value::Text(s)) => SqlValue::Text(s.clone()),
        (AttributeKind::Structured, Value::Structured(v)) => SqlValue::Text(v.to_string()),
        _ => return Err(mismatch(attribute, value)),
    };
    Ok(vec![cell])
}

fn decode_value(attribute: &AttributeDef, cells: &[SqlValue]) -> Result<Value, String> {
    if attribute.kind == AttributeKind::Reference {
        return match cells {
            [SqlValue::I64(branch), SqlValue::Text(type_name), SqlValue::I64(id), rev] => {
                let position = match rev {
                    SqlValue::Null => HistoryPosition::Current,
                    SqlValue::I64(r) => HistoryPosition::Revision(*r),
                    other => return Err(mismatch(attribute, other)),
                };
                Ok(Value::Reference(ObjectReference {
                    object: ObjectIdentity::new(*branch, type_name.clone(), *id),
                    position,
                }))
            }
            cells if cells.iter().all(SqlValue::is_null) => Ok(Value::Null),
            other => Err(mismatch(attribute, &other)),
        };
    }

    let cell = cells.first().unwrap_or(&SqlValue::Null);
    let value = match (attribute.kind, cell) {
        (_, SqlValue::Null) => Value::Null,
        (AttributeKind::Bool, SqlValue::Bool(b)) => Value::Bool(*b),
        (AttributeKind::Int, SqlValue::I64(n)) => Value::Int(*n),
        (AttributeKind::Id, SqlValue::I64(n)) => Value::Id(*n),
        (AttributeKind::Float, SqlValue::F64(x)) => Value::Float(*x),
        (AttributeKind::Float, SqlValue::I64(n)) => Value::Float(*n as f64),
        (AttributeKind::Text, SqlValue::Text(s)) => Value::Text(s.clone()),
        (AttributeKind::Structured, SqlValue::Text(s)) => {
            let parsed = serde_json::from_str(s)
                .map_err(|e| format!("attribute '{}' holds invalid JSON: {}", attribute.name, e))?;
            Value::Structured(parsed)
        }
        (_, other) => return Err(mismatch(attribute, other)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> TypeDef {
        let attr = |name: &str, kind| AttributeDef {
            name: name.into(),
            kind,
            column: None,
        };
        TypeDef {
            name: "Contact".into(),
            table: None,
            versioned: true,
            attributes: vec![
                attr("name", AttributeKind::Text),
                attr("age", AttributeKind::Int),
                attr("owner", AttributeKind::Reference),
                attr("settings", AttributeKind::Structured),
            ],
        }
    }

    #[test]
    fn test_encode_decode_attributes() {
        let def = contact();
        let values = Attributes::from([
            ("name".to_string(), Value::text("Ada")),
            (
                "owner".to_string(),
                Value::Reference(ObjectReference {
                    object: ObjectIdentity::new(1, "Person", 4),
                    position: HistoryPosition::Revision(9),
                }),
            ),
            (
                "settings".to_string(),
                Value::Structured(serde_json::json!({"theme": "dark"})),
            ),
        ]);

        let cells = encode_attributes(&def, &values).unwrap();
        assert_eq!(cells.len(), 7);
        assert_eq!(cells[1], SqlValue::Null);
        assert_eq!(cells[3], SqlValue::Text("Person".into()));

        let columns: Vec<String> = def
            .attributes
            .iter()
            .flat_map(|a| a.columns())
            .map(|c| c.name)
            .collect();
        let decoded = decode_attributes(&def, &columns, &cells).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_unknown_attribute_rejected() {
        let values = Attributes::from([("shoe_size".to_string(), Value::Int(44))]);
        let err = encode_attributes(&contact(), &values).unwrap_err();
        assert!(err.contains("shoe_size"));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let values = Attributes::from([("age".to_string(), Value::text("old"))]);
        assert!(encode_attributes(&contact(), &values).is_err());
    }

    #[test]
    fn test_null_reference_decodes_to_absent() {
        let def = contact();
        let columns = vec!["owner_branch".to_string(), "owner_id".to_string()];
        let row = vec![SqlValue::Null, SqlValue::Null];
        let decoded = decode_attributes(&def, &columns, &row).unwrap();
        assert!(decoded.is_empty());
    }
}
