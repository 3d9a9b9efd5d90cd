//! Type directory and table layout.
//!
//! The type directory answers "what attributes does type X have and where do
//! they live". It is read-only for the whole run. Every type maps to one
//! table; versioned types carry the history columns below in addition to
//! their attribute columns.

use super::value::SqlValue;
use crate::error::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Branch column of versioned tables.
pub const COL_BRANCH: &str = "_branch";
/// Object id column.
pub const COL_ID: &str = "_id";
/// First revision a row version is valid in.
pub const COL_REV_MIN: &str = "_rev_min";
/// Last revision a row version is valid in.
pub const COL_REV_MAX: &str = "_rev_max";
/// Revision the object was created in.
pub const COL_REV_CREATE: &str = "_rev_create";

pub const REVISION_TABLE: &str = "revision";
pub const BRANCH_TABLE: &str = "branch";
pub const XREF_TABLE: &str = "revision_xref";

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Boolean,
    BigInt,
    Double,
    Text,
}

impl SqlType {
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
        }
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
        }
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Rows read from one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRows {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl TableRows {
    pub fn new(table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Position of a column.
    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Kind of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Bool,
    Int,
    Float,
    Text,
    Id,
    Reference,
    Structured,
}

/// Attribute declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    pub kind: AttributeKind,
    /// Column name (default: attribute name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
}

impl AttributeDef {
    pub fn column_name(&self) -> &str {
        self.column.as_deref().unwrap_or(&self.name)
    }

    /// Physical columns backing this attribute. References span four.
    pub fn columns(&self) -> Vec<ColumnDef> {
        let base = self.column_name();
        match self.kind {
            AttributeKind::Bool => vec![ColumnDef::new(base, SqlType::Boolean)],
            AttributeKind::Int | AttributeKind::Id => vec![ColumnDef::new(base, SqlType::BigInt)],
            AttributeKind::Float => vec![ColumnDef::new(base, SqlType::Double)],
            AttributeKind::Text | AttributeKind::Structured => {
                vec![ColumnDef::new(base, SqlType::Text)]
            }
            AttributeKind::Reference => vec![
                ColumnDef::new(format!("{}_branch", base), SqlType::BigInt),
                ColumnDef::new(format!("{}_type", base), SqlType::Text),
                ColumnDef::new(format!("{}_id", base), SqlType::BigInt),
                ColumnDef::new(format!("{}_rev", base), SqlType::BigInt),
            ],
        }
    }
}

fn default_true() -> bool {
    true
}

/// Type declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    /// Table name (default: type name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Whether objects of this type live in the branch/revision model.
    #[serde(default = "default_true")]
    pub versioned: bool,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
}

impl TypeDef {
    pub fn table_name(&self) -> &str {
        self.table.as_deref().unwrap_or(&self.name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Table layout for this type.
    pub fn table_def(&self) -> TableDef {
        let mut columns = Vec::new();
        if self.versioned {
            columns.push(ColumnDef::new(COL_BRANCH, SqlType::BigInt));
            columns.push(ColumnDef::new(COL_ID, SqlType::BigInt));
            columns.push(ColumnDef::new(COL_REV_MIN, SqlType::BigInt));
            columns.push(ColumnDef::new(COL_REV_MAX, SqlType::BigInt));
            columns.push(ColumnDef::new(COL_REV_CREATE, SqlType::BigInt));
        } else {
            columns.push(ColumnDef::new(COL_ID, SqlType::BigInt));
        }
        for attribute in &self.attributes {
            columns.extend(attribute.columns());
        }
        TableDef {
            name: self.table_name().to_string(),
            columns,
        }
    }
}

/// Read-only type lookup.
pub trait TypeDirectory: Send + Sync {
    /// Find a type by name.
    fn lookup(&self, name: &str) -> Option<&TypeDef>;

    /// All types, in declaration order.
    fn types(&self) -> Vec<&TypeDef>;

    /// Tables outside the object model, copied row by row.
    fn raw_tables(&self) -> &[TableDef];

    /// Find the type stored in a table.
    fn type_for_table(&self, table: &str) -> Option<&TypeDef> {
        self.types().into_iter().find(|t| t.table_name() == table)
    }
}

/// Table holding one row per revision.
pub fn revision_table() -> TableDef {
    TableDef {
        name: REVISION_TABLE.to_string(),
        columns: vec![
            ColumnDef::new("rev", SqlType::BigInt),
            ColumnDef::new("date", SqlType::BigInt),
            ColumnDef::new("author", SqlType::Text),
            ColumnDef::new("log", SqlType::Text),
        ],
    }
}

/// Table holding one row per branch.
pub fn branch_table() -> TableDef {
    TableDef {
        name: BRANCH_TABLE.to_string(),
        columns: vec![
            ColumnDef::new("branch", SqlType::BigInt),
            ColumnDef::new("base_branch", SqlType::BigInt),
            ColumnDef::new("base_rev", SqlType::BigInt),
            ColumnDef::new("rev_create", SqlType::BigInt),
        ],
    }
}

/// Table recording which types each revision touched.
pub fn xref_table() -> TableDef {
    TableDef {
        name: XREF_TABLE.to_string(),
        columns: vec![
            ColumnDef::new("rev", SqlType::BigInt),
            ColumnDef::new("branch", SqlType::BigInt),
            ColumnDef::new("type", SqlType::Text),
        ],
    }
}

/// Every table of the store: system tables, type tables, raw tables.
pub fn store_tables(types: &dyn TypeDirectory) -> Vec<TableDef> {
    let mut tables = vec![branch_table(), revision_table(), xref_table()];
    tables.extend(types.types().into_iter().map(TypeDef::table_def));
    tables.extend(types.raw_tables().iter().cloned());
    tables
}

/// Type directory built from declarations.
#[derive(Debug, Clone, Default)]
pub struct SchemaTypes {
    types: Vec<TypeDef>,
    by_name: BTreeMap<String, usize>,
    raw_tables: Vec<TableDef>,
}

impl SchemaTypes {
    /// Build the directory, rejecting duplicate or clashing names.
    pub fn new(types: Vec<TypeDef>, raw_tables: Vec<TableDef>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        let mut tables: BTreeSet<String> = [REVISION_TABLE, BRANCH_TABLE, XREF_TABLE]
            .iter()
            .map(|s| s.to_string())
            .collect();

        for (i, def) in types.iter().enumerate() {
            if def.name.is_empty() {
                return Err(MigrateError::Config("schema type name is required".into()));
            }
            if by_name.insert(def.name.clone(), i).is_some() {
                return Err(MigrateError::Config(format!(
                    "schema type '{}' is declared twice",
                    def.name
                )));
            }
            if !tables.insert(def.table_name().to_string()) {
                return Err(MigrateError::Config(format!(
                    "table '{}' of type '{}' clashes with another table",
                    def.table_name(),
                    def.name
                )));
            }
            let mut seen = BTreeSet::new();
            for attribute in &def.attributes {
                if attribute.name.starts_with('_') {
                    return Err(MigrateError::Config(format!(
                        "attribute '{}.{}' must not start with '_'",
                        def.name, attribute.name
                    )));
                }
                if !seen.insert(attribute.name.as_str()) {
                    return Err(MigrateError::Config(format!(
                        "attribute '{}.{}' is declared twice",
                        def.name, attribute.name
                    )));
                }
            }
        }

        for table in &raw_tables {
            if !tables.insert(table.name.clone()) {
                return Err(MigrateError::Config(format!(
                    "raw table '{}' clashes with another table",
                    table.name
                )));
            }
        }

        Ok(Self {
            types,
            by_name,
            raw_tables,
        })
    }
}

impl TypeDirectory for SchemaTypes {
    fn lookup(&self, name: &str) -> Option<&TypeDef> {
        self.by_name.get(name).map(|&i| &self.types[i])
    }

    fn types(&self) -> Vec<&TypeDef> {
        self.types.iter().collect()
    }

    fn raw_tables(&self) -> &[TableDef] {
        &self.raw_tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> TypeDef {
        TypeDef {
            name: "Person".into(),
            table: Some("person".into()),
            versioned: true,
            attributes: vec![
                AttributeDef {
                    name: "name".into(),
                    kind: AttributeKind::Text,
                    column: None,
                },
                AttributeDef {
                    name: "manager".into(),
                    kind: AttributeKind::Reference,
                    column: Some("mgr".into()),
                },
            ],
        }
    }

    #[test]
    fn test_versioned_table_layout() {
        let table = person().table_def();
        assert_eq!(table.name, "person");
        assert_eq!(
            table.column_names(),
            vec![
                "_branch", "_id", "_rev_min", "_rev_max", "_rev_create", "name", "mgr_branch",
                "mgr_type", "mgr_id", "mgr_rev"
            ]
        );
    }

    #[test]
    fn test_unversioned_table_layout() {
        let mut def = person();
        def.versioned = false;
        def.attributes.truncate(1);
        assert_eq!(def.table_def().column_names(), vec!["_id", "name"]);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let result = SchemaTypes::new(vec![person(), person()], vec![]);
        assert!(matches!(result, Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_table_clash_with_system_table() {
        let mut def = person();
        def.table = Some(REVISION_TABLE.into());
        assert!(SchemaTypes::new(vec![def], vec![]).is_err());
    }

    #[test]
    fn test_reserved_attribute_name_rejected() {
        let mut def = person();
        def.attributes[0].name = "_self".into();
        assert!(SchemaTypes::new(vec![def], vec![]).is_err());
    }

    #[test]
    fn test_lookup_and_store_tables() {
        let raw = TableDef {
            name: "audit".into(),
            columns: vec![ColumnDef::new("line", SqlType::Text)],
        };
        let types = SchemaTypes::new(vec![person()], vec![raw]).unwrap();
        assert!(types.lookup("Person").is_some());
        assert!(types.lookup("Nobody").is_none());
        assert_eq!(types.type_for_table("person").map(|t| t.name.as_str()), Some("Person"));

        let names: Vec<_> = store_tables(&types).into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["branch", "revision", "revision_xref", "person", "audit"]);
    }
}
