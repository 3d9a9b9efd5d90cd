//! PostgreSQL SQL text: identifiers, literals, DDL and COPY encoding.

use crate::core::{SqlValue, TableDef};

/// Quote a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Fully qualify a table name.
pub fn qualify_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Escape a string for SQL literal use.
fn escape_sql_string(s: &str) -> String {
    s.replace('\'', "''")
}

/// Convert a cell to a SQL literal.
pub fn literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F64(x) if x.is_finite() => format!("{:?}", x),
        SqlValue::F64(x) => format!("'{}'::double precision", float_text(*x)),
        SqlValue::Text(s) => format!("'{}'", escape_sql_string(s)),
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// INSERT with literal values.
pub fn insert(schema: &str, table: &str, columns: &[String], rows: &[Vec<SqlValue>]) -> String {
    let value_rows: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = row.iter().map(literal).collect();
            format!("({})", values.join(", "))
        })
        .collect();

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualify_table(schema, table),
        column_list(columns),
        value_rows.join(",\n    ")
    )
}

/// CREATE TABLE for a table layout.
pub fn create_table(schema: &str, table: &TableDef) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("    {} {}", quote_ident(&c.name), c.sql_type.ddl()))
        .collect();
    format!(
        "CREATE TABLE {} (\n{}\n)",
        qualify_table(schema, &table.name),
        columns.join(",\n")
    )
}

pub fn drop_table(schema: &str, table: &str) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", qualify_table(schema, table))
}

/// SELECT of the given columns, in storage order.
pub fn select(schema: &str, table: &str, columns: &[String]) -> String {
    format!(
        "SELECT {} FROM {}",
        column_list(columns),
        qualify_table(schema, table)
    )
}

/// COPY FROM STDIN in text format.
pub fn copy_in(schema: &str, table: &str, columns: &[String]) -> String {
    format!(
        "COPY {} ({}) FROM STDIN WITH (FORMAT text)",
        qualify_table(schema, table),
        column_list(columns)
    )
}

/// Convert a cell to COPY text format.
pub fn copy_text(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "\\N".to_string(),
        SqlValue::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        SqlValue::I64(n) => n.to_string(),
        SqlValue::F64(x) => float_text(*x),
        SqlValue::Text(s) => escape_copy_text(s),
    }
}

/// Float text PostgreSQL accepts, including the non-finite spellings.
fn float_text(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x == f64::INFINITY {
        "Infinity".to_string()
    } else if x == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        x.to_string()
    }
}

/// Escape special characters for COPY text format.
fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}
