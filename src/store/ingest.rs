// Flight message ingestion: parsed log messages -> typed table rows

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;

/// Parsed log in the uploader's shape: `{message_name: {field: [values...]}}`.
pub type FlightMessages = BTreeMap<String, BTreeMap<String, Vec<Value>>>;

/// Fields that always hold timestamps and are stored as integers.
const TIME_FIELDS: &[&str] = &["timeus", "time_boot_ms", "timestamp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
}

impl SqlType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
        }
    }
}

/// A single value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct PreparedTable {
    pub name: String,
    pub columns: Vec<(String, SqlType)>,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestSummary {
    pub tables: Vec<String>,
    pub rows_inserted: usize,
    pub skipped: Vec<String>,
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid identifier regex"))
}

pub fn is_safe_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_time_field(field: &str) -> bool {
    TIME_FIELDS.iter().any(|t| t.eq_ignore_ascii_case(field))
}

fn scalar_type(value: &Value) -> Option<SqlType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(SqlType::Integer),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(SqlType::Integer),
        Value::Number(_) => Some(SqlType::Real),
        Value::String(_) => Some(SqlType::Text),
        Value::Array(items) => match items.as_slice() {
            [] => None,
            [single] if !single.is_array() => scalar_type(single),
            _ => Some(SqlType::Text),
        },
        Value::Object(_) => Some(SqlType::Text),
    }
}

/// Column type from the first non-null sample; timestamp fields are forced
/// to INTEGER.
pub fn infer_type(field: &str, values: &[Value]) -> SqlType {
    if is_time_field(field) {
        return SqlType::Integer;
    }
    values
        .iter()
        .find_map(|v| {
            if field == "time_unix_usec" {
                if let Value::Array(outer) = v {
                    if let Some(Value::Array(inner)) = outer.first() {
                        return inner.first().and_then(scalar_type);
                    }
                }
            }
            scalar_type(v)
        })
        .unwrap_or(SqlType::Text)
}

fn number_cell(n: &serde_json::Number) -> Cell {
    match n.as_i64() {
        Some(i) => Cell::Integer(i),
        None => n.as_f64().map(Cell::Real).unwrap_or(Cell::Null),
    }
}

/// Flatten one raw value: empty lists become NULL, single-element lists
/// their element, `time_unix_usec` pairs their first timestamp, and any
/// other structure its JSON text.
pub fn process_value(field: &str, value: &Value) -> Cell {
    match value {
        Value::Null => Cell::Null,
        Value::Bool(b) => Cell::Integer(i64::from(*b)),
        Value::Number(n) => number_cell(n),
        Value::String(s) => Cell::Text(s.clone()),
        Value::Array(items) => {
            if items.is_empty() {
                return Cell::Null;
            }
            if field == "time_unix_usec" {
                if let Some(Value::Array(inner)) = items.first() {
                    return inner.first().map(|v| process_value(field, v)).unwrap_or(Cell::Null);
                }
            }
            match items.as_slice() {
                [single] if !single.is_array() && !single.is_object() => process_value(field, single),
                _ => Cell::Text(value.to_string()),
            }
        }
        Value::Object(_) => Cell::Text(value.to_string()),
    }
}

/// Coerce a cell to its column's declared type. Values that cannot be
/// represented become NULL.
pub fn coerce(cell: Cell, column_type: SqlType) -> Cell {
    match (column_type, cell) {
        (_, Cell::Null) => Cell::Null,
        (SqlType::Integer, Cell::Integer(i)) => Cell::Integer(i),
        (SqlType::Integer, Cell::Real(f)) if f.is_finite() => Cell::Integer(f.trunc() as i64),
        (SqlType::Integer, Cell::Text(s)) => {
            let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
            let first = trimmed.split(',').next().unwrap_or("").trim();
            first
                .parse::<i64>()
                .ok()
                .or_else(|| first.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map(Cell::Integer)
                .unwrap_or(Cell::Null)
        }
        (SqlType::Real, Cell::Integer(i)) => Cell::Real(i as f64),
        (SqlType::Real, Cell::Real(f)) => Cell::Real(f),
        (SqlType::Real, Cell::Text(s)) => s.trim().parse::<f64>().map(Cell::Real).unwrap_or(Cell::Null),
        (SqlType::Text, Cell::Integer(i)) => Cell::Text(i.to_string()),
        (SqlType::Text, Cell::Real(f)) => Cell::Text(f.to_string()),
        (SqlType::Text, Cell::Text(s)) => Cell::Text(s),
        (_, _) => Cell::Null,
    }
}

/// Turn one message's columns into a table. Returns `Ok(None)` when the
/// message carries no rows.
pub fn prepare_table(name: &str, fields: &BTreeMap<String, Vec<Value>>) -> Result<Option<PreparedTable>, StoreError> {
    if !is_safe_identifier(name) {
        return Err(StoreError::InvalidData(format!("invalid message name: {name:?}")));
    }
    if let Some(bad) = fields.keys().find(|f| !is_safe_identifier(f)) {
        return Err(StoreError::InvalidData(format!("invalid field name {bad:?} in {name}")));
    }

    let row_count = fields.values().map(Vec::len).max().unwrap_or(0);
    if row_count == 0 {
        return Ok(None);
    }

    let columns: Vec<(String, SqlType)> = fields
        .iter()
        .map(|(field, values)| (field.clone(), infer_type(field, values)))
        .collect();

    let rows = (0..row_count)
        .map(|i| {
            columns
                .iter()
                .map(|(field, column_type)| {
                    let raw = fields[field].get(i).unwrap_or(&Value::Null);
                    coerce(process_value(field, raw), *column_type)
                })
                .collect()
        })
        .collect();

    Ok(Some(PreparedTable {
        name: name.to_string(),
        columns,
        rows,
    }))
}

pub fn create_table_sql(table: &PreparedTable) -> String {
    let columns = table
        .columns
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(&table.name), columns)
}

pub fn insert_sql(table: &PreparedTable) -> String {
    let names = table
        .columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; table.columns.len()].join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(&table.name), names, placeholders)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_safe_identifiers() {
        assert!(is_safe_identifier("GLOBAL_POSITION_INT"));
        assert!(is_safe_identifier("_x1"));
        assert!(!is_safe_identifier("1abc"));
        assert!(!is_safe_identifier("alt; DROP TABLE x"));
        assert!(!is_safe_identifier(""));
    }

    #[test]
    fn test_time_fields_forced_to_integer() {
        assert_eq!(infer_type("TimeUS", &[json!("123")]), SqlType::Integer);
        assert_eq!(infer_type("time_boot_ms", &[json!(1.5)]), SqlType::Integer);
    }

    #[test]
    fn test_infer_type_skips_nulls() {
        assert_eq!(infer_type("alt", &[Value::Null, json!(12.5)]), SqlType::Real);
        assert_eq!(infer_type("armed", &[json!(true)]), SqlType::Integer);
        assert_eq!(infer_type("mode", &[json!("AUTO")]), SqlType::Text);
        assert_eq!(infer_type("empty", &[]), SqlType::Text);
    }

    #[test]
    fn test_process_value_flattening() {
        assert_eq!(process_value("x", &json!([])), Cell::Null);
        assert_eq!(process_value("x", &json!([7])), Cell::Integer(7));
        assert_eq!(process_value("x", &json!(true)), Cell::Integer(1));
        assert_eq!(
            process_value("time_unix_usec", &json!([[1700000000, 2], [5, 6]])),
            Cell::Integer(1700000000)
        );
        assert_eq!(process_value("x", &json!([1, 2])), Cell::Text("[1,2]".to_string()));
    }

    #[test]
    fn test_coerce_to_column_type() {
        assert_eq!(coerce(Cell::Real(12.9), SqlType::Integer), Cell::Integer(12));
        assert_eq!(coerce(Cell::Text("[42, 1]".into()), SqlType::Integer), Cell::Integer(42));
        assert_eq!(coerce(Cell::Text("abc".into()), SqlType::Real), Cell::Null);
        assert_eq!(coerce(Cell::Integer(3), SqlType::Real), Cell::Real(3.0));
    }

    #[test]
    fn test_prepare_table_pads_short_columns() {
        let mut fields = BTreeMap::new();
        fields.insert("alt".to_string(), vec![json!(10), json!(20), json!(30)]);
        fields.insert("mode".to_string(), vec![json!("AUTO")]);

        let table = prepare_table("VFR_HUD", &fields).unwrap().unwrap();
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[2], vec![Cell::Integer(30), Cell::Null]);
        assert_eq!(
            create_table_sql(&table),
            r#"CREATE TABLE IF NOT EXISTS "VFR_HUD" ("alt" INTEGER, "mode" TEXT)"#
        );
        assert_eq!(insert_sql(&table), r#"INSERT INTO "VFR_HUD" ("alt", "mode") VALUES (?, ?)"#);
    }

    #[test]
    fn test_prepare_table_rejects_unsafe_names() {
        let mut fields = BTreeMap::new();
        fields.insert("alt".to_string(), vec![json!(1)]);
        assert!(matches!(prepare_table("x\"; DROP", &fields), Err(StoreError::InvalidData(_))));

        let mut bad = BTreeMap::new();
        bad.insert("a b".to_string(), vec![json!(1)]);
        assert!(prepare_table("OK", &bad).is_err());
    }

    #[test]
    fn test_prepare_table_without_rows() {
        let mut fields = BTreeMap::new();
        fields.insert("alt".to_string(), Vec::new());
        assert!(prepare_table("EMPTY", &fields).unwrap().is_none());
    }
}
