//! Per-session flight tables.
//!
//! Each session owns one embedded SQLite database holding the rows of its
//! uploaded flight log, one table per message type. Agents only ever see the
//! read-only [`FlightTable`] surface: schema introspection and execution of
//! statements that already passed the validator.

pub mod ingest;
pub mod knowledge_base;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::StoreConfig;
use crate::validator::ValidatedQuery;

pub use ingest::{FlightMessages, IngestSummary};
pub use knowledge_base::KnowledgeBase;
pub use sqlite::FlightDatabase;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Query timed out after {0}ms")]
    Timeout(u64),

    #[error("Table engine unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid flight data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Failures caused by the statement itself. These are fed back into a
    /// regeneration attempt instead of failing the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::Query(_) | StoreError::Timeout(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => StoreError::Query(db.message().to_string()),
            sqlx::Error::RowNotFound
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Query(err.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_rows: usize,
    pub timeout: Duration,
}

impl QueryLimits {
    pub fn new(max_rows: usize, timeout: Duration) -> Self {
        Self { max_rows, timeout }
    }
}

impl From<&StoreConfig> for QueryLimits {
    fn from(config: &StoreConfig) -> Self {
        Self::new(config.max_rows, Duration::from_millis(config.query_timeout_ms))
    }
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(column))
    }
}

/// Column names and types only; never row data.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableSchema {
    pub tables: Vec<TableInfo>,
}

impl TableSchema {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Identifier lookup is case-insensitive, like the engine's.
    pub fn table(&self, name: &str) -> Option<&TableInfo> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column_anywhere(&self, column: &str) -> bool {
        self.tables.iter().any(|t| t.has_column(column))
    }

    /// Prompt rendering: one block per table with its description and columns.
    pub fn render(&self) -> String {
        if self.tables.is_empty() {
            return "No flight data tables are loaded for this session.".to_string();
        }
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("TABLE {}\n", table.name));
            if let Some(desc) = table.description.as_deref().filter(|d| !d.is_empty()) {
                out.push_str(&format!("  Description: {}\n", desc));
            }
            for column in &table.columns {
                out.push_str(&format!("  - {} {}\n", column.name, column.data_type));
            }
        }
        out
    }
}

/// Rows returned by one execution, bounded by [`QueryLimits::max_rows`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Compact JSON for prompts: column list plus at most `max_rows` rows.
    pub fn to_compact_json(&self, max_rows: usize) -> String {
        let shown = self.rows.len().min(max_rows);
        let payload = serde_json::json!({
            "columns": self.columns,
            "rows": &self.rows[..shown],
            "row_count": self.rows.len(),
            "truncated": self.truncated || shown < self.rows.len(),
        });
        payload.to_string()
    }
}

/// Read-only view of a session's flight tables.
#[async_trait]
pub trait FlightTable: Send + Sync {
    async fn describe(&self) -> Result<TableSchema, StoreError>;

    async fn execute(&self, query: &ValidatedQuery, limits: &QueryLimits) -> Result<QueryResult, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> TableSchema {
        TableSchema {
            tables: vec![TableInfo {
                name: "GLOBAL_POSITION_INT".to_string(),
                description: Some("Fused position estimate; alt in mm".to_string()),
                columns: vec![
                    ColumnInfo { name: "time_boot_ms".into(), data_type: "INTEGER".into() },
                    ColumnInfo { name: "alt".into(), data_type: "INTEGER".into() },
                ],
            }],
        }
    }

    #[test]
    fn test_schema_lookup_is_case_insensitive() {
        let schema = schema();
        assert!(schema.table("global_position_int").is_some());
        assert!(schema.table("global_position_int").unwrap().has_column("ALT"));
        assert!(schema.has_column_anywhere("time_boot_ms"));
        assert!(!schema.has_column_anywhere("airspeed"));
    }

    #[test]
    fn test_schema_render() {
        let rendered = schema().render();
        assert!(rendered.contains("TABLE GLOBAL_POSITION_INT"));
        assert!(rendered.contains("Description: Fused position estimate"));
        assert!(rendered.contains("- alt INTEGER"));
        assert!(TableSchema::default().render().contains("No flight data"));
    }

    #[test]
    fn test_compact_json_limits_rows() {
        let result = QueryResult {
            columns: vec!["alt".to_string()],
            rows: (0..5).map(|i| vec![Value::from(i)]).collect(),
            truncated: false,
        };
        let json: Value = serde_json::from_str(&result.to_compact_json(2)).unwrap();
        assert_eq!(json["rows"].as_array().unwrap().len(), 2);
        assert_eq!(json["row_count"], 5);
        assert_eq!(json["truncated"], true);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(StoreError::Query("no such column: foo".into()).is_recoverable());
        assert!(StoreError::Timeout(10).is_recoverable());
        assert!(!StoreError::Unavailable("closed".into()).is_recoverable());
    }
}
