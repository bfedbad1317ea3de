use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::{Number, Value};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Connection, Row, Sqlite, ValueRef};
use tracing::{debug, info, warn};

use super::ingest::{self, Cell, FlightMessages, IngestSummary, PreparedTable};
use super::{ColumnInfo, FlightTable, KnowledgeBase, QueryLimits, QueryResult, StoreError, TableInfo, TableSchema};
use crate::validator::ValidatedQuery;

/// VM instructions between deadline checks while a statement runs.
const PROGRESS_INTERVAL_OPS: i32 = 1000;

/// Time the engine gets to notice a passed deadline and interrupt itself.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

/// One session's table engine.
///
/// Backed by a single long-lived SQLite connection (in memory unless a data
/// directory is configured). Every connection is opened with
/// `PRAGMA query_only = ON`; ingestion lifts it for the duration of its
/// transaction and restores it afterwards.
///
/// `execute` bounds the engine itself: a progress handler interrupts the
/// running statement once its deadline passes, even after the caller has
/// stopped waiting, so the single connection always comes back.
#[derive(Clone)]
pub struct FlightDatabase {
    pool: SqlitePool,
    knowledge_base: Option<Arc<KnowledgeBase>>,
}

impl FlightDatabase {
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        Self::connect(options).await
    }

    /// Session database under `data_dir` when set, otherwise in memory.
    pub async fn open(session_id: &str, data_dir: Option<&Path>) -> Result<Self, StoreError> {
        match data_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::Unavailable(e.to_string()))?;
                let path = dir.join(format!("{session_id}.db"));
                debug!(path = %path.display(), "Opening session database");
                let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
                Self::connect(options).await
            }
            None => Self::in_memory().await,
        }
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // A single connection that never expires: an in-memory database lives
        // exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            knowledge_base: None,
        })
    }

    pub fn with_knowledge_base(mut self, knowledge_base: Option<Arc<KnowledgeBase>>) -> Self {
        self.knowledge_base = knowledge_base;
        self
    }

    /// Store parsed flight messages, one table per message type.
    pub async fn load_messages(&self, messages: &FlightMessages) -> Result<IngestSummary, StoreError> {
        if messages.is_empty() {
            return Err(StoreError::InvalidData("no messages in flight data".to_string()));
        }

        let mut summary = IngestSummary::default();
        let mut tables = Vec::new();
        for (name, fields) in messages {
            match ingest::prepare_table(name, fields)? {
                Some(table) => tables.push(table),
                None => {
                    warn!(message = %name, "Skipping message without rows");
                    summary.skipped.push(name.clone());
                }
            }
        }

        let mut conn = self.unbounded_connection().await?;
        sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await?;
        let inserted = insert_tables(&mut conn, &tables).await;
        let restored = sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await;

        summary.rows_inserted = inserted?;
        restored?;
        summary.tables = tables.into_iter().map(|t| t.name).collect();

        info!(
            tables = summary.tables.len(),
            rows = summary.rows_inserted,
            skipped = summary.skipped.len(),
            "Flight data ingested"
        );
        Ok(summary)
    }

    pub async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.unbounded_connection().await?;
        list_tables(&mut conn).await
    }

    /// The connection with any statement deadline removed. Locking the handle
    /// waits for an interrupted statement to unwind first.
    async fn unbounded_connection(&self) -> Result<PoolConnection<Sqlite>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        conn.lock_handle().await?.remove_progress_handler();
        Ok(conn)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn list_tables(conn: &mut SqliteConnection) -> Result<Vec<String>, StoreError> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

async fn insert_tables(conn: &mut SqliteConnection, tables: &[PreparedTable]) -> Result<usize, StoreError> {
    let mut tx = conn.begin().await?;
    let mut inserted = 0;

    for table in tables {
        sqlx::query(&ingest::create_table_sql(table)).execute(&mut *tx).await?;
        let insert = ingest::insert_sql(table);
        for row in &table.rows {
            let mut query = sqlx::query(&insert);
            for cell in row {
                query = match cell {
                    Cell::Null => query.bind(None::<i64>),
                    Cell::Integer(i) => query.bind(*i),
                    Cell::Real(f) => query.bind(*f),
                    Cell::Text(s) => query.bind(s.as_str()),
                };
            }
            query.execute(&mut *tx).await?;
            inserted += 1;
        }
        debug!(table = %table.name, rows = table.rows.len(), "Table loaded");
    }

    tx.commit().await?;
    Ok(inserted)
}

/// Null first, then the narrowest numeric type, then text.
fn decode_cell(row: &SqliteRow, index: usize) -> Value {
    match row.try_get_raw(index) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }
    if let Ok(v) = row.try_get::<i64, _>(index) {
        return Value::from(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(index) {
        return Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<String, _>(index) {
        return Value::String(v);
    }
    if let Ok(v) = row.try_get::<Vec<u8>, _>(index) {
        return Value::String(format!("<{} bytes>", v.len()));
    }
    Value::Null
}

#[async_trait]
impl FlightTable for FlightDatabase {
    async fn describe(&self) -> Result<TableSchema, StoreError> {
        let mut conn = self.unbounded_connection().await?;
        let mut tables = Vec::new();
        for name in list_tables(&mut conn).await? {
            let rows = sqlx::query(&format!("PRAGMA table_info({})", ingest::quote_ident(&name)))
                .fetch_all(&mut *conn)
                .await?;
            let columns = rows
                .iter()
                .map(|row| {
                    Ok(ColumnInfo {
                        name: row.try_get::<String, _>("name")?,
                        data_type: row.try_get::<String, _>("type")?,
                    })
                })
                .collect::<Result<Vec<_>, sqlx::Error>>()?;
            let description = self
                .knowledge_base
                .as_ref()
                .and_then(|kb| kb.describe(&name))
                .map(str::to_string);
            tables.push(TableInfo {
                name,
                description,
                columns,
            });
        }
        Ok(TableSchema { tables })
    }

    async fn execute(&self, query: &ValidatedQuery, limits: &QueryLimits) -> Result<QueryResult, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let deadline = Instant::now() + limits.timeout;
        conn.lock_handle()
            .await?
            .set_progress_handler(PROGRESS_INTERVAL_OPS, move || Instant::now() < deadline);

        let run = async {
            let mut stream = sqlx::query(query.as_str()).fetch(&mut *conn);
            let mut result = QueryResult::default();
            while let Some(row) = stream.try_next().await? {
                if result.columns.is_empty() {
                    result.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                }
                if result.rows.len() >= limits.max_rows {
                    result.truncated = true;
                    break;
                }
                result.rows.push((0..row.len()).map(|i| decode_cell(&row, i)).collect());
            }
            Ok::<_, StoreError>(result)
        };

        let timed_out = || StoreError::Timeout(limits.timeout.as_millis() as u64);
        match tokio::time::timeout(limits.timeout + INTERRUPT_GRACE, run).await {
            Ok(Ok(result)) => Ok(result),
            // An interrupted statement surfaces as an engine error.
            Ok(Err(err)) if Instant::now() >= deadline => {
                debug!(error = %err, "Statement interrupted at deadline");
                Err(timed_out())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(timeout_ms = limits.timeout.as_millis() as u64, "Statement still running past deadline");
                Err(timed_out())
            }
        }
    }
}
