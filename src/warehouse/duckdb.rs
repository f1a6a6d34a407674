//! DuckDB warehouse backend
//!
//! Embedded database used for local runs and tests. Supports both file-based
//! persistence and in-memory mode. Bulk loads are emulated over local files
//! by [`super::local_copy`].

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::local_copy::{self, CellValue};
use super::{
    CopyCommand, Dialect, LoadStats, QueryResult, Warehouse, WarehouseError, WarehouseResult,
};

/// DuckDB warehouse backend
pub struct DuckDbWarehouse {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// DuckDB connection (wrapped in Mutex for thread safety)
    connection: Mutex<duckdb::Connection>,
}

impl DuckDbWarehouse {
    /// Open or create a file-based database
    pub fn new(db_path: impl AsRef<Path>) -> WarehouseResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            WarehouseError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;
        info!(path = %path.display(), "opened DuckDB warehouse");

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory database
    pub fn in_memory() -> WarehouseResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            WarehouseError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    fn lock(&self) -> WarehouseResult<std::sync::MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| WarehouseError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    /// Convert a DuckDB row to a JSON value
    fn row_to_json(row: &duckdb::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => Self::value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            map.insert(col_name.clone(), value);
        }

        serde_json::Value::Object(map)
    }

    /// Convert a DuckDB ValueRef to a JSON value
    fn value_ref_to_json(value: duckdb::types::ValueRef) -> serde_json::Value {
        use duckdb::types::{TimeUnit, ValueRef};

        match value {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Boolean(b) => serde_json::Value::Bool(b),
            ValueRef::TinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::SmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Int(i) => serde_json::Value::Number(i.into()),
            ValueRef::BigInt(i) => serde_json::Value::Number(i.into()),
            // i128 may not fit in a JSON number
            ValueRef::HugeInt(i) => serde_json::Value::String(i.to_string()),
            ValueRef::UTinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::USmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UBigInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Double(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            ValueRef::Blob(bytes) => {
                use base64::Engine;
                serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            ValueRef::Timestamp(unit, raw) => {
                let micros = match unit {
                    TimeUnit::Second => raw.saturating_mul(1_000_000),
                    TimeUnit::Millisecond => raw.saturating_mul(1_000),
                    TimeUnit::Microsecond => raw,
                    TimeUnit::Nanosecond => raw / 1_000,
                };
                chrono::DateTime::from_timestamp_micros(micros)
                    .map(|ts| {
                        serde_json::Value::String(
                            ts.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
                        )
                    })
                    .unwrap_or(serde_json::Value::Null)
            }
            ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
            other => serde_json::Value::String(format!("{:?}", other)),
        }
    }

    fn cell_to_value(cell: CellValue) -> duckdb::types::Value {
        use duckdb::types::Value;

        match cell {
            CellValue::Null => Value::Null,
            CellValue::Int(i) => Value::BigInt(i),
            CellValue::Float(f) => Value::Double(f),
            CellValue::Text(s) => Value::Text(s),
            CellValue::Bool(b) => Value::Boolean(b),
        }
    }

    /// Insert prepared rows in one transaction so a failed load writes nothing
    fn insert_rows(&self, copy: &CopyCommand, rows: Vec<Vec<CellValue>>) -> WarehouseResult<u64> {
        let table = copy.table;
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.ident(),
            table.column_list(),
            placeholders
        );
        let load_err = |e: duckdb::Error| WarehouseError::LoadFailed {
            table: table.name.to_string(),
            message: e.to_string(),
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(load_err)?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(&sql).map_err(load_err)?;
            for row in rows {
                let values: Vec<duckdb::types::Value> =
                    row.into_iter().map(Self::cell_to_value).collect();
                inserted += stmt
                    .execute(duckdb::params_from_iter(values))
                    .map_err(load_err)? as u64;
            }
        }
        tx.commit().map_err(load_err)?;
        Ok(inserted)
    }
}

#[async_trait(?Send)]
impl Warehouse for DuckDbWarehouse {
    async fn execute(&self, sql: &str) -> WarehouseResult<u64> {
        debug!(%sql, "execute");
        let conn = self.lock()?;
        conn.execute(sql, [])
            .map(|n| n as u64)
            .map_err(|e| WarehouseError::QueryFailed(format!("Execute failed: {}", e)))
    }

    async fn query(&self, sql: &str) -> WarehouseResult<QueryResult> {
        debug!(%sql, "query");
        let start = std::time::Instant::now();
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| WarehouseError::QueryFailed(format!("Prepare failed: {}", e)))?;

        // Columns are only known once the statement has run
        let mut result_rows = stmt
            .query([])
            .map_err(|e| WarehouseError::QueryFailed(format!("Query failed: {}", e)))?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| WarehouseError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            rows.push(Self::row_to_json(row, &columns));
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn bulk_load(&self, copy: &CopyCommand) -> WarehouseResult<LoadStats> {
        let start = std::time::Instant::now();
        debug!(sql = %copy.to_sql(), "emulating COPY");

        let prepared = local_copy::prepare(copy)?;
        let mut stats = prepared.stats;
        stats.rows_loaded = self.insert_rows(copy, prepared.rows)?;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    fn dialect(&self) -> Dialect {
        Dialect::DuckDb
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }

    async fn close(&self) -> WarehouseResult<()> {
        // The connection closes when dropped
        Ok(())
    }
}
