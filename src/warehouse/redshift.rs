//! Redshift warehouse backend
//!
//! Speaks the Postgres wire protocol through a single `tokio-postgres`
//! client. Statements run outside any explicit transaction, so each one
//! commits as soon as it completes.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{
    CopyCommand, Dialect, LoadStats, QueryResult, Warehouse, WarehouseError, WarehouseResult,
};
use crate::config::{ConfigResult, WarehouseConfig};

/// Connection settings for the cluster endpoint
#[derive(Clone)]
pub struct RedshiftSettings {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl RedshiftSettings {
    /// Settings from the `[cluster]` section; the endpoint host must be known
    pub fn from_config(config: &WarehouseConfig) -> ConfigResult<Self> {
        Ok(Self {
            host: config.host()?.to_string(),
            port: config.cluster.port,
            db_name: config.cluster.db_name.clone(),
            user: config.cluster.user.clone(),
            password: config.cluster.password.clone(),
            connect_timeout: Duration::from_secs(30),
        })
    }

    /// Connection string with the password masked
    pub fn masked(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password=****",
            self.host, self.port, self.db_name, self.user
        )
    }
}

impl std::fmt::Debug for RedshiftSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Redshift warehouse backend
pub struct RedshiftWarehouse {
    settings: RedshiftSettings,
    /// Client (wrapped for async access)
    client: Arc<Mutex<tokio_postgres::Client>>,
}

impl RedshiftWarehouse {
    /// Connect to the cluster and spawn the connection task
    pub async fn connect(settings: RedshiftSettings) -> WarehouseResult<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&settings.host)
            .port(settings.port)
            .dbname(&settings.db_name)
            .user(&settings.user)
            .password(&settings.password)
            .connect_timeout(settings.connect_timeout);

        let (client, connection) = pg.connect(tokio_postgres::NoTls).await.map_err(|e| {
            WarehouseError::ConnectionFailed(format!(
                "Failed to connect to {}: {}",
                settings.masked(),
                e
            ))
        })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Redshift connection error: {}", e);
            }
        });

        info!(host = %settings.host, db = %settings.db_name, "connected to Redshift");
        Ok(Self {
            settings,
            client: Arc::new(Mutex::new(client)),
        })
    }

    /// Connection string with the password masked
    pub fn connection_string_masked(&self) -> String {
        self.settings.masked()
    }

    /// Convert a row to a JSON value
    fn row_to_json(row: &tokio_postgres::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            map.insert(col_name.clone(), Self::get_column_value(row, i));
        }

        serde_json::Value::Object(map)
    }

    /// Get a column value as JSON, trying the types the schema uses
    fn get_column_value(row: &tokio_postgres::Row, idx: usize) -> serde_json::Value {
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v
                .map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v
                .map(|n| serde_json::Value::Number(n.into()))
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v
                .map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null);
        }

        serde_json::Value::Null
    }
}

#[async_trait(?Send)]
impl Warehouse for RedshiftWarehouse {
    async fn execute(&self, sql: &str) -> WarehouseResult<u64> {
        debug!(%sql, "execute");
        let client = self.client.lock().await;
        client
            .execute(sql, &[])
            .await
            .map_err(|e| WarehouseError::QueryFailed(format!("Execute failed: {}", e)))
    }

    async fn query(&self, sql: &str) -> WarehouseResult<QueryResult> {
        debug!(%sql, "query");
        let start = std::time::Instant::now();
        let client = self.client.lock().await;

        let rows = client
            .query(sql, &[])
            .await
            .map_err(|e| WarehouseError::QueryFailed(format!("Query failed: {}", e)))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let json_rows = rows
            .iter()
            .map(|row| Self::row_to_json(row, &columns))
            .collect();

        Ok(QueryResult {
            columns,
            rows: json_rows,
            rows_affected: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn bulk_load(&self, copy: &CopyCommand) -> WarehouseResult<LoadStats> {
        let start = std::time::Instant::now();
        let sql = copy.to_sql();
        // The statement embeds the role ARN, so only the target and source are logged
        debug!(table = copy.table.name, source = %copy.source, "COPY");

        let client = self.client.lock().await;
        let rows_loaded = client
            .execute(sql.as_str(), &[])
            .await
            .map_err(|e| WarehouseError::LoadFailed {
                table: copy.table.name.to_string(),
                message: e.to_string(),
            })?;

        let mut stats = LoadStats::new(copy.table.name);
        stats.rows_loaded = rows_loaded;
        stats.duration_ms = start.elapsed().as_millis() as u64;
        Ok(stats)
    }

    fn dialect(&self) -> Dialect {
        Dialect::Redshift
    }

    fn backend_type(&self) -> &'static str {
        "redshift"
    }

    async fn close(&self) -> WarehouseResult<()> {
        // The connection closes when the client is dropped
        Ok(())
    }
}
