//! Batch ETL pipeline
//!
//! The steps run strictly in sequence over one warehouse connection:
//! schema reset, staging bulk loads, star schema inserts and verification.
//! Each statement commits on its own, so a failed run leaves whatever the
//! earlier statements wrote; recovery is to run from the schema reset again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::{ConfigError, WarehouseConfig};
use crate::schema::SchemaManager;
use crate::warehouse::{LoadStats, Warehouse, WarehouseError};

pub mod staging;
pub mod transform;
pub mod verify;

pub use staging::{StagingLoader, StagingSources};
pub use transform::{InsertStats, Transformer};
pub use verify::{QualityReport, TableQuality, verify_star_schema};

/// Error type for pipeline steps
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A DROP or CREATE statement failed
    #[error("Schema statement for {table} failed: {source}")]
    Schema {
        table: &'static str,
        #[source]
        source: WarehouseError,
    },

    /// A staging bulk load failed
    #[error("Staging load failed: {0}")]
    Load(#[source] WarehouseError),

    /// A star schema insert failed
    #[error("Insert into {table} failed: {source}")]
    Transform {
        table: &'static str,
        #[source]
        source: WarehouseError,
    },

    /// A verification query failed
    #[error("Verification query on {table} failed: {source}")]
    Verify {
        table: &'static str,
        #[source]
        source: WarehouseError,
    },

    /// A dimension holds the same natural key more than once
    #[error("{table} has {duplicates} duplicated values of {key}")]
    DuplicateKeys {
        table: &'static str,
        key: &'static str,
        duplicates: u64,
    },

    /// Required settings are missing
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for pipeline steps
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Summary of one ETL run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub backend: String,
    /// Whether the schema was reset before loading
    pub schema_reset: bool,
    pub loads: Vec<LoadStats>,
    pub inserts: Vec<InsertStats>,
    pub quality: Option<QualityReport>,
    pub duration_ms: u64,
}

impl RunReport {
    fn new(backend: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            backend: backend.to_string(),
            schema_reset: false,
            loads: Vec::new(),
            inserts: Vec::new(),
            quality: None,
            duration_ms: 0,
        }
    }

    /// Rows loaded into staging across both loads
    pub fn staged_rows(&self) -> u64 {
        self.loads.iter().map(|l| l.rows_loaded).sum()
    }

    /// Malformed records skipped across both loads
    pub fn load_errors(&self) -> usize {
        self.loads.iter().map(|l| l.errors).sum()
    }
}

/// Runs the pipeline steps against one warehouse
pub struct Pipeline<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    config: &'a WarehouseConfig,
    sources: StagingSources,
}

impl<'a, W: Warehouse + ?Sized> Pipeline<'a, W> {
    pub fn new(warehouse: &'a W, config: &'a WarehouseConfig, sources: StagingSources) -> Self {
        Self {
            warehouse,
            config,
            sources,
        }
    }

    /// Drop and recreate every table
    pub async fn create_tables(&self) -> PipelineResult<()> {
        SchemaManager::new(self.warehouse).reset().await
    }

    /// Load staging, populate the star schema and verify it
    pub async fn etl(&self) -> PipelineResult<RunReport> {
        let mut report = RunReport::new(self.warehouse.backend_type());
        self.etl_into(&mut report).await?;
        Ok(report)
    }

    /// Reset the schema, then run the ETL
    pub async fn run(&self) -> PipelineResult<RunReport> {
        let mut report = RunReport::new(self.warehouse.backend_type());
        self.create_tables().await?;
        report.schema_reset = true;
        self.etl_into(&mut report).await?;
        Ok(report)
    }

    async fn etl_into(&self, report: &mut RunReport) -> PipelineResult<()> {
        let start = std::time::Instant::now();
        info!(run_id = %report.run_id, backend = %report.backend, "starting ETL run");

        let loader = StagingLoader::new(self.warehouse, &self.config.load, &self.sources);
        report.loads = loader.load_staging().await?;

        report.inserts = Transformer::new(self.warehouse)
            .populate_star_schema()
            .await?;

        let quality = verify_star_schema(self.warehouse).await?;
        report.quality = Some(quality.clone());
        quality.ensure_unique_keys()?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %report.run_id,
            staged_rows = report.staged_rows(),
            load_errors = report.load_errors(),
            duration_ms = report.duration_ms,
            "ETL run complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_config;
    use crate::warehouse::testing::RecordingWarehouse;

    fn config() -> WarehouseConfig {
        let mut config = WarehouseConfig::parse(sample_config()).unwrap();
        config.iam_role.arn = Some("arn:aws:iam::123456789012:role/redjam".to_string());
        config
    }

    #[tokio::test]
    async fn test_run_orders_steps() {
        let config = config();
        let warehouse = RecordingWarehouse::new();
        let sources = StagingSources::s3(&config).unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, sources);

        let report = pipeline.run().await.unwrap();
        assert!(report.schema_reset);
        assert_eq!(report.loads.len(), 2);
        assert_eq!(report.inserts.len(), 5);
        assert!(report.quality.is_some());

        let statements = warehouse.statements();
        let position = |prefix: &str| {
            statements
                .iter()
                .position(|s| s.starts_with(prefix))
                .unwrap_or_else(|| panic!("missing statement {}", prefix))
        };
        assert!(position("DROP TABLE") < position("CREATE TABLE"));
        assert!(position("CREATE TABLE") < position("COPY staging_events"));
        assert!(position("COPY staging_events") < position("COPY staging_songs"));
        assert!(position("COPY staging_songs") < position("INSERT INTO songplays"));
        assert!(position("INSERT INTO \"time\"") < position("SELECT COUNT(*)"));
    }

    #[tokio::test]
    async fn test_failed_load_stops_run() {
        let config = config();
        let warehouse = RecordingWarehouse::new();
        warehouse.load_result("staging_songs", Err("S3 access denied".to_string()));
        let sources = StagingSources::s3(&config).unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, sources);

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Load(_)));
        assert!(
            !warehouse
                .statements()
                .iter()
                .any(|s| s.starts_with("INSERT"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_keys_fail_run() {
        let config = config();
        let warehouse = RecordingWarehouse::new();
        warehouse.answer_count("GROUP BY user_id", "duplicate_keys", 2);
        let sources = StagingSources::s3(&config).unwrap();
        let pipeline = Pipeline::new(&warehouse, &config, sources);

        match pipeline.etl().await.unwrap_err() {
            PipelineError::DuplicateKeys {
                table, duplicates, ..
            } => {
                assert_eq!(table, "users");
                assert_eq!(duplicates, 2);
            }
            other => panic!("expected duplicate keys, got {:?}", other),
        }
    }
}
