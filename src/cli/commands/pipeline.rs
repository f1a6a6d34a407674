//! `redjam create-tables`, `etl`, `run` and `verify`

use std::path::PathBuf;

use tracing::warn;

use super::{load_config, parse_format, print_result, runtime};
use crate::cli::error::CliError;
use crate::config::WarehouseConfig;
use crate::pipeline::{Pipeline, RunReport, StagingSources, verify_star_schema};
use crate::schema::{ALL_TABLES, SchemaManager};
use crate::warehouse::{BackendKind, OutputFormat, QueryResult, Warehouse};

/// Which pipeline steps to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    /// Drop and recreate every table
    CreateTables,
    /// Load staging, populate and verify the star schema
    Etl,
    /// CreateTables followed by Etl
    Run,
}

/// Pipeline command arguments
#[derive(Debug, Clone)]
pub struct PipelineArgs {
    pub config: PathBuf,
    pub backend: BackendKind,
    pub step: PipelineStep,
}

/// Verify command arguments
#[derive(Debug, Clone)]
pub struct VerifyArgs {
    pub config: PathBuf,
    pub backend: BackendKind,
    /// Output format (table, json, csv)
    pub format: String,
}

#[cfg(feature = "postgres-backend")]
async fn open_redshift(config: &WarehouseConfig) -> Result<Box<dyn Warehouse>, CliError> {
    use crate::warehouse::redshift::{RedshiftSettings, RedshiftWarehouse};

    let settings = RedshiftSettings::from_config(config)?;
    Ok(Box::new(RedshiftWarehouse::connect(settings).await?))
}

#[cfg(not(feature = "postgres-backend"))]
async fn open_redshift(_config: &WarehouseConfig) -> Result<Box<dyn Warehouse>, CliError> {
    Err(CliError::FeatureDisabled("Redshift"))
}

#[cfg(feature = "duckdb-backend")]
fn open_duckdb(config: &WarehouseConfig) -> Result<Box<dyn Warehouse>, CliError> {
    use crate::warehouse::DuckDbWarehouse;

    Ok(Box::new(DuckDbWarehouse::new(&config.local.database)?))
}

#[cfg(not(feature = "duckdb-backend"))]
fn open_duckdb(_config: &WarehouseConfig) -> Result<Box<dyn Warehouse>, CliError> {
    Err(CliError::FeatureDisabled("DuckDB"))
}

/// Open the single connection used for the whole invocation
async fn open_warehouse(
    kind: BackendKind,
    config: &WarehouseConfig,
) -> Result<Box<dyn Warehouse>, CliError> {
    match kind {
        BackendKind::Redshift => open_redshift(config).await,
        BackendKind::DuckDb => open_duckdb(config),
    }
}

fn run_summary(report: &RunReport) -> QueryResult {
    let mut rows: Vec<serde_json::Value> = report
        .loads
        .iter()
        .map(|load| {
            serde_json::json!({
                "step": "load",
                "table": load.table,
                "rows": load.rows_loaded,
                "errors": load.errors,
            })
        })
        .collect();
    rows.extend(report.inserts.iter().map(|insert| {
        serde_json::json!({
            "step": "insert",
            "table": insert.table,
            "rows": insert.rows,
            "errors": 0,
        })
    }));

    QueryResult::new(
        vec![
            "step".to_string(),
            "table".to_string(),
            "rows".to_string(),
            "errors".to_string(),
        ],
        rows,
    )
}

pub fn handle_pipeline(args: &PipelineArgs) -> Result<(), CliError> {
    let config = load_config(&args.config)?;
    let rt = runtime()?;

    rt.block_on(async {
        let warehouse = open_warehouse(args.backend, &config).await?;

        match args.step {
            PipelineStep::CreateTables => {
                // No staging inputs are needed just to reset the schema
                SchemaManager::new(&*warehouse).reset().await?;
                println!(
                    "Recreated {} tables on {}",
                    ALL_TABLES.len(),
                    warehouse.backend_type()
                );
            }
            PipelineStep::Etl | PipelineStep::Run => {
                let sources = StagingSources::for_backend(args.backend, &config)?;
                let pipeline = Pipeline::new(&*warehouse, &config, sources);
                let report = if args.step == PipelineStep::Run {
                    pipeline.run().await?
                } else {
                    pipeline.etl().await?
                };

                println!("Run {} on {}", report.run_id, report.backend);
                print_result(&run_summary(&report), OutputFormat::Table);
                if let Some(quality) = &report.quality {
                    print_result(&quality.to_query_result(), OutputFormat::Table);
                }
                eprintln!("\nExecution time: {}ms", report.duration_ms);
            }
        }

        warehouse.close().await?;
        Ok::<_, CliError>(())
    })
}

pub fn handle_verify(args: &VerifyArgs) -> Result<(), CliError> {
    let config = load_config(&args.config)?;
    let format = parse_format(&args.format)?;
    let rt = runtime()?;

    rt.block_on(async {
        let warehouse = open_warehouse(args.backend, &config).await?;
        let report = verify_star_schema(&*warehouse).await?;

        print_result(&report.to_query_result(), format);
        if report.facts_without_time > 0 {
            warn!(
                facts_without_time = report.facts_without_time,
                "songplays rows without a time row"
            );
        }

        warehouse.close().await?;
        report.ensure_unique_keys()?;
        Ok::<_, CliError>(())
    })
}
