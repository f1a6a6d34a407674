//! redjam - Redshift provisioning and star schema ETL
//!
//! Provides:
//! - Cluster and access role provisioning (via a cloud provider seam)
//! - Table definitions for the staging tables and the star schema
//! - Staging bulk loads, star schema inserts and post-load verification
//! - Warehouse backends: Redshift over the Postgres protocol, local DuckDB

pub mod config;
pub mod pipeline;
pub mod provision;
pub mod schema;
pub mod warehouse;

#[cfg(feature = "cli")]
pub mod cli;

// Re-export commonly used types
pub use config::{ConfigError, ConfigResult, SecurityGroupSelector, WarehouseConfig};
pub use pipeline::{
    Pipeline, PipelineError, PipelineResult, QualityReport, RunReport, StagingLoader,
    StagingSources, Transformer,
};
pub use provision::{
    ClusterDescription, ClusterStatus, CloudProvider, Outcome, ProvisioningController,
    ProvisioningError, ProvisioningReport, ProvisioningResult,
};
pub use schema::{SchemaManager, TableDef};
pub use warehouse::{
    BackendKind, CopyCommand, Dialect, LoadStats, QueryResult, Warehouse, WarehouseError,
    WarehouseResult,
};

#[cfg(feature = "aws")]
pub use provision::AwsCloud;
#[cfg(feature = "duckdb-backend")]
pub use warehouse::DuckDbWarehouse;
#[cfg(feature = "postgres-backend")]
pub use warehouse::RedshiftWarehouse;
