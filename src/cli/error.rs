//! CLI-specific error types

use crate::config::ConfigError;
use crate::pipeline::PipelineError;
use crate::provision::ProvisioningError;
use crate::warehouse::WarehouseError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI-specific error type
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Config file not found: {0}. Run 'redjam init' to create one.")]
    ConfigNotFound(PathBuf),

    #[error("{0} already exists. Use --force to overwrite.")]
    AlreadyExists(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("{0} support not enabled in this build")]
    FeatureDisabled(&'static str),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
}
