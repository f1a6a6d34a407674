//! CLI command implementations
//!
//! Every handler is synchronous and drives its async work on a runtime
//! created for the invocation.

pub mod infra;
pub mod init;
pub mod pipeline;

use std::path::{Path, PathBuf};

use crate::cli::error::CliError;
use crate::config::{CONFIG_FILENAME, ENV_CONFIG_PATH, WarehouseConfig};
use crate::warehouse::{OutputFormat, QueryResult, format_query_result};

/// Config path from the flag, then `REDJAM_CONFIG`, then `./redjam.toml`
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

/// Load the configuration file with environment overrides applied
pub(crate) fn load_config(path: &Path) -> Result<WarehouseConfig, CliError> {
    if !path.exists() {
        return Err(CliError::ConfigNotFound(path.to_path_buf()));
    }
    Ok(WarehouseConfig::load(path)?)
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| CliError::IoError(format!("Failed to create runtime: {}", e)))
}

pub(crate) fn parse_format(format: &str) -> Result<OutputFormat, CliError> {
    format.parse().map_err(CliError::InvalidArgument)
}

/// Key/value pairs as a two column result
pub(crate) fn properties_result(props: &[(&'static str, String)]) -> QueryResult {
    let rows = props
        .iter()
        .map(|(key, value)| serde_json::json!({ "Key": key, "Value": value }))
        .collect();
    QueryResult::new(vec!["Key".to_string(), "Value".to_string()], rows)
}

pub(crate) fn print_result(result: &QueryResult, format: OutputFormat) {
    println!("{}", format_query_result(result, format));
}
