//! `redjam init`: write a starter configuration file

use std::path::PathBuf;

use crate::cli::error::CliError;
use crate::config::sample_config;

/// Init command arguments
#[derive(Debug, Clone)]
pub struct InitArgs {
    /// Where to write the configuration
    pub config: PathBuf,
    /// Overwrite an existing file
    pub force: bool,
}

pub fn handle_init(args: &InitArgs) -> Result<(), CliError> {
    if args.config.exists() && !args.force {
        return Err(CliError::AlreadyExists(args.config.clone()));
    }

    std::fs::write(&args.config, sample_config()).map_err(|e| {
        CliError::IoError(format!("Failed to write {}: {}", args.config.display(), e))
    })?;

    println!("Wrote {}", args.config.display());
    println!("Fill in the [cluster] and [iam_role] sections, then run 'redjam build'.");
    Ok(())
}
