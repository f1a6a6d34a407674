//! CLI binary entry point for redjam

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use redjam::cli::commands::infra::{
    BuildArgs, DeleteArgs, DescribeArgs, handle_build, handle_delete, handle_describe,
};
#[cfg(feature = "cli")]
use redjam::cli::commands::init::{InitArgs, handle_init};
#[cfg(feature = "cli")]
use redjam::cli::commands::pipeline::{
    PipelineArgs, PipelineStep, VerifyArgs, handle_pipeline, handle_verify,
};
#[cfg(feature = "cli")]
use redjam::cli::commands::resolve_config_path;
#[cfg(feature = "cli")]
use redjam::warehouse::BackendKind;
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "redjam")]
#[command(about = "Provision a Redshift cluster and load the Sparkify star schema")]
#[command(version)]
struct Cli {
    /// Configuration file (default: $REDJAM_CONFIG or ./redjam.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Write a sample configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Create the access role and cluster, and open the warehouse port
    Build,

    /// Delete the cluster and the access role
    Delete {
        /// Wait until the cluster is gone
        #[arg(short, long)]
        wait: bool,
    },

    /// Print the cluster's properties
    Describe {
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Drop and recreate the staging and star schema tables
    CreateTables {
        #[arg(short, long, value_enum, default_value = "redshift")]
        backend: BackendArg,
    },

    /// Load staging, populate the star schema and verify it
    Etl {
        #[arg(short, long, value_enum, default_value = "redshift")]
        backend: BackendArg,
    },

    /// Recreate the tables, then run the ETL
    Run {
        #[arg(short, long, value_enum, default_value = "redshift")]
        backend: BackendArg,
    },

    /// Report row counts and duplicated keys in the star schema
    Verify {
        #[arg(short, long, value_enum, default_value = "redshift")]
        backend: BackendArg,
        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[cfg(feature = "cli")]
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    /// The provisioned Redshift cluster
    Redshift,
    /// Local DuckDB file from [local].database
    Duckdb,
}

#[cfg(feature = "cli")]
impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Redshift => BackendKind::Redshift,
            BackendArg::Duckdb => BackendKind::DuckDb,
        }
    }
}

/// Filter used when `RUST_LOG` is unset or invalid
#[cfg(feature = "cli")]
const DEFAULT_LOG_FILTER: &str = "redjam=info";

#[cfg(feature = "cli")]
fn log_filter(rust_log: Option<&str>) -> tracing_subscriber::EnvFilter {
    use tracing_subscriber::EnvFilter;

    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

#[cfg(feature = "cli")]
fn init_tracing() {
    let filter = log_filter(std::env::var("RUST_LOG").ok().as_deref());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "cli")]
fn main() {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config_path(cli.config);

    let pipeline = |backend: BackendArg, step: PipelineStep| {
        handle_pipeline(&PipelineArgs {
            config: config.clone(),
            backend: backend.into(),
            step,
        })
    };

    let result = match cli.command {
        Commands::Init { force } => handle_init(&InitArgs {
            config: config.clone(),
            force,
        }),
        Commands::Build => handle_build(&BuildArgs {
            config: config.clone(),
        }),
        Commands::Delete { wait } => handle_delete(&DeleteArgs {
            config: config.clone(),
            wait,
        }),
        Commands::Describe { format } => handle_describe(&DescribeArgs {
            config: config.clone(),
            format,
        }),
        Commands::CreateTables { backend } => pipeline(backend, PipelineStep::CreateTables),
        Commands::Etl { backend } => pipeline(backend, PipelineStep::Etl),
        Commands::Run { backend } => pipeline(backend, PipelineStep::Run),
        Commands::Verify { backend, format } => handle_verify(&VerifyArgs {
            config: config.clone(),
            backend: backend.into(),
            format,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature is not enabled. Build with --features cli");
    std::process::exit(1);
}
