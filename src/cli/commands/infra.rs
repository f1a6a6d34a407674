//! `redjam build`, `redjam delete` and `redjam describe`

use std::path::PathBuf;

use crate::cli::error::CliError;

#[cfg(feature = "aws")]
use super::{load_config, parse_format, print_result, properties_result, runtime};
#[cfg(feature = "aws")]
use crate::config::{AwsCredentials, WarehouseConfig};
#[cfg(feature = "aws")]
use crate::provision::{AwsCloud, ProvisioningController};
#[cfg(feature = "aws")]
use crate::warehouse::OutputFormat;

/// Build command arguments
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub config: PathBuf,
}

/// Delete command arguments
#[derive(Debug, Clone)]
pub struct DeleteArgs {
    pub config: PathBuf,
    /// Wait until the cluster is gone
    pub wait: bool,
}

/// Describe command arguments
#[derive(Debug, Clone)]
pub struct DescribeArgs {
    pub config: PathBuf,
    /// Output format (table, json, csv)
    pub format: String,
}

/// Provision the role and cluster, then record the role ARN and host
#[cfg(feature = "aws")]
pub fn handle_build(args: &BuildArgs) -> Result<(), CliError> {
    let config = load_config(&args.config)?;
    let rt = runtime()?;

    let report = rt.block_on(async {
        let cloud = AwsCloud::from_config(&config.aws, AwsCredentials::from_env()).await;
        ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
    })?;

    WarehouseConfig::record_provisioned(&args.config, &report.role_arn, report.host())?;

    println!("Role {} ({})", config.iam_role.name, report.role);
    println!("Cluster {} ({})", config.cluster.identifier, report.cluster);
    println!(
        "Ingress on {} port {} ({})",
        report.security_group.id, config.cluster.port, report.ingress
    );
    print_result(
        &properties_result(&report.description.properties()),
        OutputFormat::Table,
    );
    println!("Recorded role ARN and host in {}", args.config.display());
    Ok(())
}

/// Delete the cluster and the access role
#[cfg(feature = "aws")]
pub fn handle_delete(args: &DeleteArgs) -> Result<(), CliError> {
    let config = load_config(&args.config)?;
    let rt = runtime()?;

    let report = rt.block_on(async {
        let cloud = AwsCloud::from_config(&config.aws, AwsCredentials::from_env()).await;
        ProvisioningController::new(&cloud, &config)
            .delete_infrastructure(args.wait)
            .await
    })?;

    println!("Cluster {} ({})", config.cluster.identifier, report.cluster);
    println!("Policy {} ({})", config.iam_role.policy_arn, report.policy);
    println!("Role {} ({})", config.iam_role.name, report.role);
    if let Some(status) = report.final_status {
        println!("Final cluster status: {}", status);
    }
    Ok(())
}

/// Print the cluster's current properties
#[cfg(feature = "aws")]
pub fn handle_describe(args: &DescribeArgs) -> Result<(), CliError> {
    let config = load_config(&args.config)?;
    let format = parse_format(&args.format)?;
    let rt = runtime()?;

    let description = rt.block_on(async {
        let cloud = AwsCloud::from_config(&config.aws, AwsCredentials::from_env()).await;
        ProvisioningController::new(&cloud, &config).describe().await
    })?;

    print_result(&properties_result(&description.properties()), format);
    Ok(())
}

#[cfg(not(feature = "aws"))]
pub fn handle_build(_args: &BuildArgs) -> Result<(), CliError> {
    Err(CliError::FeatureDisabled("AWS"))
}

#[cfg(not(feature = "aws"))]
pub fn handle_delete(_args: &DeleteArgs) -> Result<(), CliError> {
    Err(CliError::FeatureDisabled("AWS"))
}

#[cfg(not(feature = "aws"))]
pub fn handle_describe(_args: &DescribeArgs) -> Result<(), CliError> {
    Err(CliError::FeatureDisabled("AWS"))
}
