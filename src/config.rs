//! Warehouse configuration file support
//!
//! Handles parsing of `redjam.toml` configuration files and environment
//! variable overrides. The parsed [`WarehouseConfig`] is built once by the
//! caller and handed to every component by reference.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "redjam.toml";

/// Default DuckDB database filename for local runs
pub const DEFAULT_DUCKDB_FILENAME: &str = "redjam.duckdb";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-west-2";

/// Managed policy granting the cluster read access to S3
pub const DEFAULT_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess";

/// Environment variable for the configuration file path (read by the CLI)
pub const ENV_CONFIG_PATH: &str = "REDJAM_CONFIG";

/// Environment variable for the warehouse master password
pub const ENV_DB_PASSWORD: &str = "REDJAM_DB_PASSWORD";

/// Environment variable for the cluster endpoint host
pub const ENV_HOST: &str = "REDJAM_HOST";

/// Environment variable for the access role ARN
pub const ENV_ROLE_ARN: &str = "REDJAM_ROLE_ARN";

/// Environment variable for the AWS region
pub const ENV_AWS_REGION: &str = "REDJAM_AWS_REGION";

/// Environment variable for the AWS access key id
pub const ENV_AWS_ACCESS_KEY_ID: &str = "DW_AWS_ACCESS_KEY_ID";

/// Environment variable for the AWS secret access key
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "DW_AWS_SECRET_ACCESS_KEY";

/// Error type for configuration handling
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read or write the configuration file
    #[error("IO error: {0}")]
    Io(String),

    /// The file is not valid TOML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(String),

    /// The configuration could not be serialized
    #[error("Failed to serialize config: {0}")]
    Serialize(String),

    /// A required key is empty or absent
    #[error("Missing required configuration value: {0}")]
    MissingField(&'static str),

    /// A value is present but unusable
    #[error("Invalid configuration value for {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

/// AWS configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsSection {
    /// Region hosting the cluster and the source buckets
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl Default for AwsSection {
    fn default() -> Self {
        Self {
            region: default_region(),
        }
    }
}

/// Cluster sizing and connection section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    /// Cluster identifier
    #[serde(default)]
    pub identifier: String,

    /// `single-node` or `multi-node`
    #[serde(default = "default_cluster_type")]
    pub cluster_type: String,

    /// Node type, e.g. `dc2.large`
    #[serde(default = "default_node_type")]
    pub node_type: String,

    /// Number of compute nodes
    #[serde(default = "default_num_nodes")]
    pub num_nodes: i32,

    /// Database name
    #[serde(default)]
    pub db_name: String,

    /// Master user name
    #[serde(default)]
    pub user: String,

    /// Master user password
    #[serde(default)]
    pub password: String,

    /// Warehouse port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint host, written back once the cluster is available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

fn default_cluster_type() -> String {
    "multi-node".to_string()
}

fn default_node_type() -> String {
    "dc2.large".to_string()
}

fn default_num_nodes() -> i32 {
    4
}

fn default_port() -> u16 {
    5439
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            cluster_type: default_cluster_type(),
            node_type: default_node_type(),
            num_nodes: default_num_nodes(),
            db_name: String::new(),
            user: String::new(),
            password: String::new(),
            port: default_port(),
            host: None,
        }
    }
}

/// Access role section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamRoleSection {
    /// Role name
    #[serde(default)]
    pub name: String,

    /// Permission policy attached to the role
    #[serde(default = "default_policy_arn")]
    pub policy_arn: String,

    /// Role ARN, written back after provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
}

fn default_policy_arn() -> String {
    DEFAULT_POLICY_ARN.to_string()
}

impl Default for IamRoleSection {
    fn default() -> Self {
        Self {
            name: String::new(),
            policy_arn: default_policy_arn(),
            arn: None,
        }
    }
}

/// Object storage input section. Values are passed through to COPY unmodified.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3Section {
    /// Event log prefix
    #[serde(default)]
    pub log_data: String,

    /// Song catalog prefix
    #[serde(default)]
    pub song_data: String,

    /// JSONPaths file describing the event record layout
    #[serde(default)]
    pub log_jsonpath: String,
}

/// Bulk load section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSection {
    /// Malformed records tolerated per load before it fails
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Let COPY recompute column compression on the songs load
    #[serde(default)]
    pub songs_compupdate: bool,
}

fn default_max_errors() -> u32 {
    250
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            songs_compupdate: false,
        }
    }
}

/// How the ingress rule picks a security group in the cluster's VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum SecurityGroupSelector {
    /// First group the provider lists for the VPC
    #[default]
    First,
    /// Group with this name
    Name(String),
    /// Group with this id
    Id(String),
}

impl std::fmt::Display for SecurityGroupSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityGroupSelector::First => write!(f, "first"),
            SecurityGroupSelector::Name(name) => write!(f, "name={}", name),
            SecurityGroupSelector::Id(id) => write!(f, "id={}", id),
        }
    }
}

/// Provisioning behaviour section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningSection {
    /// Seconds between cluster status checks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Status checks before giving up with a timeout
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Security group receiving the ingress rule
    #[serde(default)]
    pub security_group: SecurityGroupSelector,

    /// Source range allowed to reach the warehouse port
    #[serde(default = "default_ingress_cidr")]
    pub ingress_cidr: String,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_poll_attempts() -> u32 {
    40
}

fn default_ingress_cidr() -> String {
    "0.0.0.0/0".to_string()
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
            security_group: SecurityGroupSelector::default(),
            ingress_cidr: default_ingress_cidr(),
        }
    }
}

impl ProvisioningSection {
    /// Poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Local backend section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalSection {
    /// Path to the DuckDB database file
    #[serde(default = "default_duckdb_path")]
    pub database: String,

    /// Local event log directory, file or glob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_data: Option<String>,

    /// Local song catalog directory, file or glob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub song_data: Option<String>,

    /// Local JSONPaths file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_jsonpath: Option<String>,
}

fn default_duckdb_path() -> String {
    DEFAULT_DUCKDB_FILENAME.to_string()
}

impl Default for LocalSection {
    fn default() -> Self {
        Self {
            database: default_duckdb_path(),
            log_data: None,
            song_data: None,
            log_jsonpath: None,
        }
    }
}

/// Static AWS credentials taken from the environment
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"****")
            .finish()
    }
}

impl AwsCredentials {
    /// Read credentials from `DW_AWS_ACCESS_KEY_ID` / `DW_AWS_SECRET_ACCESS_KEY`
    ///
    /// Returns `None` when either is unset, leaving the SDK's default chain in charge.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let access_key_id = lookup(ENV_AWS_ACCESS_KEY_ID).filter(|v| !v.is_empty())?;
        let secret_access_key = lookup(ENV_AWS_SECRET_ACCESS_KEY).filter(|v| !v.is_empty())?;
        Some(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

/// Main configuration structure
///
/// Represents the `redjam.toml` configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub aws: AwsSection,

    #[serde(default)]
    pub cluster: ClusterSection,

    #[serde(default)]
    pub iam_role: IamRoleSection,

    #[serde(default)]
    pub s3: S3Section,

    #[serde(default)]
    pub load: LoadSection,

    #[serde(default)]
    pub provisioning: ProvisioningSection,

    #[serde(default)]
    pub local: LocalSection,
}

impl WarehouseConfig {
    /// Load configuration from a file and apply environment overrides
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a file without environment overrides
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(ENV_DB_PASSWORD) {
            self.cluster.password = password;
        }

        if let Some(host) = lookup(ENV_HOST) {
            self.cluster.host = Some(host);
        }

        if let Some(arn) = lookup(ENV_ROLE_ARN) {
            self.iam_role.arn = Some(arn);
        }

        if let Some(region) = lookup(ENV_AWS_REGION) {
            self.aws.region = region;
        }
    }

    /// Check the values every provisioning and pipeline step relies on
    pub fn validate(&self) -> ConfigResult<()> {
        let required: [(&'static str, &str); 5] = [
            ("cluster.identifier", &self.cluster.identifier),
            ("cluster.db_name", &self.cluster.db_name),
            ("cluster.user", &self.cluster.user),
            ("cluster.password", &self.cluster.password),
            ("iam_role.name", &self.iam_role.name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(field));
            }
        }

        if self.cluster.num_nodes < 1 {
            return Err(ConfigError::Invalid {
                field: "cluster.num_nodes",
                message: "must be at least 1".to_string(),
            });
        }

        if self.provisioning.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "provisioning.max_poll_attempts",
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Endpoint host, required before opening a Redshift connection
    pub fn host(&self) -> ConfigResult<&str> {
        self.cluster
            .host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or(ConfigError::MissingField("cluster.host"))
    }

    /// Role ARN, required by the bulk loads
    pub fn role_arn(&self) -> ConfigResult<&str> {
        self.iam_role
            .arn
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or(ConfigError::MissingField("iam_role.arn"))
    }

    /// Persist the provisioning outputs into the configuration file
    ///
    /// The file is re-read without environment overrides so that values
    /// supplied through the environment are never written to disk.
    pub fn record_provisioned(path: &Path, role_arn: &str, host: Option<&str>) -> ConfigResult<()> {
        let mut on_disk = Self::load_file(path)?;
        on_disk.iam_role.arn = Some(role_arn.to_string());
        if let Some(host) = host {
            on_disk.cluster.host = Some(host.to_string());
        }
        on_disk.save(path)
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# redjam configuration

[aws]
region = "us-west-2"

[cluster]
identifier = "redjam-cluster"
cluster_type = "multi-node"
node_type = "dc2.large"
num_nodes = 4
db_name = "sparkify"
user = "dwhuser"
# Prefer REDJAM_DB_PASSWORD over storing the password here
password = "change-me"
port = 5439
# host is written here once the cluster is available

[iam_role]
name = "redjam-s3-read"
policy_arn = "arn:aws:iam::aws:policy/AmazonS3ReadOnlyAccess"
# arn is written here by `redjam build`

[s3]
log_data = "s3://udacity-dend/log_data"
song_data = "s3://udacity-dend/song_data"
log_jsonpath = "s3://udacity-dend/log_json_path.json"

[load]
max_errors = 250
songs_compupdate = false

[provisioning]
poll_interval_secs = 30
max_poll_attempts = 40
ingress_cidr = "0.0.0.0/0"
# security_group = { by = "name", value = "default" }
security_group = { by = "first" }

[local]
database = "redjam.duckdb"
# log_data = "./data/log_data"
# song_data = "./data/song_data"
# log_jsonpath = "./data/log_json_path.json"
"#
}
