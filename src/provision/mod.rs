//! Warehouse infrastructure provisioning
//!
//! The [`CloudProvider`] trait is the boundary between the provisioning
//! state machine ([`ProvisioningController`]) and the cloud APIs. Provider
//! calls report "already exists" and "not found" as an [`Outcome`] value
//! rather than as errors, so the controller never inspects error text.

pub mod controller;

#[cfg(feature = "aws")]
pub mod aws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, WarehouseConfig};

pub use controller::{ProvisioningController, ProvisioningReport, TeardownReport};

#[cfg(feature = "aws")]
pub use self::aws::AwsCloud;

/// Error type for provisioning operations
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Failed to create role {role}: {message}")]
    RoleCreate { role: String, message: String },

    #[error("Failed to attach policy to role {role}: {message}")]
    PolicyAttach { role: String, message: String },

    #[error("Failed to look up role {role}: {message}")]
    RoleLookup { role: String, message: String },

    #[error("Failed to create cluster {cluster}: {message}")]
    ClusterCreate { cluster: String, message: String },

    #[error("Failed to describe cluster {cluster}: {message}")]
    ClusterDescribe { cluster: String, message: String },

    #[error("Failed to delete cluster {cluster}: {message}")]
    ClusterDelete { cluster: String, message: String },

    #[error("Failed to delete role {role}: {message}")]
    RoleDelete { role: String, message: String },

    #[error("Failed to detach policy from role {role}: {message}")]
    PolicyDetach { role: String, message: String },

    #[error("Failed to list security groups in VPC {vpc_id}: {message}")]
    SecurityGroupLookup { vpc_id: String, message: String },

    #[error("No security group matching {selector} in VPC {vpc_id}")]
    SecurityGroupNotFound { vpc_id: String, selector: String },

    #[error("Failed to authorize ingress on {group_id}: {message}")]
    NetworkRule { group_id: String, message: String },

    #[error("Cluster still {last_status} after {attempts} status checks")]
    ProvisioningTimeout {
        attempts: u32,
        last_status: ClusterStatus,
    },

    #[error("Cluster is {actual} while waiting for it to become {expected}")]
    UnexpectedStatus {
        expected: ClusterStatus,
        actual: ClusterStatus,
    },

    #[error("Cluster description has no {0}")]
    MissingAttribute(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for provisioning operations
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

/// What an idempotent provider call actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    AlreadyExisted,
    Removed,
    AlreadyAbsent,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Created => write!(f, "created"),
            Outcome::AlreadyExisted => write!(f, "already existed"),
            Outcome::Removed => write!(f, "removed"),
            Outcome::AlreadyAbsent => write!(f, "already absent"),
        }
    }
}

/// Cluster lifecycle status as last observed from the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Absent,
    Creating,
    Available,
    Deleting,
    Deleted,
    /// Any other provider status, e.g. `modifying` or `rebooting`
    Other(String),
}

impl ClusterStatus {
    /// Map a provider status string
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "creating" => ClusterStatus::Creating,
            "available" => ClusterStatus::Available,
            "deleting" | "final-snapshot" => ClusterStatus::Deleting,
            "deleted" => ClusterStatus::Deleted,
            other => ClusterStatus::Other(other.to_string()),
        }
    }

    /// Status from which the cluster will not become available
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterStatus::Deleting | ClusterStatus::Deleted)
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Absent => write!(f, "absent"),
            ClusterStatus::Creating => write!(f, "creating"),
            ClusterStatus::Available => write!(f, "available"),
            ClusterStatus::Deleting => write!(f, "deleting"),
            ClusterStatus::Deleted => write!(f, "deleted"),
            ClusterStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Everything needed to request a cluster
#[derive(Clone)]
pub struct ClusterSpec {
    pub identifier: String,
    pub cluster_type: String,
    pub node_type: String,
    pub num_nodes: i32,
    pub db_name: String,
    pub master_user: String,
    pub master_password: String,
    pub port: u16,
    pub role_arn: String,
}

impl ClusterSpec {
    pub fn from_config(config: &WarehouseConfig, role_arn: &str) -> Self {
        Self {
            identifier: config.cluster.identifier.clone(),
            cluster_type: config.cluster.cluster_type.clone(),
            node_type: config.cluster.node_type.clone(),
            num_nodes: config.cluster.num_nodes,
            db_name: config.cluster.db_name.clone(),
            master_user: config.cluster.user.clone(),
            master_password: config.cluster.password.clone(),
            port: config.cluster.port,
            role_arn: role_arn.to_string(),
        }
    }

    /// Single-node clusters must not send a node count
    pub fn is_single_node(&self) -> bool {
        self.cluster_type == "single-node"
    }
}

impl std::fmt::Debug for ClusterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSpec")
            .field("identifier", &self.identifier)
            .field("cluster_type", &self.cluster_type)
            .field("node_type", &self.node_type)
            .field("num_nodes", &self.num_nodes)
            .field("db_name", &self.db_name)
            .field("master_user", &self.master_user)
            .field("master_password", &"****")
            .field("port", &self.port)
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

/// Current state of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    pub identifier: String,
    pub status: ClusterStatus,
    pub node_type: Option<String>,
    pub num_nodes: Option<i32>,
    pub master_user: Option<String>,
    pub db_name: Option<String>,
    pub endpoint_address: Option<String>,
    pub endpoint_port: Option<i32>,
    pub vpc_id: Option<String>,
}

impl ClusterDescription {
    /// Description of a cluster the provider does not know
    pub fn absent(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            status: ClusterStatus::Absent,
            node_type: None,
            num_nodes: None,
            master_user: None,
            db_name: None,
            endpoint_address: None,
            endpoint_port: None,
            vpc_id: None,
        }
    }

    /// Key/value view for display, unknown values omitted
    pub fn properties(&self) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("ClusterIdentifier", self.identifier.clone()),
            ("ClusterStatus", self.status.to_string()),
        ];
        let optional = [
            ("NodeType", self.node_type.clone()),
            ("NumberOfNodes", self.num_nodes.map(|n| n.to_string())),
            ("MasterUsername", self.master_user.clone()),
            ("DBName", self.db_name.clone()),
            ("Endpoint", self.endpoint_address.clone()),
            ("Port", self.endpoint_port.map(|p| p.to_string())),
            ("VpcId", self.vpc_id.clone()),
        ];
        props.extend(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v))),
        );
        props
    }
}

/// A network security group in the cluster's VPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

/// Inbound TCP rule opening the warehouse port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub group_id: String,
    pub cidr: String,
    pub port: u16,
}

/// Trust policy letting the warehouse service assume the access role
pub fn warehouse_trust_policy() -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Action": "sts:AssumeRole",
            "Effect": "Allow",
            "Principal": { "Service": "redshift.amazonaws.com" }
        }]
    })
    .to_string()
}

/// Cloud operations the provisioning state machine depends on
///
/// Implementations map "already exists" to [`Outcome::AlreadyExisted`] and
/// "not found" on teardown to [`Outcome::AlreadyAbsent`]. Every other
/// failure is returned as a [`ProvisioningError`].
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_role(&self, role: &str, trust_policy: &str) -> ProvisioningResult<Outcome>;

    async fn attach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome>;

    async fn role_arn(&self, role: &str) -> ProvisioningResult<String>;

    async fn create_cluster(&self, spec: &ClusterSpec) -> ProvisioningResult<Outcome>;

    /// Describe a cluster; an unknown cluster has status [`ClusterStatus::Absent`]
    async fn describe_cluster(&self, identifier: &str) -> ProvisioningResult<ClusterDescription>;

    /// Request deletion without a final snapshot
    async fn delete_cluster(&self, identifier: &str) -> ProvisioningResult<Outcome>;

    async fn detach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome>;

    async fn delete_role(&self, role: &str) -> ProvisioningResult<Outcome>;

    /// Security groups of a VPC in provider order
    async fn security_groups(&self, vpc_id: &str) -> ProvisioningResult<Vec<SecurityGroup>>;

    async fn authorize_ingress(&self, rule: &IngressRule) -> ProvisioningResult<Outcome>;
}
