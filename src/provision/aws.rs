//! AWS implementation of [`CloudProvider`]
//!
//! IAM for the access role, Redshift for the cluster and EC2 for the VPC
//! ingress rule, all built from one shared SDK configuration.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use tracing::debug;

use super::{
    ClusterDescription, ClusterSpec, ClusterStatus, CloudProvider, IngressRule, Outcome,
    ProvisioningError, ProvisioningResult, SecurityGroup,
};
use crate::config::{AwsCredentials, AwsSection};

/// EC2 error code for an ingress rule that is already present
const DUPLICATE_RULE_CODE: &str = "InvalidPermission.Duplicate";

/// Cloud provider backed by the AWS SDK
pub struct AwsCloud {
    iam: aws_sdk_iam::Client,
    redshift: aws_sdk_redshift::Client,
    ec2: aws_sdk_ec2::Client,
}

impl AwsCloud {
    /// Build clients for the configured region
    ///
    /// Static credentials are used when given; otherwise the SDK default
    /// credential chain applies.
    pub async fn from_config(aws: &AwsSection, credentials: Option<AwsCredentials>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(aws.region.clone()));
        if let Some(creds) = credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id,
                creds.secret_access_key,
                None,
                None,
                "redjam",
            ));
        }
        let sdk_config = loader.load().await;
        debug!(region = %aws.region, "AWS clients configured");

        Self::from_sdk_config(&sdk_config)
    }

    pub fn from_sdk_config(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            iam: aws_sdk_iam::Client::new(sdk_config),
            redshift: aws_sdk_redshift::Client::new(sdk_config),
            ec2: aws_sdk_ec2::Client::new(sdk_config),
        }
    }
}

/// Render an SDK error with its full source chain
fn sdk_message<E: std::error::Error>(err: &E) -> String {
    aws_sdk_iam::error::DisplayErrorContext(err).to_string()
}

/// Map a Redshift cluster record to a description
fn describe(identifier: &str, cluster: &aws_sdk_redshift::types::Cluster) -> ClusterDescription {
    let endpoint = cluster.endpoint();
    ClusterDescription {
        identifier: cluster
            .cluster_identifier()
            .unwrap_or(identifier)
            .to_string(),
        status: cluster
            .cluster_status()
            .map(ClusterStatus::from_provider)
            .unwrap_or_else(|| ClusterStatus::Other("unknown".to_string())),
        node_type: cluster.node_type().map(str::to_string),
        num_nodes: cluster.number_of_nodes(),
        master_user: cluster.master_username().map(str::to_string),
        db_name: cluster.db_name().map(str::to_string),
        endpoint_address: endpoint.and_then(|e| e.address()).map(str::to_string),
        endpoint_port: endpoint.and_then(|e| e.port()),
        vpc_id: cluster.vpc_id().map(str::to_string),
    }
}

#[async_trait]
impl CloudProvider for AwsCloud {
    async fn create_role(&self, role: &str, trust_policy: &str) -> ProvisioningResult<Outcome> {
        use aws_sdk_iam::operation::create_role::CreateRoleError;

        let result = self
            .iam
            .create_role()
            .path("/")
            .role_name(role)
            .description("Allows Redshift clusters to call AWS services")
            .assume_role_policy_document(trust_policy)
            .send()
            .await;

        match result {
            Ok(_) => Ok(Outcome::Created),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(CreateRoleError::EntityAlreadyExistsException(_))
                ) =>
            {
                Ok(Outcome::AlreadyExisted)
            }
            Err(e) => Err(ProvisioningError::RoleCreate {
                role: role.to_string(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn attach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome> {
        // Attaching is idempotent on the IAM side, so list first to report what happened
        let attached = self
            .iam
            .list_attached_role_policies()
            .role_name(role)
            .send()
            .await
            .map_err(|e| ProvisioningError::PolicyAttach {
                role: role.to_string(),
                message: sdk_message(&e),
            })?;
        if attached
            .attached_policies()
            .iter()
            .any(|p| p.policy_arn() == Some(policy_arn))
        {
            return Ok(Outcome::AlreadyExisted);
        }

        self.iam
            .attach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await
            .map_err(|e| ProvisioningError::PolicyAttach {
                role: role.to_string(),
                message: sdk_message(&e),
            })?;
        Ok(Outcome::Created)
    }

    async fn role_arn(&self, role: &str) -> ProvisioningResult<String> {
        let output = self
            .iam
            .get_role()
            .role_name(role)
            .send()
            .await
            .map_err(|e| ProvisioningError::RoleLookup {
                role: role.to_string(),
                message: sdk_message(&e),
            })?;

        output
            .role()
            .map(|r| r.arn().to_string())
            .ok_or(ProvisioningError::MissingAttribute("Role.Arn"))
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> ProvisioningResult<Outcome> {
        use aws_sdk_redshift::operation::create_cluster::CreateClusterError;

        let mut request = self
            .redshift
            .create_cluster()
            .cluster_identifier(&spec.identifier)
            .cluster_type(&spec.cluster_type)
            .node_type(&spec.node_type)
            .db_name(&spec.db_name)
            .master_username(&spec.master_user)
            .master_user_password(&spec.master_password)
            .port(i32::from(spec.port))
            .iam_roles(&spec.role_arn);
        if !spec.is_single_node() {
            request = request.number_of_nodes(spec.num_nodes);
        }

        match request.send().await {
            Ok(_) => Ok(Outcome::Created),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(CreateClusterError::ClusterAlreadyExistsFault(_))
                ) =>
            {
                Ok(Outcome::AlreadyExisted)
            }
            Err(e) => Err(ProvisioningError::ClusterCreate {
                cluster: spec.identifier.clone(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn describe_cluster(&self, identifier: &str) -> ProvisioningResult<ClusterDescription> {
        use aws_sdk_redshift::operation::describe_clusters::DescribeClustersError;

        let result = self
            .redshift
            .describe_clusters()
            .cluster_identifier(identifier)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output
                .clusters()
                .first()
                .map(|c| describe(identifier, c))
                .unwrap_or_else(|| ClusterDescription::absent(identifier))),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DescribeClustersError::ClusterNotFoundFault(_))
                ) =>
            {
                Ok(ClusterDescription::absent(identifier))
            }
            Err(e) => Err(ProvisioningError::ClusterDescribe {
                cluster: identifier.to_string(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn delete_cluster(&self, identifier: &str) -> ProvisioningResult<Outcome> {
        use aws_sdk_redshift::operation::delete_cluster::DeleteClusterError;

        let result = self
            .redshift
            .delete_cluster()
            .cluster_identifier(identifier)
            .skip_final_cluster_snapshot(true)
            .send()
            .await;

        match result {
            Ok(_) => Ok(Outcome::Removed),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DeleteClusterError::ClusterNotFoundFault(_))
                ) =>
            {
                Ok(Outcome::AlreadyAbsent)
            }
            Err(e) => Err(ProvisioningError::ClusterDelete {
                cluster: identifier.to_string(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn detach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome> {
        use aws_sdk_iam::operation::detach_role_policy::DetachRolePolicyError;

        let result = self
            .iam
            .detach_role_policy()
            .role_name(role)
            .policy_arn(policy_arn)
            .send()
            .await;

        match result {
            Ok(_) => Ok(Outcome::Removed),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DetachRolePolicyError::NoSuchEntityException(_))
                ) =>
            {
                Ok(Outcome::AlreadyAbsent)
            }
            Err(e) => Err(ProvisioningError::PolicyDetach {
                role: role.to_string(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn delete_role(&self, role: &str) -> ProvisioningResult<Outcome> {
        use aws_sdk_iam::operation::delete_role::DeleteRoleError;

        let result = self.iam.delete_role().role_name(role).send().await;

        match result {
            Ok(_) => Ok(Outcome::Removed),
            Err(e)
                if matches!(
                    e.as_service_error(),
                    Some(DeleteRoleError::NoSuchEntityException(_))
                ) =>
            {
                Ok(Outcome::AlreadyAbsent)
            }
            Err(e) => Err(ProvisioningError::RoleDelete {
                role: role.to_string(),
                message: sdk_message(&e),
            }),
        }
    }

    async fn security_groups(&self, vpc_id: &str) -> ProvisioningResult<Vec<SecurityGroup>> {
        use aws_sdk_ec2::types::Filter;

        let output = self
            .ec2
            .describe_security_groups()
            .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
            .send()
            .await
            .map_err(|e| ProvisioningError::SecurityGroupLookup {
                vpc_id: vpc_id.to_string(),
                message: sdk_message(&e),
            })?;

        Ok(output
            .security_groups()
            .iter()
            .filter_map(|g| {
                Some(SecurityGroup {
                    id: g.group_id()?.to_string(),
                    name: g.group_name().unwrap_or_default().to_string(),
                })
            })
            .collect())
    }

    async fn authorize_ingress(&self, rule: &IngressRule) -> ProvisioningResult<Outcome> {
        use aws_sdk_ec2::error::ProvideErrorMetadata;

        let port = i32::from(rule.port);
        let result = self
            .ec2
            .authorize_security_group_ingress()
            .group_id(&rule.group_id)
            .ip_protocol("tcp")
            .cidr_ip(&rule.cidr)
            .from_port(port)
            .to_port(port)
            .send()
            .await;

        match result {
            Ok(_) => Ok(Outcome::Created),
            Err(e)
                if e.as_service_error().and_then(|se| se.code()) == Some(DUPLICATE_RULE_CODE) =>
            {
                Ok(Outcome::AlreadyExisted)
            }
            Err(e) => Err(ProvisioningError::NetworkRule {
                group_id: rule.group_id.clone(),
                message: sdk_message(&e),
            }),
        }
    }
}
