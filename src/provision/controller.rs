//! Provisioning state machine
//!
//! Drives a cluster through `Absent -> Creating -> Available` and back
//! through `Deleting -> Deleted`, using a [`CloudProvider`] for every
//! external call.

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    ClusterDescription, ClusterSpec, ClusterStatus, CloudProvider, IngressRule, Outcome,
    ProvisioningError, ProvisioningResult, SecurityGroup, warehouse_trust_policy,
};
use crate::config::{SecurityGroupSelector, WarehouseConfig};

/// What `create_infrastructure` did
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningReport {
    pub role: Outcome,
    pub policy: Outcome,
    pub role_arn: String,
    pub cluster: Outcome,
    pub description: ClusterDescription,
    pub security_group: SecurityGroup,
    pub ingress: Outcome,
}

impl ProvisioningReport {
    /// Endpoint host of the available cluster
    pub fn host(&self) -> Option<&str> {
        self.description.endpoint_address.as_deref()
    }
}

/// What `delete_infrastructure` did
#[derive(Debug, Clone, Serialize)]
pub struct TeardownReport {
    pub cluster: Outcome,
    pub policy: Outcome,
    pub role: Outcome,
    /// Final description when the teardown waited for deletion
    pub final_status: Option<ClusterStatus>,
}

/// Creates and destroys the cluster and its access role
pub struct ProvisioningController<'a, P: CloudProvider + ?Sized> {
    provider: &'a P,
    config: &'a WarehouseConfig,
}

impl<'a, P: CloudProvider + ?Sized> ProvisioningController<'a, P> {
    pub fn new(provider: &'a P, config: &'a WarehouseConfig) -> Self {
        Self { provider, config }
    }

    fn cluster_id(&self) -> &str {
        &self.config.cluster.identifier
    }

    fn role_name(&self) -> &str {
        &self.config.iam_role.name
    }

    /// Provision the role and cluster, wait for availability and open the port
    ///
    /// Any failure other than an already-existing resource aborts. A timed
    /// out wait leaves the cluster as it is; calling this again resumes
    /// waiting on the same cluster.
    pub async fn create_infrastructure(&self) -> ProvisioningResult<ProvisioningReport> {
        self.config.validate()?;
        let role_name = self.role_name();
        let policy_arn = &self.config.iam_role.policy_arn;

        let role = self
            .provider
            .create_role(role_name, &warehouse_trust_policy())
            .await?;
        info!(role = role_name, outcome = %role, "access role");

        let policy = self.provider.attach_policy(role_name, policy_arn).await?;
        info!(role = role_name, policy = %policy_arn, outcome = %policy, "role policy");

        let role_arn = self.provider.role_arn(role_name).await?;
        debug!(role_arn = %role_arn, "resolved role ARN");

        let spec = ClusterSpec::from_config(self.config, &role_arn);
        let cluster = self.provider.create_cluster(&spec).await?;
        info!(cluster = %spec.identifier, outcome = %cluster, "cluster requested");

        let description = self.wait_until_available().await?;
        let vpc_id = description
            .vpc_id
            .as_deref()
            .ok_or(ProvisioningError::MissingAttribute("VpcId"))?;
        if description.endpoint_address.is_none() {
            return Err(ProvisioningError::MissingAttribute("Endpoint.Address"));
        }

        let groups = self.provider.security_groups(vpc_id).await?;
        let security_group =
            select_security_group(&groups, &self.config.provisioning.security_group, vpc_id)?;
        let rule = IngressRule {
            group_id: security_group.id.clone(),
            cidr: self.config.provisioning.ingress_cidr.clone(),
            port: self.config.cluster.port,
        };
        let ingress = self.provider.authorize_ingress(&rule).await?;
        info!(
            group = %security_group.id,
            port = rule.port,
            cidr = %rule.cidr,
            outcome = %ingress,
            "ingress rule"
        );

        Ok(ProvisioningReport {
            role,
            policy,
            role_arn,
            cluster,
            description,
            security_group,
            ingress,
        })
    }

    /// Poll until the cluster is available, bounded by the configured attempts
    pub async fn wait_until_available(&self) -> ProvisioningResult<ClusterDescription> {
        let attempts = self.config.provisioning.max_poll_attempts;
        let mut last_status = ClusterStatus::Absent;

        for attempt in 1..=attempts {
            let description = self.provider.describe_cluster(self.cluster_id()).await?;
            debug!(cluster = self.cluster_id(), attempt, status = %description.status, "polled");

            match description.status {
                ClusterStatus::Available => {
                    info!(cluster = self.cluster_id(), attempt, "cluster available");
                    return Ok(description);
                }
                ref status if status.is_terminal() => {
                    return Err(ProvisioningError::UnexpectedStatus {
                        expected: ClusterStatus::Available,
                        actual: status.clone(),
                    });
                }
                // Absent here is a create that the provider has not surfaced yet
                status => last_status = status,
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.provisioning.poll_interval()).await;
            }
        }

        Err(ProvisioningError::ProvisioningTimeout {
            attempts,
            last_status,
        })
    }

    /// Request cluster deletion, then detach the policy and delete the role
    pub async fn delete_infrastructure(&self, wait: bool) -> ProvisioningResult<TeardownReport> {
        let role_name = self.role_name();

        let cluster = self.provider.delete_cluster(self.cluster_id()).await?;
        info!(cluster = self.cluster_id(), outcome = %cluster, "cluster deletion");

        let policy = self
            .provider
            .detach_policy(role_name, &self.config.iam_role.policy_arn)
            .await?;
        info!(role = role_name, outcome = %policy, "role policy detached");

        let role = self.provider.delete_role(role_name).await?;
        info!(role = role_name, outcome = %role, "access role deleted");

        let final_status = if wait {
            Some(self.wait_until_deleted().await?)
        } else {
            None
        };

        Ok(TeardownReport {
            cluster,
            policy,
            role,
            final_status,
        })
    }

    /// Poll until the provider no longer reports the cluster
    pub async fn wait_until_deleted(&self) -> ProvisioningResult<ClusterStatus> {
        let attempts = self.config.provisioning.max_poll_attempts;
        let mut last_status = ClusterStatus::Deleting;

        for attempt in 1..=attempts {
            let description = self.provider.describe_cluster(self.cluster_id()).await?;
            debug!(cluster = self.cluster_id(), attempt, status = %description.status, "polled");

            match description.status {
                ClusterStatus::Absent | ClusterStatus::Deleted => {
                    info!(cluster = self.cluster_id(), "cluster deleted");
                    return Ok(description.status);
                }
                ClusterStatus::Available => {
                    return Err(ProvisioningError::UnexpectedStatus {
                        expected: ClusterStatus::Deleted,
                        actual: ClusterStatus::Available,
                    });
                }
                status => last_status = status,
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.provisioning.poll_interval()).await;
            }
        }

        Err(ProvisioningError::ProvisioningTimeout {
            attempts,
            last_status,
        })
    }

    /// Current cluster state
    pub async fn describe(&self) -> ProvisioningResult<ClusterDescription> {
        self.provider.describe_cluster(self.cluster_id()).await
    }
}

/// Pick the group that receives the ingress rule
pub fn select_security_group(
    groups: &[SecurityGroup],
    selector: &SecurityGroupSelector,
    vpc_id: &str,
) -> ProvisioningResult<SecurityGroup> {
    let found = match selector {
        SecurityGroupSelector::First => {
            if groups.len() > 1 {
                warn!(
                    vpc = vpc_id,
                    groups = groups.len(),
                    chosen = groups.first().map(|g| g.id.as_str()).unwrap_or_default(),
                    "several security groups in VPC, using the first; set provisioning.security_group to choose"
                );
            }
            groups.first()
        }
        SecurityGroupSelector::Name(name) => groups.iter().find(|g| &g.name == name),
        SecurityGroupSelector::Id(id) => groups.iter().find(|g| &g.id == id),
    };

    found
        .cloned()
        .ok_or_else(|| ProvisioningError::SecurityGroupNotFound {
            vpc_id: vpc_id.to_string(),
            selector: selector.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::sample_config;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CloudState {
        roles: HashSet<String>,
        attached: HashSet<(String, String)>,
        cluster_requested: bool,
        /// Statuses returned by successive describes; the last one repeats
        statuses: VecDeque<ClusterStatus>,
        rules: HashSet<(String, String, u16)>,
        fail_role_create: bool,
        fail_attach: bool,
        fail_cluster_create: bool,
        fail_group_lookup: bool,
        calls: Vec<String>,
    }

    /// In-memory cloud with scripted cluster status
    struct FakeCloud {
        state: Mutex<CloudState>,
        groups: Vec<SecurityGroup>,
    }

    impl FakeCloud {
        fn new(statuses: Vec<ClusterStatus>) -> Self {
            Self {
                state: Mutex::new(CloudState {
                    statuses: statuses.into(),
                    ..Default::default()
                }),
                groups: vec![
                    SecurityGroup {
                        id: "sg-default".to_string(),
                        name: "default".to_string(),
                    },
                    SecurityGroup {
                        id: "sg-redshift".to_string(),
                        name: "redshift-ingress".to_string(),
                    },
                ],
            }
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn record(&self, call: &str) {
            self.state.lock().unwrap().calls.push(call.to_string());
        }
    }

    #[async_trait]
    impl CloudProvider for FakeCloud {
        async fn create_role(
            &self,
            role: &str,
            _trust_policy: &str,
        ) -> ProvisioningResult<Outcome> {
            self.record("create_role");
            let mut state = self.state.lock().unwrap();
            if state.fail_role_create {
                return Err(ProvisioningError::RoleCreate {
                    role: role.to_string(),
                    message: "AccessDenied".to_string(),
                });
            }
            let created = state.roles.insert(role.to_string());
            Ok(if created { Outcome::Created } else { Outcome::AlreadyExisted })
        }

        async fn attach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome> {
            self.record("attach_policy");
            let mut state = self.state.lock().unwrap();
            if state.fail_attach {
                return Err(ProvisioningError::PolicyAttach {
                    role: role.to_string(),
                    message: "LimitExceeded".to_string(),
                });
            }
            let created = state
                .attached
                .insert((role.to_string(), policy_arn.to_string()));
            Ok(if created { Outcome::Created } else { Outcome::AlreadyExisted })
        }

        async fn role_arn(&self, role: &str) -> ProvisioningResult<String> {
            Ok(format!("arn:aws:iam::123456789012:role/{}", role))
        }

        async fn create_cluster(&self, spec: &ClusterSpec) -> ProvisioningResult<Outcome> {
            self.record("create_cluster");
            let mut state = self.state.lock().unwrap();
            if state.fail_cluster_create {
                return Err(ProvisioningError::ClusterCreate {
                    cluster: spec.identifier.clone(),
                    message: "InsufficientClusterCapacity".to_string(),
                });
            }
            let existed = state.cluster_requested;
            state.cluster_requested = true;
            Ok(if existed { Outcome::AlreadyExisted } else { Outcome::Created })
        }

        async fn describe_cluster(
            &self,
            identifier: &str,
        ) -> ProvisioningResult<ClusterDescription> {
            self.record("describe_cluster");
            let mut state = self.state.lock().unwrap();
            let status = if state.statuses.len() > 1 {
                state.statuses.pop_front().unwrap()
            } else {
                state.statuses.front().cloned().unwrap_or(ClusterStatus::Absent)
            };
            let mut description = ClusterDescription::absent(identifier);
            if status == ClusterStatus::Available {
                description.endpoint_address = Some("redjam.example.com".to_string());
                description.endpoint_port = Some(5439);
                description.vpc_id = Some("vpc-123".to_string());
            }
            description.status = status;
            Ok(description)
        }

        async fn delete_cluster(&self, _identifier: &str) -> ProvisioningResult<Outcome> {
            self.record("delete_cluster");
            let mut state = self.state.lock().unwrap();
            let existed = state.cluster_requested;
            state.cluster_requested = false;
            Ok(if existed { Outcome::Removed } else { Outcome::AlreadyAbsent })
        }

        async fn detach_policy(&self, role: &str, policy_arn: &str) -> ProvisioningResult<Outcome> {
            self.record("detach_policy");
            let removed = self
                .state
                .lock()
                .unwrap()
                .attached
                .remove(&(role.to_string(), policy_arn.to_string()));
            Ok(if removed { Outcome::Removed } else { Outcome::AlreadyAbsent })
        }

        async fn delete_role(&self, role: &str) -> ProvisioningResult<Outcome> {
            self.record("delete_role");
            let removed = self.state.lock().unwrap().roles.remove(role);
            Ok(if removed { Outcome::Removed } else { Outcome::AlreadyAbsent })
        }

        async fn security_groups(&self, vpc_id: &str) -> ProvisioningResult<Vec<SecurityGroup>> {
            self.record("security_groups");
            if self.state.lock().unwrap().fail_group_lookup {
                return Err(ProvisioningError::SecurityGroupLookup {
                    vpc_id: vpc_id.to_string(),
                    message: "RequestLimitExceeded".to_string(),
                });
            }
            Ok(self.groups.clone())
        }

        async fn authorize_ingress(&self, rule: &IngressRule) -> ProvisioningResult<Outcome> {
            self.record("authorize_ingress");
            let created = self.state.lock().unwrap().rules.insert((
                rule.group_id.clone(),
                rule.cidr.clone(),
                rule.port,
            ));
            Ok(if created { Outcome::Created } else { Outcome::AlreadyExisted })
        }
    }

    fn config() -> WarehouseConfig {
        let mut config = WarehouseConfig::parse(sample_config()).unwrap();
        config.provisioning.poll_interval_secs = 0;
        config.provisioning.max_poll_attempts = 5;
        config
    }

    #[tokio::test]
    async fn test_create_polls_until_available() {
        let cloud = FakeCloud::new(vec![
            ClusterStatus::Absent,
            ClusterStatus::Creating,
            ClusterStatus::Available,
        ]);
        let config = config();
        let report = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap();

        assert_eq!(report.role, Outcome::Created);
        assert_eq!(report.policy, Outcome::Created);
        assert_eq!(report.cluster, Outcome::Created);
        assert_eq!(report.role_arn, "arn:aws:iam::123456789012:role/redjam-s3-read");
        assert_eq!(report.host(), Some("redjam.example.com"));
        assert_eq!(report.security_group.id, "sg-default");
        assert_eq!(report.ingress, Outcome::Created);

        let describes = cloud
            .calls()
            .iter()
            .filter(|c| c.as_str() == "describe_cluster")
            .count();
        assert_eq!(describes, 3);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        let config = config();
        let controller = ProvisioningController::new(&cloud, &config);

        controller.create_infrastructure().await.unwrap();
        let second = controller.create_infrastructure().await.unwrap();

        assert_eq!(second.role, Outcome::AlreadyExisted);
        assert_eq!(second.policy, Outcome::AlreadyExisted);
        assert_eq!(second.cluster, Outcome::AlreadyExisted);
        assert_eq!(second.ingress, Outcome::AlreadyExisted);
    }

    #[tokio::test]
    async fn test_poll_is_bounded() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Creating]);
        let config = config();
        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();

        match err {
            ProvisioningError::ProvisioningTimeout {
                attempts,
                last_status,
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(last_status, ClusterStatus::Creating);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!cloud.calls().contains(&"authorize_ingress".to_string()));
    }

    #[tokio::test]
    async fn test_cluster_create_failure_stops_before_polling() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        cloud.state.lock().unwrap().fail_cluster_create = true;
        let config = config();

        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::ClusterCreate { .. }));
        assert!(!cloud.calls().contains(&"describe_cluster".to_string()));
    }

    #[tokio::test]
    async fn test_role_create_failure_stops_before_cluster() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        cloud.state.lock().unwrap().fail_role_create = true;
        let config = config();

        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::RoleCreate { .. }));
        assert_eq!(cloud.calls(), vec!["create_role".to_string()]);
    }

    #[tokio::test]
    async fn test_policy_attach_failure_stops_before_cluster() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        cloud.state.lock().unwrap().fail_attach = true;
        let config = config();

        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::PolicyAttach { .. }));
        let calls = cloud.calls();
        assert!(!calls.contains(&"create_cluster".to_string()));
        assert!(!calls.contains(&"describe_cluster".to_string()));
    }

    #[tokio::test]
    async fn test_group_lookup_failure_is_not_a_missing_group() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        cloud.state.lock().unwrap().fail_group_lookup = true;
        let config = config();

        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();
        match err {
            ProvisioningError::SecurityGroupLookup { vpc_id, message } => {
                assert_eq!(vpc_id, "vpc-123");
                assert_eq!(message, "RequestLimitExceeded");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!cloud.calls().contains(&"authorize_ingress".to_string()));
    }

    #[tokio::test]
    async fn test_deleting_cluster_is_unexpected() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Creating, ClusterStatus::Deleting]);
        let config = config();
        let err = ProvisioningController::new(&cloud, &config)
            .wait_until_available()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::UnexpectedStatus {
                actual: ClusterStatus::Deleting,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_makes_no_calls() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        let mut config = config();
        config.iam_role.name = String::new();

        let err = ProvisioningController::new(&cloud, &config)
            .create_infrastructure()
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Config(_)));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_order_and_idempotence() {
        let cloud = FakeCloud::new(vec![ClusterStatus::Available]);
        let config = config();
        let controller = ProvisioningController::new(&cloud, &config);
        controller.create_infrastructure().await.unwrap();

        let report = controller.delete_infrastructure(false).await.unwrap();
        assert_eq!(report.cluster, Outcome::Removed);
        assert_eq!(report.policy, Outcome::Removed);
        assert_eq!(report.role, Outcome::Removed);
        assert!(report.final_status.is_none());

        let calls = cloud.calls();
        let tail: Vec<&str> = calls.iter().rev().take(3).rev().map(|s| s.as_str()).collect();
        assert_eq!(tail, vec!["delete_cluster", "detach_policy", "delete_role"]);

        let again = controller.delete_infrastructure(false).await.unwrap();
        assert_eq!(again.cluster, Outcome::AlreadyAbsent);
        assert_eq!(again.policy, Outcome::AlreadyAbsent);
        assert_eq!(again.role, Outcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_deletion() {
        let cloud = FakeCloud::new(vec![
            ClusterStatus::Deleting,
            ClusterStatus::Deleting,
            ClusterStatus::Absent,
        ]);
        let config = config();
        let report = ProvisioningController::new(&cloud, &config)
            .delete_infrastructure(true)
            .await
            .unwrap();
        assert_eq!(report.final_status, Some(ClusterStatus::Absent));
    }

    #[test]
    fn test_select_security_group() {
        let groups = vec![
            SecurityGroup {
                id: "sg-1".to_string(),
                name: "default".to_string(),
            },
            SecurityGroup {
                id: "sg-2".to_string(),
                name: "redshift".to_string(),
            },
        ];

        let first = select_security_group(&groups, &SecurityGroupSelector::First, "vpc").unwrap();
        assert_eq!(first.id, "sg-1");

        let by_name = select_security_group(
            &groups,
            &SecurityGroupSelector::Name("redshift".to_string()),
            "vpc",
        )
        .unwrap();
        assert_eq!(by_name.id, "sg-2");

        let missing =
            select_security_group(&groups, &SecurityGroupSelector::Id("sg-9".to_string()), "vpc");
        assert!(matches!(
            missing,
            Err(ProvisioningError::SecurityGroupNotFound { .. })
        ));

        assert!(select_security_group(&[], &SecurityGroupSelector::First, "vpc").is_err());
    }
}
