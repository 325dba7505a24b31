//! Namespace that Nodepool drives with its own restricted service account.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use serde::Serialize;
use sfkit_core::{DesiredResource, Kind, Readiness, ResourceRef, ResourceStore, WaitPolicy};
use sfkit_kubehub::ClusterEndpoint;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::keys;
use crate::manifests;
use crate::plan::{execute, PlanReport, ProvisioningPlan, Step};
use crate::teardown::{teardown, Target, TeardownReport};

pub const SERVICE_ACCOUNT: &str = "nodepool-sa";
pub const ROLE: &str = "nodepool-role";
pub const ROLE_BINDING: &str = "nodepool-rb";
pub const TOKEN_SECRET: &str = "nodepool-token";
pub const PROVIDERS_SECRET: &str = "nodepool-providers-secrets";
pub const KUBE_CONTEXT: &str = "openshiftpods";
const CLUSTER_NAME: &str = "OpenshiftPodsCluster";
const VERBS: [&str; 7] = ["create", "delete", "get", "list", "patch", "update", "watch"];

#[derive(Debug, Clone)]
pub struct NodepoolConfig {
    /// Namespace of the Software Factory deployment; holds the providers secret.
    pub sf_namespace: String,
    pub nodepool_namespace: String,
    pub endpoint: ClusterEndpoint,
    pub token: WaitPolicy,
}

impl NodepoolConfig {
    pub const DEFAULT_TOKEN: WaitPolicy = WaitPolicy { poll_interval: Duration::from_secs(1), max_attempts: 20 };

    pub fn new(sf_namespace: impl Into<String>, nodepool_namespace: impl Into<String>, endpoint: ClusterEndpoint) -> Self {
        Self {
            sf_namespace: sf_namespace.into(),
            nodepool_namespace: nodepool_namespace.into(),
            endpoint,
            token: Self::DEFAULT_TOKEN,
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.token = WaitPolicy::from_env("SFKIT_TOKEN", self.token);
        self
    }

    fn np(&self, kind: Kind, name: &str) -> ResourceRef {
        ResourceRef::namespaced(kind, self.nodepool_namespace.clone(), name)
    }

    pub fn token_ref(&self) -> ResourceRef { self.np(Kind::Secret, TOKEN_SECRET) }

    pub fn providers_ref(&self) -> ResourceRef {
        ResourceRef::namespaced(Kind::Secret, self.sf_namespace.clone(), PROVIDERS_SECRET)
    }
}

pub fn service_account(cfg: &NodepoolConfig) -> Result<DesiredResource> {
    let r = cfg.np(Kind::ServiceAccount, SERVICE_ACCOUNT);
    manifests::desired(&r, &ServiceAccount { metadata: manifests::meta(&r), ..Default::default() })
}

pub fn role(cfg: &NodepoolConfig) -> Result<DesiredResource> {
    let r = cfg.np(Kind::Role, ROLE);
    let rule = |group: &str, resources: &[&str]| PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|s| s.to_string()).collect()),
        verbs: VERBS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    let role = Role {
        metadata: manifests::meta(&r),
        rules: Some(vec![
            rule(
                "",
                &["pods", "pods/exec", "pods/portforward", "services", "persistentvolumeclaims", "configmaps", "secrets"],
            ),
            rule("apps", &["deployments", "statefulsets"]),
        ]),
    };
    manifests::desired(&r, &role)
}

pub fn role_binding(cfg: &NodepoolConfig) -> Result<DesiredResource> {
    let r = cfg.np(Kind::RoleBinding, ROLE_BINDING);
    let rb = RoleBinding {
        metadata: manifests::meta(&r),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".into(),
            kind: "Role".into(),
            name: ROLE.into(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".into(),
            name: SERVICE_ACCOUNT.into(),
            namespace: Some(cfg.nodepool_namespace.clone()),
            ..Default::default()
        }]),
    };
    manifests::desired(&r, &rb)
}

/// Empty secret the platform fills with the service account's token.
pub fn token_secret(cfg: &NodepoolConfig) -> Result<DesiredResource> {
    let r = cfg.np(Kind::Secret, TOKEN_SECRET);
    let mut d = keys::secret_body(&r, Some("kubernetes.io/service-account-token"), BTreeMap::new())?;
    d.body["metadata"]["annotations"] = serde_json::json!({"kubernetes.io/service-account.name": SERVICE_ACCOUNT});
    Ok(d)
}

#[derive(Serialize)]
struct KubeconfigFile {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<Named<ClusterEntry>>,
    contexts: Vec<Named<ContextEntry>>,
    #[serde(rename = "current-context")]
    current_context: &'static str,
    users: Vec<Named<UserEntry>>,
}

#[derive(Serialize)]
struct Named<T> {
    name: String,
    #[serde(flatten)]
    item: T,
}

#[derive(Serialize)]
struct ClusterEntry {
    cluster: ClusterFields,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterFields {
    server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    certificate_authority_data: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    insecure_skip_tls_verify: bool,
}

#[derive(Serialize)]
struct ContextEntry {
    context: ContextFields,
}

#[derive(Serialize)]
struct ContextFields {
    cluster: String,
    namespace: String,
    user: String,
}

#[derive(Serialize)]
struct UserEntry {
    user: UserFields,
}

#[derive(Serialize)]
struct UserFields {
    token: String,
}

/// Kubeconfig that authenticates as the nodepool service account.
pub fn render_kubeconfig(endpoint: &ClusterEndpoint, namespace: &str, token: &str) -> Result<String> {
    let file = KubeconfigFile {
        api_version: "v1",
        kind: "Config",
        clusters: vec![Named {
            name: CLUSTER_NAME.into(),
            item: ClusterEntry {
                cluster: ClusterFields {
                    server: endpoint.server.clone(),
                    certificate_authority_data: endpoint.certificate_authority_data.clone(),
                    insecure_skip_tls_verify: endpoint.insecure_skip_tls_verify,
                },
            },
        }],
        contexts: vec![Named {
            name: KUBE_CONTEXT.into(),
            item: ContextEntry {
                context: ContextFields { cluster: CLUSTER_NAME.into(), namespace: namespace.into(), user: SERVICE_ACCOUNT.into() },
            },
        }],
        current_context: KUBE_CONTEXT,
        users: vec![Named { name: SERVICE_ACCOUNT.into(), item: UserEntry { user: UserFields { token: token.into() } } }],
    };
    Ok(serde_yaml::to_string(&file)?)
}

pub fn providers_secret(cfg: &NodepoolConfig, kubeconfig: &str) -> Result<DesiredResource> {
    let data = BTreeMap::from([("kube.config".to_string(), kubeconfig.as_bytes().to_vec())]);
    keys::secret_body(&cfg.providers_ref(), None, data)
}

#[derive(Serialize)]
struct ProvidersConfig {
    providers: Vec<Provider>,
}

#[derive(Serialize)]
struct Provider {
    name: &'static str,
    driver: &'static str,
    context: &'static str,
    pools: Vec<Pool>,
}

#[derive(Serialize)]
struct Pool {
    name: String,
    labels: Vec<Label>,
}

#[derive(Serialize)]
struct Label {
    name: &'static str,
    image: &'static str,
}

/// Sample `openshiftpods` provider section for nodepool.yaml.
pub fn config_template(nodepool_namespace: &str) -> Result<String> {
    let cfg = ProvidersConfig {
        providers: vec![Provider {
            name: "openshiftpods",
            driver: "openshiftpods",
            context: KUBE_CONTEXT,
            pools: vec![Pool {
                name: nodepool_namespace.to_string(),
                labels: vec![Label { name: "fedora-latest", image: "quay.io/fedora/fedora:latest" }],
            }],
        }],
    };
    Ok(serde_yaml::to_string(&cfg)?)
}

/// Steps run against the cluster Nodepool will use, ending with the issued token.
pub fn nodepool_plan(cfg: &NodepoolConfig) -> Result<ProvisioningPlan> {
    let mut plan = ProvisioningPlan::new("nodepool");
    plan.push(Step::ensure(manifests::namespace(&cfg.nodepool_namespace)?))
        .push(Step::ensure(service_account(cfg)?))
        .push(Step::ensure(role(cfg)?))
        .push(Step::ensure(role_binding(cfg)?))
        .push(Step::ensure(token_secret(cfg)?))
        .push(Step::wait(cfg.token_ref(), Readiness::DataKey("token".into()), cfg.token));
    Ok(plan)
}

/// Single-step plan for the deployment's cluster.
pub fn providers_plan(cfg: &NodepoolConfig, kubeconfig: &str) -> Result<ProvisioningPlan> {
    let mut plan = ProvisioningPlan::new("nodepool-providers");
    plan.push(Step::ensure(providers_secret(cfg, kubeconfig)?));
    Ok(plan)
}

#[derive(Debug, Serialize)]
pub struct NodepoolDeployReport {
    pub namespace: PlanReport,
    /// `None` when the providers secret was skipped.
    pub providers: Option<PlanReport>,
    /// The rendered kubeconfig, only when it was not stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
}

/// Prepare the nodepool namespace through `nodepool_store`, then store the
/// resulting kubeconfig in the providers secret through `sf_store`.
///
/// With `skip_providers_secret` the second store is never touched and the
/// kubeconfig is returned in the report instead. Step indexes run on across both
/// stores, so a providers failure reports index 7.
pub async fn deploy_nodepool(
    nodepool_store: &dyn ResourceStore,
    sf_store: &dyn ResourceStore,
    cfg: &NodepoolConfig,
    skip_providers_secret: bool,
    cancel: &CancellationToken,
) -> Result<NodepoolDeployReport> {
    let plan = nodepool_plan(cfg)?;
    let offset = plan.len();
    let namespace = execute(nodepool_store, plan, cancel).await?;
    let token = namespace.observed.secret_value(&cfg.token_ref(), "token")?;
    let kubeconfig = render_kubeconfig(&cfg.endpoint, &cfg.nodepool_namespace, &token)?;

    if skip_providers_secret {
        info!(secret = %cfg.providers_ref(), "providers secret skipped");
        return Ok(NodepoolDeployReport { namespace, providers: None, kubeconfig: Some(kubeconfig) });
    }
    let providers = execute(sf_store, providers_plan(cfg, &kubeconfig)?, cancel).await.map_err(|mut e| {
        e.index += offset;
        e
    })?;
    Ok(NodepoolDeployReport { namespace, providers: Some(providers), kubeconfig: None })
}

/// Targets on the nodepool cluster. The namespace itself is left in place.
pub fn nodepool_teardown_targets(cfg: &NodepoolConfig) -> Vec<Target> {
    vec![
        Target::new(cfg.np(Kind::RoleBinding, ROLE_BINDING)),
        Target::new(cfg.np(Kind::Role, ROLE)),
        Target::new(cfg.token_ref()),
        Target::new(cfg.np(Kind::ServiceAccount, SERVICE_ACCOUNT)),
    ]
}

/// Teardown across both clusters: the namespace objects, then the providers secret.
pub async fn wipe_nodepool(nodepool_store: &dyn ResourceStore, sf_store: &dyn ResourceStore, cfg: &NodepoolConfig) -> TeardownReport {
    let mut report = teardown(nodepool_store, &nodepool_teardown_targets(cfg)).await;
    let providers = teardown(sf_store, &[Target::new(cfg.providers_ref())]).await;
    report.entries.extend(providers.entries);
    report
}
