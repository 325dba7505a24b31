//! Gerrit code-review stack: provisioning plan and teardown targets.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sfkit_core::{DesiredResource, Kind, Propagation, Readiness, ResourceRef, WaitPolicy};

use crate::keys;
use crate::manifests::{self, BUSYBOX_IMAGE};
use crate::plan::{ProvisioningPlan, Step};
use crate::teardown::Target;

pub const GERRIT_IMAGE: &str = "quay.io/software-factory/gerrit:3.6.4-8";
const IDENT: &str = "gerrit";
const INGRESS: &str = "gerrit-ingress";
const MANAGESF: &str = "managesf-resources";
const HTTPD_PORT: i32 = 8080;
const HTTP_PORT: i32 = 80;
const HTTPD_PORT_NAME: &str = "gerrit-httpd";
const SSHD_PORT: i32 = 29418;
const SSHD_PORT_NAME: &str = "gerrit-sshd";
const SITE_PATH: &str = "/gerrit";
const POST_INIT: &str = "post-init";
const EXEC_MODE: i32 = 0o755;

pub const ADMIN_SSH_KEY: &str = "admin-ssh-key";
pub const ZUUL_SSH_KEY: &str = "zuul-ssh-key";
pub const ADMIN_API_KEY: &str = "gerrit-admin-api-key";
pub const ZUUL_API_KEY: &str = "zuul-gerrit-api-key";
pub const CONFIG_MAP: &str = "managesf-resources-config-map";
pub const TOOLING_CONFIG_MAP: &str = "managesf-resources-tooling-config-map";
/// Claim created by the `gerrit` volume template for replica 0.
pub const DATA_PVC: &str = "gerrit-gerrit-0";

const ENTRYPOINT: &str = include_str!("../static/entrypoint.sh");
const INIT_SCRIPT: &str = include_str!("../static/init.sh");
const MANAGESF_ENTRYPOINT: &str = include_str!("../static/msf-entrypoint.sh");
const POST_INIT_SCRIPT: &str = include_str!("../static/post-init.sh");
const CONFIG_PY_TEMPLATE: &str = include_str!("../static/config.py.tmpl");
const CREATE_REPO_SCRIPT: &str = include_str!("../static/create-repo.sh");
const CREATE_CI_USER_SCRIPT: &str = include_str!("../static/create-ci-user.sh");

/// Extra `/etc/hosts` entry for the Gerrit pod, parsed from `IP=host1,host2`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostAlias {
    pub ip: String,
    pub hostnames: Vec<String>,
}

impl FromStr for HostAlias {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((ip, hosts)) = s.split_once('=') else { bail!("host alias {:?} must look like IP=host1,host2", s) };
        let ip = ip.trim();
        if ip.parse::<std::net::IpAddr>().is_err() {
            bail!("host alias {:?}: {:?} is not an IP address", s, ip);
        }
        let hostnames: Vec<String> = hosts.split(',').map(str::trim).filter(|h| !h.is_empty()).map(str::to_string).collect();
        if hostnames.is_empty() {
            bail!("host alias {:?} names no hosts", s);
        }
        Ok(Self { ip: ip.to_string(), hostnames })
    }
}

#[derive(Debug, Clone)]
pub struct GerritConfig {
    pub namespace: String,
    pub fqdn: String,
    pub openshift: bool,
    pub host_aliases: Vec<HostAlias>,
    pub ssh_key_bits: usize,
    pub rollout: WaitPolicy,
    pub job: WaitPolicy,
}

impl GerritConfig {
    pub const DEFAULT_ROLLOUT: WaitPolicy = WaitPolicy { poll_interval: Duration::from_secs(10), max_attempts: 60 };
    pub const DEFAULT_JOB: WaitPolicy = WaitPolicy { poll_interval: Duration::from_secs(2), max_attempts: 60 };

    pub fn new(namespace: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            fqdn: fqdn.into(),
            openshift: false,
            host_aliases: Vec::new(),
            ssh_key_bits: keys::DEFAULT_SSH_KEY_BITS,
            rollout: Self::DEFAULT_ROLLOUT,
            job: Self::DEFAULT_JOB,
        }
    }

    /// Apply `SFKIT_ROLLOUT_*`, `SFKIT_JOB_*` and `SFKIT_SSH_KEY_BITS`.
    pub fn with_env_overrides(mut self) -> Self {
        self.rollout = WaitPolicy::from_env("SFKIT_ROLLOUT", self.rollout);
        self.job = WaitPolicy::from_env("SFKIT_JOB", self.job);
        self.ssh_key_bits = keys::ssh_key_bits_from_env();
        self
    }

    fn r(&self, kind: Kind, name: &str) -> ResourceRef { ResourceRef::namespaced(kind, self.namespace.clone(), name) }

    pub fn endpoint_ref(&self) -> ResourceRef {
        if self.openshift { self.r(Kind::Route, IDENT) } else { self.r(Kind::Ingress, INGRESS) }
    }

    pub fn hostname(&self) -> String { format!("gerrit.{}", self.fqdn) }
}

fn render_config_py(fqdn: &str, admin_password: &str) -> String {
    CONFIG_PY_TEMPLATE.replace("{{FQDN}}", fqdn).replace("{{ADMIN_PASSWORD}}", admin_password)
}

pub fn httpd_service(cfg: &GerritConfig) -> Result<DesiredResource> {
    let r = cfg.r(Kind::Service, HTTPD_PORT_NAME);
    let port = |name: String, port: i32| ServicePort {
        name: Some(name),
        protocol: Some("TCP".into()),
        port,
        target_port: Some(IntOrString::String(HTTPD_PORT_NAME.into())),
        ..Default::default()
    };
    let svc = Service {
        metadata: manifests::meta(&r),
        spec: Some(ServiceSpec {
            ports: Some(vec![
                port(HTTPD_PORT_NAME.into(), HTTPD_PORT),
                port(format!("{}-internal-http", HTTPD_PORT_NAME), HTTP_PORT),
            ]),
            selector: Some(manifests::app_labels(IDENT)),
            ..Default::default()
        }),
        ..Default::default()
    };
    manifests::desired(&r, &svc)
}

pub fn sshd_service(cfg: &GerritConfig) -> Result<DesiredResource> {
    let r = cfg.r(Kind::Service, SSHD_PORT_NAME);
    let svc = Service {
        metadata: manifests::meta(&r),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(SSHD_PORT_NAME.into()),
                protocol: Some("TCP".into()),
                port: SSHD_PORT,
                ..Default::default()
            }]),
            type_: Some("LoadBalancer".into()),
            selector: Some(manifests::app_labels(IDENT)),
            ..Default::default()
        }),
        ..Default::default()
    };
    manifests::desired(&r, &svc)
}

pub fn managesf_config_map(cfg: &GerritConfig, admin_api_key: &str) -> Result<DesiredResource> {
    let data = BTreeMap::from([("config.py".to_string(), render_config_py(&cfg.fqdn, admin_api_key))]);
    manifests::config_map(&cfg.r(Kind::ConfigMap, CONFIG_MAP), data)
}

pub fn tooling_config_map(cfg: &GerritConfig) -> Result<DesiredResource> {
    let data = BTreeMap::from([
        ("create-repo.sh".to_string(), CREATE_REPO_SCRIPT.to_string()),
        ("create-ci-user.sh".to_string(), CREATE_CI_USER_SCRIPT.to_string()),
    ]);
    manifests::config_map(&cfg.r(Kind::ConfigMap, TOOLING_CONFIG_MAP), data)
}

fn managesf_volumes() -> Vec<k8s_openapi::api::core::v1::Volume> {
    vec![
        manifests::config_map_volume(&format!("{}-config-vol", MANAGESF), CONFIG_MAP, None),
        manifests::config_map_volume(&format!("{}-tooling-vol", MANAGESF), TOOLING_CONFIG_MAP, Some(EXEC_MODE)),
    ]
}

fn managesf_mounts() -> Vec<k8s_openapi::api::core::v1::VolumeMount> {
    vec![
        manifests::mount(&format!("{}-config-vol", MANAGESF), "/etc/managesf"),
        manifests::mount(&format!("{}-tooling-vol", MANAGESF), "/usr/share/managesf"),
    ]
}

fn sh(script: &str) -> Option<Vec<String>> { Some(vec!["sh".into(), "-c".into(), script.to_string()]) }

fn gerrit_pod(cfg: &GerritConfig) -> PodTemplateSpec {
    let site = vec![manifests::mount(IDENT, SITE_PATH)];
    let ready = ["bash", "/gerrit/ready.sh"];

    let mut gerrit = manifests::container(IDENT, GERRIT_IMAGE);
    manifests::limits(&mut gerrit, "512Mi", "768Mi", "100m", "1000m");
    gerrit.command = sh(ENTRYPOINT);
    gerrit.volume_mounts = Some(site.clone());
    gerrit.ports = Some(vec![
        ContainerPort { container_port: HTTPD_PORT, name: Some(HTTPD_PORT_NAME.into()), ..Default::default() },
        ContainerPort { container_port: SSHD_PORT, name: Some(SSHD_PORT_NAME.into()), ..Default::default() },
    ]);
    gerrit.env = Some(vec![
        manifests::env("HOME", SITE_PATH),
        manifests::env("FQDN", &cfg.fqdn),
        manifests::env("JVM_XMS", "128m"),
        manifests::env("JVM_XMX", "512m"),
        manifests::secret_env("GERRIT_ADMIN_SSH", ADMIN_SSH_KEY, "priv"),
    ]);
    gerrit.readiness_probe = Some(manifests::exec_probe(&ready, 10, 3));
    gerrit.startup_probe = Some(manifests::exec_probe(&ready, 10, 30));
    gerrit.liveness_probe = Some(manifests::exec_probe(&ready, 30, 3));

    let mut init = manifests::container("gerrit-init", GERRIT_IMAGE);
    manifests::limits(&mut init, "512Mi", "768Mi", "100m", "1000m");
    init.command = sh(INIT_SCRIPT);
    init.volume_mounts = Some(site);
    init.env = Some(vec![
        manifests::secret_env("GERRIT_ADMIN_SSH_PUB", ADMIN_SSH_KEY, "pub"),
        manifests::env("FQDN", &cfg.fqdn),
        manifests::env("JVM_XMS", "256m"),
        manifests::env("JVM_XMX", "512m"),
    ]);

    let mut managesf = manifests::container(MANAGESF, BUSYBOX_IMAGE);
    managesf.command = sh(MANAGESF_ENTRYPOINT);
    managesf.env = Some(vec![
        manifests::env("HOME", "/tmp"),
        manifests::env("FQDN", &cfg.fqdn),
        manifests::secret_env("SF_ADMIN_SSH", ADMIN_SSH_KEY, "priv"),
    ]);
    managesf.volume_mounts = Some(managesf_mounts());

    PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(manifests::app_labels(IDENT)), ..Default::default() }),
        spec: Some(PodSpec {
            containers: vec![gerrit, managesf],
            init_containers: Some(vec![init]),
            volumes: Some(managesf_volumes()),
            security_context: Some(manifests::pod_security_context()),
            ..Default::default()
        }),
    }
}

pub fn statefulset(cfg: &GerritConfig) -> Result<DesiredResource> {
    let r = cfg.r(Kind::StatefulSet, IDENT);
    let mut template = serde_json::to_value(gerrit_pod(cfg))?;
    if !cfg.host_aliases.is_empty() {
        template["spec"]["hostAliases"] = serde_json::to_value(&cfg.host_aliases)?;
    }
    let body = json!({
        "metadata": {"name": IDENT, "namespace": cfg.namespace},
        "spec": {
            "replicas": 1,
            "serviceName": IDENT,
            "selector": {"matchLabels": manifests::app_labels(IDENT)},
            "template": template,
            "volumeClaimTemplates": [{
                "metadata": {"name": IDENT},
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {"requests": {"storage": "1Gi"}},
                },
            }],
        },
    });
    Ok(DesiredResource::new(r, body))
}

pub fn post_init_job(cfg: &GerritConfig) -> Result<DesiredResource> {
    let r = cfg.r(Kind::Job, POST_INIT);
    let mut c = manifests::container(&format!("{}-container", POST_INIT), BUSYBOX_IMAGE);
    c.command = sh(POST_INIT_SCRIPT);
    c.env = Some(vec![
        manifests::env("HOME", "/tmp"),
        manifests::env("FQDN", &cfg.fqdn),
        manifests::secret_env("GERRIT_ADMIN_SSH", ADMIN_SSH_KEY, "priv"),
        manifests::secret_env("GERRIT_ADMIN_API_KEY", ADMIN_API_KEY, ADMIN_API_KEY),
        manifests::secret_env("ZUUL_SSH_PUB_KEY", ZUUL_SSH_KEY, "pub"),
        manifests::secret_env("ZUUL_HTTP_PASSWORD", ZUUL_API_KEY, ZUUL_API_KEY),
    ]);
    c.volume_mounts = Some(managesf_mounts());
    let job = Job {
        metadata: manifests::meta(&r),
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![c],
                    restart_policy: Some("Never".into()),
                    volumes: Some(managesf_volumes()),
                    security_context: Some(manifests::pod_security_context()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };
    manifests::desired(&r, &job)
}

/// OpenShift Route (edge TLS) or a plain Ingress, depending on the platform.
pub fn endpoint(cfg: &GerritConfig) -> DesiredResource {
    let r = cfg.endpoint_ref();
    let body = if cfg.openshift {
        json!({
            "spec": {
                "host": cfg.hostname(),
                "path": "/",
                "to": {"kind": "Service", "name": HTTPD_PORT_NAME, "weight": 100},
                "port": {"targetPort": HTTPD_PORT},
                "tls": {"termination": "edge", "insecureEdgeTerminationPolicy": "Redirect"},
            }
        })
    } else {
        json!({
            "spec": {
                "rules": [{
                    "host": cfg.hostname(),
                    "http": {"paths": [{
                        "path": "/",
                        "pathType": "Prefix",
                        "backend": {"service": {"name": HTTPD_PORT_NAME, "port": {"number": HTTPD_PORT}}},
                    }]},
                }],
            }
        })
    };
    DesiredResource::new(r, body)
}

/// Namespace, credentials, services, config, workload, post-init job, endpoint.
pub fn gerrit_plan(cfg: &GerritConfig) -> Result<ProvisioningPlan> {
    let mut plan = ProvisioningPlan::new("gerrit");
    plan.push(Step::ensure(manifests::namespace(&cfg.namespace)?));

    for name in [ADMIN_SSH_KEY, ZUUL_SSH_KEY] {
        let r = cfg.r(Kind::Secret, name);
        let bits = cfg.ssh_key_bits;
        plan.push(Step::ensure_with(r.clone(), move |_| keys::ssh_key_secret(&r, bits)));
    }
    for name in [ADMIN_API_KEY, ZUUL_API_KEY] {
        let r = cfg.r(Kind::Secret, name);
        plan.push(Step::ensure_with(r.clone(), move |_| keys::api_key_secret(&r)));
    }

    plan.push(Step::ensure(httpd_service(cfg)?));
    plan.push(Step::ensure(sshd_service(cfg)?));

    // config.py carries whichever admin key the secret holds, new or reused.
    let admin_key = cfg.r(Kind::Secret, ADMIN_API_KEY);
    let cm_cfg = cfg.clone();
    plan.push(Step::ensure_with(cfg.r(Kind::ConfigMap, CONFIG_MAP), move |seen| {
        let key = seen.secret_value(&admin_key, ADMIN_API_KEY)?;
        managesf_config_map(&cm_cfg, &key)
    }));
    plan.push(Step::ensure(tooling_config_map(cfg)?));

    let sts = statefulset(cfg)?;
    let sts_ref = sts.reference.clone();
    plan.push(Step::ensure(sts));
    plan.push(Step::wait(sts_ref, Readiness::Rollout, cfg.rollout));

    let job = post_init_job(cfg)?;
    let job_ref = job.reference.clone();
    plan.push(Step::ensure(job));
    plan.push(Step::wait(job_ref, Readiness::Completion, cfg.job));

    plan.push(Step::ensure(endpoint(cfg)));
    Ok(plan)
}

/// Everything `gerrit_plan` may create except the namespace.
///
/// Both the Route and the Ingress are listed whatever `cfg.openshift` says; the
/// one that was never created reports absent.
pub fn gerrit_teardown_targets(cfg: &GerritConfig, keep_data: bool) -> Vec<Target> {
    let mut targets = vec![Target::new(cfg.r(Kind::Route, IDENT)), Target::new(cfg.r(Kind::Ingress, INGRESS))];
    for name in [ADMIN_SSH_KEY, ZUUL_SSH_KEY, ADMIN_API_KEY, ZUUL_API_KEY] {
        targets.push(Target::new(cfg.r(Kind::Secret, name)));
    }
    for name in [HTTPD_PORT_NAME, SSHD_PORT_NAME] {
        targets.push(Target::new(cfg.r(Kind::Service, name)));
    }
    for name in [CONFIG_MAP, TOOLING_CONFIG_MAP] {
        targets.push(Target::new(cfg.r(Kind::ConfigMap, name)));
    }
    targets.push(Target::new(cfg.r(Kind::StatefulSet, IDENT)));
    targets.push(Target::with_propagation(cfg.r(Kind::Job, POST_INIT), Propagation::Background));
    if !keep_data {
        targets.push(Target::new(cfg.r(Kind::PersistentVolumeClaim, DATA_PVC)));
    }
    targets
}
