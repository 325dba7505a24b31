//! Typed object builders shared by the Gerrit and Nodepool plans.

use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, ExecAction, Namespace,
    PodSecurityContext, Probe, ResourceRequirements, SeccompProfile, SecretKeySelector, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use sfkit_core::{DesiredResource, Kind, ResourceRef};

pub const BUSYBOX_IMAGE: &str = "quay.io/software-factory/sf-op-busybox:1.5-3";

/// Serialize a typed object into a body stored under `reference`.
pub fn desired<T: Serialize>(reference: &ResourceRef, object: &T) -> Result<DesiredResource> {
    Ok(DesiredResource::new(reference.clone(), serde_json::to_value(object)?))
}

pub fn meta(reference: &ResourceRef) -> ObjectMeta {
    ObjectMeta { name: Some(reference.name.clone()), namespace: reference.namespace.clone(), ..Default::default() }
}

pub fn app_labels(run: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "sf".to_string()), ("run".to_string(), run.to_string())])
}

pub fn namespace(name: &str) -> Result<DesiredResource> {
    let reference = ResourceRef::cluster(Kind::Namespace, name);
    desired(&reference, &Namespace { metadata: meta(&reference), ..Default::default() })
}

pub fn config_map(reference: &ResourceRef, data: BTreeMap<String, String>) -> Result<DesiredResource> {
    desired(reference, &ConfigMap { metadata: meta(reference), data: Some(data), ..Default::default() })
}

pub fn env(name: &str, value: &str) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.to_string()), ..Default::default() }
}

/// Env var sourced from `secret[key]`.
pub fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.to_string(), mount_path: path.to_string(), ..Default::default() }
}

pub fn config_map_volume(name: &str, config_map: &str, default_mode: Option<i32>) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource { name: Some(config_map.to_string()), default_mode, ..Default::default() }),
        ..Default::default()
    }
}

pub fn limits(container: &mut Container, mem_request: &str, mem_limit: &str, cpu_request: &str, cpu_limit: &str) {
    let pair = |mem: &str, cpu: &str| {
        BTreeMap::from([("memory".to_string(), Quantity(mem.to_string())), ("cpu".to_string(), Quantity(cpu.to_string()))])
    };
    container.resources = Some(ResourceRequirements {
        requests: Some(pair(mem_request, cpu_request)),
        limits: Some(pair(mem_limit, cpu_limit)),
        ..Default::default()
    });
}

/// Unprivileged container with the default resource profile.
pub fn container(name: &str, image: &str) -> Container {
    let mut c = Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities { drop: Some(vec!["ALL".to_string()]), ..Default::default() }),
            seccomp_profile: Some(SeccompProfile { type_: "RuntimeDefault".to_string(), ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    };
    limits(&mut c, "128Mi", "256Mi", "100m", "500m");
    c
}

pub fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile { type_: "RuntimeDefault".to_string(), ..Default::default() }),
        ..Default::default()
    }
}

pub fn exec_probe(command: &[&str], period_seconds: i32, failure_threshold: i32) -> Probe {
    Probe {
        exec: Some(ExecAction { command: Some(command.iter().map(|s| s.to_string()).collect()) }),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(failure_threshold),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}
