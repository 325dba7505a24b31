//! sfkit core types: object references, desired bodies, wait policies, errors
//! and the `ResourceStore` seam every engine component talks through.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod readiness;

pub use readiness::Readiness;

/// Object kinds the engine knows how to address.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Namespace,
    Secret,
    Service,
    ConfigMap,
    StatefulSet,
    Job,
    PersistentVolumeClaim,
    Route,
    Ingress,
    ServiceAccount,
    Role,
    RoleBinding,
}

impl Kind {
    /// `(group, version, kind, plural)` as served by the API server.
    fn meta(&self) -> (&'static str, &'static str, &'static str, &'static str) {
        match self {
            Kind::Namespace => ("", "v1", "Namespace", "namespaces"),
            Kind::Secret => ("", "v1", "Secret", "secrets"),
            Kind::Service => ("", "v1", "Service", "services"),
            Kind::ConfigMap => ("", "v1", "ConfigMap", "configmaps"),
            Kind::StatefulSet => ("apps", "v1", "StatefulSet", "statefulsets"),
            Kind::Job => ("batch", "v1", "Job", "jobs"),
            Kind::PersistentVolumeClaim => ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims"),
            Kind::Route => ("route.openshift.io", "v1", "Route", "routes"),
            Kind::Ingress => ("networking.k8s.io", "v1", "Ingress", "ingresses"),
            Kind::ServiceAccount => ("", "v1", "ServiceAccount", "serviceaccounts"),
            Kind::Role => ("rbac.authorization.k8s.io", "v1", "Role", "roles"),
            Kind::RoleBinding => ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings"),
        }
    }

    pub fn group(&self) -> &'static str { self.meta().0 }
    pub fn version(&self) -> &'static str { self.meta().1 }
    pub fn kind(&self) -> &'static str { self.meta().2 }
    pub fn plural(&self) -> &'static str { self.meta().3 }

    /// Only namespaces are cluster-scoped among the kinds we manage.
    pub fn namespaced(&self) -> bool { !matches!(self, Kind::Namespace) }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    /// `v1/Kind` or `group/v1/Kind`.
    pub fn gvk_key(&self) -> String { format!("{}/{}", self.api_version(), self.kind()) }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.kind()) }
}

/// Identifies one object instance. Lookup key for every ensure/wait/delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn namespaced(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(kind: Kind, name: impl Into<String>) -> Self {
        Self { kind, namespace: None, name: name.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A fully populated object body paired with the ref it will be stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredResource {
    pub reference: ResourceRef,
    pub body: Json,
}

impl DesiredResource {
    /// Stamps `apiVersion`, `kind` and `metadata.{name,namespace}` from the ref so
    /// the body can never disagree with the key it is created under.
    pub fn new(reference: ResourceRef, mut body: Json) -> Self {
        if !body.is_object() { body = Json::Object(serde_json::Map::new()); }
        if let Some(obj) = body.as_object_mut() {
            obj.insert("apiVersion".into(), Json::String(reference.kind.api_version()));
            obj.insert("kind".into(), Json::String(reference.kind.kind().to_string()));
            let meta = obj.entry("metadata").or_insert_with(|| Json::Object(serde_json::Map::new()));
            if let Some(m) = meta.as_object_mut() {
                m.insert("name".into(), Json::String(reference.name.clone()));
                match &reference.namespace {
                    Some(ns) => { m.insert("namespace".into(), Json::String(ns.clone())); }
                    None => { m.remove("namespace"); }
                }
            }
        }
        Self { reference, body }
    }
}

/// Result of an ensure call. There is deliberately no `Updated`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    AlreadyPresent,
    Created,
}

/// Fixed-interval polling budget: `poll_interval * max_attempts`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, max_attempts: u32) -> Self {
        Self { poll_interval, max_attempts: max_attempts.max(1) }
    }

    pub fn budget(&self) -> Duration { self.poll_interval * self.max_attempts }

    /// Read `<PREFIX>_POLL_SECS` / `<PREFIX>_MAX_ATTEMPTS`, falling back per field.
    pub fn from_env(prefix: &str, default: WaitPolicy) -> Self {
        let poll = std::env::var(format!("{prefix}_POLL_SECS"))
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default.poll_interval);
        let attempts = std::env::var(format!("{prefix}_MAX_ATTEMPTS"))
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(default.max_attempts);
        Self::new(poll, attempts)
    }
}

/// Deletion cascade mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Default,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Delete,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { StoreOp::Get => "get", StoreOp::Create => "create", StoreOp::Delete => "delete" })
    }
}

/// Classified Resource Store failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("codec: {0}")]
    Codec(String),
}

/// Fatal engine errors. `NotFound` never surfaces here on the happy paths.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("{op} {reference} failed: {source}")]
    Store { reference: ResourceRef, op: StoreOp, #[source] source: StoreError },
    #[error("timed out waiting for {reference} to satisfy {predicate} after {attempts} attempts ({elapsed:?})")]
    Timeout { reference: ResourceRef, predicate: String, attempts: u32, elapsed: Duration },
    #[error("cancelled while reconciling {reference}")]
    Cancelled { reference: ResourceRef },
    #[error("building desired body for {reference}: {message}")]
    Build { reference: ResourceRef, message: String },
    /// Create hit AlreadyExists, but the object was gone again on re-read.
    #[error("{reference} was created by another writer and deleted before it could be read")]
    Conflict { reference: ResourceRef },
}

impl ReconcileError {
    pub fn reference(&self) -> &ResourceRef {
        match self {
            ReconcileError::Store { reference, .. }
            | ReconcileError::Timeout { reference, .. }
            | ReconcileError::Cancelled { reference }
            | ReconcileError::Build { reference, .. }
            | ReconcileError::Conflict { reference } => reference,
        }
    }
}

/// Key-value object store addressed by (kind, namespace, name).
///
/// Implementations must be strongly consistent: a successful `create` is visible
/// to the next `get`.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, reference: &ResourceRef) -> Result<Json, StoreError>;
    async fn create(&self, desired: &DesiredResource) -> Result<(), StoreError>;
    async fn delete(&self, reference: &ResourceRef, propagation: Propagation) -> Result<(), StoreError>;
}

pub mod prelude {
    pub use super::{
        DesiredResource, Kind, Propagation, Readiness, ReconcileError, ReconciliationOutcome, ResourceRef,
        ResourceStore, StoreError, StoreOp, WaitPolicy,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_resource_stamps_identity() {
        let r = ResourceRef::namespaced(Kind::StatefulSet, "sf", "gerrit");
        let d = DesiredResource::new(r, serde_json::json!({"metadata": {"name": "other", "labels": {"a": "b"}}, "spec": {}}));
        assert_eq!(d.body["apiVersion"], "apps/v1");
        assert_eq!(d.body["kind"], "StatefulSet");
        assert_eq!(d.body["metadata"]["name"], "gerrit");
        assert_eq!(d.body["metadata"]["namespace"], "sf");
        assert_eq!(d.body["metadata"]["labels"]["a"], "b");
    }

    #[test]
    fn cluster_scoped_ref_drops_namespace() {
        let r = ResourceRef::cluster(Kind::Namespace, "sf");
        let d = DesiredResource::new(r.clone(), serde_json::json!({"metadata": {"namespace": "x"}}));
        assert!(d.body["metadata"].get("namespace").is_none());
        assert_eq!(r.to_string(), "Namespace sf");
        assert!(!Kind::Namespace.namespaced());
    }

    #[test]
    fn gvk_keys_follow_api_server_naming() {
        assert_eq!(Kind::Secret.gvk_key(), "v1/Secret");
        assert_eq!(Kind::Route.gvk_key(), "route.openshift.io/v1/Route");
        assert_eq!(Kind::RoleBinding.plural(), "rolebindings");
    }

    #[test]
    fn wait_policy_budget_and_floor() {
        let p = WaitPolicy::new(Duration::from_secs(2), 60);
        assert_eq!(p.budget(), Duration::from_secs(120));
        assert_eq!(WaitPolicy::new(Duration::from_secs(1), 0).max_attempts, 1);
    }

    #[test]
    fn wait_policy_from_env_overrides_per_field() {
        std::env::set_var("SFKIT_CORE_TEST_POLL_SECS", "7");
        std::env::set_var("SFKIT_CORE_TEST_MAX_ATTEMPTS", "not-a-number");
        let p = WaitPolicy::from_env("SFKIT_CORE_TEST", WaitPolicy::new(Duration::from_secs(1), 3));
        assert_eq!(p.poll_interval, Duration::from_secs(7));
        assert_eq!(p.max_attempts, 3);
    }
}
