//! sfkit kubehub: kube client wiring, platform discovery and the kube-backed
//! `ResourceStore`.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use kube::{
    api::{Api, DeleteParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::Discovery,
    Client, Config,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sfkit_core::{DesiredResource, Kind, Propagation, ResourceRef, ResourceStore, StoreError};
use tracing::{debug, info};

const ROUTE_GROUP: &str = "route.openshift.io";

/// Client for the current context, or for `context` from the kubeconfig.
pub async fn get_kube_client(context: Option<&str>) -> Result<Client> {
    match context {
        None => Ok(Client::try_default().await?),
        Some(ctx) => {
            let opts = KubeConfigOptions { context: Some(ctx.to_string()), ..Default::default() };
            let cfg = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kube context {}", ctx))?;
            Ok(Client::try_from(cfg)?)
        }
    }
}

/// True when the cluster serves OpenShift routes.
pub async fn is_openshift(client: Client) -> Result<bool> {
    let discovery = Discovery::new(client).filter(&[ROUTE_GROUP]).run().await?;
    let found = discovery.has_group(ROUTE_GROUP);
    debug!(openshift = found, "platform discovery done");
    Ok(found)
}

/// API server address and trust bundle of a kubeconfig context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterEndpoint {
    pub server: String,
    /// Base64 PEM bundle, as stored in kubeconfig files.
    pub certificate_authority_data: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

/// Resolve the endpoint of `context` (or the current context) from the local kubeconfig.
pub fn cluster_endpoint(context: Option<&str>) -> Result<ClusterEndpoint> {
    let kc = Kubeconfig::read().context("reading kubeconfig")?;
    endpoint_from_kubeconfig(&kc, context)
}

fn endpoint_from_kubeconfig(kc: &Kubeconfig, context: Option<&str>) -> Result<ClusterEndpoint> {
    let ctx_name = context
        .map(|s| s.to_string())
        .or_else(|| kc.current_context.clone())
        .ok_or_else(|| anyhow!("no kube context given and kubeconfig has no current-context"))?;
    let ctx = kc
        .contexts
        .iter()
        .find(|c| c.name == ctx_name)
        .and_then(|c| c.context.as_ref())
        .ok_or_else(|| anyhow!("kube context {} not found", ctx_name))?;
    let cluster = kc
        .clusters
        .iter()
        .find(|c| c.name == ctx.cluster)
        .and_then(|c| c.cluster.as_ref())
        .ok_or_else(|| anyhow!("cluster {} of context {} not found", ctx.cluster, ctx_name))?;
    let server = cluster.server.clone().ok_or_else(|| anyhow!("cluster {} has no server address", ctx.cluster))?;
    // The address is handed to pods, so it must resolve from inside the cluster.
    if server.starts_with("https://localhost") || server.starts_with("https://127.") {
        bail!("server address {} of context {} is a loopback address", server, ctx_name);
    }
    Ok(ClusterEndpoint {
        server,
        certificate_authority_data: cluster.certificate_authority_data.clone(),
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify.unwrap_or(false),
    })
}

fn api_resource(kind: Kind) -> ApiResource {
    let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
    ApiResource::from_gvk_with_plural(&gvk, kind.plural())
}

fn classify(e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists,
        kube::Error::Api(ae) => StoreError::Api { code: ae.code, reason: ae.reason, message: ae.message },
        other => StoreError::Transport(other.to_string()),
    }
}

fn codec(e: serde_json::Error) -> StoreError { StoreError::Codec(e.to_string()) }

/// `ResourceStore` over a live cluster through `Api<DynamicObject>`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, reference: &ResourceRef) -> Api<DynamicObject> {
        let ar = api_resource(reference.kind);
        match (&reference.namespace, reference.kind.namespaced()) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, reference: &ResourceRef) -> Result<Json, StoreError> {
        let obj = self.api(reference).get(&reference.name).await.map_err(classify)?;
        serde_json::to_value(&obj).map_err(codec)
    }

    async fn create(&self, desired: &DesiredResource) -> Result<(), StoreError> {
        let obj: DynamicObject = serde_json::from_value(desired.body.clone()).map_err(codec)?;
        self.api(&desired.reference).create(&PostParams::default(), &obj).await.map_err(classify)?;
        info!(reference = %desired.reference, "api create accepted");
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef, propagation: Propagation) -> Result<(), StoreError> {
        let dp = match propagation {
            Propagation::Default => DeleteParams::default(),
            Propagation::Background => DeleteParams::background(),
        };
        self.api(reference).delete(&reference.name, &dp).await.map_err(classify)?;
        Ok(())
    }
}
