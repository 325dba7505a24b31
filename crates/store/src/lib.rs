//! sfkit in-RAM Resource Store.
//!
//! `MemoryStore` behaves like a strongly consistent API server for the handful of
//! verbs the engine uses. Every call is journaled so callers can assert on call
//! order, and faults or status convergence can be scripted per object.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use base64::Engine as _;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use sfkit_core::{DesiredResource, Kind, Propagation, ResourceRef, ResourceStore, StoreError, StoreOp};
use tracing::debug;

/// One journaled store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Get(ResourceRef),
    Create(ResourceRef),
    Delete(ResourceRef, Propagation),
}

impl Call {
    pub fn op(&self) -> StoreOp {
        match self { Call::Get(_) => StoreOp::Get, Call::Create(_) => StoreOp::Create, Call::Delete(..) => StoreOp::Delete }
    }

    pub fn reference(&self) -> &ResourceRef {
        match self { Call::Get(r) | Call::Create(r) | Call::Delete(r, _) => r }
    }
}

struct Convergence {
    after_gets: u32,
    seen: u32,
    patch: Json,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceRef, Json>,
    journal: Vec<Call>,
    faults: FxHashMap<(u8, ResourceRef), VecDeque<StoreError>>,
    convergence: FxHashMap<ResourceRef, Convergence>,
    resource_version: u64,
}

fn op_key(op: StoreOp) -> u8 {
    match op { StoreOp::Get => 0, StoreOp::Create => 1, StoreOp::Delete => 2 }
}

impl Inner {
    fn take_fault(&mut self, op: StoreOp, r: &ResourceRef) -> Option<StoreError> {
        let key = (op_key(op), r.clone());
        let q = self.faults.get_mut(&key)?;
        let e = q.pop_front();
        if q.is_empty() { self.faults.remove(&key); }
        e
    }
}

/// In-memory `ResourceStore` with a call journal.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    simulate_controllers: bool,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    /// A store that plays the part of the cluster controllers: created workloads
    /// report a finished rollout, jobs report success and service-account token
    /// secrets get a token. Used for `--dry-run`.
    pub fn converging() -> Self { Self { inner: Mutex::new(Inner::default()), simulate_controllers: true } }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert an object directly, bypassing the journal.
    pub fn seed(&self, reference: ResourceRef, body: Json) {
        let d = DesiredResource::new(reference, body);
        self.lock().objects.insert(d.reference, d.body);
    }

    /// Queue an error returned by the next `op` on `reference`. Several calls queue in order.
    pub fn fail_next(&self, op: StoreOp, reference: &ResourceRef, err: StoreError) {
        self.lock().faults.entry((op_key(op), reference.clone())).or_default().push_back(err);
    }

    /// Merge `patch` into the object once it has been observed by more than
    /// `after_gets` successful gets.
    pub fn converge_after(&self, reference: &ResourceRef, after_gets: u32, patch: Json) {
        self.lock().convergence.insert(reference.clone(), Convergence { after_gets, seen: 0, patch });
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().journal.clone() }

    pub fn count(&self, op: StoreOp, reference: &ResourceRef) -> usize {
        self.lock().journal.iter().filter(|c| c.op() == op && c.reference() == reference).count()
    }

    pub fn count_op(&self, op: StoreOp) -> usize {
        self.lock().journal.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_journal(&self) { self.lock().journal.clear(); }

    pub fn object(&self, reference: &ResourceRef) -> Option<Json> { self.lock().objects.get(reference).cloned() }

    pub fn contains(&self, reference: &ResourceRef) -> bool { self.lock().objects.contains_key(reference) }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.lock().objects.is_empty() }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() { *target = Json::Object(serde_json::Map::new()); }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

fn stamp_server_fields(body: &mut Json, rv: u64) {
    let meta = match body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        Some(m) => m,
        None => return,
    };
    meta.insert("uid".into(), Json::String(uuid::Uuid::new_v4().to_string()));
    meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
    meta.insert("generation".into(), Json::from(1));
    meta.insert("creationTimestamp".into(), Json::String(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()));
}

fn simulated_status(kind: Kind, body: &Json) -> Option<Json> {
    match kind {
        Kind::StatefulSet => {
            let replicas = body.pointer("/spec/replicas").and_then(|v| v.as_i64()).unwrap_or(1);
            let name = body.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("sts");
            let rev = format!("{}-0", name);
            Some(serde_json::json!({"status": {
                "observedGeneration": 1, "replicas": replicas, "readyReplicas": replicas,
                "currentReplicas": replicas, "updatedReplicas": replicas,
                "currentRevision": rev, "updateRevision": rev,
            }}))
        }
        Kind::Job => Some(serde_json::json!({"status": {"succeeded": 1}})),
        Kind::Secret if body.get("type").and_then(|t| t.as_str()) == Some("kubernetes.io/service-account-token") => {
            let token = base64::engine::general_purpose::STANDARD.encode("simulated-service-account-token");
            Some(serde_json::json!({"data": {"token": token}}))
        }
        _ => None,
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, reference: &ResourceRef) -> Result<Json, StoreError> {
        let mut g = self.lock();
        g.journal.push(Call::Get(reference.clone()));
        if let Some(e) = g.take_fault(StoreOp::Get, reference) { return Err(e); }
        let inner = &mut *g;
        let obj = inner.objects.get_mut(reference).ok_or(StoreError::NotFound)?;
        let mut converged = false;
        if let Some(c) = inner.convergence.get_mut(reference) {
            c.seen += 1;
            if c.seen > c.after_gets {
                merge_patch(obj, &c.patch);
                converged = true;
            }
        }
        let out = obj.clone();
        if converged {
            inner.convergence.remove(reference);
            debug!(reference = %reference, "scripted convergence applied");
        }
        Ok(out)
    }

    async fn create(&self, desired: &DesiredResource) -> Result<(), StoreError> {
        let mut g = self.lock();
        let reference = desired.reference.clone();
        g.journal.push(Call::Create(reference.clone()));
        if let Some(e) = g.take_fault(StoreOp::Create, &reference) { return Err(e); }
        if g.objects.contains_key(&reference) { return Err(StoreError::AlreadyExists); }
        g.resource_version += 1;
        let mut body = desired.body.clone();
        stamp_server_fields(&mut body, g.resource_version);
        if self.simulate_controllers {
            if let Some(patch) = simulated_status(reference.kind, &body) { merge_patch(&mut body, &patch); }
        }
        g.objects.insert(reference, body);
        Ok(())
    }

    async fn delete(&self, reference: &ResourceRef, propagation: Propagation) -> Result<(), StoreError> {
        let mut g = self.lock();
        g.journal.push(Call::Delete(reference.clone(), propagation));
        if let Some(e) = g.take_fault(StoreOp::Delete, reference) { return Err(e); }
        g.objects.remove(reference).map(|_| ()).ok_or(StoreError::NotFound)
    }
}
