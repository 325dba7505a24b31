//! sfkit apply: create-if-absent and bounded readiness waits over a `ResourceStore`.
//!
//! Both primitives only ever call `get` and `create`; nothing here updates or
//! patches an existing object.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::{counter, histogram};
use serde_json::Value as Json;
use sfkit_core::{
    DesiredResource, Readiness, ReconcileError, ReconciliationOutcome, ResourceRef, ResourceStore, StoreError, StoreOp,
    WaitPolicy,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of an ensure call: the outcome plus the object as last observed.
#[derive(Debug, Clone)]
pub struct Ensured {
    pub outcome: ReconciliationOutcome,
    pub object: Json,
}

/// Result of a satisfied wait.
#[derive(Debug, Clone)]
pub struct Ready {
    pub object: Json,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Create `desired` unless an object already exists under its ref.
///
/// A create that loses a race is re-read and reported as present. If the
/// winner's object is already gone by then, the call fails with
/// [`ReconcileError::Conflict`] rather than creating it a second time.
pub async fn ensure(store: &dyn ResourceStore, desired: &DesiredResource) -> Result<Ensured, ReconcileError> {
    ensure_with(store, &desired.reference, || Ok(desired.clone())).await
}

/// Like [`ensure`], but the body is only built when the object is absent.
pub async fn ensure_with<F>(store: &dyn ResourceStore, reference: &ResourceRef, build: F) -> Result<Ensured, ReconcileError>
where
    F: FnOnce() -> anyhow::Result<DesiredResource>,
{
    match store.get(reference).await {
        Ok(object) => {
            debug!(reference = %reference, "already present");
            counter!("ensure_present_total", "kind" => reference.kind.kind()).increment(1);
            return Ok(Ensured { outcome: ReconciliationOutcome::AlreadyPresent, object });
        }
        Err(StoreError::NotFound) => {}
        Err(source) => return Err(ReconcileError::Store { reference: reference.clone(), op: StoreOp::Get, source }),
    }

    let desired = build().map_err(|e| ReconcileError::Build { reference: reference.clone(), message: format!("{:#}", e) })?;
    if desired.reference != *reference {
        return Err(ReconcileError::Build {
            reference: reference.clone(),
            message: format!("builder produced a body for {}", desired.reference),
        });
    }

    info!(reference = %reference, "creating");
    match store.create(&desired).await {
        Ok(()) => {
            counter!("ensure_created_total", "kind" => reference.kind.kind()).increment(1);
            info!(reference = %reference, "created");
            Ok(Ensured { outcome: ReconciliationOutcome::Created, object: desired.body })
        }
        Err(StoreError::AlreadyExists) => {
            // Another runner created it between our get and create.
            warn!(reference = %reference, "create raced with another writer; keeping existing object");
            counter!("ensure_present_total", "kind" => reference.kind.kind()).increment(1);
            match store.get(reference).await {
                Ok(object) => Ok(Ensured { outcome: ReconciliationOutcome::AlreadyPresent, object }),
                // Nothing is recreated here: the other writer owns the object's lifecycle.
                Err(StoreError::NotFound) => Err(ReconcileError::Conflict { reference: reference.clone() }),
                Err(source) => Err(ReconcileError::Store { reference: reference.clone(), op: StoreOp::Get, source }),
            }
        }
        Err(source) => Err(ReconcileError::Store { reference: reference.clone(), op: StoreOp::Create, source }),
    }
}

/// Poll `reference` until `readiness` holds or `policy` is exhausted.
///
/// A missing object counts as "not yet ready". Cancellation is checked between
/// polls, never during a fetch.
pub async fn wait_until_ready(
    store: &dyn ResourceStore,
    reference: &ResourceRef,
    readiness: &Readiness,
    policy: &WaitPolicy,
    cancel: &CancellationToken,
) -> Result<Ready, ReconcileError> {
    let t0 = Instant::now();
    let max = policy.max_attempts.max(1);
    for attempt in 1..=max {
        counter!("wait_polls_total", "predicate" => readiness.name()).increment(1);
        let progress = match store.get(reference).await {
            Ok(object) => {
                if readiness.is_ready(&object) {
                    let elapsed = t0.elapsed();
                    histogram!("wait_latency_ms", "predicate" => readiness.name()).record(elapsed.as_secs_f64() * 1000.0);
                    info!(reference = %reference, predicate = %readiness.name(), attempt, took_ms = %elapsed.as_millis(), "ready");
                    return Ok(Ready { object, attempts: attempt, elapsed });
                }
                readiness.progress(&object)
            }
            Err(StoreError::NotFound) => "absent".to_string(),
            Err(source) => return Err(ReconcileError::Store { reference: reference.clone(), op: StoreOp::Get, source }),
        };
        if attempt == max { break; }
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled { reference: reference.clone() });
        }
        info!(
            reference = %reference,
            predicate = %readiness.name(),
            attempt,
            max,
            progress = %progress,
            "not ready; retrying in {:?}",
            policy.poll_interval
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled { reference: reference.clone() }),
            _ = tokio::time::sleep(policy.poll_interval) => {}
        }
    }
    let elapsed = t0.elapsed();
    counter!("wait_timeouts_total", "predicate" => readiness.name()).increment(1);
    Err(ReconcileError::Timeout { reference: reference.clone(), predicate: readiness.name(), attempts: max, elapsed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfkit_core::Kind;
    use sfkit_store::MemoryStore;

    #[tokio::test]
    async fn builder_is_not_called_when_present() {
        let store = MemoryStore::new();
        let r = ResourceRef::namespaced(Kind::Secret, "sf", "admin-ssh-key");
        store.seed(r.clone(), serde_json::json!({"data": {"priv": "eA=="}}));
        let got = ensure_with(&store, &r, || -> anyhow::Result<DesiredResource> { panic!("must not build") }).await.unwrap();
        assert_eq!(got.outcome, ReconciliationOutcome::AlreadyPresent);
        assert_eq!(got.object["data"]["priv"], "eA==");
    }

    #[tokio::test]
    async fn builder_errors_surface_as_build_errors() {
        let store = MemoryStore::new();
        let r = ResourceRef::namespaced(Kind::Secret, "sf", "x");
        let err = ensure_with(&store, &r, || Err(anyhow::anyhow!("no entropy"))).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Build { ref message, .. } if message.contains("no entropy")));
        assert_eq!(store.count_op(StoreOp::Create), 0);
    }

    #[tokio::test]
    async fn builder_must_target_the_ensured_ref() {
        let store = MemoryStore::new();
        let r = ResourceRef::namespaced(Kind::Secret, "sf", "x");
        let other = ResourceRef::namespaced(Kind::Secret, "sf", "y");
        let err = ensure_with(&store, &r, || Ok(DesiredResource::new(other.clone(), serde_json::json!({})))).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Build { .. }));
    }
}
