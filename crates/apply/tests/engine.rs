#![forbid(unsafe_code)]

use std::time::Duration;

use sfkit_apply::{ensure, wait_until_ready};
use sfkit_core::{DesiredResource, Kind, Readiness, ReconcileError, ReconciliationOutcome, ResourceRef, StoreError, StoreOp, WaitPolicy};
use sfkit_store::MemoryStore;
use tokio_util::sync::CancellationToken;

fn job() -> ResourceRef { ResourceRef::namespaced(Kind::Job, "sf", "post-init") }

fn cm(data: &str) -> DesiredResource {
    DesiredResource::new(
        ResourceRef::namespaced(Kind::ConfigMap, "sf", "managesf-resources-config-map"),
        serde_json::json!({"data": {"config.py": data}}),
    )
}

#[tokio::test]
async fn ensure_twice_creates_once() {
    let store = MemoryStore::new();
    let desired = cm("v1");
    let first = ensure(&store, &desired).await.unwrap();
    let second = ensure(&store, &desired).await.unwrap();
    assert_eq!(first.outcome, ReconciliationOutcome::Created);
    assert_eq!(second.outcome, ReconciliationOutcome::AlreadyPresent);
    assert_eq!(store.count(StoreOp::Create, &desired.reference), 1);
}

#[tokio::test]
async fn ensure_never_overwrites_divergent_object() {
    let store = MemoryStore::new();
    let existing = cm("old");
    store.seed(existing.reference.clone(), existing.body.clone());
    let got = ensure(&store, &cm("new")).await.unwrap();
    assert_eq!(got.outcome, ReconciliationOutcome::AlreadyPresent);
    assert_eq!(got.object["data"]["config.py"], "old");
    assert_eq!(store.count_op(StoreOp::Create), 0);
    assert_eq!(store.object(&existing.reference).unwrap()["data"]["config.py"], "old");
}

#[tokio::test]
async fn ensure_get_failure_is_fatal_and_skips_create() {
    let store = MemoryStore::new();
    let desired = cm("v1");
    store.fail_next(StoreOp::Get, &desired.reference, StoreError::Transport("connection reset".into()));
    let err = ensure(&store, &desired).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::Get, .. }));
    assert_eq!(store.count_op(StoreOp::Create), 0);
}

#[tokio::test]
async fn ensure_create_failure_is_fatal() {
    let store = MemoryStore::new();
    let desired = cm("v1");
    let forbidden = StoreError::Api { code: 403, reason: "Forbidden".into(), message: "nope".into() };
    store.fail_next(StoreOp::Create, &desired.reference, forbidden.clone());
    let err = ensure(&store, &desired).await.unwrap_err();
    match err {
        ReconcileError::Store { op, source, reference } => {
            assert_eq!(op, StoreOp::Create);
            assert_eq!(source, forbidden);
            assert_eq!(reference, desired.reference);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn ensure_create_conflict_resolves_to_present() {
    let store = MemoryStore::new();
    let desired = cm("v1");
    store.fail_next(StoreOp::Create, &desired.reference, StoreError::AlreadyExists);
    // The conflicting writer's object shows up for the follow-up read.
    store.fail_next(StoreOp::Get, &desired.reference, StoreError::NotFound);
    store.seed(desired.reference.clone(), serde_json::json!({"data": {"config.py": "theirs"}}));
    let got = ensure(&store, &desired).await.unwrap();
    assert_eq!(got.outcome, ReconciliationOutcome::AlreadyPresent);
    assert_eq!(got.object["data"]["config.py"], "theirs");
    assert_eq!(store.count(StoreOp::Create, &desired.reference), 1);
}

#[tokio::test]
async fn ensure_conflict_with_vanished_object_is_reported() {
    let store = MemoryStore::new();
    let desired = cm("v1");
    store.fail_next(StoreOp::Create, &desired.reference, StoreError::AlreadyExists);
    let err = ensure(&store, &desired).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Conflict { ref reference } if *reference == desired.reference));
    assert_eq!(store.count(StoreOp::Create, &desired.reference), 1);
    assert_eq!(store.count(StoreOp::Get, &desired.reference), 2);
    assert!(!store.contains(&desired.reference));
}

#[tokio::test(start_paused = true)]
async fn waiter_returns_on_third_poll() {
    let store = MemoryStore::new();
    store.seed(job(), serde_json::json!({"status": {"active": 1}}));
    store.converge_after(&job(), 2, serde_json::json!({"status": {"succeeded": 1}}));
    let policy = WaitPolicy::new(Duration::from_secs(1), 10);
    let ready = wait_until_ready(&store, &job(), &Readiness::Completion, &policy, &CancellationToken::new()).await.unwrap();
    assert_eq!(ready.attempts, 3);
    assert_eq!(store.count(StoreOp::Get, &job()), 3);
    assert!(ready.elapsed >= Duration::from_secs(2));
    assert!(ready.elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn waiter_exhausts_budget_then_times_out() {
    let store = MemoryStore::new();
    store.seed(job(), serde_json::json!({"status": {"active": 1}}));
    let policy = WaitPolicy::new(Duration::from_secs(1), 5);
    let err = wait_until_ready(&store, &job(), &Readiness::Completion, &policy, &CancellationToken::new()).await.unwrap_err();
    assert_eq!(store.count(StoreOp::Get, &job()), 5);
    match err {
        ReconcileError::Timeout { reference, predicate, attempts, elapsed } => {
            assert_eq!(reference, job());
            assert_eq!(predicate, "completion");
            assert_eq!(attempts, 5);
            assert!(elapsed >= Duration::from_secs(4));
            assert!(elapsed < Duration::from_secs(5));
        }
        other => panic!("expected timeout, got {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn waiter_treats_absence_as_not_ready() {
    let store = MemoryStore::new();
    let token = ResourceRef::namespaced(Kind::Secret, "nodepool", "nodepool-token");
    let policy = WaitPolicy::new(Duration::from_secs(1), 3);
    let err = wait_until_ready(&store, &token, &Readiness::DataKey("token".into()), &policy, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Timeout { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn waiter_sees_token_once_platform_fills_it() {
    let store = MemoryStore::new();
    let token = ResourceRef::namespaced(Kind::Secret, "nodepool", "nodepool-token");
    store.seed(token.clone(), serde_json::json!({"type": "kubernetes.io/service-account-token"}));
    store.converge_after(&token, 1, serde_json::json!({"data": {"token": "c2VjcmV0"}}));
    let policy = WaitPolicy::new(Duration::from_secs(1), 20);
    let ready = wait_until_ready(&store, &token, &Readiness::DataKey("token".into()), &policy, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ready.attempts, 2);
    assert_eq!(ready.object["data"]["token"], "c2VjcmV0");
}

#[tokio::test(start_paused = true)]
async fn waiter_fetch_error_is_fatal() {
    let store = MemoryStore::new();
    store.seed(job(), serde_json::json!({}));
    store.fail_next(StoreOp::Get, &job(), StoreError::Transport("eof".into()));
    let policy = WaitPolicy::new(Duration::from_secs(1), 5);
    let err = wait_until_ready(&store, &job(), &Readiness::Completion, &policy, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Store { op: StoreOp::Get, .. }));
    assert_eq!(store.count(StoreOp::Get, &job()), 1);
}

#[tokio::test(start_paused = true)]
async fn waiter_stops_between_polls_when_cancelled() {
    let store = MemoryStore::new();
    store.seed(job(), serde_json::json!({}));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        trigger.cancel();
    });
    let policy = WaitPolicy::new(Duration::from_secs(1), 100);
    let err = wait_until_ready(&store, &job(), &Readiness::Completion, &policy, &cancel).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled { .. }));
    assert_eq!(store.count(StoreOp::Get, &job()), 3);
}

#[tokio::test(start_paused = true)]
async fn waiter_with_cancelled_token_fetches_once() {
    let store = MemoryStore::new();
    store.seed(job(), serde_json::json!({}));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let policy = WaitPolicy::new(Duration::from_secs(1), 10);
    let err = wait_until_ready(&store, &job(), &Readiness::Completion, &policy, &cancel).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled { .. }));
    assert_eq!(store.count(StoreOp::Get, &job()), 1);
}
