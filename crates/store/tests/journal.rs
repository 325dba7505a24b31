#![forbid(unsafe_code)]

use sfkit_core::{DesiredResource, Kind, Propagation, ResourceRef, ResourceStore, StoreError, StoreOp};
use sfkit_store::{Call, MemoryStore};

fn secret(name: &str) -> ResourceRef { ResourceRef::namespaced(Kind::Secret, "sf", name) }

#[tokio::test]
async fn create_is_visible_to_next_get_with_server_fields() {
    let store = MemoryStore::new();
    let r = secret("a");
    store.create(&DesiredResource::new(r.clone(), serde_json::json!({"data": {"a": "eA=="}}))).await.unwrap();
    let got = store.get(&r).await.unwrap();
    assert_eq!(got["data"]["a"], "eA==");
    assert!(got["metadata"]["uid"].as_str().is_some());
    assert_eq!(got["metadata"]["resourceVersion"], "1");
    assert_eq!(
        store.create(&DesiredResource::new(r.clone(), serde_json::json!({}))).await,
        Err(StoreError::AlreadyExists)
    );
    assert_eq!(store.calls(), vec![Call::Create(r.clone()), Call::Get(r.clone()), Call::Create(r)]);
}

#[tokio::test]
async fn faults_are_one_shot_and_journaled() {
    let store = MemoryStore::new();
    let r = secret("b");
    store.seed(r.clone(), serde_json::json!({}));
    let boom = StoreError::Api { code: 500, reason: "InternalError".into(), message: "boom".into() };
    store.fail_next(StoreOp::Get, &r, boom.clone());
    assert_eq!(store.get(&r).await, Err(boom));
    assert!(store.get(&r).await.is_ok());
    assert_eq!(store.count(StoreOp::Get, &r), 2);
}

#[tokio::test]
async fn delete_reports_not_found_for_absent_objects() {
    let store = MemoryStore::new();
    let r = secret("c");
    assert_eq!(store.delete(&r, Propagation::Default).await, Err(StoreError::NotFound));
    store.seed(r.clone(), serde_json::json!({}));
    assert!(store.delete(&r, Propagation::Background).await.is_ok());
    assert!(!store.contains(&r));
    assert_eq!(store.calls()[1], Call::Delete(r, Propagation::Background));
}

#[tokio::test]
async fn convergence_applies_after_scripted_gets() {
    let store = MemoryStore::new();
    let r = ResourceRef::namespaced(Kind::Job, "sf", "post-init");
    store.seed(r.clone(), serde_json::json!({"status": {"active": 1}}));
    store.converge_after(&r, 2, serde_json::json!({"status": {"active": null, "succeeded": 1}}));
    assert!(store.get(&r).await.unwrap()["status"].get("succeeded").is_none());
    assert!(store.get(&r).await.unwrap()["status"].get("succeeded").is_none());
    let third = store.get(&r).await.unwrap();
    assert_eq!(third["status"], serde_json::json!({"succeeded": 1}));
}

#[tokio::test]
async fn converging_store_simulates_controllers() {
    let store = MemoryStore::converging();
    let sts = ResourceRef::namespaced(Kind::StatefulSet, "sf", "gerrit");
    store.create(&DesiredResource::new(sts.clone(), serde_json::json!({"spec": {"replicas": 1}}))).await.unwrap();
    let got = store.get(&sts).await.unwrap();
    assert_eq!(got["status"]["readyReplicas"], 1);
    assert_eq!(got["status"]["currentRevision"], got["status"]["updateRevision"]);
}
