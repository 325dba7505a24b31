#![forbid(unsafe_code)]

use metrics_exporter_prometheus::PrometheusBuilder;
use sfkit_core::{Kind, ResourceRef, StoreError, StoreOp};
use sfkit_ops::{execute, gerrit_plan, teardown, GerritConfig, Target};
use sfkit_store::MemoryStore;
use tokio_util::sync::CancellationToken;

fn line<'a>(rendered: &'a str, name: &str, label: &str) -> Option<&'a str> {
    rendered.lines().find(|l| l.starts_with(&format!("{}{{", name)) && l.contains(label))
}

// Single test: the recorder is process-global.
#[tokio::test(start_paused = true)]
async fn engine_metrics_reach_the_prometheus_recorder() {
    let handle = PrometheusBuilder::new().install_recorder().unwrap();

    let store = MemoryStore::new();
    let broken = ResourceRef::namespaced(Kind::Secret, "sf", "admin-ssh-key");
    store.seed(broken.clone(), serde_json::json!({}));
    store.fail_next(StoreOp::Delete, &broken, StoreError::Transport("connection reset".into()));
    let report = teardown(&store, &[Target::new(broken)]).await;
    assert!(!report.is_clean());

    let mut cfg = GerritConfig::new("sf", "sftests.com");
    cfg.ssh_key_bits = 1024;
    let converging = MemoryStore::converging();
    execute(&converging, gerrit_plan(&cfg).unwrap(), &CancellationToken::new()).await.unwrap();

    let rendered = handle.render();
    let failures = line(&rendered, "teardown_failures_total", "kind=\"Secret\"").expect(&rendered);
    assert!(failures.ends_with(" 1"), "{}", failures);
    let runs = line(&rendered, "plan_runs_total", "result=\"ok\"").expect(&rendered);
    assert!(runs.contains("plan=\"gerrit\""));
    assert!(runs.ends_with(" 1"), "{}", runs);
    assert!(line(&rendered, "ensure_created_total", "kind=\"StatefulSet\"").is_some(), "{}", rendered);
    assert!(line(&rendered, "wait_polls_total", "predicate=\"rollout\"").is_some(), "{}", rendered);
    assert!(rendered.contains("wait_latency_ms"), "{}", rendered);
}
