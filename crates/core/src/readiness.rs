//! Readiness predicates over fetched object bodies.
//!
//! Each predicate reads the raw JSON status the API server reports and answers
//! "ready or not". `progress` renders a short human summary for wait logs.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Readiness {
    /// Every replica of a StatefulSet is ready and on the latest revision.
    Rollout,
    /// A Job has at least one successful completion.
    Completion,
    /// A Secret carries a non-empty value under the given data key.
    DataKey(String),
}

fn int_at(raw: &Json, path: &str) -> Option<i64> {
    raw.pointer(path).and_then(|v| v.as_i64())
}

impl Readiness {
    pub fn name(&self) -> String {
        match self {
            Readiness::Rollout => "rollout".to_string(),
            Readiness::Completion => "completion".to_string(),
            Readiness::DataKey(k) => format!("data-key:{}", k),
        }
    }

    pub fn is_ready(&self, raw: &Json) -> bool {
        match self {
            Readiness::Rollout => rollout_done(raw),
            Readiness::Completion => int_at(raw, "/status/succeeded").unwrap_or(0) >= 1,
            Readiness::DataKey(key) => raw
                .get("data")
                .and_then(|d| d.get(key.as_str()))
                .and_then(|v| v.as_str())
                .map(|s| !s.is_empty())
                .unwrap_or(false),
        }
    }

    pub fn progress(&self, raw: &Json) -> String {
        match self {
            Readiness::Rollout => {
                let desired = int_at(raw, "/spec/replicas").unwrap_or(1);
                let ready = int_at(raw, "/status/readyReplicas").unwrap_or(0);
                format!("{}/{} ready", ready, desired)
            }
            Readiness::Completion => {
                let active = int_at(raw, "/status/active").unwrap_or(0);
                let succeeded = int_at(raw, "/status/succeeded").unwrap_or(0);
                let failed = int_at(raw, "/status/failed").unwrap_or(0);
                format!("active={} succeeded={} failed={}", active, succeeded, failed)
            }
            Readiness::DataKey(key) => {
                if self.is_ready(raw) { format!("{} present", key) } else { format!("{} missing", key) }
            }
        }
    }
}

fn rollout_done(raw: &Json) -> bool {
    // The API server omits zero-valued counters, so absence reads as 0.
    if raw.get("status").is_none() { return false; }
    let generation = int_at(raw, "/metadata/generation").unwrap_or(0);
    let observed = int_at(raw, "/status/observedGeneration").unwrap_or(0);
    let desired = int_at(raw, "/spec/replicas").unwrap_or(1);
    let replicas = int_at(raw, "/status/replicas").unwrap_or(0);
    let ready = int_at(raw, "/status/readyReplicas").unwrap_or(0);
    let current = int_at(raw, "/status/currentReplicas").unwrap_or(0);
    if observed < generation || ready != desired || replicas != ready || current != replicas {
        return false;
    }
    let cur_rev = raw.pointer("/status/currentRevision").and_then(|v| v.as_str());
    let upd_rev = raw.pointer("/status/updateRevision").and_then(|v| v.as_str());
    match (cur_rev, upd_rev) {
        (Some(c), Some(u)) => c == u,
        _ => true,
    }
}
