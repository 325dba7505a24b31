//! Best-effort deletion of everything a plan may have created.

use metrics::counter;
use serde::{Deserialize, Serialize};
use sfkit_core::{Propagation, ResourceRef, ResourceStore, StoreError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub reference: ResourceRef,
    pub propagation: Propagation,
}

impl Target {
    pub fn new(reference: ResourceRef) -> Self { Self { reference, propagation: Propagation::Default } }

    pub fn with_propagation(reference: ResourceRef, propagation: Propagation) -> Self { Self { reference, propagation } }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TeardownOutcome {
    Deleted,
    Absent,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownEntry {
    pub reference: ResourceRef,
    #[serde(flatten)]
    pub outcome: TeardownOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TeardownReport {
    pub entries: Vec<TeardownEntry>,
}

impl TeardownReport {
    pub fn failures(&self) -> impl Iterator<Item = &TeardownEntry> {
        self.entries.iter().filter(|e| matches!(e.outcome, TeardownOutcome::Failed { .. }))
    }

    pub fn is_clean(&self) -> bool { self.failures().next().is_none() }

    pub fn count(&self, outcome: &TeardownOutcome) -> usize { self.entries.iter().filter(|e| &e.outcome == outcome).count() }
}

/// Issue one delete per target, in order, never stopping early.
///
/// Absent objects are not an error. Deletion is only requested; nothing waits
/// for objects to actually go away.
pub async fn teardown(store: &dyn ResourceStore, targets: &[Target]) -> TeardownReport {
    let mut report = TeardownReport { entries: Vec::with_capacity(targets.len()) };
    for t in targets {
        let outcome = match store.delete(&t.reference, t.propagation).await {
            Ok(()) => {
                info!(reference = %t.reference, "deleted");
                TeardownOutcome::Deleted
            }
            Err(StoreError::NotFound) => {
                debug!(reference = %t.reference, "already absent");
                TeardownOutcome::Absent
            }
            Err(e) => {
                warn!(reference = %t.reference, error = %e, "delete failed; continuing");
                counter!("teardown_failures_total", "kind" => t.reference.kind.kind()).increment(1);
                TeardownOutcome::Failed { message: e.to_string() }
            }
        };
        report.entries.push(TeardownEntry { reference: t.reference.clone(), outcome });
    }
    info!(
        deleted = report.count(&TeardownOutcome::Deleted),
        absent = report.count(&TeardownOutcome::Absent),
        failed = report.failures().count(),
        "teardown finished"
    );
    report
}
