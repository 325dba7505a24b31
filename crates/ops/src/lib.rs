//! sfkit ops: provisioning plans for the managed applications, their executor
//! and best-effort teardown.

#![forbid(unsafe_code)]

use sfkit_core::ReconcileError;

pub mod gerrit;
pub mod keys;
pub mod manifests;
pub mod nodepool;
pub mod plan;
pub mod teardown;

pub use gerrit::{gerrit_plan, gerrit_teardown_targets, GerritConfig, HostAlias};
pub use nodepool::{
    deploy_nodepool, nodepool_plan, nodepool_teardown_targets, providers_plan, wipe_nodepool, NodepoolConfig,
    NodepoolDeployReport,
};
pub use plan::{execute, Observed, PlanReport, ProvisioningPlan, Step, StepDescription, StepOutcome, StepReport};
pub use teardown::{teardown, Target, TeardownEntry, TeardownOutcome, TeardownReport};

/// A plan step failed; steps after `index` (1-based) were not run.
#[derive(Debug, thiserror::Error)]
#[error("step {index} ({label}) failed: {source}")]
pub struct ProvisionError {
    pub index: usize,
    pub label: String,
    #[source]
    pub source: ReconcileError,
}
