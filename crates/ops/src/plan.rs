//! Ordered provisioning plans and their sequential executor.

use std::collections::BTreeMap;
use std::fmt;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sfkit_apply::{ensure_with, wait_until_ready};
use sfkit_core::{DesiredResource, Readiness, ReconcileError, ReconciliationOutcome, ResourceRef, ResourceStore, WaitPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ProvisionError;

/// Objects seen by earlier steps of the running plan, by ref.
#[derive(Debug, Clone, Default)]
pub struct Observed {
    objects: BTreeMap<ResourceRef, Json>,
}

impl Observed {
    pub fn get(&self, reference: &ResourceRef) -> Option<&Json> { self.objects.get(reference) }

    /// Decoded `data[key]` of a secret observed earlier in the plan.
    pub fn secret_value(&self, reference: &ResourceRef, key: &str) -> anyhow::Result<String> {
        let secret = self.get(reference).ok_or_else(|| anyhow::anyhow!("{} was not observed before this step", reference))?;
        crate::keys::secret_value(secret, key)
    }

    fn record(&mut self, reference: ResourceRef, object: Json) { self.objects.insert(reference, object); }
}

pub type Builder = Box<dyn FnOnce(&Observed) -> anyhow::Result<DesiredResource> + Send>;

pub enum Step {
    Ensure { reference: ResourceRef, build: Builder },
    Wait { reference: ResourceRef, readiness: Readiness, policy: WaitPolicy },
}

impl Step {
    pub fn ensure(desired: DesiredResource) -> Self {
        let reference = desired.reference.clone();
        Step::Ensure { reference, build: Box::new(move |_| Ok(desired)) }
    }

    /// Ensure whose body is built only if the object is absent.
    pub fn ensure_with<F>(reference: ResourceRef, build: F) -> Self
    where
        F: FnOnce(&Observed) -> anyhow::Result<DesiredResource> + Send + 'static,
    {
        Step::Ensure { reference, build: Box::new(build) }
    }

    pub fn wait(reference: ResourceRef, readiness: Readiness, policy: WaitPolicy) -> Self {
        Step::Wait { reference, readiness, policy }
    }

    pub fn reference(&self) -> &ResourceRef {
        match self { Step::Ensure { reference, .. } | Step::Wait { reference, .. } => reference }
    }

    pub fn label(&self) -> String {
        match self {
            Step::Ensure { reference, .. } => format!("ensure {}", reference),
            Step::Wait { reference, readiness, .. } => format!("wait {} on {}", readiness.name(), reference),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.label()) }
}

/// One line of `plan` output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDescription {
    pub index: usize,
    pub action: String,
    pub reference: ResourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Default)]
pub struct ProvisioningPlan {
    pub name: String,
    steps: Vec<Step>,
}

impl ProvisioningPlan {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), steps: Vec::new() } }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Step] { &self.steps }

    pub fn len(&self) -> usize { self.steps.len() }

    pub fn is_empty(&self) -> bool { self.steps.is_empty() }

    /// Steps with 1-based indexes, without touching the store.
    pub fn describe(&self) -> Vec<StepDescription> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| match s {
                Step::Ensure { reference, .. } => StepDescription {
                    index: i + 1,
                    action: "ensure".into(),
                    reference: reference.clone(),
                    predicate: None,
                    poll_secs: None,
                    max_attempts: None,
                },
                Step::Wait { reference, readiness, policy } => StepDescription {
                    index: i + 1,
                    action: "wait".into(),
                    reference: reference.clone(),
                    predicate: Some(readiness.name()),
                    poll_secs: Some(policy.poll_interval.as_secs_f64()),
                    max_attempts: Some(policy.max_attempts),
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Created,
    AlreadyPresent,
    Ready { attempts: u32, elapsed_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub index: usize,
    pub label: String,
    pub reference: ResourceRef,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan: String,
    pub steps: Vec<StepReport>,
    /// Every object the run ensured or waited on, as last read.
    #[serde(skip)]
    pub observed: Observed,
}

impl PlanReport {
    pub fn created(&self) -> usize { self.steps.iter().filter(|s| s.outcome == StepOutcome::Created).count() }

    pub fn already_present(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome == StepOutcome::AlreadyPresent).count()
    }
}

/// Run `plan` top to bottom, stopping at the first fatal error.
///
/// Objects created before the failure stay in place; a rerun picks up from there.
pub async fn execute(
    store: &dyn ResourceStore,
    plan: ProvisioningPlan,
    cancel: &CancellationToken,
) -> Result<PlanReport, ProvisionError> {
    let name = plan.name.clone();
    let total = plan.steps.len();
    let mut observed = Observed::default();
    let mut report = PlanReport { plan: name.clone(), steps: Vec::with_capacity(total), observed: Observed::default() };
    info!(plan = %name, steps = total, "executing plan");

    for (i, step) in plan.steps.into_iter().enumerate() {
        let index = i + 1;
        let label = step.label();
        let fail = |source: ReconcileError| {
            warn!(plan = %name, index, label = %label, error = %source, "step failed; aborting plan");
            counter!("plan_runs_total", "plan" => name.clone(), "result" => "failed").increment(1);
            ProvisionError { index, label: label.clone(), source }
        };
        if cancel.is_cancelled() {
            return Err(fail(ReconcileError::Cancelled { reference: step.reference().clone() }));
        }
        info!(plan = %name, "[{}/{}] {}", index, total, label);
        let (reference, outcome) = match step {
            Step::Ensure { reference, build } => {
                let ensured = ensure_with(store, &reference, || build(&observed)).await.map_err(&fail)?;
                observed.record(reference.clone(), ensured.object);
                let outcome = match ensured.outcome {
                    ReconciliationOutcome::Created => StepOutcome::Created,
                    ReconciliationOutcome::AlreadyPresent => StepOutcome::AlreadyPresent,
                };
                (reference, outcome)
            }
            Step::Wait { reference, readiness, policy } => {
                let ready = wait_until_ready(store, &reference, &readiness, &policy, cancel).await.map_err(&fail)?;
                observed.record(reference.clone(), ready.object);
                (reference, StepOutcome::Ready { attempts: ready.attempts, elapsed_ms: ready.elapsed.as_millis() as u64 })
            }
        };
        report.steps.push(StepReport { index, label, reference, outcome });
    }
    report.observed = observed;

    counter!("plan_runs_total", "plan" => name.clone(), "result" => "ok").increment(1);
    info!(plan = %name, created = report.created(), present = report.already_present(), "plan complete");
    Ok(report)
}
