//! The reconcile cycle: select, resolve, stamp, extract, report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, error};
use weft_chain::{select_supply_chain, validate_chain, EmptySelectorPolicy, ResolutionContext, SelectError};
use weft_core::{
    condition_types, kinds, reasons, CondStatus, Condition, CycleError, ResourceStatus, SupplyChain,
    SupplyChainStatus, TemplateRef, Workload, WorkloadKey, WorkloadStatus,
};
use weft_expr::RenderError;
use weft_stamp::{health, Health, Stamper, WatchRegistrar};
use weft_store::{ObjectRef, ObjectStore};

use crate::backoff::{BackoffConfig, BackoffScheduler};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilerConfig {
    pub backoff: BackoffConfig,
    pub empty_selector: EmptySelectorPolicy,
}

/// What the worker loop does with a finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub requeue_after: Option<Duration>,
}

/// Everything one evaluation produced, whether or not it completed.
#[derive(Default)]
struct Evaluation {
    components: Vec<Condition>,
    resources: Vec<ResourceStatus>,
    error: Option<CycleError>,
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    registrar: WatchRegistrar,
    backoff: BackoffScheduler,
    empty_selector: EmptySelectorPolicy,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, registrar: WatchRegistrar, cfg: ReconcilerConfig) -> Self {
        Self {
            store,
            registrar,
            backoff: BackoffScheduler::new(cfg.backoff),
            empty_selector: cfg.empty_selector,
        }
    }

    pub fn failures(&self, key: &WorkloadKey) -> u32 {
        self.backoff.failures(key)
    }

    /// One full cycle for a workload. Blocking errors are logged and escalate
    /// backoff; benign incompleteness resets it and waits for a watch event.
    pub async fn reconcile(&self, key: &WorkloadKey) -> Outcome {
        counter!("reconcile_cycles", 1u64);
        match self.run_cycle(key).await {
            Ok(()) => {
                self.backoff.record_stable(key);
                Outcome { requeue_after: None }
            }
            Err(e) if !e.is_blocking() => {
                self.backoff.record_stable(key);
                debug!(name = %key.name, namespace = %key.namespace, reason = e.reason(), "cycle incomplete, waiting for watch");
                Outcome { requeue_after: None }
            }
            Err(e) => {
                counter!("reconcile_errors", 1u64);
                let delay = self.backoff.record_failure(key);
                error!(name = %key.name, namespace = %key.namespace, error = %e, "Reconciler error");
                Outcome { requeue_after: Some(delay) }
            }
        }
    }

    async fn run_cycle(&self, key: &WorkloadKey) -> Result<(), CycleError> {
        let workload_ref = ObjectRef::weft(kinds::WORKLOAD, Some(&key.namespace), &key.name);
        let Some(raw) = self.store.get(&workload_ref).await? else {
            debug!(name = %key.name, namespace = %key.namespace, "workload gone, nothing to do");
            return Ok(());
        };
        let workload = Workload::from_object(&raw)
            .map_err(|e| CycleError::Internal(format!("workload decode: {e}")))?;

        let eval = self.evaluate(&workload).await;

        // Status is written every cycle, even when the cycle stopped early:
        // partial progress must never leave stale conditions behind.
        let now = Utc::now();
        let conditions =
            weft_status::finalize(&workload.status.conditions, eval.components, workload.metadata.generation, now);
        let status = WorkloadStatus {
            observed_generation: workload.metadata.generation,
            conditions,
            resources: eval.resources,
        };
        let status_json =
            serde_json::to_value(&status).map_err(|e| CycleError::Internal(format!("status encode: {e}")))?;
        self.store.update_status(&workload_ref, status_json).await?;

        match eval.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn evaluate(&self, workload: &Workload) -> Evaluation {
        let mut eval = Evaluation::default();

        let chain = match self.select_chain(workload).await {
            Ok(chain) => {
                eval.components.push(Condition::new(
                    condition_types::SUPPLY_CHAIN_READY,
                    CondStatus::True,
                    reasons::READY,
                ));
                chain
            }
            Err(e) => {
                eval.components.push(
                    Condition::new(condition_types::SUPPLY_CHAIN_READY, e.condition_status(), e.reason())
                        .with_message(e.to_string()),
                );
                // Keep the condition set complete: nothing was submitted,
                // and observers should not see the type vanish.
                eval.components.push(
                    Condition::new(condition_types::RESOURCES_SUBMITTED, CondStatus::Unknown, e.reason())
                        .with_message("waiting on supply chain selection"),
                );
                eval.error = Some(e);
                return eval;
            }
        };

        if let Err(ve) = validate_chain(&chain) {
            eval.components.push(
                Condition::new(condition_types::RESOURCES_SUBMITTED, CondStatus::False, reasons::INVALID_RESOURCES)
                    .with_message(ve.to_string()),
            );
            eval.error = Some(CycleError::Internal(format!("invalid supply chain {}: {ve}", chain.metadata.name)));
            return eval;
        }

        let stamper = Stamper::new(self.store.as_ref(), &self.registrar);
        let mut outputs: BTreeMap<String, Json> = BTreeMap::new();
        let mut submitted: Option<Condition> = None;

        for resource in &chain.spec.resources {
            let template = match self.fetch_template(&resource.template_ref).await {
                Ok(t) => t,
                Err(e) => {
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, e.condition_status(), e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
            };

            let ctx = ResolutionContext::new(workload, resource, &outputs);
            let rendered = match ctx.render(template.spec.skeleton()) {
                Ok(v) => v,
                Err(RenderError::MissingValue(path)) => {
                    let e = CycleError::MissingValueAtPath { resource: resource.name.clone(), path };
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, CondStatus::Unknown, e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
                Err(re) => {
                    let e = CycleError::Internal(format!("rendering {}: {re}", resource.name));
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, CondStatus::Unknown, e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
            };

            let outcome = match stamper.stamp(workload, &resource.name, rendered).await {
                Ok(o) => {
                    if !o.wrote {
                        counter!("stamp_writes_skipped", 1u64);
                    }
                    o
                }
                Err(e) => {
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, e.condition_status(), e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
            };

            let extraction = match health::extract(&template.spec, &outcome.object) {
                Ok(x) => x,
                Err(e) => {
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, e.condition_status(), e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
            };

            eval.resources.push(ResourceStatus {
                name: resource.name.clone(),
                stamped_ref: Some(outcome.reference),
                output: extraction.output.clone(),
            });

            match extraction.health {
                Health::Missing { path } => {
                    let e = CycleError::MissingValueAtPath { resource: resource.name.clone(), path };
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, CondStatus::Unknown, e.reason())
                            .with_message(e.to_string()),
                    );
                    eval.error = Some(e);
                    break;
                }
                Health::Reported(reported) if reported.status != CondStatus::True => {
                    // A stable degraded state, not an error: the reported
                    // condition is surfaced as-is and watches carry recovery.
                    submitted = Some(
                        Condition::new(condition_types::RESOURCES_SUBMITTED, reported.status, reported.reason)
                            .with_message(reported.message),
                    );
                    break;
                }
                Health::Reported(_) | Health::Implicit => {
                    if let Some(out) = extraction.output {
                        outputs.insert(resource.name.clone(), out);
                    }
                }
            }
        }

        eval.components.push(submitted.unwrap_or_else(|| {
            Condition::new(
                condition_types::RESOURCES_SUBMITTED,
                CondStatus::True,
                reasons::RESOURCE_SUBMISSION_COMPLETE,
            )
        }));
        eval
    }

    async fn select_chain(&self, workload: &Workload) -> Result<SupplyChain, CycleError> {
        let raw = self.store.list(weft_core::API_VERSION, kinds::SUPPLY_CHAIN).await?;
        let mut chains = Vec::with_capacity(raw.len());
        for obj in &raw {
            chains.push(
                SupplyChain::from_object(obj)
                    .map_err(|e| CycleError::Internal(format!("supply chain decode: {e}")))?,
            );
        }
        match select_supply_chain(&workload.metadata.labels, &chains, self.empty_selector) {
            Ok(chain) => Ok(chain.clone()),
            Err(SelectError::NoMatch) => Err(CycleError::SupplyChainNotFound),
            Err(SelectError::Multiple(names)) => Err(CycleError::MultipleMatches { names }),
        }
    }

    async fn fetch_template(&self, r: &TemplateRef) -> Result<weft_core::Template, CycleError> {
        let obj_ref = ObjectRef::weft(r.kind.kind_name(), None, &r.name);
        match self.store.get(&obj_ref).await? {
            Some(raw) => weft_core::Template::from_object(&raw),
            None => Err(CycleError::TemplateNotFound { kind: r.kind, name: r.name.clone() }),
        }
    }

    /// Supply chains carry their own Ready condition: the definition is valid
    /// and every referenced template exists.
    pub async fn reconcile_chain(&self, name: &str) -> Result<(), CycleError> {
        let chain_ref = ObjectRef::weft(kinds::SUPPLY_CHAIN, None, name);
        let Some(raw) = self.store.get(&chain_ref).await? else {
            return Ok(());
        };
        let chain = SupplyChain::from_object(&raw)
            .map_err(|e| CycleError::Internal(format!("supply chain decode: {e}")))?;

        let mut ready = Condition::new(condition_types::READY, CondStatus::True, reasons::READY);
        if let Err(ve) = validate_chain(&chain) {
            ready = Condition::new(condition_types::READY, CondStatus::False, reasons::INVALID_RESOURCES)
                .with_message(ve.to_string());
        } else {
            for resource in &chain.spec.resources {
                if let Err(e) = self.fetch_template(&resource.template_ref).await {
                    ready = Condition::new(condition_types::READY, e.condition_status(), e.reason())
                        .with_message(e.to_string());
                    break;
                }
            }
        }

        let now = Utc::now();
        let mut ready = vec![ready];
        for c in &mut ready {
            c.observed_generation = chain.metadata.generation;
        }
        let conditions = weft_status::merge_conditions(&chain.status.conditions, ready, now);
        let status =
            SupplyChainStatus { observed_generation: chain.metadata.generation, conditions };
        let status_json =
            serde_json::to_value(&status).map_err(|e| CycleError::Internal(format!("status encode: {e}")))?;
        self.store.update_status(&chain_ref, status_json).await?;
        Ok(())
    }
}
