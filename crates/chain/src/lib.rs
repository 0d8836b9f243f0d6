//! Supply-chain selection, validation, and template resolution context.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value as Json};
use weft_core::{Param, ResourceSpec, SupplyChain, Workload};
use weft_expr::RenderError;

/// Policy for a supply chain whose selector is empty. Matching nothing is the
/// default so a chain with a forgotten selector cannot bind every workload in
/// the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptySelectorPolicy {
    MatchNothing,
    MatchEverything,
}

impl Default for EmptySelectorPolicy {
    fn default() -> Self {
        EmptySelectorPolicy::MatchNothing
    }
}

/// A chain matches iff every selector key/value is present and equal in the
/// workload's labels.
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: &BTreeMap<String, String>,
    policy: EmptySelectorPolicy,
) -> bool {
    if selector.is_empty() {
        return policy == EmptySelectorPolicy::MatchEverything;
    }
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no supply chain matched")]
    NoMatch,
    #[error("multiple supply chains matched: {0:?}")]
    Multiple(Vec<String>),
}

/// Pick the single chain matching the workload's labels. Zero and multiple
/// matches are explicit outcomes, reported as conditions by the caller.
pub fn select_supply_chain<'a>(
    labels: &BTreeMap<String, String>,
    chains: &'a [SupplyChain],
    policy: EmptySelectorPolicy,
) -> Result<&'a SupplyChain, SelectError> {
    let matched: Vec<&SupplyChain> = chains
        .iter()
        .filter(|c| selector_matches(&c.spec.selector, labels, policy))
        .collect();
    match matched.as_slice() {
        [] => Err(SelectError::NoMatch),
        [one] => Ok(one),
        many => Err(SelectError::Multiple(many.iter().map(|c| c.metadata.name.clone()).collect())),
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChainValidationError {
    #[error("duplicate resource name {0:?}")]
    DuplicateName(String),
    #[error("resource {resource:?} references {input:?}, which is not an earlier resource")]
    ForwardReference { resource: String, input: String },
}

/// Resources form a strict total order: names unique, inputs only reference
/// strictly earlier resources.
pub fn validate_chain(chain: &SupplyChain) -> Result<(), ChainValidationError> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for res in &chain.spec.resources {
        for input in &res.inputs {
            if !seen.contains(input.as_str()) {
                return Err(ChainValidationError::ForwardReference {
                    resource: res.name.clone(),
                    input: input.clone(),
                });
            }
        }
        if !seen.insert(&res.name) {
            return Err(ChainValidationError::DuplicateName(res.name.clone()));
        }
    }
    Ok(())
}

/// Evaluation context for rendering one resource's template: the workload,
/// the merged parameter set, and every earlier resource's extracted output.
pub struct ResolutionContext {
    root: Json,
}

impl ResolutionContext {
    pub fn new(workload: &Workload, resource: &ResourceSpec, outputs: &BTreeMap<String, Json>) -> Self {
        let mut params = serde_json::Map::new();
        for Param { name, value } in &workload.spec.params {
            params.insert(name.clone(), value.clone());
        }
        // Resource-level overrides win over workload params.
        for Param { name, value } in &resource.params {
            params.insert(name.clone(), value.clone());
        }
        let outputs_obj: serde_json::Map<String, Json> =
            outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let workload_json = serde_json::to_value(workload).unwrap_or(Json::Null);
        let root = json!({
            "workload": workload_json,
            "params": Json::Object(params),
            "outputs": Json::Object(outputs_obj),
        });
        Self { root }
    }

    pub fn render(&self, skeleton: &Json) -> Result<Json, RenderError> {
        weft_expr::render(skeleton, &self.root)
    }

    #[doc(hidden)]
    pub fn root(&self) -> &Json {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{Meta, SupplyChainSpec, TemplateKind, TemplateRef, WorkloadSpec};

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn chain(name: &str, selector: &[(&str, &str)]) -> SupplyChain {
        SupplyChain {
            metadata: Meta { name: name.into(), ..Default::default() },
            spec: SupplyChainSpec { selector: labels(selector), resources: vec![] },
            status: Default::default(),
        }
    }

    fn resource(name: &str, inputs: &[&str]) -> ResourceSpec {
        ResourceSpec {
            name: name.into(),
            template_ref: TemplateRef { kind: TemplateKind::GenericTemplate, name: "t".into() },
            params: vec![],
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn matches_on_full_selector_subset() {
        let sel = labels(&[("name", "webapp")]);
        assert!(selector_matches(&sel, &labels(&[("name", "webapp"), ("extra", "y")]), Default::default()));
        assert!(!selector_matches(&sel, &labels(&[("name", "other")]), Default::default()));
        assert!(!selector_matches(&sel, &labels(&[]), Default::default()));
    }

    #[test]
    fn empty_selector_policy_is_explicit() {
        let sel = labels(&[]);
        let lbl = labels(&[("a", "b")]);
        assert!(!selector_matches(&sel, &lbl, EmptySelectorPolicy::MatchNothing));
        assert!(selector_matches(&sel, &lbl, EmptySelectorPolicy::MatchEverything));
    }

    #[test]
    fn selection_reports_zero_one_many() {
        let chains = vec![
            chain("a", &[("name", "webapp")]),
            chain("b", &[("tier", "db")]),
            chain("c", &[("name", "webapp")]),
        ];
        let policy = EmptySelectorPolicy::MatchNothing;
        assert_eq!(
            select_supply_chain(&labels(&[("zone", "x")]), &chains, policy).unwrap_err(),
            SelectError::NoMatch
        );
        assert_eq!(
            select_supply_chain(&labels(&[("tier", "db")]), &chains, policy).unwrap().metadata.name,
            "b"
        );
        match select_supply_chain(&labels(&[("name", "webapp")]), &chains, policy) {
            Err(SelectError::Multiple(names)) => assert_eq!(names, vec!["a".to_string(), "c".to_string()]),
            other => panic!("expected Multiple, got {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_forward_and_self_references() {
        let mut c = chain("c", &[("a", "b")]);
        c.spec.resources = vec![resource("one", &[]), resource("two", &["one"])];
        assert!(validate_chain(&c).is_ok());

        c.spec.resources = vec![resource("one", &["two"]), resource("two", &[])];
        assert!(matches!(validate_chain(&c), Err(ChainValidationError::ForwardReference { .. })));

        c.spec.resources = vec![resource("one", &["one"])];
        assert!(matches!(validate_chain(&c), Err(ChainValidationError::ForwardReference { .. })));

        c.spec.resources = vec![resource("one", &[]), resource("one", &[])];
        assert!(matches!(validate_chain(&c), Err(ChainValidationError::DuplicateName(_))));
    }

    #[test]
    fn resource_params_override_workload_params() {
        let workload = Workload {
            metadata: Meta { name: "w".into(), namespace: Some("ns".into()), ..Default::default() },
            spec: WorkloadSpec {
                params: vec![
                    Param { name: "foo".into(), value: json!("from-workload") },
                    Param { name: "keep".into(), value: json!("kept") },
                ],
            },
            status: Default::default(),
        };
        let mut res = resource("r", &[]);
        res.params = vec![Param { name: "foo".into(), value: json!("from-resource") }];
        let ctx = ResolutionContext::new(&workload, &res, &BTreeMap::new());
        let out = ctx.render(&json!({ "a": "$(params.foo)", "b": "$(params.keep)" })).unwrap();
        assert_eq!(out["a"], "from-resource");
        assert_eq!(out["b"], "kept");
    }

    #[test]
    fn earlier_outputs_are_addressable() {
        let workload = Workload {
            metadata: Meta { name: "w".into(), ..Default::default() },
            ..Default::default()
        };
        let mut outputs = BTreeMap::new();
        outputs.insert("source".to_string(), json!({ "url": "git://x", "revision": "abc" }));
        let ctx = ResolutionContext::new(&workload, &resource("r", &["source"]), &outputs);
        let out = ctx.render(&json!({ "src": "$(outputs.source.url)" })).unwrap();
        assert_eq!(out["src"], "git://x");
    }

    #[test]
    fn workload_fields_are_addressable() {
        let workload = Workload {
            metadata: Meta { name: "workload-bob".into(), ..Default::default() },
            ..Default::default()
        };
        let ctx = ResolutionContext::new(&workload, &resource("r", &[]), &BTreeMap::new());
        let out = ctx.render(&json!({ "owner": "$(workload.metadata.name)" })).unwrap();
        assert_eq!(out["owner"], "workload-bob");
    }
}
