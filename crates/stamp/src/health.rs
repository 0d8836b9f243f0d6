//! Health and output extraction from live stamped objects.
//!
//! Three outcomes, per template variant: the configured path resolves to a
//! condition-shaped value (adopted as the health signal), to a plain value
//! (the resource's output, implicitly healthy once present), or to nothing
//! (benign `MissingValueAtPath`).

use serde_json::{json, Value as Json};
use weft_core::{CondStatus, Condition, CycleError, TemplateSpec};

#[derive(Debug, Clone, PartialEq)]
pub enum Health {
    /// No explicit signal; presence of the output is the signal.
    Implicit,
    /// A condition read off the live object, adopted verbatim.
    Reported(Condition),
    /// The path had no value yet.
    Missing { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Value stored for downstream resources' evaluation context.
    pub output: Option<Json>,
    pub health: Health,
}

fn eval(live: &Json, path: &str) -> Result<Option<Json>, CycleError> {
    weft_expr::eval(live, path)
        .map(|v| v.cloned())
        .map_err(|e| CycleError::Internal(format!("extraction path: {e}")))
}

/// Parse a condition-shaped value: an object with a string `type` and a
/// `status` of True/False/Unknown.
fn as_condition(v: &Json) -> Option<Condition> {
    let type_ = v.get("type")?.as_str()?;
    let status = match v.get("status")?.as_str()? {
        "True" => CondStatus::True,
        "False" => CondStatus::False,
        "Unknown" => CondStatus::Unknown,
        _ => return None,
    };
    let mut c = Condition::new(type_, status, v.get("reason").and_then(|r| r.as_str()).unwrap_or(""));
    if let Some(msg) = v.get("message").and_then(|m| m.as_str()) {
        c = c.with_message(msg);
    }
    Some(c)
}

pub fn extract(spec: &TemplateSpec, live: &Json) -> Result<Extraction, CycleError> {
    let output: Option<Json> = match spec {
        TemplateSpec::Source(s) => {
            let url = eval(live, &s.url_path)?;
            let revision = eval(live, &s.revision_path)?;
            match (url, revision) {
                (Some(u), Some(r)) => Some(json!({ "url": u, "revision": r })),
                (None, _) => {
                    return Ok(Extraction { output: None, health: Health::Missing { path: s.url_path.clone() } })
                }
                (_, None) => {
                    return Ok(Extraction {
                        output: None,
                        health: Health::Missing { path: s.revision_path.clone() },
                    })
                }
            }
        }
        TemplateSpec::Image(s) => match eval(live, &s.image_path)? {
            Some(v) => Some(v),
            None => {
                return Ok(Extraction { output: None, health: Health::Missing { path: s.image_path.clone() } })
            }
        },
        TemplateSpec::Config(s) => match eval(live, &s.config_path)? {
            Some(v) => Some(v),
            None => {
                return Ok(Extraction { output: None, health: Health::Missing { path: s.config_path.clone() } })
            }
        },
        TemplateSpec::Generic(_) => None,
    };

    // Explicit health rule wins; otherwise a condition-shaped output doubles
    // as the health signal.
    let health = match spec.health_path() {
        Some(path) => match eval(live, path)? {
            Some(v) => as_condition(&v).map(Health::Reported).unwrap_or(Health::Implicit),
            None => Health::Missing { path: path.to_string() },
        },
        None => match output.as_ref().and_then(as_condition) {
            Some(c) => Health::Reported(c),
            None => Health::Implicit,
        },
    };

    Ok(Extraction { output, health })
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{ConfigTemplateSpec, GenericTemplateSpec, ImageTemplateSpec, SourceTemplateSpec};

    fn source_spec() -> TemplateSpec {
        TemplateSpec::Source(SourceTemplateSpec {
            template: json!({}),
            url_path: "status.artifact.url".into(),
            revision_path: "status.artifact.revision".into(),
            health_path: None,
        })
    }

    #[test]
    fn source_output_needs_both_paths() {
        let live = json!({ "status": { "artifact": { "url": "git://x", "revision": "abc" } } });
        let ex = extract(&source_spec(), &live).unwrap();
        assert_eq!(ex.health, Health::Implicit);
        let out = ex.output.unwrap();
        assert_eq!(out["url"], "git://x");
        assert_eq!(out["revision"], "abc");

        let partial = json!({ "status": { "artifact": { "url": "git://x" } } });
        let ex = extract(&source_spec(), &partial).unwrap();
        assert_eq!(ex.output, None);
        assert_eq!(ex.health, Health::Missing { path: "status.artifact.revision".into() });
    }

    #[test]
    fn image_path_yields_scalar_output() {
        let spec = TemplateSpec::Image(ImageTemplateSpec {
            template: json!({}),
            image_path: "status.latestImage".into(),
            health_path: None,
        });
        let live = json!({ "status": { "latestImage": "reg/app@sha256:1" } });
        let ex = extract(&spec, &live).unwrap();
        assert_eq!(ex.output, Some(json!("reg/app@sha256:1")));
        assert_eq!(ex.health, Health::Implicit);
    }

    #[test]
    fn condition_shaped_config_output_is_adopted_as_health() {
        let spec = TemplateSpec::Config(ConfigTemplateSpec {
            template: json!({}),
            config_path: "status.conditions[?(@.type==\"Ready\")]".into(),
            health_path: None,
        });
        let live = json!({
            "status": { "conditions": [
                { "type": "Ready", "status": "True", "reason": "LifeIsGood" }
            ]}
        });
        let ex = extract(&spec, &live).unwrap();
        match ex.health {
            Health::Reported(c) => {
                assert_eq!(c.status, CondStatus::True);
                assert_eq!(c.reason, "LifeIsGood");
            }
            other => panic!("expected Reported, got {other:?}"),
        }
        assert!(ex.output.is_some());
    }

    #[test]
    fn absent_path_is_benignly_missing() {
        let spec = TemplateSpec::Config(ConfigTemplateSpec {
            template: json!({}),
            config_path: "nonexistant.path".into(),
            health_path: None,
        });
        let ex = extract(&spec, &json!({ "status": {} })).unwrap();
        assert_eq!(ex.output, None);
        assert_eq!(ex.health, Health::Missing { path: "nonexistant.path".into() });
    }

    #[test]
    fn generic_templates_are_healthy_once_stamped() {
        let spec = TemplateSpec::Generic(GenericTemplateSpec { template: json!({}), health_path: None });
        let ex = extract(&spec, &json!({})).unwrap();
        assert_eq!(ex.output, None);
        assert_eq!(ex.health, Health::Implicit);
    }

    #[test]
    fn explicit_health_rule_wins_over_output_shape() {
        let spec = TemplateSpec::Generic(GenericTemplateSpec {
            template: json!({}),
            health_path: Some("status.conditions[?(@.type==\"Healthy\")]".into()),
        });
        let live = json!({
            "status": { "conditions": [ { "type": "Healthy", "status": "False", "reason": "CrashLoop" } ] }
        });
        let ex = extract(&spec, &live).unwrap();
        match ex.health {
            Health::Reported(c) => assert_eq!(c.status, CondStatus::False),
            other => panic!("expected Reported, got {other:?}"),
        }
    }
}
