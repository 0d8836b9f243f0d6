//! Weft core types: workloads, supply chains, templates, conditions, errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod condition;
pub mod error;

pub use condition::{CondStatus, Condition};
pub use error::{CycleError, StoreError};

/// API group/version for all weft-owned kinds.
pub const API_VERSION: &str = "weft.dev/v1alpha1";

pub mod kinds {
    pub const WORKLOAD: &str = "Workload";
    pub const SUPPLY_CHAIN: &str = "SupplyChain";
    pub const SOURCE_TEMPLATE: &str = "SourceTemplate";
    pub const IMAGE_TEMPLATE: &str = "ImageTemplate";
    pub const CONFIG_TEMPLATE: &str = "ConfigTemplate";
    pub const GENERIC_TEMPLATE: &str = "GenericTemplate";
}

/// Condition types reported on workload and supply-chain status.
pub mod condition_types {
    pub const SUPPLY_CHAIN_READY: &str = "SupplyChainReady";
    pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
    pub const READY: &str = "Ready";
}

/// Condition reasons. The reason strings are part of the status contract.
pub mod reasons {
    pub const READY: &str = "Ready";
    pub const SUPPLY_CHAIN_NOT_FOUND: &str = "SupplyChainNotFound";
    pub const MULTIPLE_MATCHES: &str = "MultipleMatches";
    pub const TEMPLATE_NOT_FOUND: &str = "TemplateNotFound";
    pub const MISSING_VALUE_AT_PATH: &str = "MissingValueAtPath";
    pub const RESOURCE_SUBMISSION_COMPLETE: &str = "ResourceSubmissionComplete";
    pub const INVALID_RESOURCES: &str = "InvalidResources";
    pub const STORE_FAILURE: &str = "StoreFailure";
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Work-queue key for a workload: the unit of reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata subset the reconciler cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Named parameter carried by workloads and resource overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Json,
}

// ---- Workload ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

impl Workload {
    pub fn from_object(obj: &Json) -> serde_json::Result<Self> {
        serde_json::from_value(obj.clone())
    }

    pub fn key(&self) -> WorkloadKey {
        WorkloadKey::new(self.metadata.namespace.clone().unwrap_or_default(), self.metadata.name.clone())
    }
}

/// Per-resource entry in workload status: where the derived object went and
/// what was read back from it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamped_ref: Option<StampedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Json>,
}

/// Reference to a stamped (derived) object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StampedRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

// ---- SupplyChain ----

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChain {
    pub metadata: Meta,
    #[serde(default)]
    pub spec: SupplyChainSpec,
    #[serde(default)]
    pub status: SupplyChainStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplyChainStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SupplyChain {
    pub fn from_object(obj: &Json) -> serde_json::Result<Self> {
        serde_json::from_value(obj.clone())
    }
}

/// One step of a supply chain: which template to stamp and what feeds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub name: String,
    pub template_ref: TemplateRef,
    /// Resource-level parameter overrides; these win over workload params.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Param>,
    /// Names of strictly earlier resources whose outputs this one consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub kind: TemplateKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    SourceTemplate,
    ImageTemplate,
    ConfigTemplate,
    GenericTemplate,
}

impl TemplateKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TemplateKind::SourceTemplate => kinds::SOURCE_TEMPLATE,
            TemplateKind::ImageTemplate => kinds::IMAGE_TEMPLATE,
            TemplateKind::ConfigTemplate => kinds::CONFIG_TEMPLATE,
            TemplateKind::GenericTemplate => kinds::GENERIC_TEMPLATE,
        }
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

// ---- Templates ----

/// A template object: skeleton plus kind-specific extraction paths.
#[derive(Debug, Clone)]
pub struct Template {
    pub metadata: Meta,
    pub spec: TemplateSpec,
}

/// Closed set of template variants. Each knows which paths pull its output
/// back out of the live stamped object.
#[derive(Debug, Clone)]
pub enum TemplateSpec {
    Source(SourceTemplateSpec),
    Image(ImageTemplateSpec),
    Config(ConfigTemplateSpec),
    Generic(GenericTemplateSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceTemplateSpec {
    pub template: Json,
    pub url_path: String,
    pub revision_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTemplateSpec {
    pub template: Json,
    pub image_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTemplateSpec {
    pub template: Json,
    pub config_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericTemplateSpec {
    pub template: Json,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

impl TemplateSpec {
    pub fn kind(&self) -> TemplateKind {
        match self {
            TemplateSpec::Source(_) => TemplateKind::SourceTemplate,
            TemplateSpec::Image(_) => TemplateKind::ImageTemplate,
            TemplateSpec::Config(_) => TemplateKind::ConfigTemplate,
            TemplateSpec::Generic(_) => TemplateKind::GenericTemplate,
        }
    }

    pub fn skeleton(&self) -> &Json {
        match self {
            TemplateSpec::Source(s) => &s.template,
            TemplateSpec::Image(s) => &s.template,
            TemplateSpec::Config(s) => &s.template,
            TemplateSpec::Generic(s) => &s.template,
        }
    }

    pub fn health_path(&self) -> Option<&str> {
        match self {
            TemplateSpec::Source(s) => s.health_path.as_deref(),
            TemplateSpec::Image(s) => s.health_path.as_deref(),
            TemplateSpec::Config(s) => s.health_path.as_deref(),
            TemplateSpec::Generic(s) => s.health_path.as_deref(),
        }
    }
}

impl Template {
    /// Parse a raw store object into a typed template, dispatching on the
    /// envelope `kind`.
    pub fn from_object(obj: &Json) -> Result<Self, CycleError> {
        let kind = obj
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CycleError::Internal("template object missing kind".into()))?;
        let metadata: Meta = serde_json::from_value(obj.get("metadata").cloned().unwrap_or(Json::Null))
            .map_err(|e| CycleError::Internal(format!("template metadata: {e}")))?;
        let spec_raw = obj.get("spec").cloned().unwrap_or(Json::Null);
        let spec = match kind {
            kinds::SOURCE_TEMPLATE => TemplateSpec::Source(
                serde_json::from_value(spec_raw).map_err(|e| CycleError::Internal(format!("source template spec: {e}")))?,
            ),
            kinds::IMAGE_TEMPLATE => TemplateSpec::Image(
                serde_json::from_value(spec_raw).map_err(|e| CycleError::Internal(format!("image template spec: {e}")))?,
            ),
            kinds::CONFIG_TEMPLATE => TemplateSpec::Config(
                serde_json::from_value(spec_raw).map_err(|e| CycleError::Internal(format!("config template spec: {e}")))?,
            ),
            kinds::GENERIC_TEMPLATE => TemplateSpec::Generic(
                serde_json::from_value(spec_raw).map_err(|e| CycleError::Internal(format!("generic template spec: {e}")))?,
            ),
            other => return Err(CycleError::Internal(format!("unknown template kind: {other}"))),
        };
        Ok(Template { metadata, spec })
    }
}

/// Deterministic stamped-object name: a pure function of (workload, resource)
/// so re-stamping can never create duplicates.
pub fn stamped_name(workload: &str, resource: &str) -> String {
    format!("{workload}-{resource}")
}
