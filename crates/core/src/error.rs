//! Error taxonomy for reconcile cycles and the store seam.
//!
//! Blocking errors escalate backoff and are logged; benign ones surface as
//! `Unknown` conditions and wait for the next watch event or poll.

use crate::{reasons, CondStatus, TemplateKind};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("deadline exceeded")]
    Timeout,
    #[error("api: {0}")]
    Api(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("no supply chain matches workload labels")]
    SupplyChainNotFound,
    #[error("workload labels match more than one supply chain: {names:?}")]
    MultipleMatches { names: Vec<String> },
    #[error("template {kind}/{name} not found")]
    TemplateNotFound { kind: TemplateKind, name: String },
    #[error("no value at path {path} for resource {resource}")]
    MissingValueAtPath { resource: String, path: String },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("internal: {0}")]
    Internal(String),
}

impl CycleError {
    /// Blocking means: log once, bump the failure counter, requeue with
    /// exponential delay. Benign states rely on watches instead.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, CycleError::MissingValueAtPath { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CycleError::SupplyChainNotFound => reasons::SUPPLY_CHAIN_NOT_FOUND,
            CycleError::MultipleMatches { .. } => reasons::MULTIPLE_MATCHES,
            CycleError::TemplateNotFound { .. } => reasons::TEMPLATE_NOT_FOUND,
            CycleError::MissingValueAtPath { .. } => reasons::MISSING_VALUE_AT_PATH,
            CycleError::Store(_) => reasons::STORE_FAILURE,
            CycleError::Internal(_) => reasons::INTERNAL_ERROR,
        }
    }

    /// Status carried by the condition that reports this error.
    pub fn condition_status(&self) -> CondStatus {
        match self {
            CycleError::SupplyChainNotFound
            | CycleError::MultipleMatches { .. }
            | CycleError::TemplateNotFound { .. } => CondStatus::False,
            CycleError::MissingValueAtPath { .. }
            | CycleError::Store(_)
            | CycleError::Internal(_) => CondStatus::Unknown,
        }
    }
}
