//! Shared types, errors, and outcomes for the Cairn pipeline engine.
//!
//! This crate provides the foundational types used across the other Cairn crates:
//! - `CairnError`: unified error taxonomy
//! - `Outcome`: tagged result of executing one step
//! - `Budget`: the ledger ceilings a run can exhaust
//! - `Results` / `Variables`: insertion-ordered maps carried by execution contexts

use serde::{Deserialize, Serialize};

pub mod duration_serde;

/// Unified error type for all Cairn subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CairnError {
    // === Configuration Errors ===
    #[error("No capability registered for kind '{kind}' (step '{step}')")]
    UnknownCapability { kind: String, step: String },

    #[error("Duplicate step name '{step}' in pipeline '{pipeline}'")]
    DuplicateStep { pipeline: String, step: String },

    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("Invalid parameters for step '{step}': {message}")]
    InvalidParameters { step: String, message: String },

    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    #[error("Condition parse error: {0}")]
    ConditionParse(String),

    // === Runtime Errors ===
    #[error("Capability failed on step '{step}': {message}")]
    CapabilityFailure {
        step: String,
        message: String,
        retryable: bool,
    },

    #[error("Capability on step '{step}' timed out after {timeout_ms}ms")]
    CapabilityTimeout { step: String, timeout_ms: u64 },

    #[error("Budget exceeded: {which}")]
    BudgetExceeded { which: Budget },

    // === Checkpoint Errors ===
    #[error("Checkpoint I/O error for run {run_id}: {message}")]
    CheckpointIo { run_id: String, message: String },

    #[error("No checkpoint found for run {0}")]
    CheckpointNotFound(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Returns `true` if the error is transient and the step may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CairnError::CapabilityFailure {
                retryable: true,
                ..
            } | CairnError::CapabilityTimeout { .. }
        )
    }

    /// Returns `true` for configuration problems. These are never retried and
    /// abort the run as soon as they are discovered.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CairnError::UnknownCapability { .. }
                | CairnError::DuplicateStep { .. }
                | CairnError::UnknownPipeline(_)
                | CairnError::InvalidParameters { .. }
                | CairnError::ValidationError(_)
                | CairnError::ConditionParse(_)
        )
    }

    /// Returns `true` if the error must terminate the whole run rather than
    /// being folded into a step's `Outcome::Failed`.
    pub fn is_fatal(&self) -> bool {
        self.is_configuration() || matches!(self, CairnError::BudgetExceeded { .. })
    }

    /// The exhausted budget, if this is a budget error.
    pub fn budget(&self) -> Option<Budget> {
        match self {
            CairnError::BudgetExceeded { which } => Some(*which),
            _ => None,
        }
    }
}

/// A convenience alias for `Result<T, CairnError>`.
pub type Result<T> = std::result::Result<T, CairnError>;

// ---------------------------------------------------------------------------
// Budget: the ceilings enforced by the resource ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Budget {
    Steps,
    Depth,
    Duration,
    Memory,
}

impl Budget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Budget::Steps => "steps",
            Budget::Depth => "depth",
            Budget::Duration => "duration",
            Budget::Memory => "memory",
        }
    }
}

impl std::fmt::Display for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome: result of executing one step
// ---------------------------------------------------------------------------

/// Why a step failed. Purely descriptive; retry decisions use `retryable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Capability,
    Timeout,
    NestedPipeline,
    FanOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        value: serde_json::Value,
    },
    Skipped {
        reason: String,
    },
    Failed {
        kind: FailureKind,
        message: String,
        retryable: bool,
        /// Diagnostic payload, e.g. the partial results of a failed child pipeline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },
}

impl Outcome {
    /// Create a successful outcome carrying `value`.
    pub fn success(value: impl Into<serde_json::Value>) -> Self {
        Outcome::Success {
            value: value.into(),
        }
    }

    /// Create a skipped outcome.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    /// Create a non-retryable capability failure.
    pub fn fail(message: impl Into<String>) -> Self {
        Outcome::Failed {
            kind: FailureKind::Capability,
            message: message.into(),
            retryable: false,
            detail: None,
        }
    }

    /// Create a retryable capability failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Outcome::Failed {
            kind: FailureKind::Capability,
            message: message.into(),
            retryable: true,
            detail: None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }

    /// True only for `Failed { retryable: true, .. }`.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(self, Outcome::Failed { retryable: true, .. })
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Outcome::Success { value } => Some(value),
            _ => None,
        }
    }

    /// Lowercase status label used by the condition language.
    pub fn status_str(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Failed { .. } => "failed",
        }
    }

    /// Skip reason or failure message.
    pub fn message(&self) -> Option<&str> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::Skipped { reason } => Some(reason),
            Outcome::Failed { message, .. } => Some(message),
        }
    }

    /// Rough in-memory footprint used for the ledger's memory estimate.
    pub fn estimated_size(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }
}

impl From<CairnError> for Outcome {
    /// Fold a non-fatal error into a failed outcome, keeping its retry class.
    fn from(err: CairnError) -> Self {
        let kind = match err {
            CairnError::CapabilityTimeout { .. } => FailureKind::Timeout,
            _ => FailureKind::Capability,
        };
        let retryable = err.is_retryable();
        let message = match &err {
            CairnError::CapabilityFailure { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Outcome::Failed {
            kind,
            message,
            retryable,
            detail: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Ordered maps carried by execution contexts and checkpoints
// ---------------------------------------------------------------------------

/// Step name → outcome, in execution order.
pub type Results = indexmap::IndexMap<String, Outcome>;

/// Variable name → value, in binding order.
pub type Variables = indexmap::IndexMap<String, serde_json::Value>;

/// Render a results map as a JSON object of `{step: outcome}`.
pub fn results_to_json(results: &Results) -> serde_json::Value {
    serde_json::Value::Object(
        results
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect(),
    )
}
