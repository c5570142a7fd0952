//! Nested pipeline execution engine.
//!
//! This crate implements the Cairn runner: the step scheduler and its
//! nested/fan-out dispatch, the run-wide resource ledger, the capability
//! registry with built-in capabilities, layered execution contexts,
//! checkpoint/resume, the condition language, and the built-in lint rules.

pub mod capabilities;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod definition;
pub mod events;
pub mod ledger;
pub mod loader;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod supervisor;
pub mod validation;

pub use capabilities::{EchoCapability, ReadFileCapability, ShellCapability, WriteFileCapability};
pub use checkpoint::{
    nested_run_id, CheckpointRecord, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore,
};
pub use condition::{evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use context::{ContextFrame, ContextSnapshot, ExecutionContext};
pub use definition::{
    BranchCall, CapabilityKind, FanOutCall, NestedCall, OnFailure, PipelineDefinition, PipelineSet,
    StepSpec,
};
pub use events::{EventEmitter, RunEvent};
pub use ledger::{Budgets, LedgerSnapshot, ResourceLedger};
pub use loader::{load_document, parse_document, DocumentFormat, PipelineDocument};
pub use registry::{default_registry, Capability, CapabilityInput, CapabilityRegistry};
pub use retry::{execute_with_retry, BackoffPolicy, RetryPolicy};
pub use scheduler::{CancelSignal, LevelStatus, StepScheduler};
pub use supervisor::{AbortReason, ExecutionSupervisor, RunOutcome, RunReport, SupervisorBuilder};
pub use validation::{validate, validate_or_raise, validate_with_registry, Diagnostic, LintRule, Severity};
