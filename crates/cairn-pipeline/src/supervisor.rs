//! Execution supervisor: the single entry point for running and resuming pipelines.
//!
//! The supervisor creates the run's [`ResourceLedger`] and root
//! [`ExecutionContext`], drives the root level through a [`StepScheduler`], and
//! classifies how the run ended into a [`RunOutcome`].

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_types::{Budget, CairnError, Result, Results, Variables};

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::context::ExecutionContext;
use crate::definition::{PipelineDefinition, PipelineSet};
use crate::events::{EventEmitter, RunEvent};
use crate::ledger::{Budgets, LedgerSnapshot, ResourceLedger};
use crate::registry::{default_registry, CapabilityRegistry};
use crate::scheduler::{CancelSignal, LevelStatus, StepScheduler};
use crate::validation::validate_with_registry;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// A root-level step failed under `on_failure: halt`.
    StepFailed {
        step: String,
        message: String,
        retryable: bool,
    },
    /// Unregistered capability, duplicate step, unknown pipeline, bad parameters.
    Configuration { message: String },
    Cancelled,
    /// Any other fatal error.
    Error { message: String },
}

/// How a run ended. Budget exhaustion is always distinct from failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { results: Results },
    Aborted { reason: AbortReason },
    BudgetExceeded { which: Budget },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Aborted { .. } => "aborted",
            RunOutcome::BudgetExceeded { .. } => "budget_exceeded",
        }
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub outcome: RunOutcome,
    /// Root-level results recorded before the run ended, whatever the outcome.
    pub results: Results,
    pub ledger: LedgerSnapshot,
    /// True if a root checkpoint exists and every checkpoint write succeeded.
    pub resumable: bool,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SupervisorBuilder {
    registry: Option<CapabilityRegistry>,
    pipelines: Option<Arc<PipelineSet>>,
    store: Option<Arc<dyn CheckpointStore>>,
    events: Option<EventEmitter>,
}

impl SupervisorBuilder {
    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pipelines(mut self, pipelines: impl Into<Arc<PipelineSet>>) -> Self {
        self.pipelines = Some(pipelines.into());
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    /// Missing parts default to the built-in registry, an empty pipeline set,
    /// an in-memory checkpoint store, and a fresh event emitter.
    pub fn build(self) -> ExecutionSupervisor {
        ExecutionSupervisor {
            registry: self.registry.unwrap_or_else(default_registry),
            pipelines: self.pipelines.unwrap_or_default(),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryCheckpointStore::new())),
            events: self.events.unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionSupervisor
// ---------------------------------------------------------------------------

pub struct ExecutionSupervisor {
    registry: CapabilityRegistry,
    pipelines: Arc<PipelineSet>,
    store: Arc<dyn CheckpointStore>,
    events: EventEmitter,
}

impl ExecutionSupervisor {
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::default()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn pipelines(&self) -> &PipelineSet {
        &self.pipelines
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Run `pipeline` from the start with no variables.
    pub async fn run(&self, pipeline: &PipelineDefinition, budgets: Budgets) -> RunReport {
        self.run_with_variables(pipeline, budgets, Variables::new())
            .await
    }

    /// Run `pipeline` from the start. `variables` seed the root context.
    pub async fn run_with_variables(
        &self,
        pipeline: &PipelineDefinition,
        budgets: Budgets,
        variables: Variables,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        self.execute(run_id, pipeline, budgets, variables, false)
            .await
    }

    /// Continue an interrupted run from its root checkpoint.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunReport> {
        let record = self
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| CairnError::CheckpointNotFound(run_id.to_string()))?;
        if !record.is_root() {
            return Err(CairnError::ValidationError(format!(
                "run {run_id} is a nested level of run {}; resume the root run instead",
                record.parent_run_id.unwrap_or_default()
            )));
        }
        let pipeline = self
            .pipelines
            .get(&record.pipeline_name)
            .cloned()
            .ok_or_else(|| CairnError::UnknownPipeline(record.pipeline_name.clone()))?;
        let budgets = record.budgets.unwrap_or_default();

        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name,
            resume_after = record.last_completed_step_index,
            "Resuming run"
        );
        Ok(self
            .execute(run_id, &pipeline, budgets, Variables::new(), true)
            .await)
    }

    /// Delete a run's root checkpoint so it can no longer be resumed.
    pub async fn abandon(&self, run_id: Uuid) -> Result<()> {
        tracing::info!(run_id = %run_id, "Abandoning run");
        self.store.delete(run_id).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        pipeline: &PipelineDefinition,
        budgets: Budgets,
        variables: Variables,
        resumed: bool,
    ) -> RunReport {
        let started = Instant::now();
        let ledger = Arc::new(ResourceLedger::new(budgets));
        let mut ctx = ExecutionContext::root(run_id, pipeline.name.as_str(), variables, Arc::clone(&ledger));

        self.events.emit(RunEvent::RunStarted {
            run_id,
            pipeline_name: pipeline.name.clone(),
            resumed,
        });
        tracing::info!(
            run_id = %run_id,
            pipeline = %pipeline.name,
            steps = pipeline.len(),
            max_steps = budgets.max_steps,
            max_depth = budgets.max_depth,
            "Starting pipeline run"
        );

        let pipelines = self.pipelines_for(pipeline);
        let scheduler = StepScheduler::new(
            &self.registry,
            &pipelines,
            self.store.as_ref(),
            &self.events,
            Arc::clone(&ledger),
        );

        // Only what this run can reach has to be runnable.
        let reachable = pipelines.reachable_from(&pipeline.name);
        let result = match validate_with_registry(&reachable, &self.registry) {
            Ok(_) => {
                scheduler
                    .run_level(pipeline, &mut ctx, &CancelSignal::new())
                    .await
            }
            Err(e) => Err(e),
        };

        let outcome = classify(result, &ctx);
        if let RunOutcome::BudgetExceeded { which } = &outcome {
            self.events.emit(RunEvent::BudgetExceeded {
                run_id,
                budget: *which,
            });
        }

        let resumable = !outcome.is_completed()
            && !scheduler.is_degraded()
            && matches!(self.store.load(run_id).await, Ok(Some(_)));

        match &outcome {
            RunOutcome::Completed { results } => tracing::info!(
                run_id = %run_id,
                steps = results.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "Pipeline run completed"
            ),
            RunOutcome::Aborted { reason } => tracing::error!(
                run_id = %run_id,
                reason = ?reason,
                resumable,
                "Pipeline run aborted"
            ),
            RunOutcome::BudgetExceeded { which } => tracing::error!(
                run_id = %run_id,
                budget = %which,
                resumable,
                "Pipeline run exceeded its budget"
            ),
        }
        self.events.emit(RunEvent::RunFinished {
            run_id,
            pipeline_name: pipeline.name.clone(),
            status: outcome.as_str().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });

        RunReport {
            run_id,
            pipeline_name: pipeline.name.clone(),
            outcome,
            results: ctx.snapshot().results,
            ledger: ledger.snapshot(),
            resumable,
        }
    }

    /// The pipeline set a run resolves nested calls against. A root pipeline
    /// that is not part of the loaded set is added to a per-run copy.
    fn pipelines_for(&self, pipeline: &PipelineDefinition) -> Arc<PipelineSet> {
        if self.pipelines.contains(&pipeline.name) {
            return Arc::clone(&self.pipelines);
        }
        let mut with_root = (*self.pipelines).clone();
        // cannot collide: the name was just checked
        let _ = with_root.insert(pipeline.clone());
        Arc::new(with_root)
    }
}

/// Map the root level's result to the run's outcome.
fn classify(result: Result<LevelStatus>, ctx: &ExecutionContext) -> RunOutcome {
    match result {
        Ok(LevelStatus::Completed) => RunOutcome::Completed {
            results: ctx.results().clone(),
        },
        Ok(LevelStatus::Halted { step, outcome }) => RunOutcome::Aborted {
            reason: AbortReason::StepFailed {
                message: outcome.message().unwrap_or_default().to_string(),
                retryable: outcome.is_retryable_failure(),
                step,
            },
        },
        Ok(LevelStatus::Cancelled) => RunOutcome::Aborted {
            reason: AbortReason::Cancelled,
        },
        Err(e) => match e.budget() {
            Some(which) => RunOutcome::BudgetExceeded { which },
            None if e.is_configuration() => RunOutcome::Aborted {
                reason: AbortReason::Configuration {
                    message: e.to_string(),
                },
            },
            None => RunOutcome::Aborted {
                reason: AbortReason::Error {
                    message: e.to_string(),
                },
            },
        },
    }
}
