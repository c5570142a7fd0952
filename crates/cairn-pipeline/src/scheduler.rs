//! Step scheduler: runs the ordered steps of one pipeline level.
//!
//! Per step: evaluate the run condition, charge the ledger, dispatch with
//! retry, apply the `on_failure` policy, record the outcome, checkpoint.
//! `nested_pipeline` and `fan_out` steps recurse into [`StepScheduler::run_level`]
//! with a child context; every recursion holds a [`NestingGuard`](crate::ledger::NestingGuard)
//! so the ledger depth is released on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::Instrument;
use uuid::Uuid;

use cairn_types::{results_to_json, CairnError, FailureKind, Outcome, Result, Results, Variables};

use crate::capabilities::substitute;
use crate::checkpoint::{nested_run_id, CheckpointRecord, CheckpointStore};
use crate::condition::{evaluate_condition, parse_condition};
use crate::context::{lookup_path, ContextFrame, ExecutionContext};
use crate::definition::{
    CapabilityKind, FanOutCall, NestedCall, OnFailure, PipelineDefinition, PipelineSet, StepSpec,
};
use crate::events::{EventEmitter, RunEvent};
use crate::ledger::ResourceLedger;
use crate::registry::{CapabilityInput, CapabilityRegistry, Dispatch};
use crate::retry::execute_with_retry;

// ---------------------------------------------------------------------------
// LevelStatus / CancelSignal
// ---------------------------------------------------------------------------

/// How one pipeline level ended. Fatal conditions are returned as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub enum LevelStatus {
    /// Every step ran (or was skipped).
    Completed,
    /// A step failed under `on_failure: halt`.
    Halted { step: String, outcome: Outcome },
    /// A sibling branch failed; no further steps were dispatched.
    Cancelled,
}

impl LevelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LevelStatus::Completed => "completed",
            LevelStatus::Halted { .. } => "halted",
            LevelStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Default)]
struct CancelNode {
    flag: AtomicBool,
    parent: Option<Arc<CancelNode>>,
}

/// Cooperative cancellation shared by the levels of one fan-out group.
///
/// Cancelling a signal cancels every signal derived from it with [`child`](Self::child),
/// but never its parent.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    node: Arc<CancelNode>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(CancelNode {
                flag: AtomicBool::new(false),
                parent: Some(Arc::clone(&self.node)),
            }),
        }
    }

    pub fn cancel(&self) {
        self.node.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if current.flag.load(Ordering::Acquire) {
                return true;
            }
            node = current.parent.as_ref();
        }
        false
    }
}

// ---------------------------------------------------------------------------
// StepScheduler
// ---------------------------------------------------------------------------

/// Drives the levels of one run. Created by the supervisor, which owns the ledger.
pub struct StepScheduler<'a> {
    registry: &'a CapabilityRegistry,
    pipelines: &'a PipelineSet,
    store: &'a dyn CheckpointStore,
    events: &'a EventEmitter,
    ledger: Arc<ResourceLedger>,
    /// Set once any checkpoint write fails.
    degraded: AtomicBool,
}

impl<'a> StepScheduler<'a> {
    pub(crate) fn new(
        registry: &'a CapabilityRegistry,
        pipelines: &'a PipelineSet,
        store: &'a dyn CheckpointStore,
        events: &'a EventEmitter,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        Self {
            registry,
            pipelines,
            store,
            events,
            ledger,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// True if a checkpoint write failed during this run.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Run `pipeline` in `ctx`, resuming from the level's checkpoint if one exists.
    pub fn run_level<'s>(
        &'s self,
        pipeline: &'s PipelineDefinition,
        ctx: &'s mut ExecutionContext,
        cancel: &'s CancelSignal,
    ) -> BoxFuture<'s, Result<LevelStatus>> {
        let span = tracing::info_span!(
            "level",
            pipeline = %pipeline.name,
            depth = ctx.nesting_depth(),
            run_id = %ctx.run_id()
        );
        Box::pin(
            async move {
                let start_index = self.restore_level(pipeline, ctx).await;

                for (index, step) in pipeline.steps.iter().enumerate().skip(start_index) {
                    if cancel.is_cancelled() {
                        tracing::debug!(step = %step.name, "Level cancelled before step");
                        return Ok(LevelStatus::Cancelled);
                    }
                    self.ledger.check_limits()?;

                    let outcome = self.execute_step(index, step, ctx, cancel).await?;

                    if cancel.is_cancelled() {
                        tracing::debug!(step = %step.name, "Discarding result of cancelled step");
                        return Ok(LevelStatus::Cancelled);
                    }

                    if outcome.is_failed() {
                        match step.on_failure {
                            OnFailure::Halt => {
                                tracing::warn!(
                                    step = %step.name,
                                    error = outcome.message().unwrap_or_default(),
                                    "Step failed, halting pipeline level"
                                );
                                ctx.record(&step.name, outcome.clone())?;
                                return Ok(LevelStatus::Halted {
                                    step: step.name.clone(),
                                    outcome,
                                });
                            }
                            OnFailure::Skip => tracing::warn!(
                                step = %step.name,
                                error = outcome.message().unwrap_or_default(),
                                "Step failed, skipping"
                            ),
                            OnFailure::Continue => tracing::debug!(
                                step = %step.name,
                                error = outcome.message().unwrap_or_default(),
                                "Step failed, continuing"
                            ),
                        }
                        self.abandon_children(ctx.run_id(), index, step).await;
                    }

                    ctx.record(&step.name, outcome)?;
                    self.save_checkpoint(pipeline, ctx, index).await;
                    self.ledger.check_limits()?;
                }

                if let Err(e) = self.store.delete(ctx.run_id()).await {
                    self.mark_degraded(ctx.run_id(), &e);
                }
                tracing::debug!(steps = ctx.results().len(), "Pipeline level completed");
                Ok(LevelStatus::Completed)
            }
            .instrument(span),
        )
    }

    /// Restore `ctx` from the level's checkpoint; returns the first step to run.
    async fn restore_level(&self, pipeline: &PipelineDefinition, ctx: &mut ExecutionContext) -> usize {
        match self.store.load(ctx.run_id()).await {
            Ok(Some(record)) if record.pipeline_name == pipeline.name => {
                let next = record.last_completed_step_index + 1;
                tracing::info!(
                    resume_at = next,
                    restored = record.snapshot.results.len(),
                    "Resuming pipeline level from checkpoint"
                );
                ctx.restore(record.snapshot);
                next
            }
            Ok(Some(record)) => {
                tracing::warn!(
                    found = %record.pipeline_name,
                    "Checkpoint belongs to another pipeline, starting level fresh"
                );
                0
            }
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load checkpoint, starting level fresh");
                0
            }
        }
    }

    async fn execute_step(
        &self,
        index: usize,
        step: &StepSpec,
        ctx: &mut ExecutionContext,
        cancel: &CancelSignal,
    ) -> Result<Outcome> {
        let run_id = ctx.run_id();

        if let Some(condition) = step.run_condition.as_deref() {
            let expr = parse_condition(condition)?;
            let passed = evaluate_condition(&expr, &|key: &str| ctx.resolve(key));
            if !passed {
                tracing::debug!(step = %step.name, condition, "Condition false, skipping step");
                let reason = "condition false".to_string();
                self.events.emit(RunEvent::StepSkipped {
                    run_id,
                    step: step.name.clone(),
                    reason: reason.clone(),
                });
                return Ok(Outcome::skipped(reason));
            }
        }

        if ctx.result(&step.name).is_some() {
            return Err(CairnError::DuplicateStep {
                pipeline: ctx.pipeline_name().to_string(),
                step: step.name.clone(),
            });
        }

        self.ledger.try_enter_step()?;
        let dispatch = self.registry.resolve(step.kind, &step.name)?;
        let frame = ctx.freeze();
        let frame = &frame;
        let started = Instant::now();

        let attempted = execute_with_retry(
            move |attempt| self.dispatch_once(dispatch, index, step, frame, attempt, cancel),
            step.retry.as_ref(),
            &step.name,
            |attempt, delay, _| {
                self.events.emit(RunEvent::StepRetrying {
                    run_id,
                    step: step.name.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                })
            },
        )
        .await?;

        match &attempted.outcome {
            Outcome::Failed {
                message, retryable, ..
            } => self.events.emit(RunEvent::StepFailed {
                run_id,
                step: step.name.clone(),
                message: message.clone(),
                retryable: *retryable,
                attempts: attempted.attempts,
            }),
            _ => {
                tracing::info!(step = %step.name, attempts = attempted.attempts, "Step succeeded");
                self.events.emit(RunEvent::StepSucceeded {
                    run_id,
                    step: step.name.clone(),
                    attempts: attempted.attempts,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
        Ok(attempted.outcome)
    }

    /// One attempt of a step. Non-fatal capability errors become failed outcomes.
    async fn dispatch_once(
        &self,
        dispatch: Dispatch<'_>,
        index: usize,
        step: &StepSpec,
        frame: &Arc<ContextFrame>,
        attempt: u32,
        cancel: &CancelSignal,
    ) -> Result<Outcome> {
        if attempt > 1 {
            self.ledger.check_limits()?;
            if cancel.is_cancelled() {
                return Ok(Outcome::fail("cancelled"));
            }
        }
        self.events.emit(RunEvent::StepStarted {
            run_id: frame.run_id(),
            step: step.name.clone(),
            kind: step.kind.to_string(),
            attempt,
        });

        match dispatch {
            Dispatch::External(_) => {
                let input = CapabilityInput {
                    run_id: frame.run_id(),
                    pipeline: frame.pipeline_name().to_string(),
                    attempt,
                    context: Arc::clone(frame),
                };
                match self.registry.invoke(step, &input).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => Ok(e.into()),
                }
            }
            Dispatch::NestedPipeline => self.run_nested(index, step, frame, attempt, cancel).await,
            Dispatch::FanOut => self.run_fan_out(index, step, frame, attempt, cancel).await,
        }
    }

    // -----------------------------------------------------------------------
    // Nested levels
    // -----------------------------------------------------------------------

    async fn run_nested(
        &self,
        index: usize,
        step: &StepSpec,
        frame: &Arc<ContextFrame>,
        attempt: u32,
        cancel: &CancelSignal,
    ) -> Result<Outcome> {
        let call = NestedCall::from_step(step)?;
        let definition = self.lookup(&call.pipeline)?;
        let child_id = nested_run_id(frame.run_id(), &index.to_string());
        if attempt > 1 {
            self.abandon(child_id).await;
        }

        let inputs = substitute_inputs(&call.inputs, frame);
        let (status, results) = self
            .run_child(frame, child_id, &definition, inputs, cancel)
            .await?;

        Ok(match status {
            LevelStatus::Completed => match extract(&results, call.extract.as_deref()) {
                Ok(value) => Outcome::success(value),
                Err(message) => Outcome::fail(message),
            },
            LevelStatus::Halted {
                step: inner,
                outcome,
            } => Outcome::Failed {
                kind: FailureKind::NestedPipeline,
                message: format!(
                    "pipeline '{}' halted at step '{inner}': {}",
                    definition.name,
                    outcome.message().unwrap_or_default()
                ),
                retryable: outcome.is_retryable_failure(),
                detail: Some(results_to_json(&results)),
            },
            LevelStatus::Cancelled => Outcome::fail(format!("pipeline '{}' cancelled", definition.name)),
        })
    }

    async fn run_fan_out(
        &self,
        index: usize,
        step: &StepSpec,
        frame: &Arc<ContextFrame>,
        attempt: u32,
        cancel: &CancelSignal,
    ) -> Result<Outcome> {
        let call = FanOutCall::from_step(step)?;
        let mut branches = Vec::with_capacity(call.branches.len());
        for (name, branch) in &call.branches {
            let definition = self.lookup(&branch.pipeline)?;
            let run_id = nested_run_id(frame.run_id(), &format!("{index}/{name}"));
            branches.push((name.as_str(), run_id, definition, substitute_inputs(&branch.inputs, frame)));
        }

        tracing::info!(step = %step.name, branches = branches.len(), "Fan-out");
        let group = cancel.child();
        let group = &group;

        let joined = futures::future::join_all(branches.into_iter().map(
            |(name, run_id, definition, inputs)| async move {
                if attempt > 1 {
                    self.abandon(run_id).await;
                }
                let result = self.run_child(frame, run_id, &definition, inputs, group).await;
                if !matches!(result, Ok((LevelStatus::Completed, _))) {
                    group.cancel();
                }
                (name, result)
            },
        ))
        .await;

        // Fatal errors win over ordinary branch failures, and an exhausted
        // budget wins over whichever fatal error a sibling hit first.
        let mut finished = Vec::with_capacity(joined.len());
        let mut fatal = None;
        for (name, result) in joined {
            match result {
                Ok(done) => finished.push((name, done)),
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }
        if let Some(e) = fatal {
            return Err(match self.ledger.exceeded_budget() {
                Some(which) => CairnError::BudgetExceeded { which },
                None => e,
            });
        }

        let mut values = serde_json::Map::new();
        let mut failures = serde_json::Map::new();
        let mut first_failure: Option<String> = None;
        let mut all_retryable = true;

        for (name, (status, results)) in finished {
            match status {
                LevelStatus::Completed => match extract(&results, call.extract.as_deref()) {
                    Ok(value) => {
                        values.insert(name.to_string(), value);
                    }
                    Err(message) => {
                        all_retryable = false;
                        first_failure.get_or_insert_with(|| format!("branch '{name}': {message}"));
                        failures.insert(
                            name.to_string(),
                            serde_json::json!({"status": "failed", "message": message}),
                        );
                    }
                },
                LevelStatus::Halted {
                    step: inner,
                    outcome,
                } => {
                    all_retryable &= outcome.is_retryable_failure();
                    let message = outcome.message().unwrap_or_default().to_string();
                    first_failure.get_or_insert_with(|| {
                        format!("branch '{name}' halted at step '{inner}': {message}")
                    });
                    failures.insert(
                        name.to_string(),
                        serde_json::json!({
                            "status": "halted",
                            "step": inner,
                            "message": message,
                            "results": results_to_json(&results),
                        }),
                    );
                }
                LevelStatus::Cancelled => {
                    failures.insert(
                        name.to_string(),
                        serde_json::json!({"status": "cancelled", "results": results_to_json(&results)}),
                    );
                }
            }
        }

        match first_failure {
            None if failures.is_empty() => Ok(Outcome::success(serde_json::Value::Object(values))),
            first => Ok(Outcome::Failed {
                kind: FailureKind::FanOut,
                message: first.unwrap_or_else(|| "fan-out cancelled".to_string()),
                retryable: all_retryable,
                detail: Some(serde_json::json!({
                    "completed": values,
                    "failed": failures,
                })),
            }),
        }
    }

    /// Enter one nesting level, run `definition` in a fresh child context, exit.
    async fn run_child(
        &self,
        parent: &Arc<ContextFrame>,
        run_id: Uuid,
        definition: &PipelineDefinition,
        inputs: Variables,
        cancel: &CancelSignal,
    ) -> Result<(LevelStatus, Results)> {
        let guard = self
            .ledger
            .enter_nesting_at(parent.nesting_depth() as u64 + 1)?;
        let mut child = ExecutionContext::child(
            parent,
            run_id,
            definition.name.as_str(),
            inputs,
            Arc::clone(&self.ledger),
        );
        self.events.emit(RunEvent::NestingEntered {
            parent_run_id: parent.run_id(),
            run_id,
            pipeline_name: definition.name.clone(),
            depth: child.nesting_depth(),
        });

        let status = self.run_level(definition, &mut child, cancel).await;
        drop(guard);

        self.events.emit(RunEvent::NestingExited {
            run_id,
            pipeline_name: definition.name.clone(),
            status: match &status {
                Ok(s) => s.as_str().to_string(),
                Err(_) => "error".to_string(),
            },
        });
        let status = status?;
        Ok((status, child.take_results()))
    }

    fn lookup(&self, name: &str) -> Result<Arc<PipelineDefinition>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| CairnError::UnknownPipeline(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Checkpointing
    // -----------------------------------------------------------------------

    async fn save_checkpoint(&self, pipeline: &PipelineDefinition, ctx: &ExecutionContext, index: usize) {
        let record = CheckpointRecord {
            run_id: ctx.run_id(),
            parent_run_id: ctx.parent_run_id(),
            pipeline_name: pipeline.name.clone(),
            nesting_depth: ctx.nesting_depth(),
            last_completed_step_index: index,
            snapshot: ctx.snapshot(),
            budgets: ctx
                .parent_run_id()
                .is_none()
                .then(|| *self.ledger.budgets()),
            saved_at: chrono::Utc::now(),
        };
        match self.store.save(&record).await {
            Ok(()) => self.events.emit(RunEvent::CheckpointSaved {
                run_id: record.run_id,
                step_index: index,
            }),
            Err(e) => self.mark_degraded(record.run_id, &e),
        }
    }

    /// Drop the checkpoints of the levels a structural step started.
    async fn abandon_children(&self, run_id: Uuid, index: usize, step: &StepSpec) {
        let ids: Vec<Uuid> = match step.kind {
            CapabilityKind::NestedPipeline => {
                vec![nested_run_id(run_id, &index.to_string())]
            }
            CapabilityKind::FanOut => match FanOutCall::from_step(step) {
                Ok(call) => call
                    .branches
                    .keys()
                    .map(|name| nested_run_id(run_id, &format!("{index}/{name}")))
                    .collect(),
                Err(_) => Vec::new(),
            },
            _ => Vec::new(),
        };
        for id in ids {
            self.abandon(id).await;
        }
    }

    async fn abandon(&self, run_id: Uuid) {
        if let Err(e) = self.store.delete(run_id).await {
            self.mark_degraded(run_id, &e);
        }
    }

    fn mark_degraded(&self, run_id: Uuid, err: &CairnError) {
        tracing::warn!(run_id = %run_id, error = %err, "Checkpoint write failed, run is no longer resumable");
        self.degraded.store(true, Ordering::Release);
        self.events.emit(RunEvent::CheckpointFailed {
            run_id,
            error: err.to_string(),
        });
    }
}

fn substitute_inputs(inputs: &Variables, frame: &ContextFrame) -> Variables {
    inputs
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, frame)))
        .collect()
}

/// The whole child result set, or the value at a dotted path inside it
/// (`<step>.value.<field>...`).
fn extract(results: &Results, path: Option<&str>) -> std::result::Result<serde_json::Value, String> {
    let all = results_to_json(results);
    match path {
        None => Ok(all),
        Some(path) => {
            let segments: Vec<&str> = path.split('.').collect();
            lookup_path(&all, &segments)
                .cloned()
                .ok_or_else(|| format!("extract path '{path}' not found in child results"))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
