//! Pipeline validation: lint rules and diagnostics.
//!
//! Provides 9 built-in rules that check the structural and semantic
//! correctness of a [`PipelineSet`]. Call [`validate`] for advisory
//! diagnostics, [`validate_or_raise`] to fail on any `Error`-severity issue,
//! or [`validate_with_registry`] to also check capability registrations.

use std::collections::{HashSet, VecDeque};

use cairn_types::{CairnError, Result};

use crate::condition::parse_condition;
use crate::definition::{CapabilityKind, FanOutCall, NestedCall, PipelineDefinition, PipelineSet, StepSpec};
use crate::registry::CapabilityRegistry;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub pipeline: String,
    pub step: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.rule, self.message)
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic>;
}

fn step_diagnostic(
    rule: &dyn LintRule,
    severity: Severity,
    pipeline: &PipelineDefinition,
    step: &StepSpec,
    message: String,
    fix: impl Into<String>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        pipeline: pipeline.name.clone(),
        step: Some(step.name.clone()),
        fix: Some(fix.into()),
    }
}

fn is_valid_step_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NonEmptyPipelineRule;
impl LintRule for NonEmptyPipelineRule {
    fn name(&self) -> &str { "non_empty_pipeline" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        set.iter()
            .filter(|p| p.is_empty())
            .map(|p| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!("Pipeline '{}' has no steps", p.name),
                pipeline: p.name.clone(),
                step: None,
                fix: Some("Add at least one step or remove the pipeline".into()),
            })
            .collect()
    }
}

struct UniqueStepNamesRule;
impl LintRule for UniqueStepNamesRule {
    fn name(&self) -> &str { "unique_step_names" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            let mut seen = HashSet::new();
            for step in &pipeline.steps {
                if !seen.insert(step.name.as_str()) {
                    diags.push(step_diagnostic(
                        self,
                        Severity::Error,
                        pipeline,
                        step,
                        format!("Pipeline '{}' declares step '{}' more than once", pipeline.name, step.name),
                        format!("Rename one of the '{}' steps", step.name),
                    ));
                }
            }
        }
        diags
    }
}

struct StepNameFormatRule;
impl LintRule for StepNameFormatRule {
    fn name(&self) -> &str { "step_name_format" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for step in pipeline.steps.iter().filter(|s| !is_valid_step_name(&s.name)) {
                diags.push(step_diagnostic(
                    self,
                    Severity::Error,
                    pipeline,
                    step,
                    format!("Step name '{}' is not a valid identifier", step.name),
                    "Use letters, digits, '_' or '-', starting with a letter or '_'",
                ));
            }
        }
        diags
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str { "condition_syntax" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for step in &pipeline.steps {
                let Some(cond) = step.run_condition.as_deref() else {
                    continue;
                };
                if let Err(err) = parse_condition(cond) {
                    diags.push(step_diagnostic(
                        self,
                        Severity::Error,
                        pipeline,
                        step,
                        format!("Step '{}' has invalid condition '{cond}': {err}", step.name),
                        "Fix the condition expression syntax",
                    ));
                }
            }
        }
        diags
    }
}

struct NestedTargetExistsRule;
impl LintRule for NestedTargetExistsRule {
    fn name(&self) -> &str { "nested_target_exists" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for (step, target) in pipeline.nested_targets() {
                if !set.contains(&target) {
                    diags.push(step_diagnostic(
                        self,
                        Severity::Error,
                        pipeline,
                        step,
                        format!("Step '{}' calls unknown pipeline '{target}'", step.name),
                        format!("Load a pipeline named '{target}' or fix the reference"),
                    ));
                }
            }
        }
        diags
    }
}

struct NestedParamsRule;
impl LintRule for NestedParamsRule {
    fn name(&self) -> &str { "nested_params" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for step in &pipeline.steps {
                let parsed = match step.kind {
                    CapabilityKind::NestedPipeline => NestedCall::from_step(step).map(|_| ()),
                    CapabilityKind::FanOut => FanOutCall::from_step(step).map(|_| ()),
                    _ => continue,
                };
                if let Err(err) = parsed {
                    diags.push(step_diagnostic(
                        self,
                        Severity::Error,
                        pipeline,
                        step,
                        err.to_string(),
                        match step.kind {
                            CapabilityKind::FanOut => {
                                "Provide `branches: {name: {pipeline, inputs}}` and an optional `extract`"
                            }
                            _ => "Provide `pipeline`, optional `inputs` and optional `extract`",
                        },
                    ));
                }
            }
        }
        diags
    }
}

struct RetryPolicyRule;
impl LintRule for RetryPolicyRule {
    fn name(&self) -> &str { "retry_policy" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for step in &pipeline.steps {
                if matches!(&step.retry, Some(r) if r.max_attempts == 0) {
                    diags.push(step_diagnostic(
                        self,
                        Severity::Error,
                        pipeline,
                        step,
                        format!("Step '{}' has retry.max_attempts = 0", step.name),
                        "max_attempts counts the first attempt and must be at least 1",
                    ));
                }
            }
        }
        diags
    }
}

/// Warns about pipelines that can reach themselves through nested calls.
/// Such recursion is legal and bounded only by the depth budget.
struct SelfRecursionRule;
impl LintRule for SelfRecursionRule {
    fn name(&self) -> &str { "self_recursion" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            let mut visited = HashSet::new();
            let mut queue: VecDeque<String> = pipeline
                .nested_targets()
                .into_iter()
                .map(|(_, target)| target)
                .collect();

            while let Some(current) = queue.pop_front() {
                if current == pipeline.name {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Pipeline '{}' can invoke itself; recursion is bounded only by max_depth",
                            pipeline.name
                        ),
                        pipeline: pipeline.name.clone(),
                        step: None,
                        fix: Some("Guard the recursive step with a run_condition".into()),
                    });
                    break;
                }
                if !visited.insert(current.clone()) {
                    continue;
                }
                if let Some(next) = set.get(&current) {
                    queue.extend(next.nested_targets().into_iter().map(|(_, t)| t));
                }
            }
        }
        diags
    }
}

struct UnregisteredCapabilityRule<'a> {
    registry: &'a CapabilityRegistry,
}
impl LintRule for UnregisteredCapabilityRule<'_> {
    fn name(&self) -> &str { "unregistered_capability" }
    fn apply(&self, set: &PipelineSet) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for pipeline in set.iter() {
            for step in pipeline.steps.iter().filter(|s| !self.registry.has(s.kind)) {
                diags.push(step_diagnostic(
                    self,
                    Severity::Error,
                    pipeline,
                    step,
                    format!("Step '{}' uses capability '{}', which is not registered", step.name, step.kind),
                    format!("Register a '{}' capability before running", step.kind),
                ));
            }
        }
        diags
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn builtin_rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(NonEmptyPipelineRule),
        Box::new(UniqueStepNamesRule),
        Box::new(StepNameFormatRule),
        Box::new(ConditionSyntaxRule),
        Box::new(NestedTargetExistsRule),
        Box::new(NestedParamsRule),
        Box::new(RetryPolicyRule),
        Box::new(SelfRecursionRule),
    ]
}

fn run_rules(rules: &[Box<dyn LintRule + '_>], set: &PipelineSet) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for rule in rules {
        diagnostics.extend(rule.apply(set));
    }
    diagnostics
}

fn raise_on_errors(diagnostics: Vec<Diagnostic>) -> Result<Vec<Diagnostic>> {
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(CairnError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

/// Run all registry-independent lint rules and return every diagnostic.
pub fn validate(set: &PipelineSet) -> Vec<Diagnostic> {
    run_rules(&builtin_rules(), set)
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(set: &PipelineSet) -> Result<Vec<Diagnostic>> {
    raise_on_errors(validate(set))
}

/// Like [`validate_or_raise`], also requiring every non-structural step kind
/// to have a registered capability.
pub fn validate_with_registry(set: &PipelineSet, registry: &CapabilityRegistry) -> Result<Vec<Diagnostic>> {
    let mut rules: Vec<Box<dyn LintRule + '_>> = builtin_rules();
    rules.push(Box::new(UnregisteredCapabilityRule { registry }));
    raise_on_errors(run_rules(&rules, set))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
