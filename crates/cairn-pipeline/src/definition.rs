//! Pipeline definitions: ordered step lists, capability kinds, and failure policies.
//!
//! Definitions are immutable once loaded. A [`PipelineSet`] holds every pipeline
//! a run may reach through `nested_pipeline` and `fan_out` steps.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use cairn_types::{CairnError, Result, Variables};

use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// CapabilityKind
// ---------------------------------------------------------------------------

/// The closed set of step kinds. Unknown kinds fail at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Echo,
    Generate,
    Shell,
    ReadFile,
    WriteFile,
    NestedPipeline,
    FanOut,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 7] = [
        CapabilityKind::Echo,
        CapabilityKind::Generate,
        CapabilityKind::Shell,
        CapabilityKind::ReadFile,
        CapabilityKind::WriteFile,
        CapabilityKind::NestedPipeline,
        CapabilityKind::FanOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Echo => "echo",
            CapabilityKind::Generate => "generate",
            CapabilityKind::Shell => "shell",
            CapabilityKind::ReadFile => "read_file",
            CapabilityKind::WriteFile => "write_file",
            CapabilityKind::NestedPipeline => "nested_pipeline",
            CapabilityKind::FanOut => "fan_out",
        }
    }

    /// Kinds the scheduler runs itself instead of calling a capability.
    pub fn is_structural(&self) -> bool {
        matches!(self, CapabilityKind::NestedPipeline | CapabilityKind::FanOut)
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepSpec
// ---------------------------------------------------------------------------

/// What to do with a step whose final attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop this pipeline level and report the failure upward.
    #[default]
    Halt,
    /// Record the failure, log it as anomalous, and move on.
    Skip,
    /// Record the failure and move on quietly.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(alias = "capability")]
    pub kind: CapabilityKind,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, alias = "when", skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub on_failure: OnFailure,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: serde_json::Map::new(),
            run_condition: None,
            retry: None,
            on_failure: OnFailure::Halt,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.run_condition = Some(condition.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts.max(1)).unwrap_or(1)
    }

    /// Deserialize the parameter map into a typed parameter struct.
    pub fn params_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            CairnError::InvalidParameters {
                step: self.name.clone(),
                message: e.to_string(),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Structural step parameters
// ---------------------------------------------------------------------------

/// Parameters of a `nested_pipeline` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NestedCall {
    pub pipeline: String,
    #[serde(default)]
    pub inputs: Variables,
    #[serde(default)]
    pub extract: Option<String>,
}

impl NestedCall {
    pub fn from_step(step: &StepSpec) -> Result<Self> {
        step.params_as()
    }
}

/// One branch of a `fan_out` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchCall {
    pub pipeline: String,
    #[serde(default)]
    pub inputs: Variables,
}

/// Parameters of a `fan_out` step. Branch order is declaration order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanOutCall {
    pub branches: IndexMap<String, BranchCall>,
    #[serde(default)]
    pub extract: Option<String>,
}

impl FanOutCall {
    pub fn from_step(step: &StepSpec) -> Result<Self> {
        let call: FanOutCall = step.params_as()?;
        if call.branches.is_empty() {
            return Err(CairnError::InvalidParameters {
                step: step.name.clone(),
                message: "fan_out requires at least one branch".into(),
            });
        }
        Ok(call)
    }
}

// ---------------------------------------------------------------------------
// PipelineDefinition / PipelineSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Names of the pipelines this one invokes directly, with the invoking step.
    ///
    /// Steps whose parameters do not parse are ignored here; validation reports them.
    pub fn nested_targets(&self) -> Vec<(&StepSpec, String)> {
        let mut targets = Vec::new();
        for step in &self.steps {
            match step.kind {
                CapabilityKind::NestedPipeline => {
                    if let Ok(call) = NestedCall::from_step(step) {
                        targets.push((step, call.pipeline));
                    }
                }
                CapabilityKind::FanOut => {
                    if let Ok(call) = FanOutCall::from_step(step) {
                        for branch in call.branches.into_values() {
                            targets.push((step, branch.pipeline));
                        }
                    }
                }
                _ => {}
            }
        }
        targets
    }
}

/// Named collection of loaded pipelines, in load order.
#[derive(Debug, Clone, Default)]
pub struct PipelineSet {
    pipelines: IndexMap<String, Arc<PipelineDefinition>>,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate pipeline names.
    pub fn from_definitions(definitions: impl IntoIterator<Item = PipelineDefinition>) -> Result<Self> {
        let mut set = Self::new();
        for def in definitions {
            set.insert(def)?;
        }
        Ok(set)
    }

    pub fn insert(&mut self, definition: PipelineDefinition) -> Result<Arc<PipelineDefinition>> {
        if self.pipelines.contains_key(&definition.name) {
            return Err(CairnError::ValidationError(format!(
                "duplicate pipeline name '{}'",
                definition.name
            )));
        }
        let def = Arc::new(definition);
        self.pipelines.insert(def.name.clone(), def.clone());
        Ok(def)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<PipelineDefinition>> {
        self.pipelines.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    /// The first pipeline loaded; the conventional entry point.
    pub fn first(&self) -> Option<&Arc<PipelineDefinition>> {
        self.pipelines.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PipelineDefinition>> {
        self.pipelines.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// `root` and every pipeline it can reach through nested and fan-out
    /// calls, in load order. Names missing from the set are skipped.
    pub fn reachable_from(&self, root: &str) -> PipelineSet {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue = VecDeque::from([root.to_string()]);
        while let Some(name) = queue.pop_front() {
            let Some(definition) = self.pipelines.get(&name) else {
                continue;
            };
            if seen.insert(name) {
                queue.extend(definition.nested_targets().into_iter().map(|(_, target)| target));
            }
        }
        PipelineSet {
            pipelines: self
                .pipelines
                .iter()
                .filter(|(name, _)| seen.contains(name.as_str()))
                .map(|(name, definition)| (name.clone(), Arc::clone(definition)))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use serde_json::json;

    #[test]
    fn step_deserializes_with_defaults() {
        let step: StepSpec = serde_json::from_value(json!({
            "name": "a",
            "kind": "echo",
            "params": {"input": "x"}
        }))
        .unwrap();
        assert_eq!(step.kind, CapabilityKind::Echo);
        assert_eq!(step.on_failure, OnFailure::Halt);
        assert!(step.run_condition.is_none());
        assert_eq!(step.max_attempts(), 1);
        assert_eq!(step.param_str("input"), Some("x"));
    }

    #[test]
    fn step_accepts_aliases() {
        let step: StepSpec = serde_json::from_value(json!({
            "name": "a",
            "capability": "shell",
            "when": "vars.go",
            "on_failure": "continue",
            "retry": {"max_attempts": 3, "backoff": {"type": "fixed", "delay": "10ms"}}
        }))
        .unwrap();
        assert_eq!(step.kind, CapabilityKind::Shell);
        assert_eq!(step.run_condition.as_deref(), Some("vars.go"));
        assert_eq!(step.on_failure, OnFailure::Continue);
        assert_eq!(step.max_attempts(), 3);
        assert_eq!(
            step.retry.unwrap().backoff,
            BackoffPolicy::Fixed {
                delay: std::time::Duration::from_millis(10)
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = serde_json::from_value::<StepSpec>(json!({"name": "a", "kind": "teleport"}));
        assert!(err.is_err());
    }

    #[test]
    fn capability_kind_names_match_serde() {
        for kind in CapabilityKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, json!(kind.as_str()));
        }
        assert!(CapabilityKind::NestedPipeline.is_structural());
        assert!(CapabilityKind::FanOut.is_structural());
        assert!(!CapabilityKind::Echo.is_structural());
    }

    #[test]
    fn nested_call_parses_params() {
        let step = StepSpec::new("sub", CapabilityKind::NestedPipeline)
            .with_param("pipeline", "child")
            .with_param("inputs", json!({"topic": "rust"}))
            .with_param("extract", "summary.value");
        let call = NestedCall::from_step(&step).unwrap();
        assert_eq!(call.pipeline, "child");
        assert_eq!(call.inputs.get("topic"), Some(&json!("rust")));
        assert_eq!(call.extract.as_deref(), Some("summary.value"));
    }

    #[test]
    fn nested_call_missing_pipeline_is_invalid() {
        let step = StepSpec::new("sub", CapabilityKind::NestedPipeline);
        let err = NestedCall::from_step(&step).unwrap_err();
        assert!(matches!(err, CairnError::InvalidParameters { .. }));
        assert!(err.is_configuration());
    }

    #[test]
    fn fan_out_preserves_branch_order() {
        let step = StepSpec::new("fan", CapabilityKind::FanOut).with_param(
            "branches",
            json!({
                "zeta": {"pipeline": "p1"},
                "alpha": {"pipeline": "p2", "inputs": {"n": 1}}
            }),
        );
        let call = FanOutCall::from_step(&step).unwrap();
        let names: Vec<_> = call.branches.keys().cloned().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn fan_out_requires_branches() {
        let step =
            StepSpec::new("fan", CapabilityKind::FanOut).with_param("branches", json!({}));
        assert!(FanOutCall::from_step(&step).is_err());
    }

    #[test]
    fn nested_targets_lists_direct_calls() {
        let def = PipelineDefinition::new(
            "main",
            vec![
                StepSpec::new("a", CapabilityKind::Echo),
                StepSpec::new("b", CapabilityKind::NestedPipeline).with_param("pipeline", "child"),
                StepSpec::new("c", CapabilityKind::FanOut).with_param(
                    "branches",
                    json!({"x": {"pipeline": "p1"}, "y": {"pipeline": "p2"}}),
                ),
            ],
        );
        let targets: Vec<_> = def
            .nested_targets()
            .into_iter()
            .map(|(step, target)| (step.name.clone(), target))
            .collect();
        assert_eq!(
            targets,
            vec![
                ("b".to_string(), "child".to_string()),
                ("c".to_string(), "p1".to_string()),
                ("c".to_string(), "p2".to_string()),
            ]
        );
    }

    #[test]
    fn reachable_from_follows_nested_and_fan_out_calls() {
        let set = PipelineSet::from_definitions(vec![
            PipelineDefinition::new("unrelated", vec![StepSpec::new("g", CapabilityKind::Generate)]),
            PipelineDefinition::new(
                "main",
                vec![StepSpec::new("sub", CapabilityKind::NestedPipeline).with_param("pipeline", "child")],
            ),
            PipelineDefinition::new(
                "child",
                vec![
                    StepSpec::new("fan", CapabilityKind::FanOut)
                        .with_param("branches", json!({"x": {"pipeline": "leaf"}, "y": {"pipeline": "ghost"}})),
                    StepSpec::new("again", CapabilityKind::NestedPipeline).with_param("pipeline", "main"),
                ],
            ),
            PipelineDefinition::new("leaf", vec![]),
        ])
        .unwrap();

        let reachable = set.reachable_from("main");
        let names: Vec<_> = reachable.names().collect();
        assert_eq!(names, vec!["main", "child", "leaf"]);
        assert!(set.reachable_from("missing").is_empty());
    }

    #[test]
    fn pipeline_set_rejects_duplicates() {
        let err = PipelineSet::from_definitions(vec![
            PipelineDefinition::new("a", vec![]),
            PipelineDefinition::new("a", vec![]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate pipeline name 'a'"));
    }

    #[test]
    fn pipeline_set_keeps_load_order() {
        let set = PipelineSet::from_definitions(vec![
            PipelineDefinition::new("main", vec![]),
            PipelineDefinition::new("child", vec![]),
        ])
        .unwrap();
        assert_eq!(set.first().unwrap().name, "main");
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["main", "child"]);
        assert!(set.contains("child"));
        assert!(set.get("missing").is_none());
    }
}
