//! Built-in capabilities: `echo`, `shell`, `read_file`, `write_file`.

pub mod file;
pub mod shell;

pub use file::{ReadFileCapability, WriteFileCapability};
pub use shell::ShellCapability;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use cairn_types::{Outcome, Result};

use crate::context::ContextFrame;
use crate::definition::{CapabilityKind, StepSpec};
use crate::registry::{Capability, CapabilityInput};

// ---------------------------------------------------------------------------
// Placeholder substitution
// ---------------------------------------------------------------------------

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{\s*((?:steps|vars)(?:\.[A-Za-z0-9_-]+)+)\s*\}")
            .expect("placeholder pattern is a valid regex")
    })
}

/// Replace `${steps.*}` / `${vars.*}` placeholders in every string of `value`.
///
/// A string that is exactly one placeholder becomes the resolved JSON value
/// itself. Placeholders that do not resolve are left as written.
pub fn substitute(value: &serde_json::Value, frame: &ContextFrame) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => substitute_str(s, frame),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| substitute(v, frame)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, frame)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, frame: &ContextFrame) -> serde_json::Value {
    let pattern = placeholder_pattern();

    if let Some(caps) = pattern.captures(s) {
        if caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()) {
            if let Some(resolved) = frame.resolve(&caps[1]) {
                return resolved;
            }
        }
    }

    let replaced = pattern.replace_all(s, |caps: &regex::Captures<'_>| match frame.resolve(&caps[1]) {
        Some(serde_json::Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => caps[0].to_string(),
    });
    serde_json::Value::String(replaced.into_owned())
}

/// Fetch a required string parameter after placeholder substitution.
pub(crate) fn required_str(step: &StepSpec, input: &CapabilityInput, key: &str) -> std::result::Result<String, Outcome> {
    match step.param(key).map(|v| substitute(v, &input.context)) {
        Some(serde_json::Value::String(s)) => Ok(s),
        Some(other) => Err(Outcome::fail(format!(
            "parameter '{key}' must be a string, got {other}"
        ))),
        None => Err(Outcome::fail(format!("missing required parameter '{key}'"))),
    }
}

// ---------------------------------------------------------------------------
// EchoCapability
// ---------------------------------------------------------------------------

/// Returns `params.input` (or `null`) with placeholders substituted.
pub struct EchoCapability;

#[async_trait]
impl Capability for EchoCapability {
    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Echo
    }

    async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
        let value = step
            .param("input")
            .map(|v| substitute(v, &input.context))
            .unwrap_or(serde_json::Value::Null);
        tracing::debug!(step = %step.name, "Echo");
        Ok(Outcome::success(value))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::ledger::{Budgets, ResourceLedger};
    use cairn_types::Variables;
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    /// Capability input over a root context with the given variables and results.
    pub(crate) fn make_input(vars: Variables, results: Vec<(&str, Outcome)>) -> CapabilityInput {
        let ledger = Arc::new(ResourceLedger::new(Budgets::default()));
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", vars, ledger);
        for (name, outcome) in results {
            ctx.record(name, outcome).unwrap();
        }
        CapabilityInput {
            run_id: ctx.run_id(),
            pipeline: "main".into(),
            attempt: 1,
            context: ctx.freeze(),
        }
    }

    #[tokio::test]
    async fn echo_returns_input() {
        let step = StepSpec::new("stepA", CapabilityKind::Echo).with_param("input", "x");
        let outcome = EchoCapability
            .invoke(&step, &make_input(Variables::new(), vec![]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::success("x"));
    }

    #[tokio::test]
    async fn echo_without_input_is_null() {
        let step = StepSpec::new("stepA", CapabilityKind::Echo);
        let outcome = EchoCapability
            .invoke(&step, &make_input(Variables::new(), vec![]))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::success(serde_json::Value::Null));
    }

    #[tokio::test]
    async fn echo_substitutes_placeholders() {
        let mut vars = Variables::new();
        vars.insert("name".into(), json!("world"));
        let input = make_input(vars, vec![("count", Outcome::success(json!({"n": 3})))]);

        let step = StepSpec::new("greet", CapabilityKind::Echo)
            .with_param("input", "hello ${vars.name}, n=${steps.count.value.n}, ${vars.missing}");
        let outcome = EchoCapability.invoke(&step, &input).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::success("hello world, n=3, ${vars.missing}")
        );
    }

    #[test]
    fn whole_placeholder_keeps_json_type() {
        let input = make_input(
            Variables::new(),
            vec![("fetch", Outcome::success(json!({"items": [1, 2]})))],
        );
        let value = substitute(&json!({"list": "${steps.fetch.value.items}"}), &input.context);
        assert_eq!(value, json!({"list": [1, 2]}));
    }

    #[test]
    fn required_str_reports_missing_parameter() {
        let input = make_input(Variables::new(), vec![]);
        let step = StepSpec::new("s", CapabilityKind::Shell);
        let outcome = required_str(&step, &input, "command").unwrap_err();
        assert!(outcome.is_failed());
        assert!(!outcome.is_retryable_failure());
    }
}
