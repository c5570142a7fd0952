//! Per-level execution context: step results, variables, and a read-only link
//! to the enclosing level.
//!
//! Each nesting level owns exactly one [`ExecutionContext`]. The results and
//! variables maps are copy-on-write (`Arc` + `make_mut`), so freezing a context
//! into a [`ContextFrame`] for a capability call or a child level is cheap.
//! A child holds only a `Weak` reference to its parent's frame; the parent
//! scheduler keeps that frame alive while the child runs.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_types::{CairnError, Outcome, Result, Results, Variables};

use crate::ledger::ResourceLedger;

/// Serializable results + variables of one level, as stored in checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub results: Results,
    pub variables: Variables,
}

// ---------------------------------------------------------------------------
// Key resolution
// ---------------------------------------------------------------------------

/// Walk a dotted path into a JSON value.
pub fn lookup_path<'v>(value: &'v serde_json::Value, path: &[&str]) -> Option<&'v serde_json::Value> {
    path.iter().try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(*segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve `steps.<name>[.field...]` or `vars.<name>[.path...]` against one level.
///
/// For steps, the first field is one of `status`, `value`, `message`, or
/// `reason`; anything after `value` navigates into the success value. A bare
/// `steps.<name>` yields the whole outcome.
fn resolve_local(results: &Results, variables: &Variables, key: &str) -> Option<serde_json::Value> {
    let segments: Vec<&str> = key.split('.').collect();
    match segments.as_slice() {
        ["vars", name, rest @ ..] => {
            variables.get(*name).and_then(|v| lookup_path(v, rest)).cloned()
        }
        ["steps", name] => results
            .get(*name)
            .and_then(|o| serde_json::to_value(o).ok()),
        ["steps", name, "status"] => results
            .get(*name)
            .map(|o| serde_json::Value::String(o.status_str().to_string())),
        ["steps", name, "value", rest @ ..] => results
            .get(*name)
            .and_then(Outcome::value)
            .and_then(|v| lookup_path(v, rest))
            .cloned(),
        ["steps", name, "message" | "reason"] => results
            .get(*name)
            .and_then(Outcome::message)
            .map(|m| serde_json::Value::String(m.to_string())),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ContextFrame: frozen, shareable view of one level
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ContextFrame {
    run_id: Uuid,
    pipeline_name: String,
    nesting_depth: usize,
    results: Arc<Results>,
    variables: Arc<Variables>,
    parent: Option<Weak<ContextFrame>>,
}

impl ContextFrame {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn parent(&self) -> Option<Arc<ContextFrame>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Resolve a key here, then in each ancestor that is still alive.
    pub fn resolve(&self, key: &str) -> Option<serde_json::Value> {
        resolve_local(&self.results, &self.variables, key).or_else(|| {
            let mut ancestor = self.parent();
            while let Some(frame) = ancestor {
                if let Some(found) = resolve_local(&frame.results, &frame.variables, key) {
                    return Some(found);
                }
                ancestor = frame.parent();
            }
            None
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext: the mutable state of one level
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExecutionContext {
    run_id: Uuid,
    pipeline_name: String,
    nesting_depth: usize,
    parent: Option<Weak<ContextFrame>>,
    parent_run_id: Option<Uuid>,
    results: Arc<Results>,
    variables: Arc<Variables>,
    ledger: Arc<ResourceLedger>,
    /// Bytes this context has added to the ledger's memory estimate.
    accounted_bytes: u64,
}

impl ExecutionContext {
    /// Context for the root level of a run.
    pub(crate) fn root(
        run_id: Uuid,
        pipeline_name: impl Into<String>,
        variables: Variables,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        let mut ctx = Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            nesting_depth: 0,
            parent: None,
            parent_run_id: None,
            results: Arc::new(Results::new()),
            variables: Arc::new(variables),
            ledger,
            accounted_bytes: 0,
        };
        ctx.account_variables();
        ctx
    }

    /// Context for a nested level, one deeper than `parent`, with empty results.
    pub(crate) fn child(
        parent: &Arc<ContextFrame>,
        run_id: Uuid,
        pipeline_name: impl Into<String>,
        variables: Variables,
        ledger: Arc<ResourceLedger>,
    ) -> Self {
        let mut ctx = Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            nesting_depth: parent.nesting_depth + 1,
            parent: Some(Arc::downgrade(parent)),
            parent_run_id: Some(parent.run_id),
            results: Arc::new(Results::new()),
            variables: Arc::new(variables),
            ledger,
            accounted_bytes: 0,
        };
        ctx.account_variables();
        ctx
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    pub fn parent_run_id(&self) -> Option<Uuid> {
        self.parent_run_id
    }

    pub fn results(&self) -> &Results {
        &self.results
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn result(&self, step: &str) -> Option<&Outcome> {
        self.results.get(step)
    }

    /// Record a step's outcome. A step name may be recorded once per context.
    pub fn record(&mut self, step: &str, outcome: Outcome) -> Result<()> {
        if self.results.contains_key(step) {
            return Err(CairnError::DuplicateStep {
                pipeline: self.pipeline_name.clone(),
                step: step.to_string(),
            });
        }
        self.account(outcome.estimated_size());
        Arc::make_mut(&mut self.results).insert(step.to_string(), outcome);
        Ok(())
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.account(value.to_string().len() as u64);
        Arc::make_mut(&mut self.variables).insert(name.into(), value);
    }

    /// Replace results and variables with a checkpointed snapshot, verbatim.
    pub fn restore(&mut self, snapshot: ContextSnapshot) {
        self.release();
        self.results = Arc::new(snapshot.results);
        self.variables = Arc::new(snapshot.variables);
        let results_bytes: u64 = self.results.values().map(Outcome::estimated_size).sum();
        self.account(results_bytes);
        self.account_variables();
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            results: (*self.results).clone(),
            variables: (*self.variables).clone(),
        }
    }

    /// Move the results out, leaving this context empty.
    pub fn take_results(&mut self) -> Results {
        Arc::unwrap_or_clone(std::mem::take(&mut self.results))
    }

    /// Freeze the current state into a shareable frame linked to this level's parent.
    pub fn freeze(&self) -> Arc<ContextFrame> {
        Arc::new(ContextFrame {
            run_id: self.run_id,
            pipeline_name: self.pipeline_name.clone(),
            nesting_depth: self.nesting_depth,
            results: Arc::clone(&self.results),
            variables: Arc::clone(&self.variables),
            parent: self.parent.clone(),
        })
    }

    /// Resolve a condition key here, then through the parent chain.
    pub fn resolve(&self, key: &str) -> Option<serde_json::Value> {
        resolve_local(&self.results, &self.variables, key).or_else(|| {
            self.parent
                .as_ref()
                .and_then(Weak::upgrade)
                .and_then(|frame| frame.resolve(key))
        })
    }

    fn account_variables(&mut self) {
        let bytes: u64 = self
            .variables
            .iter()
            .map(|(k, v)| (k.len() + v.to_string().len()) as u64)
            .sum();
        self.account(bytes);
    }

    fn account(&mut self, bytes: u64) {
        self.accounted_bytes = self.accounted_bytes.saturating_add(bytes);
        self.ledger.record_memory(bytes as i64);
    }

    fn release(&mut self) {
        self.ledger.record_memory(-(self.accounted_bytes as i64));
        self.accounted_bytes = 0;
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Budgets;
    use serde_json::json;

    fn ledger() -> Arc<ResourceLedger> {
        Arc::new(ResourceLedger::new(Budgets::default()))
    }

    fn vars(pairs: &[(&str, serde_json::Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn record_keeps_execution_order() {
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger());
        ctx.record("b", Outcome::success(1)).unwrap();
        ctx.record("a", Outcome::skipped("condition false")).unwrap();
        let keys: Vec<_> = ctx.results().keys().cloned().collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn duplicate_record_is_configuration_error() {
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger());
        ctx.record("a", Outcome::success(1)).unwrap();
        let err = ctx.record("a", Outcome::success(2)).unwrap_err();
        assert!(matches!(err, CairnError::DuplicateStep { .. }));
        assert!(err.is_configuration());
        assert_eq!(ctx.result("a"), Some(&Outcome::success(1)));
    }

    #[test]
    fn resolve_step_fields_and_vars() {
        let mut ctx = ExecutionContext::root(
            Uuid::new_v4(),
            "main",
            vars(&[("cfg", json!({"mode": "fast"}))]),
            ledger(),
        );
        ctx.record("fetch", Outcome::success(json!({"items": [10, 20]})))
            .unwrap();
        ctx.record("broken", Outcome::fail("boom")).unwrap();

        assert_eq!(ctx.resolve("steps.fetch.status"), Some(json!("success")));
        assert_eq!(ctx.resolve("steps.fetch.value.items.1"), Some(json!(20)));
        assert_eq!(ctx.resolve("steps.broken.status"), Some(json!("failed")));
        assert_eq!(ctx.resolve("steps.broken.message"), Some(json!("boom")));
        assert_eq!(ctx.resolve("vars.cfg.mode"), Some(json!("fast")));
        assert_eq!(ctx.resolve("steps.missing.status"), None);
        assert_eq!(ctx.resolve("steps.broken.value"), None);
        assert_eq!(ctx.resolve("nonsense"), None);
    }

    #[test]
    fn child_depth_and_read_through() {
        let l = ledger();
        let mut root = ExecutionContext::root(
            Uuid::new_v4(),
            "main",
            vars(&[("region", json!("eu")), ("shadowed", json!("parent"))]),
            l.clone(),
        );
        root.record("setup", Outcome::success("ready")).unwrap();
        let frame = root.freeze();

        let child = ExecutionContext::child(
            &frame,
            Uuid::new_v4(),
            "child",
            vars(&[("shadowed", json!("child"))]),
            l,
        );
        assert_eq!(child.nesting_depth(), root.nesting_depth() + 1);
        assert_eq!(child.parent_run_id(), Some(root.run_id()));
        assert_eq!(root.parent_run_id(), None);
        assert!(child.results().is_empty());
        assert_eq!(child.resolve("vars.region"), Some(json!("eu")));
        assert_eq!(child.resolve("vars.shadowed"), Some(json!("child")));
        assert_eq!(child.resolve("steps.setup.value"), Some(json!("ready")));
    }

    #[test]
    fn dropped_parent_frame_ends_read_through() {
        let l = ledger();
        let root = ExecutionContext::root(
            Uuid::new_v4(),
            "main",
            vars(&[("x", json!(1))]),
            l.clone(),
        );
        let frame = root.freeze();
        let child = ExecutionContext::child(&frame, Uuid::new_v4(), "child", Variables::new(), l);
        assert_eq!(child.resolve("vars.x"), Some(json!(1)));
        drop(frame);
        assert_eq!(child.resolve("vars.x"), None);
    }

    #[test]
    fn frozen_frame_is_unaffected_by_later_writes() {
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger());
        ctx.record("a", Outcome::success(1)).unwrap();
        let frame = ctx.freeze();
        ctx.record("b", Outcome::success(2)).unwrap();
        assert_eq!(frame.results().len(), 1);
        assert_eq!(ctx.results().len(), 2);
    }

    #[test]
    fn restore_replaces_state_verbatim() {
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger());
        ctx.record("stale", Outcome::success(0)).unwrap();

        let mut snapshot = ContextSnapshot::default();
        snapshot.results.insert("a".into(), Outcome::success("x"));
        snapshot.variables.insert("v".into(), json!(true));
        ctx.restore(snapshot.clone());

        assert_eq!(ctx.snapshot(), snapshot);
        assert!(ctx.result("stale").is_none());
    }

    #[test]
    fn memory_is_accounted_and_released_on_drop() {
        let l = ledger();
        {
            let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), l.clone());
            ctx.record("big", Outcome::success("x".repeat(4096))).unwrap();
            assert!(l.memory_estimate_bytes() >= 4096);
        }
        assert_eq!(l.memory_estimate_bytes(), 0);
    }

    #[test]
    fn take_results_empties_context() {
        let mut ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger());
        ctx.record("a", Outcome::success(1)).unwrap();
        let taken = ctx.take_results();
        assert_eq!(taken.len(), 1);
        assert!(ctx.results().is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn snapshot_json_round_trip(
                values in proptest::collection::vec((any::<i64>(), any::<f64>().prop_filter("finite", |f| f.is_finite()), "[a-z]{0,8}"), 0..8),
            ) {
                let mut snapshot = ContextSnapshot::default();
                for (i, (n, f, s)) in values.into_iter().enumerate() {
                    snapshot.results.insert(format!("step_{i}"), Outcome::success(json!({"n": n, "f": f, "s": s})));
                    snapshot.variables.insert(format!("var_{i}"), json!(s));
                }
                let json = serde_json::to_string(&snapshot).unwrap();
                let back: ContextSnapshot = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back, snapshot);
            }
        }
    }
}
