//! Capability trait, invocation input, and the capability registry.
//!
//! The registry maps each non-structural [`CapabilityKind`] to exactly one
//! implementation. `nested_pipeline` and `fan_out` are never registered; the
//! scheduler runs them itself, and [`CapabilityRegistry::resolve`] says so
//! through [`Dispatch`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use cairn_types::{CairnError, Outcome, Result};

use crate::capabilities::{EchoCapability, ReadFileCapability, ShellCapability, WriteFileCapability};
use crate::context::ContextFrame;
use crate::definition::{CapabilityKind, StepSpec};

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// Everything a capability may read while executing one step attempt.
#[derive(Debug, Clone)]
pub struct CapabilityInput {
    pub run_id: Uuid,
    pub pipeline: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Read-only view of the level the step runs in.
    pub context: Arc<ContextFrame>,
}

impl CapabilityInput {
    /// Resolve `steps.*` / `vars.*` keys, reading through enclosing levels.
    pub fn resolve(&self, key: &str) -> Option<serde_json::Value> {
        self.context.resolve(key)
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    /// The step kind this capability implements.
    fn kind(&self) -> CapabilityKind;

    /// Execute one attempt of `step`.
    ///
    /// Ordinary failures belong in `Ok(Outcome::Failed { .. })`. An `Err` is
    /// folded into a failed outcome by the scheduler unless it is fatal.
    async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome>;
}

/// How the scheduler must execute a step.
#[derive(Clone, Copy)]
pub enum Dispatch<'a> {
    External(&'a dyn Capability),
    NestedPipeline,
    FanOut,
}

impl std::fmt::Debug for Dispatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::External(cap) => write!(f, "External({})", cap.kind()),
            Dispatch::NestedPipeline => f.write_str("NestedPipeline"),
            Dispatch::FanOut => f.write_str("FanOut"),
        }
    }
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    capabilities: HashMap<CapabilityKind, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation, replacing any previous one for its kind.
    pub fn register(&mut self, capability: impl Capability + 'static) -> Result<()> {
        self.register_arc(Arc::new(capability))
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let kind = capability.kind();
        if kind.is_structural() {
            return Err(CairnError::ValidationError(format!(
                "'{kind}' is executed by the scheduler and cannot be registered"
            )));
        }
        if self.capabilities.insert(kind, capability).is_some() {
            tracing::debug!(kind = %kind, "Replaced registered capability");
        }
        Ok(())
    }

    /// Decide how `step` is executed. Unregistered kinds are a configuration error.
    pub fn resolve(&self, kind: CapabilityKind, step: &str) -> Result<Dispatch<'_>> {
        match kind {
            CapabilityKind::NestedPipeline => Ok(Dispatch::NestedPipeline),
            CapabilityKind::FanOut => Ok(Dispatch::FanOut),
            other => self
                .capabilities
                .get(&other)
                .map(|cap| Dispatch::External(cap.as_ref()))
                .ok_or_else(|| CairnError::UnknownCapability {
                    kind: other.to_string(),
                    step: step.to_string(),
                }),
        }
    }

    /// Invoke the registered implementation for a non-structural step.
    pub async fn invoke(&self, step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
        match self.resolve(step.kind, &step.name)? {
            Dispatch::External(cap) => cap.invoke(step, input).await,
            Dispatch::NestedPipeline | Dispatch::FanOut => Err(CairnError::Other(format!(
                "step '{}' is structural and must be run by the scheduler",
                step.name
            ))),
        }
    }

    /// True when `kind` can be executed: structural, or registered.
    pub fn has(&self, kind: CapabilityKind) -> bool {
        kind.is_structural() || self.capabilities.contains_key(&kind)
    }

    /// Registered kinds, in declaration order of [`CapabilityKind::ALL`].
    pub fn kinds(&self) -> Vec<CapabilityKind> {
        CapabilityKind::ALL
            .into_iter()
            .filter(|k| self.capabilities.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Registry with the built-in `echo`, `shell`, `read_file` and `write_file`
/// capabilities. `generate` must be registered by the caller.
pub fn default_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.capabilities.insert(CapabilityKind::Echo, Arc::new(EchoCapability));
    registry.capabilities.insert(CapabilityKind::Shell, Arc::new(ShellCapability::default()));
    registry.capabilities.insert(CapabilityKind::ReadFile, Arc::new(ReadFileCapability));
    registry.capabilities.insert(CapabilityKind::WriteFile, Arc::new(WriteFileCapability));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::ledger::{Budgets, ResourceLedger};
    use cairn_types::Variables;

    struct FixedGenerate;

    #[async_trait]
    impl Capability for FixedGenerate {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::Generate
        }

        async fn invoke(&self, _step: &StepSpec, input: &CapabilityInput) -> Result<Outcome> {
            Ok(Outcome::success(format!("generated on attempt {}", input.attempt)))
        }
    }

    struct StructuralImpostor;

    #[async_trait]
    impl Capability for StructuralImpostor {
        fn kind(&self) -> CapabilityKind {
            CapabilityKind::FanOut
        }

        async fn invoke(&self, _step: &StepSpec, _input: &CapabilityInput) -> Result<Outcome> {
            Ok(Outcome::success(serde_json::Value::Null))
        }
    }

    fn input() -> CapabilityInput {
        let ledger = Arc::new(ResourceLedger::new(Budgets::default()));
        let ctx = ExecutionContext::root(Uuid::new_v4(), "main", Variables::new(), ledger);
        CapabilityInput {
            run_id: ctx.run_id(),
            pipeline: "main".into(),
            attempt: 1,
            context: ctx.freeze(),
        }
    }

    #[test]
    fn default_registry_has_builtins_but_not_generate() {
        let registry = default_registry();
        assert!(registry.has(CapabilityKind::Echo));
        assert!(registry.has(CapabilityKind::Shell));
        assert!(registry.has(CapabilityKind::ReadFile));
        assert!(registry.has(CapabilityKind::WriteFile));
        assert!(!registry.has(CapabilityKind::Generate));
        assert!(registry.has(CapabilityKind::NestedPipeline));
    }

    #[test]
    fn resolve_unregistered_is_configuration_error() {
        let registry = default_registry();
        let err = registry
            .resolve(CapabilityKind::Generate, "summarize")
            .unwrap_err();
        assert!(matches!(err, CairnError::UnknownCapability { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn resolve_structural_kinds() {
        let registry = CapabilityRegistry::new();
        assert!(matches!(
            registry.resolve(CapabilityKind::NestedPipeline, "s").unwrap(),
            Dispatch::NestedPipeline
        ));
        assert!(matches!(
            registry.resolve(CapabilityKind::FanOut, "s").unwrap(),
            Dispatch::FanOut
        ));
    }

    #[test]
    fn structural_kinds_cannot_be_registered() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.register(StructuralImpostor).is_err());
    }

    #[tokio::test]
    async fn registered_capability_is_invoked() {
        let mut registry = default_registry();
        registry.register(FixedGenerate).unwrap();
        let step = StepSpec::new("summarize", CapabilityKind::Generate);
        let outcome = registry.invoke(&step, &input()).await.unwrap();
        assert_eq!(outcome, Outcome::success("generated on attempt 1"));
        assert_eq!(
            registry.kinds(),
            vec![
                CapabilityKind::Echo,
                CapabilityKind::Generate,
                CapabilityKind::Shell,
                CapabilityKind::ReadFile,
                CapabilityKind::WriteFile,
            ]
        );
    }
}
