use crate::types::{Dependency, DependencyType, Step, StepStatus};
use std::collections::HashMap;
use std::sync::Arc;

/// Decides whether a finished dependency lets a conditional edge through
pub trait ConditionPredicate: Send + Sync {
    fn evaluate(&self, dependency: &Step) -> bool;
}

impl<F> ConditionPredicate for F
where
    F: Fn(&Step) -> bool + Send + Sync,
{
    fn evaluate(&self, dependency: &Step) -> bool {
        self(dependency)
    }
}

/// Named predicates for conditional edges.
///
/// An edge whose condition has no registered predicate (or names none at all)
/// resolves like an optional edge.
#[derive(Clone, Default)]
pub struct ConditionRegistry {
    predicates: HashMap<String, Arc<dyn ConditionPredicate>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `on_success` and `on_failure`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("on_success", |dep: &Step| dep.status == StepStatus::Done);
        registry.register("on_failure", |dep: &Step| {
            matches!(dep.status, StepStatus::Failed | StepStatus::Blocked)
        });
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, predicate: impl ConditionPredicate + 'static) {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    /// Predicate governing an edge, if the edge is conditional and one is registered
    pub fn predicate_for(&self, edge: &Dependency) -> Option<&dyn ConditionPredicate> {
        if edge.dependency_type != DependencyType::Conditional {
            return None;
        }
        edge.condition
            .as_deref()
            .and_then(|name| self.predicates.get(name))
            .map(|p| p.as_ref())
    }
}

impl std::fmt::Debug for ConditionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.predicates.keys().collect();
        names.sort();
        f.debug_struct("ConditionRegistry")
            .field("predicates", &names)
            .finish()
    }
}
