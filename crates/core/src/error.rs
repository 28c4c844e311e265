use crate::types::{StepNumber, StepStatus};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Reasons a plan is rejected at creation time. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Plan contains no steps")]
    EmptyPlan,

    #[error("Duplicate step number {0}")]
    DuplicateStep(StepNumber),

    #[error("Step {step} depends on unknown step {depends_on}")]
    MissingDependency {
        step: StepNumber,
        depends_on: StepNumber,
    },

    #[error("Step {step} lists step {depends_on} as a dependency more than once")]
    DuplicateDependency {
        step: StepNumber,
        depends_on: StepNumber,
    },

    #[error("Step {0} depends on itself")]
    SelfDependency(StepNumber),

    #[error("Plan contains circular dependencies involving step {0}")]
    CyclicDependency(StepNumber),

    /// Cycle made only possible by optional edges
    #[error("Optional dependencies form a cycle involving step {0}")]
    OptionalCycle(StepNumber),

    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Errors surfaced by the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(String),

    /// Lost compare-and-set on a step; the step is owned by someone else
    #[error("Step {step_number} is {status}")]
    Conflict {
        step_number: StepNumber,
        status: StepStatus,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
