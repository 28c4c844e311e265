pub mod dag;
pub mod executor;
pub mod step_executor;
pub mod transition;

pub use dag::{validate_plan, ProjectGraph, StepGraph};
pub use executor::Executor;
pub use step_executor::{AttemptOutcome, StepExecutor};
pub use transition::{ProjectCommand, StepCommand};
