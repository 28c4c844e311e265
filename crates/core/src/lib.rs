// Execution-graph engine: plans of dependent steps run in order, with
// approval gates, bounded retries and a replayable event log

pub mod types;
pub mod error;
pub mod storage;
pub mod events;
pub mod workflow;
pub mod condition;
pub mod scheduler;
pub mod retry;
pub mod runner;
pub mod approval;
pub mod config;
pub mod controller;

pub use config::EngineConfig;
pub use controller::ProjectController;
pub use error::{EngineError, EngineResult, ValidationError};
pub use events::{EventBus, EventType, ExecutionEvent};
pub use runner::{RunnerRegistry, StepOutput, StepRequest, StepRunner};
pub use types::*;
