use crate::runner::{RunnerRegistry, StepRequest};
use crate::types::Step;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Result of a single runner attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded {
        output: Option<String>,
        elapsed_ms: u64,
    },
    /// Runner error, timeout, or no runner for the step
    Failed { error: String, elapsed_ms: u64 },
    /// The attempt was abandoned because its project was deleted or shut down
    Cancelled,
}

/// Runs one attempt of a step with a deadline and a cancellation token
pub struct StepExecutor {
    runners: RunnerRegistry,
    step_timeout: Duration,
}

impl StepExecutor {
    pub fn new(runners: RunnerRegistry, step_timeout: Duration) -> Self {
        Self {
            runners,
            step_timeout,
        }
    }

    pub async fn execute(&self, step: &Step, cancel: CancellationToken) -> AttemptOutcome {
        let request = StepRequest::for_step(step);
        tracing::info!(
            "Executing step {} (attempt {}) for project {}",
            step.step_number,
            request.attempt,
            step.project_id
        );

        let Some(runner) = self.runners.resolve(step) else {
            tracing::warn!(
                "No runner registered for step {} (action {}, agent {:?})",
                step.step_number,
                step.action,
                step.agent_name
            );
            return AttemptOutcome::Failed {
                error: format!("No runner registered for action '{}'", step.action),
                elapsed_ms: 0,
            };
        };

        let start = Instant::now();
        let run = timeout(self.step_timeout, runner.run(request, cancel.clone()));

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Step {} of project {} cancelled", step.step_number, step.project_id);
                return AttemptOutcome::Cancelled;
            }
            result = run => result,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => AttemptOutcome::Succeeded {
                output: output.output,
                elapsed_ms,
            },
            Ok(Err(e)) => {
                // A runner that bails out on cancellation is not a step failure
                if cancel.is_cancelled() {
                    return AttemptOutcome::Cancelled;
                }
                tracing::warn!("Step {} failed: {:#}", step.step_number, e);
                AttemptOutcome::Failed {
                    error: format!("{:#}", e),
                    elapsed_ms,
                }
            }
            Err(_) => {
                tracing::warn!("Step {} timed out", step.step_number);
                AttemptOutcome::Failed {
                    error: format!(
                        "Step timed out after {} seconds",
                        self.step_timeout.as_secs_f64()
                    ),
                    elapsed_ms,
                }
            }
        }
    }
}
