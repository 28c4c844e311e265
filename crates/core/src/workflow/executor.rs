use super::step_executor::{AttemptOutcome, StepExecutor};
use super::transition::StepCommand;
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::scheduler::Scheduler;
use crate::storage::{GraphStore, StepTransition};
use crate::types::{ProjectId, ProjectStatus, Step, StepNumber, StepStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

type AttemptResult = (Step, AttemptOutcome);

/// An outcome whose transition has not been committed yet
type Unrecorded = (Step, StepCommand);

/// What one scheduling pass found
enum Pass {
    /// The project can still make progress
    Scheduled { next_retry_at: Option<DateTime<Utc>> },
    /// Terminal, paused, pausing or gone: claim nothing more
    Idle,
}

/// Drives projects through their graphs.
///
/// One run loop per executing project claims ready steps, hands them to the
/// [`StepExecutor`] on spawned tasks, and records every outcome through the
/// store. A semaphore shared by all loops bounds the number of runner calls
/// in flight across the process.
pub struct Executor {
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    step_executor: Arc<StepExecutor>,
    scheduler: Scheduler,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    poll_interval: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        bus: Arc<EventBus>,
        step_executor: StepExecutor,
        scheduler: Scheduler,
        retry: RetryPolicy,
        max_concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            step_executor: Arc::new(step_executor),
            scheduler,
            retry,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            poll_interval,
        }
    }

    /// Run loop for one project. Returns once the project is terminal,
    /// paused or deleted, or when `cancel` fires; attempts still in flight
    /// are drained and recorded before returning.
    ///
    /// An outcome that fails to commit stays buffered and is retried at the
    /// start of every pass, so the step never stays stuck in progress.
    pub async fn run_project(self: Arc<Self>, project_id: ProjectId, cancel: CancellationToken, wake: Arc<Notify>) {
        tracing::info!("Run loop started for project {}", project_id);

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<AttemptResult>();
        let mut in_flight = 0usize;
        let mut unrecorded: Vec<Unrecorded> = Vec::new();

        loop {
            self.retry_unrecorded(&mut unrecorded);

            let next_retry_at = match self.schedule_pass(&project_id, &cancel, &result_tx, &mut in_flight) {
                Ok(Pass::Scheduled { next_retry_at }) => next_retry_at,
                Ok(Pass::Idle) if in_flight == 0 && unrecorded.is_empty() => break,
                Ok(Pass::Idle) => None,
                Err(e) => {
                    tracing::warn!("Scheduling pass for project {} failed: {}", project_id, e);
                    None
                }
            };

            let tick = next_retry_at
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(self.poll_interval, |until_retry| until_retry.min(self.poll_interval));

            tokio::select! {
                _ = cancel.cancelled() => break,
                Some((step, outcome)) = result_rx.recv() => {
                    in_flight -= 1;
                    let command = self.command_for(&step, outcome);
                    unrecorded.extend(self.record(step, command));
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }

        while in_flight > 0 {
            let Some((step, outcome)) = result_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            let command = self.command_for(&step, outcome);
            unrecorded.extend(self.record(step, command));
        }

        // Last attempt; whatever still fails is requeued by startup recovery
        self.retry_unrecorded(&mut unrecorded);
        for (step, _) in &unrecorded {
            tracing::error!(
                "Giving up on recording step {} of project {}, it stays in progress",
                step.step_number,
                project_id
            );
        }

        tracing::info!("Run loop stopped for project {}", project_id);
    }

    /// Promote, gate and claim whatever the scheduler says is ready
    fn schedule_pass(
        &self,
        project_id: &ProjectId,
        cancel: &CancellationToken,
        result_tx: &mpsc::UnboundedSender<AttemptResult>,
        in_flight: &mut usize,
    ) -> EngineResult<Pass> {
        let Some(graph) = self.store.load_graph(project_id)? else {
            return Ok(Pass::Idle);
        };
        if graph.project.status != ProjectStatus::Executing || graph.project.pause_requested {
            return Ok(Pass::Idle);
        }

        let plan = self.scheduler.plan(&graph, Utc::now());

        for number in plan.ready {
            if cancel.is_cancelled() {
                break;
            }
            let Some(mut step) = graph.step(number).cloned() else {
                continue;
            };

            if step.status == StepStatus::Pending {
                match self.apply(project_id, number, StepCommand::Promote) {
                    Ok(transition) => step = transition.step,
                    Err(e) if e.is_conflict() => {
                        tracing::debug!("Step {} of project {} changed before promotion", number, project_id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if step.requires_approval && step.approved_at.is_none() {
                match self.apply(project_id, number, StepCommand::AwaitApproval) {
                    Ok(_) => tracing::info!("Step {} of project {} is waiting for approval", number, project_id),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!("No worker permits left, step {} stays ready", number);
                continue;
            };

            let claimed = match self.apply(project_id, number, StepCommand::Claim) {
                Ok(transition) => transition.step,
                Err(e) if e.is_conflict() => {
                    // Another worker owns it
                    tracing::debug!("Lost claim on step {} of project {}", number, project_id);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let step_executor = self.step_executor.clone();
            let result_tx = result_tx.clone();
            let token = cancel.child_token();
            *in_flight += 1;

            tokio::spawn(async move {
                let outcome = step_executor.execute(&claimed, token).await;
                drop(permit);
                // Receiver gone means the loop is shutting down
                let _ = result_tx.send((claimed, outcome));
            });
        }

        Ok(Pass::Scheduled {
            next_retry_at: plan.next_retry_at,
        })
    }

    fn retry_unrecorded(&self, unrecorded: &mut Vec<Unrecorded>) {
        for (step, command) in std::mem::take(unrecorded) {
            unrecorded.extend(self.record(step, command));
        }
    }

    /// Transition that records the result of an attempt
    fn command_for(&self, step: &Step, outcome: AttemptOutcome) -> StepCommand {
        match outcome {
            AttemptOutcome::Succeeded { output, elapsed_ms } => {
                tracing::info!(
                    "Step {} of project {} completed in {}ms",
                    step.step_number,
                    step.project_id,
                    elapsed_ms
                );
                StepCommand::Complete {
                    output,
                    execution_time_ms: elapsed_ms,
                }
            }
            AttemptOutcome::Failed { error, elapsed_ms } => {
                match self.retry.decide(step.retry_count, step.max_retries) {
                    RetryDecision::Retry { retry_count, delay } => {
                        tracing::warn!(
                            "Step {} of project {} failed, retry {}/{} in {:?}: {}",
                            step.step_number,
                            step.project_id,
                            retry_count,
                            step.max_retries,
                            delay,
                            error
                        );
                        StepCommand::ScheduleRetry {
                            error,
                            execution_time_ms: elapsed_ms,
                            next_attempt_at: Utc::now()
                                + chrono::Duration::milliseconds(delay.as_millis() as i64),
                        }
                    }
                    RetryDecision::GiveUp => {
                        tracing::error!(
                            "Step {} of project {} failed after {} attempts: {}",
                            step.step_number,
                            step.project_id,
                            step.retry_count + 1,
                            error
                        );
                        StepCommand::Fail {
                            error,
                            execution_time_ms: Some(elapsed_ms),
                        }
                    }
                }
            }
            AttemptOutcome::Cancelled => StepCommand::Requeue,
        }
    }

    /// Commit an outcome. Hands it back when storage failed and it should
    /// be tried again.
    fn record(&self, step: Step, command: StepCommand) -> Option<Unrecorded> {
        match self.apply(&step.project_id, step.step_number, command.clone()) {
            Ok(transition) => {
                if transition.project.status.is_terminal() {
                    tracing::info!(
                        "Project {} finished as {} ({} of {} steps done)",
                        transition.project.id,
                        transition.project.status,
                        transition.project.completed_steps,
                        transition.project.total_steps
                    );
                }
                None
            }
            // Deleted while the step was running
            Err(e) if e.is_not_found() => None,
            // Someone else already resolved the step
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    "Step {} of project {} changed before its outcome was recorded",
                    step.step_number,
                    step.project_id
                );
                None
            }
            Err(EngineError::Storage(e)) => {
                tracing::warn!(
                    "Failed to record outcome of step {} of project {}, retrying: {:#}",
                    step.step_number,
                    step.project_id,
                    e
                );
                Some((step, command))
            }
            Err(e) => {
                tracing::error!(
                    "Outcome of step {} of project {} was refused: {}",
                    step.step_number,
                    step.project_id,
                    e
                );
                None
            }
        }
    }

    /// Apply a step command and publish its committed events
    fn apply(&self, project_id: &ProjectId, step_number: StepNumber, command: StepCommand) -> EngineResult<StepTransition> {
        let transition = self
            .store
            .apply(project_id, step_number, command, self.scheduler.conditions())?;
        self.bus.publish(&transition.events);
        Ok(transition)
    }
}
