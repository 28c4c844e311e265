//! Step and project state machine.
//!
//! Every function here mutates an in-memory [`ProjectGraph`] and returns the
//! events describing what changed. The store runs them inside one write
//! transaction, so the compare-and-set check, the blocking propagation, the
//! project summary and the event log always commit together.

use super::dag::ProjectGraph;
use crate::condition::ConditionRegistry;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventType, NewEvent};
use crate::scheduler::{self, EdgeState};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::VecDeque;

/// A single-step state change
#[derive(Debug, Clone)]
pub enum StepCommand {
    /// pending → ready
    Promote,
    /// ready → awaiting_approval
    AwaitApproval,
    /// pending | ready → in_progress
    Claim,
    /// in_progress → done
    Complete {
        output: Option<String>,
        execution_time_ms: u64,
    },
    /// in_progress → pending, to be claimed again after `next_attempt_at`
    ScheduleRetry {
        error: String,
        execution_time_ms: u64,
        next_attempt_at: DateTime<Utc>,
    },
    /// in_progress → failed
    Fail {
        error: String,
        execution_time_ms: Option<u64>,
    },
    /// awaiting_approval → ready
    Approve,
    /// awaiting_approval → failed
    Reject { reason: String },
    /// Field edits before the step starts
    Edit(StepPatch),
    /// in_progress → ready, for steps whose runner never reported back
    Requeue,
}

impl StepCommand {
    /// Statuses the step must be in for the command to apply
    pub fn allowed_from(&self) -> &'static [StepStatus] {
        use StepStatus::*;
        match self {
            Self::Promote => &[Pending],
            Self::AwaitApproval => &[Ready],
            Self::Claim => &[Pending, Ready],
            Self::Complete { .. } | Self::ScheduleRetry { .. } | Self::Fail { .. } => &[InProgress],
            Self::Approve | Self::Reject { .. } => &[AwaitingApproval],
            Self::Edit(_) => &[Pending, Ready, AwaitingApproval],
            Self::Requeue => &[InProgress],
        }
    }
}

/// A project-level control change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectCommand {
    /// Start a ready project or resume a paused one
    Start,
    /// Stop claiming new steps; paused once nothing is in progress
    RequestPause,
}

/// Apply a step command, compare-and-set on the step's current status
pub fn apply_step_command(
    graph: &mut ProjectGraph,
    step_number: StepNumber,
    command: StepCommand,
    conditions: &ConditionRegistry,
    now: DateTime<Utc>,
) -> EngineResult<Vec<NewEvent>> {
    let current = graph
        .step(step_number)
        .cloned()
        .ok_or_else(|| {
            EngineError::NotFound(format!("Step {} of project {}", step_number, graph.project.id))
        })?;

    if !command.allowed_from().contains(&current.status) {
        return Err(conflict(&current));
    }

    let mut events = Vec::new();
    let mut settle = false;

    match command {
        StepCommand::Promote => {
            if !scheduler::is_step_ready(graph, &current, conditions, now) {
                return Err(conflict(&current));
            }
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Ready;
            step.next_attempt_at = None;
            step.updated_at = now;
            events.push(NewEvent::step(
                EventType::StepReady,
                step,
                format!("Step {} is ready", step_number),
            ));
        }

        StepCommand::AwaitApproval => {
            if !current.requires_approval || current.approved_at.is_some() {
                return Err(conflict(&current));
            }
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::AwaitingApproval;
            step.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepAwaitingApproval,
                    step,
                    format!("Step {} is waiting for approval", step_number),
                )
                .with_data(json!({ "approvalId": step.id, "goal": step.goal })),
            );
        }

        StepCommand::Claim => {
            // Gated steps never start without a recorded approval
            if current.requires_approval && current.approved_at.is_none() {
                return Err(conflict(&current));
            }
            if !scheduler::is_step_ready(graph, &current, conditions, now) {
                return Err(conflict(&current));
            }
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::InProgress;
            step.next_attempt_at = None;
            step.started_at = Some(now);
            step.updated_at = now;
            let attempt = step.retry_count + 1;
            events.push(
                NewEvent::step(
                    EventType::StepStarted,
                    step,
                    format!("Step {} started (attempt {})", step_number, attempt),
                )
                .with_data(json!({ "attempt": attempt, "action": step.action })),
            );
        }

        StepCommand::Complete {
            output,
            execution_time_ms,
        } => {
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Done;
            step.output = output;
            step.error_message = None;
            step.execution_time_ms = Some(execution_time_ms);
            step.completed_at = Some(now);
            step.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepCompleted,
                    step,
                    format!("Step {} completed in {}ms", step_number, execution_time_ms),
                )
                .with_data(json!({
                    "executionTimeMs": execution_time_ms,
                    "output": step.output,
                })),
            );
            settle = true;
        }

        StepCommand::ScheduleRetry {
            error,
            execution_time_ms,
            next_attempt_at,
        } => {
            if current.retry_count >= current.max_retries {
                return Err(EngineError::InvalidState(format!(
                    "Step {} has used all {} retries",
                    step_number, current.max_retries
                )));
            }
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Pending;
            step.retry_count += 1;
            step.error_message = Some(error);
            step.execution_time_ms = Some(execution_time_ms);
            step.next_attempt_at = Some(next_attempt_at);
            step.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepRetryScheduled,
                    step,
                    format!(
                        "Step {} failed, retry {}/{} scheduled",
                        step_number, step.retry_count, step.max_retries
                    ),
                )
                .with_data(json!({
                    "retryCount": step.retry_count,
                    "maxRetries": step.max_retries,
                    "nextAttemptAt": next_attempt_at,
                    "error": step.error_message,
                })),
            );
        }

        StepCommand::Fail {
            error,
            execution_time_ms,
        } => {
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Failed;
            step.error_message = Some(error);
            if execution_time_ms.is_some() {
                step.execution_time_ms = execution_time_ms;
            }
            step.completed_at = Some(now);
            step.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepFailed,
                    step,
                    format!("Step {} failed", step_number),
                )
                .with_data(json!({
                    "error": step.error_message,
                    "retryCount": step.retry_count,
                })),
            );
            settle = true;
        }

        StepCommand::Approve => {
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Ready;
            step.approved_at = Some(now);
            step.updated_at = now;
            events.push(NewEvent::step(
                EventType::StepApproved,
                step,
                format!("Step {} approved", step_number),
            ));
        }

        StepCommand::Reject { reason } => {
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Failed;
            step.error_message = Some(reason);
            step.completed_at = Some(now);
            step.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepRejected,
                    step,
                    format!("Step {} rejected", step_number),
                )
                .with_data(json!({ "reason": step.error_message })),
            );
            settle = true;
        }

        StepCommand::Edit(patch) => {
            let step = graph.step_mut(step_number)?;
            if let Some(goal) = patch.goal {
                if goal.trim().is_empty() {
                    return Err(crate::error::ValidationError::InvalidField {
                        field: "goal",
                        reason: "must not be empty".to_string(),
                    }
                    .into());
                }
                step.goal = goal;
            }
            if let Some(action) = patch.action {
                step.action = action;
            }
            if let Some(artifact) = patch.artifact {
                step.artifact = Some(artifact);
            }
            if let Some(agent_name) = patch.agent_name {
                step.agent_name = Some(agent_name);
            }
            if let Some(max_retries) = patch.max_retries {
                step.max_retries = max_retries.max(step.retry_count);
            }
            if let Some(requires_approval) = patch.requires_approval {
                step.requires_approval = requires_approval;
                if !requires_approval && step.status == StepStatus::AwaitingApproval {
                    step.status = StepStatus::Ready;
                }
            }
            step.updated_at = now;
            events.push(NewEvent::step(
                EventType::StepUpdated,
                step,
                format!("Step {} updated", step_number),
            ));
        }

        StepCommand::Requeue => {
            let step = graph.step_mut(step_number)?;
            step.status = StepStatus::Ready;
            step.started_at = None;
            step.updated_at = now;
            events.push(NewEvent::step(
                EventType::StepRequeued,
                step,
                format!("Step {} requeued", step_number),
            ));
        }
    }

    if settle {
        events.extend(settle_dependents(graph, step_number, conditions, now)?);
    }
    events.extend(refresh_summary(graph, now));

    Ok(events)
}

/// Apply a project-level control command
pub fn apply_project_command(
    graph: &mut ProjectGraph,
    command: ProjectCommand,
    now: DateTime<Utc>,
) -> EngineResult<Vec<NewEvent>> {
    let mut events = Vec::new();
    let project = &mut graph.project;

    match command {
        ProjectCommand::Start => match project.status {
            ProjectStatus::Ready => {
                project.status = ProjectStatus::Executing;
                project.pause_requested = false;
                project.started_at = Some(now);
                project.updated_at = now;
                events.push(NewEvent::project(
                    EventType::ProjectStarted,
                    format!("Project {} started", project.name),
                ));
            }
            ProjectStatus::Paused => {
                project.status = ProjectStatus::Executing;
                project.pause_requested = false;
                project.updated_at = now;
                events.push(NewEvent::project(
                    EventType::ProjectResumed,
                    format!("Project {} resumed", project.name),
                ));
            }
            ProjectStatus::Executing if project.pause_requested => {
                project.pause_requested = false;
                project.updated_at = now;
                events.push(NewEvent::project(
                    EventType::ProjectResumed,
                    format!("Project {} resumed", project.name),
                ));
            }
            ProjectStatus::Executing | ProjectStatus::Completed | ProjectStatus::Failed => {}
        },

        ProjectCommand::RequestPause => match project.status {
            ProjectStatus::Executing if !project.pause_requested => {
                project.pause_requested = true;
                project.updated_at = now;
                events.push(NewEvent::project(
                    EventType::ProjectPausing,
                    format!("Project {} is pausing", project.name),
                ));
            }
            ProjectStatus::Executing | ProjectStatus::Paused => {}
            ProjectStatus::Ready => {
                return Err(EngineError::InvalidState(format!(
                    "Project {} has not been started",
                    project.id
                )));
            }
            ProjectStatus::Completed | ProjectStatus::Failed => {
                return Err(EngineError::InvalidState(format!(
                    "Project {} is already {}",
                    project.id, project.status
                )));
            }
        },
    }

    events.extend(refresh_summary(graph, now));
    Ok(events)
}

/// Block every live step that can no longer run because of `root`,
/// following broken edges transitively
fn settle_dependents(
    graph: &mut ProjectGraph,
    root: StepNumber,
    conditions: &ConditionRegistry,
    now: DateTime<Utc>,
) -> EngineResult<Vec<NewEvent>> {
    let dag = graph.dag()?;
    let mut events = Vec::new();
    let mut queue = VecDeque::from([root]);

    while let Some(current) = queue.pop_front() {
        let Some(source) = graph.step(current).cloned() else {
            continue;
        };

        for edge in dag.dependents(current) {
            if scheduler::edge_state(&edge, &source, conditions) != EdgeState::Broken {
                continue;
            }

            let dependent = graph.step_mut(edge.step_number)?;
            if !matches!(
                dependent.status,
                StepStatus::Pending | StepStatus::Ready | StepStatus::AwaitingApproval
            ) {
                continue;
            }

            dependent.status = StepStatus::Blocked;
            dependent.error_message = Some(format!(
                "Blocked by step {} ({})",
                current, source.status
            ));
            dependent.next_attempt_at = None;
            dependent.completed_at = Some(now);
            dependent.updated_at = now;
            events.push(
                NewEvent::step(
                    EventType::StepBlocked,
                    dependent,
                    format!("Step {} blocked by step {}", edge.step_number, current),
                )
                .with_data(json!({ "blockedBy": current })),
            );
            queue.push_back(edge.step_number);
        }
    }

    Ok(events)
}

/// Project status implied by its steps
pub fn derive_status(project: &Project, steps: &[Step]) -> ProjectStatus {
    if matches!(
        project.status,
        ProjectStatus::Ready | ProjectStatus::Completed | ProjectStatus::Failed
    ) {
        return project.status;
    }

    let live = steps.iter().filter(|s| s.status.is_live()).count();
    let in_progress = steps
        .iter()
        .filter(|s| s.status == StepStatus::InProgress)
        .count();
    let unsuccessful = steps
        .iter()
        .any(|s| matches!(s.status, StepStatus::Failed | StepStatus::Blocked));

    if live == 0 {
        if unsuccessful {
            ProjectStatus::Failed
        } else {
            ProjectStatus::Completed
        }
    } else if project.pause_requested {
        if in_progress == 0 {
            ProjectStatus::Paused
        } else {
            ProjectStatus::Executing
        }
    } else {
        ProjectStatus::Executing
    }
}

/// Recompute the cached counters and status; returns the status-change event
fn refresh_summary(graph: &mut ProjectGraph, now: DateTime<Utc>) -> Option<NewEvent> {
    let completed = graph
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Done)
        .count() as u32;
    let failed = graph
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .count() as u32;

    let project = &mut graph.project;
    project.total_steps = graph.steps.len() as u32;
    project.completed_steps = completed;
    project.failed_steps = failed;

    let next = derive_status(project, &graph.steps);
    if next == project.status {
        return None;
    }

    project.status = next;
    project.updated_at = now;

    let summary = json!({
        "totalSteps": project.total_steps,
        "completedSteps": project.completed_steps,
        "failedSteps": project.failed_steps,
    });

    let event_type = match next {
        ProjectStatus::Completed => EventType::ProjectCompleted,
        ProjectStatus::Failed => EventType::ProjectFailed,
        ProjectStatus::Paused => EventType::ProjectPaused,
        ProjectStatus::Executing => EventType::ProjectResumed,
        ProjectStatus::Ready => return None,
    };
    if next.is_terminal() {
        project.completed_at = Some(now);
    }

    Some(
        NewEvent::project(event_type, format!("Project {} is {}", project.name, next))
            .with_data(summary),
    )
}

fn conflict(step: &Step) -> EngineError {
    EngineError::Conflict {
        step_number: step.step_number,
        status: step.status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_graph(specs: &[(StepNumber, &[(StepNumber, DependencyType)])]) -> ProjectGraph {
        let now = Utc::now();
        let project_id = ProjectId::new();
        let steps = specs
            .iter()
            .map(|(number, _)| Step {
                id: StepId::new(),
                project_id,
                step_number: *number,
                goal: format!("Step {}", number),
                action: StepAction::Build,
                artifact: None,
                agent_name: None,
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: 2,
                output: None,
                error_message: None,
                requires_approval: false,
                approved_at: None,
                execution_time_ms: None,
                next_attempt_at: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect::<Vec<_>>();
        let dependencies = specs
            .iter()
            .flat_map(|(number, deps)| {
                deps.iter().map(move |(on, kind)| Dependency {
                    step_number: *number,
                    depends_on: *on,
                    dependency_type: *kind,
                    condition: None,
                })
            })
            .collect();

        ProjectGraph {
            project: Project {
                id: project_id,
                name: "demo".to_string(),
                description: None,
                project_type: "app".to_string(),
                status: ProjectStatus::Executing,
                total_steps: steps.len() as u32,
                completed_steps: 0,
                failed_steps: 0,
                pause_requested: false,
                created_at: now,
                updated_at: now,
                started_at: Some(now),
                completed_at: None,
            },
            steps,
            dependencies,
        }
    }

    fn apply(graph: &mut ProjectGraph, step: StepNumber, command: StepCommand) -> EngineResult<Vec<NewEvent>> {
        apply_step_command(graph, step, command, &ConditionRegistry::with_builtins(), Utc::now())
    }

    fn status(graph: &ProjectGraph, step: StepNumber) -> StepStatus {
        graph.step(step).unwrap().status
    }

    #[test]
    fn test_claim_is_compare_and_set() {
        let mut graph = make_graph(&[(1, &[])]);

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        assert_eq!(status(&graph, 1), StepStatus::InProgress);

        let second = apply(&mut graph, 1, StepCommand::Claim);
        assert!(matches!(
            second,
            Err(EngineError::Conflict { step_number: 1, status: StepStatus::InProgress })
        ));
    }

    #[test]
    fn test_claim_requires_satisfied_dependencies() {
        let mut graph = make_graph(&[(1, &[]), (2, &[(1, DependencyType::Requires)])]);
        assert!(apply(&mut graph, 2, StepCommand::Claim).unwrap_err().is_conflict());
        assert!(apply(&mut graph, 2, StepCommand::Promote).unwrap_err().is_conflict());
    }

    #[test]
    fn test_gated_step_cannot_be_claimed_before_approval() {
        let mut graph = make_graph(&[(1, &[])]);
        graph.step_mut(1).unwrap().requires_approval = true;

        apply(&mut graph, 1, StepCommand::Promote).unwrap();
        assert!(apply(&mut graph, 1, StepCommand::Claim).unwrap_err().is_conflict());

        apply(&mut graph, 1, StepCommand::AwaitApproval).unwrap();
        assert_eq!(status(&graph, 1), StepStatus::AwaitingApproval);

        apply(&mut graph, 1, StepCommand::Approve).unwrap();
        assert!(graph.step(1).unwrap().approved_at.is_some());
        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        assert_eq!(status(&graph, 1), StepStatus::InProgress);
    }

    #[test]
    fn test_failure_blocks_transitive_required_dependents() {
        let mut graph = make_graph(&[
            (1, &[]),
            (2, &[(1, DependencyType::Requires)]),
            (3, &[(2, DependencyType::Requires)]),
            (4, &[(1, DependencyType::Optional)]),
            (5, &[(1, DependencyType::Conditional)]),
        ]);

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        let events = apply(
            &mut graph,
            1,
            StepCommand::Fail {
                error: "boom".to_string(),
                execution_time_ms: Some(5),
            },
        )
        .unwrap();

        assert_eq!(status(&graph, 1), StepStatus::Failed);
        assert_eq!(status(&graph, 2), StepStatus::Blocked);
        assert_eq!(status(&graph, 3), StepStatus::Blocked);
        assert_eq!(status(&graph, 4), StepStatus::Pending);
        assert_eq!(status(&graph, 5), StepStatus::Pending);

        let blocked = events
            .iter()
            .filter(|e| e.event_type == EventType::StepBlocked)
            .count();
        assert_eq!(blocked, 2);
        assert_eq!(graph.project.failed_steps, 1);
        assert_eq!(graph.project.status, ProjectStatus::Executing);
    }

    #[test]
    fn test_rejected_conditional_predicate_blocks() {
        let mut graph = make_graph(&[(1, &[]), (2, &[(1, DependencyType::Conditional)])]);
        graph.dependencies[0].condition = Some("on_failure".to_string());

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        apply(
            &mut graph,
            1,
            StepCommand::Complete {
                output: None,
                execution_time_ms: 1,
            },
        )
        .unwrap();

        assert_eq!(status(&graph, 2), StepStatus::Blocked);
        assert_eq!(graph.project.status, ProjectStatus::Failed);
    }

    #[test]
    fn test_retry_returns_step_to_pending() {
        let mut graph = make_graph(&[(1, &[])]);
        let later = Utc::now() + Duration::seconds(10);

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        apply(
            &mut graph,
            1,
            StepCommand::ScheduleRetry {
                error: "flaky".to_string(),
                execution_time_ms: 3,
                next_attempt_at: later,
            },
        )
        .unwrap();

        let step = graph.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.retry_count, 1);
        assert_eq!(step.next_attempt_at, Some(later));
        // Not claimable until the backoff elapses
        assert!(apply(&mut graph, 1, StepCommand::Claim).unwrap_err().is_conflict());
    }

    #[test]
    fn test_retry_refused_past_max() {
        let mut graph = make_graph(&[(1, &[])]);
        graph.step_mut(1).unwrap().max_retries = 0;

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        let result = apply(
            &mut graph,
            1,
            StepCommand::ScheduleRetry {
                error: "flaky".to_string(),
                execution_time_ms: 3,
                next_attempt_at: Utc::now(),
            },
        );
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
        assert_eq!(graph.step(1).unwrap().retry_count, 0);
    }

    #[test]
    fn test_project_completes_when_all_done() {
        let mut graph = make_graph(&[(1, &[]), (2, &[(1, DependencyType::Requires)])]);

        for n in [1, 2] {
            apply(&mut graph, n, StepCommand::Claim).unwrap();
            let events = apply(
                &mut graph,
                n,
                StepCommand::Complete {
                    output: Some("ok".to_string()),
                    execution_time_ms: 1,
                },
            )
            .unwrap();
            if n == 2 {
                assert_eq!(events.last().unwrap().event_type, EventType::ProjectCompleted);
            }
        }

        assert_eq!(graph.project.status, ProjectStatus::Completed);
        assert_eq!(graph.project.completed_steps, 2);
        assert!(graph.project.completed_at.is_some());
    }

    #[test]
    fn test_pause_waits_for_in_flight_steps() {
        let mut graph = make_graph(&[(1, &[]), (2, &[])]);
        apply(&mut graph, 1, StepCommand::Claim).unwrap();

        let events = apply_project_command(&mut graph, ProjectCommand::RequestPause, Utc::now()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(graph.project.status, ProjectStatus::Executing);
        assert!(graph.project.pause_requested);

        let events = apply(
            &mut graph,
            1,
            StepCommand::Complete {
                output: None,
                execution_time_ms: 1,
            },
        )
        .unwrap();
        assert_eq!(graph.project.status, ProjectStatus::Paused);
        assert_eq!(events.last().unwrap().event_type, EventType::ProjectPaused);

        apply_project_command(&mut graph, ProjectCommand::Start, Utc::now()).unwrap();
        assert_eq!(graph.project.status, ProjectStatus::Executing);
        assert!(!graph.project.pause_requested);
    }

    #[test]
    fn test_pause_rejected_for_unstarted_project() {
        let mut graph = make_graph(&[(1, &[])]);
        graph.project.status = ProjectStatus::Ready;
        let result = apply_project_command(&mut graph, ProjectCommand::RequestPause, Utc::now());
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
    }

    #[test]
    fn test_edit_clearing_approval_releases_step() {
        let mut graph = make_graph(&[(1, &[])]);
        graph.step_mut(1).unwrap().requires_approval = true;
        apply(&mut graph, 1, StepCommand::Promote).unwrap();
        apply(&mut graph, 1, StepCommand::AwaitApproval).unwrap();

        apply(
            &mut graph,
            1,
            StepCommand::Edit(StepPatch {
                requires_approval: Some(false),
                goal: Some("Build the thing".to_string()),
                ..Default::default()
            }),
        )
        .unwrap();

        let step = graph.step(1).unwrap();
        assert_eq!(step.status, StepStatus::Ready);
        assert_eq!(step.goal, "Build the thing");

        apply(&mut graph, 1, StepCommand::Claim).unwrap();
        let edit = apply(&mut graph, 1, StepCommand::Edit(StepPatch::default()));
        assert!(edit.unwrap_err().is_conflict());
    }
}
