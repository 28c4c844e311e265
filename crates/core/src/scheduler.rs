//! Ready-frontier computation.
//!
//! A step may start once every incoming edge is satisfied: `requires` edges
//! need a done dependency, `optional` edges only need it finished, and
//! `conditional` edges need it finished and accepted by their predicate.

use crate::condition::ConditionRegistry;
use crate::types::{Dependency, DependencyType, Step, StepNumber, StepStatus};
use crate::workflow::dag::ProjectGraph;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// How one edge currently constrains its dependent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    Satisfied,
    /// The dependency has not finished yet
    Waiting,
    /// The dependent can never run through this edge
    Broken,
}

/// Evaluate one edge against the current state of its dependency
pub fn edge_state(edge: &Dependency, dependency: &Step, conditions: &ConditionRegistry) -> EdgeState {
    let finished = dependency.status.is_terminal();

    match edge.dependency_type {
        DependencyType::Requires => match dependency.status {
            StepStatus::Done => EdgeState::Satisfied,
            StepStatus::Failed | StepStatus::Blocked => EdgeState::Broken,
            _ => EdgeState::Waiting,
        },
        DependencyType::Optional => {
            if finished {
                EdgeState::Satisfied
            } else {
                EdgeState::Waiting
            }
        }
        DependencyType::Conditional => match conditions.predicate_for(edge) {
            _ if !finished => EdgeState::Waiting,
            None => EdgeState::Satisfied,
            Some(predicate) if predicate.evaluate(dependency) => EdgeState::Satisfied,
            Some(_) => EdgeState::Broken,
        },
    }
}

/// Whether a step can be claimed right now
pub fn is_step_ready(
    graph: &ProjectGraph,
    step: &Step,
    conditions: &ConditionRegistry,
    now: DateTime<Utc>,
) -> bool {
    match step.status {
        StepStatus::Ready => {}
        StepStatus::Pending => {
            if step.next_attempt_at.is_some_and(|at| at > now) {
                return false;
            }
        }
        _ => return false,
    }

    graph.dependencies_of(step.step_number).all(|edge| {
        graph
            .step(edge.depends_on)
            .is_some_and(|dep| edge_state(edge, dep, conditions) == EdgeState::Satisfied)
    })
}

/// Result of one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePlan {
    /// Claimable steps in ascending step-number order
    pub ready: Vec<StepNumber>,
    /// Earliest pending retry that is not due yet
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Computes the ready frontier of a project
#[derive(Debug, Clone)]
pub struct Scheduler {
    conditions: Arc<ConditionRegistry>,
}

impl Scheduler {
    pub fn new(conditions: Arc<ConditionRegistry>) -> Self {
        Self { conditions }
    }

    pub fn conditions(&self) -> &ConditionRegistry {
        &self.conditions
    }

    pub fn plan(&self, graph: &ProjectGraph, now: DateTime<Utc>) -> SchedulePlan {
        let mut plan = SchedulePlan::default();

        // Steps are kept ordered by number, so the frontier comes out sorted
        for step in &graph.steps {
            if is_step_ready(graph, step, &self.conditions, now) {
                plan.ready.push(step.step_number);
            } else if step.status == StepStatus::Pending {
                if let Some(at) = step.next_attempt_at.filter(|at| *at > now) {
                    plan.next_retry_at = Some(plan.next_retry_at.map_or(at, |cur| cur.min(at)));
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use chrono::Duration;

    fn step(number: StepNumber, status: StepStatus) -> Step {
        let now = Utc::now();
        Step {
            id: StepId::new(),
            project_id: ProjectId::default(),
            step_number: number,
            goal: format!("Step {}", number),
            action: StepAction::Build,
            artifact: None,
            agent_name: None,
            status,
            retry_count: 0,
            max_retries: 0,
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
        }
    }

    fn edge(step: StepNumber, on: StepNumber, kind: DependencyType) -> Dependency {
        Dependency {
            step_number: step,
            depends_on: on,
            dependency_type: kind,
            condition: None,
        }
    }

    fn graph(steps: Vec<Step>, dependencies: Vec<Dependency>) -> ProjectGraph {
        let now = Utc::now();
        ProjectGraph {
            project: Project {
                id: ProjectId::default(),
                name: "test".to_string(),
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

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(ConditionRegistry::with_builtins()))
    }

    #[test]
    fn test_join_waits_for_all_requirements() {
        let g = graph(
            vec![
                step(1, StepStatus::Pending),
                step(2, StepStatus::Pending),
                step(3, StepStatus::Pending),
            ],
            vec![
                edge(3, 1, DependencyType::Requires),
                edge(3, 2, DependencyType::Requires),
            ],
        );
        assert_eq!(scheduler().plan(&g, Utc::now()).ready, vec![1, 2]);

        let g = graph(
            vec![
                step(1, StepStatus::Done),
                step(2, StepStatus::InProgress),
                step(3, StepStatus::Pending),
            ],
            g.dependencies.clone(),
        );
        assert!(scheduler().plan(&g, Utc::now()).ready.is_empty());

        let g = graph(
            vec![
                step(1, StepStatus::Done),
                step(2, StepStatus::Done),
                step(3, StepStatus::Pending),
            ],
            g.dependencies.clone(),
        );
        assert_eq!(scheduler().plan(&g, Utc::now()).ready, vec![3]);
    }

    #[test]
    fn test_optional_edges_never_block() {
        let g = graph(
            vec![step(1, StepStatus::Failed), step(2, StepStatus::Pending)],
            vec![edge(2, 1, DependencyType::Optional)],
        );
        assert_eq!(scheduler().plan(&g, Utc::now()).ready, vec![2]);

        let g = graph(
            vec![step(1, StepStatus::InProgress), step(2, StepStatus::Pending)],
            vec![edge(2, 1, DependencyType::Optional)],
        );
        assert!(scheduler().plan(&g, Utc::now()).ready.is_empty());
    }

    #[test]
    fn test_conditional_without_predicate_acts_optional() {
        let failed = step(1, StepStatus::Failed);
        let conditional = edge(2, 1, DependencyType::Conditional);
        let registry = ConditionRegistry::with_builtins();

        assert_eq!(edge_state(&conditional, &failed, &registry), EdgeState::Satisfied);

        let mut unknown = conditional.clone();
        unknown.condition = Some("not_registered".to_string());
        assert_eq!(edge_state(&unknown, &failed, &registry), EdgeState::Satisfied);
    }

    #[test]
    fn test_conditional_predicates() {
        let registry = ConditionRegistry::with_builtins();
        let mut on_success = edge(2, 1, DependencyType::Conditional);
        on_success.condition = Some("on_success".to_string());
        let mut on_failure = on_success.clone();
        on_failure.condition = Some("on_failure".to_string());

        let done = step(1, StepStatus::Done);
        let failed = step(1, StepStatus::Failed);
        let running = step(1, StepStatus::InProgress);

        assert_eq!(edge_state(&on_success, &done, &registry), EdgeState::Satisfied);
        assert_eq!(edge_state(&on_success, &failed, &registry), EdgeState::Broken);
        assert_eq!(edge_state(&on_failure, &done, &registry), EdgeState::Broken);
        assert_eq!(edge_state(&on_failure, &failed, &registry), EdgeState::Satisfied);
        assert_eq!(edge_state(&on_success, &running, &registry), EdgeState::Waiting);
    }

    #[test]
    fn test_retry_backoff_delays_readiness() {
        let now = Utc::now();
        let mut retrying = step(1, StepStatus::Pending);
        retrying.next_attempt_at = Some(now + Duration::seconds(5));
        let g = graph(vec![retrying, step(2, StepStatus::Ready)], vec![]);

        let plan = scheduler().plan(&g, now);
        assert_eq!(plan.ready, vec![2]);
        assert_eq!(plan.next_retry_at, Some(now + Duration::seconds(5)));

        let later = scheduler().plan(&g, now + Duration::seconds(6));
        assert_eq!(later.ready, vec![1, 2]);
        assert_eq!(later.next_retry_at, None);
    }

    #[test]
    fn test_gated_and_running_steps_are_not_ready() {
        let g = graph(
            vec![
                step(1, StepStatus::AwaitingApproval),
                step(2, StepStatus::InProgress),
                step(3, StepStatus::Blocked),
            ],
            vec![],
        );
        assert!(scheduler().plan(&g, Utc::now()).ready.is_empty());
    }
}
