use crate::condition::ConditionRegistry;
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::storage::GraphStore;
use crate::types::{ProjectId, Step, StepId, StepStatus};
use crate::workflow::transition::StepCommand;
use std::sync::Arc;

/// Reason recorded when a rejection carries none
pub const DEFAULT_REJECTION_REASON: &str = "Rejected";

/// Human decisions on gated steps.
///
/// The approval id is the gated step's id. All approval state lives on the
/// step itself, so pending decisions survive restarts.
pub struct ApprovalGate {
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    conditions: Arc<ConditionRegistry>,
}

impl ApprovalGate {
    pub fn new(store: Arc<dyn GraphStore>, bus: Arc<EventBus>, conditions: Arc<ConditionRegistry>) -> Self {
        Self { store, bus, conditions }
    }

    /// Release a step waiting for approval back to `ready`
    pub fn approve_step(&self, approval_id: &StepId) -> EngineResult<Step> {
        let step = self.decide(approval_id, StepCommand::Approve)?;
        tracing::info!("Approved step {} of project {}", step.step_number, step.project_id);
        Ok(step)
    }

    /// Fail a step waiting for approval; it is never retried
    pub fn reject_step(&self, approval_id: &StepId, reason: Option<String>) -> EngineResult<Step> {
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string());

        let step = self.decide(approval_id, StepCommand::Reject { reason })?;
        tracing::info!(
            "Rejected step {} of project {}: {}",
            step.step_number,
            step.project_id,
            step.error_message.as_deref().unwrap_or(DEFAULT_REJECTION_REASON)
        );
        Ok(step)
    }

    /// Steps of a project currently waiting for a decision
    pub fn pending_approvals(&self, project_id: &ProjectId) -> EngineResult<Vec<Step>> {
        let detail = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| EngineError::NotFound(format!("Project {}", project_id)))?;

        Ok(detail
            .steps
            .into_iter()
            .filter(|s| s.status == StepStatus::AwaitingApproval)
            .collect())
    }

    fn decide(&self, approval_id: &StepId, command: StepCommand) -> EngineResult<Step> {
        let step = self
            .store
            .find_step(approval_id)?
            .ok_or_else(|| EngineError::NotFound(format!("Approval {}", approval_id)))?;

        let transition = self
            .store
            .apply(&step.project_id, step.step_number, command, &self.conditions)
            .map_err(|e| match e {
                EngineError::Conflict { step_number, status } => EngineError::InvalidState(format!(
                    "Step {} is {}, not awaiting approval",
                    step_number, status
                )),
                other => other,
            })?;

        self.bus.publish(&transition.events);
        Ok(transition.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedbGraphStore;
    use crate::types::*;
    use crate::workflow::transition::ProjectCommand;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn GraphStore>,
        gate: ApprovalGate,
        conditions: Arc<ConditionRegistry>,
        project: ProjectDetail,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn GraphStore> = Arc::new(RedbGraphStore::new(dir.path().join("db.redb")).unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 16, Duration::from_millis(50)));
        let conditions = Arc::new(ConditionRegistry::with_builtins());
        let gate = ApprovalGate::new(store.clone(), bus, conditions.clone());

        let request = NewProject {
            name: "gated".to_string(),
            description: None,
            project_type: "service".to_string(),
            steps: vec![
                NewStep {
                    step_number: 1,
                    goal: "Deploy to production".to_string(),
                    action: StepAction::Deploy,
                    artifact: None,
                    agent_name: None,
                    requires_approval: true,
                    max_retries: None,
                    dependencies: vec![],
                },
                NewStep {
                    step_number: 2,
                    goal: "Smoke test".to_string(),
                    action: StepAction::Test,
                    artifact: None,
                    agent_name: None,
                    requires_approval: false,
                    max_retries: None,
                    dependencies: vec![DependencySpec::Step(1)],
                },
            ],
        };
        let project = store.create_project(request, 2).unwrap().detail;
        let id = project.project.id;
        store.control(&id, ProjectCommand::Start).unwrap();
        store.apply(&id, 1, StepCommand::Promote, &conditions).unwrap();
        store.apply(&id, 1, StepCommand::AwaitApproval, &conditions).unwrap();

        Fixture {
            _dir: dir,
            store,
            gate,
            conditions,
            project,
        }
    }

    #[test]
    fn test_approve_releases_step() {
        let f = fixture();
        let approval_id = f.project.steps[0].id;

        assert_eq!(f.gate.pending_approvals(&f.project.project.id).unwrap().len(), 1);

        let step = f.gate.approve_step(&approval_id).unwrap();
        assert_eq!(step.status, StepStatus::Ready);
        assert!(step.approved_at.is_some());
        assert!(f.gate.pending_approvals(&f.project.project.id).unwrap().is_empty());

        // Approved steps go through the normal claim path
        let claimed = f
            .store
            .apply(&f.project.project.id, 1, StepCommand::Claim, &f.conditions)
            .unwrap();
        assert_eq!(claimed.step.status, StepStatus::InProgress);
    }

    #[test]
    fn test_reject_fails_step_and_blocks_dependents() {
        let f = fixture();
        let step = f
            .gate
            .reject_step(&f.project.steps[0].id, Some("not safe".to_string()))
            .unwrap();

        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error_message.as_deref(), Some("not safe"));
        assert_eq!(step.retry_count, 0);

        let detail = f.store.get_project(&f.project.project.id).unwrap().unwrap();
        assert_eq!(detail.steps[1].status, StepStatus::Blocked);
        assert_eq!(detail.project.status, ProjectStatus::Failed);
    }

    #[test]
    fn test_reject_without_reason_uses_default() {
        let f = fixture();
        let step = f.gate.reject_step(&f.project.steps[0].id, Some("  ".to_string())).unwrap();
        assert_eq!(step.error_message.as_deref(), Some(DEFAULT_REJECTION_REASON));
    }

    #[test]
    fn test_decision_requires_waiting_step() {
        let f = fixture();
        f.gate.approve_step(&f.project.steps[0].id).unwrap();

        let again = f.gate.approve_step(&f.project.steps[0].id);
        assert!(matches!(again, Err(EngineError::InvalidState(_))));

        let not_gated = f.gate.reject_step(&f.project.steps[1].id, None);
        assert!(matches!(not_gated, Err(EngineError::InvalidState(_))));

        let unknown = f.gate.approve_step(&StepId::new());
        assert!(unknown.unwrap_err().is_not_found());
    }
}
