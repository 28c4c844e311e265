use crate::types::{ProjectId, Step, StepAction, StepId, StepNumber};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What a runner receives for one attempt of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRequest {
    pub project_id: ProjectId,
    pub step_id: StepId,
    pub step_number: StepNumber,
    pub action: StepAction,
    pub artifact: Option<String>,
    pub agent_name: Option<String>,
    pub goal: String,
    /// 1 for the first attempt
    pub attempt: u32,
}

impl StepRequest {
    pub fn for_step(step: &Step) -> Self {
        Self {
            project_id: step.project_id,
            step_id: step.id,
            step_number: step.step_number,
            action: step.action,
            artifact: step.artifact.clone(),
            agent_name: step.agent_name.clone(),
            goal: step.goal.clone(),
            attempt: step.retry_count + 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default)]
    pub output: Option<String>,
}

/// Carries out the side effects of a step.
///
/// An `Err` is a step execution failure and counts against the step's
/// retries. Runners should stop promptly once `cancel` fires.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<StepOutput>;
}

/// Runner lookup: `agent_name` overrides, then the step's action
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    by_action: HashMap<StepAction, Arc<dyn StepRunner>>,
    by_agent: HashMap<String, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same runner for every action
    pub fn with_default(runner: Arc<dyn StepRunner>) -> Self {
        let mut registry = Self::new();
        for action in StepAction::ALL {
            registry.register_action(action, runner.clone());
        }
        registry
    }

    pub fn register_action(&mut self, action: StepAction, runner: Arc<dyn StepRunner>) {
        self.by_action.insert(action, runner);
    }

    pub fn register_agent(&mut self, agent_name: impl Into<String>, runner: Arc<dyn StepRunner>) {
        self.by_agent.insert(agent_name.into(), runner);
    }

    pub fn resolve(&self, step: &Step) -> Option<Arc<dyn StepRunner>> {
        step.agent_name
            .as_deref()
            .and_then(|agent| self.by_agent.get(agent))
            .or_else(|| self.by_action.get(&step.action))
            .cloned()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<&str> = self.by_action.keys().map(|a| a.as_str()).collect();
        actions.sort_unstable();
        let mut agents: Vec<&String> = self.by_agent.keys().collect();
        agents.sort();
        f.debug_struct("RunnerRegistry")
            .field("actions", &actions)
            .field("agents", &agents)
            .finish()
    }
}
