use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Position of a step inside its project's plan
pub type StepNumber = u32;

/// Unique identifier for a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a step. Also serves as the approval id of a gated step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub Uuid);

impl StepId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StepId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Status of a project, cached from the states of its steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Ready,
    Executing,
    Paused,
    Completed,
    Failed,
}

impl ProjectStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    InProgress,
    Done,
    Failed,
    Blocked,
    AwaitingApproval,
}

impl StepStatus {
    /// Done, failed and blocked steps never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Blocked)
    }

    /// Steps that can still make progress
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a step performs; selects the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Build,
    Modify,
    Run,
    Test,
    Deploy,
}

impl StepAction {
    pub const ALL: [StepAction; 5] = [
        StepAction::Build,
        StepAction::Modify,
        StepAction::Run,
        StepAction::Test,
        StepAction::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Modify => "modify",
            Self::Run => "run",
            Self::Test => "test",
            Self::Deploy => "deploy",
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dependency edge constrains its dependent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    /// The dependency must be done
    #[default]
    Requires,
    /// The dependency must be finished, successfully or not
    Optional,
    /// Resolved by a registered predicate; behaves like `Optional` without one
    Conditional,
}

/// A project: one plan, its steps, and its execution summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub project_type: String,
    pub status: ProjectStatus,
    pub total_steps: u32,
    pub completed_steps: u32,
    pub failed_steps: u32,
    #[serde(default)]
    pub pause_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single step of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: StepId,
    pub project_id: ProjectId,
    pub step_number: StepNumber,
    pub goal: String,
    pub action: StepAction,
    pub artifact: Option<String>,
    pub agent_name: Option<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub requires_approval: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    /// Earliest time a scheduled retry may be claimed
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Directed edge: `step_number` depends on `depends_on`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub step_number: StepNumber,
    pub depends_on: StepNumber,
    #[serde(default)]
    pub dependency_type: DependencyType,
    /// Name of the predicate resolving a conditional edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Request to create a project together with its whole plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub project_type: String,
    pub steps: Vec<NewStep>,
}

/// One step of a creation request, with its dependencies inline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    pub step_number: StepNumber,
    pub goal: String,
    pub action: StepAction,
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

/// Inline dependency: either a bare step number (`requires`) or a typed edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    Step(StepNumber),
    Edge {
        #[serde(rename = "stepNumber", alias = "dependsOn")]
        depends_on: StepNumber,
        #[serde(rename = "type", default)]
        dependency_type: DependencyType,
        #[serde(default)]
        condition: Option<String>,
    },
}

impl DependencySpec {
    /// Resolve into a stored edge for the given dependent step
    pub fn to_dependency(&self, step_number: StepNumber) -> Dependency {
        match self {
            Self::Step(n) => Dependency {
                step_number,
                depends_on: *n,
                dependency_type: DependencyType::Requires,
                condition: None,
            },
            Self::Edge {
                depends_on,
                dependency_type,
                condition,
            } => Dependency {
                step_number,
                depends_on: *depends_on,
                dependency_type: *dependency_type,
                condition: condition.clone(),
            },
        }
    }
}

/// Project with all of its steps and edges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDetail {
    pub project: Project,
    pub steps: Vec<Step>,
    pub dependencies: Vec<Dependency>,
}

/// Visualization view of a project's graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphView {
    pub project_id: ProjectId,
    pub status: ProjectStatus,
    pub nodes: Vec<GraphNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub step_number: StepNumber,
    pub step_id: StepId,
    pub goal: String,
    pub action: StepAction,
    pub status: StepStatus,
    pub dependencies: Vec<StepNumber>,
    pub dependents: Vec<StepNumber>,
}

/// Filter and paging for project listings
#[derive(Debug, Clone)]
pub struct ProjectQuery {
    pub status: Option<ProjectStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl ProjectQuery {
    pub fn with_status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

impl Default for ProjectQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: usize::MAX,
            offset: 0,
        }
    }
}

/// One page of a listing plus the unpaged total
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Editable step fields before the step starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepPatch {
    pub goal: Option<String>,
    pub action: Option<StepAction>,
    pub artifact: Option<String>,
    pub agent_name: Option<String>,
    pub requires_approval: Option<bool>,
    pub max_retries: Option<u32>,
}

impl StepPatch {
    pub fn is_empty(&self) -> bool {
        self.goal.is_none()
            && self.action.is_none()
            && self.artifact.is_none()
            && self.agent_name.is_none()
            && self.requires_approval.is_none()
            && self.max_retries.is_none()
    }
}
