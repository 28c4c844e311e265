//! Project lifecycle entry point.
//!
//! The controller owns the only process-local execution state: one run-loop
//! handle per executing project, kept for waking and cancellation. Everything
//! else is read from and written to the [`GraphStore`].

use crate::approval::ApprovalGate;
use crate::condition::ConditionRegistry;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::events::{EventBus, ExecutionEvent};
use crate::runner::RunnerRegistry;
use crate::scheduler::Scheduler;
use crate::storage::GraphStore;
use crate::types::*;
use crate::workflow::executor::Executor;
use crate::workflow::step_executor::StepExecutor;
use crate::workflow::transition::{ProjectCommand, StepCommand};
use futures::{FutureExt, Stream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type RunMap = Arc<RwLock<HashMap<ProjectId, RunHandle>>>;

struct RunHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct ProjectController {
    store: Arc<dyn GraphStore>,
    bus: Arc<EventBus>,
    executor: Arc<Executor>,
    approvals: ApprovalGate,
    conditions: Arc<ConditionRegistry>,
    config: EngineConfig,
    shutdown: CancellationToken,
    // Track active run loops for waking and cancellation
    runs: RunMap,
}

impl ProjectController {
    pub fn new(store: Arc<dyn GraphStore>, runners: RunnerRegistry, config: EngineConfig) -> Self {
        Self::with_conditions(store, runners, config, ConditionRegistry::with_builtins())
    }

    pub fn with_conditions(
        store: Arc<dyn GraphStore>,
        runners: RunnerRegistry,
        config: EngineConfig,
        conditions: ConditionRegistry,
    ) -> Self {
        let conditions = Arc::new(conditions);
        let bus = Arc::new(EventBus::new(store.clone(), config.event_buffer, config.poll_interval()));
        let executor = Arc::new(Executor::new(
            store.clone(),
            bus.clone(),
            StepExecutor::new(runners, config.step_timeout()),
            Scheduler::new(conditions.clone()),
            config.retry.clone(),
            config.max_concurrency,
            config.poll_interval(),
        ));
        let approvals = ApprovalGate::new(store.clone(), bus.clone(), conditions.clone());

        Self {
            store,
            bus,
            executor,
            approvals,
            conditions,
            config,
            shutdown: CancellationToken::new(),
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validate and persist a new project in `ready` state
    pub fn create_project(&self, request: NewProject) -> EngineResult<ProjectDetail> {
        let created = self
            .store
            .create_project(request, self.config.retry.default_max_retries)?;
        self.bus.publish(&created.events);
        Ok(created.detail)
    }

    pub fn get_project(&self, project_id: &ProjectId) -> EngineResult<ProjectDetail> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| not_found(project_id))
    }

    pub fn list_projects(&self, query: &ProjectQuery) -> EngineResult<Page<Project>> {
        self.store.list_projects(query)
    }

    pub fn get_graph(&self, project_id: &ProjectId) -> EngineResult<GraphView> {
        self.store
            .get_graph(project_id)?
            .ok_or_else(|| not_found(project_id))
    }

    /// Durable events with `seq > after_seq`
    pub fn events(&self, project_id: &ProjectId, after_seq: u64, limit: usize) -> EngineResult<Vec<ExecutionEvent>> {
        if self.store.get_project(project_id)?.is_none() {
            return Err(not_found(project_id));
        }
        self.store.events_after(project_id, after_seq, limit)
    }

    /// Start or resume execution. Idempotent: an executing project keeps its
    /// run loop and a finished project is returned unchanged.
    pub async fn execute(&self, project_id: &ProjectId) -> EngineResult<Project> {
        let project = self.get_project(project_id)?.project;
        if project.status.is_terminal() {
            return Ok(project);
        }

        let transition = self.store.control(project_id, ProjectCommand::Start)?;
        self.bus.publish(&transition.events);

        if transition.project.status == ProjectStatus::Executing {
            if project.status != ProjectStatus::Executing {
                tracing::info!("Executing project {} ({})", project_id, transition.project.name);
            }
            self.ensure_running(*project_id).await;
        }

        Ok(transition.project)
    }

    /// Stop claiming new steps. In-flight steps finish normally and the
    /// project reports `paused` once none is left.
    pub async fn pause(&self, project_id: &ProjectId) -> EngineResult<Project> {
        if self.store.get_project(project_id)?.is_none() {
            return Err(not_found(project_id));
        }

        let transition = self.store.control(project_id, ProjectCommand::RequestPause)?;
        self.bus.publish(&transition.events);
        self.wake(project_id).await;

        tracing::info!("Pause requested for project {} (now {})", project_id, transition.project.status);
        Ok(transition.project)
    }

    /// Cancel the project's run loop and in-flight steps, then remove it
    pub async fn delete(&self, project_id: &ProjectId) -> EngineResult<()> {
        let handle = self.runs.write().await.remove(project_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!("Run loop for project {} ended abnormally: {}", project_id, e);
            }
        }

        if !self.store.delete_project(project_id)? {
            return Err(not_found(project_id));
        }
        self.bus.publish_deleted(*project_id);
        Ok(())
    }

    pub async fn approve_step(&self, approval_id: &StepId) -> EngineResult<Step> {
        let step = self.approvals.approve_step(approval_id)?;
        self.kick(&step.project_id).await?;
        Ok(step)
    }

    pub async fn reject_step(&self, approval_id: &StepId, reason: Option<String>) -> EngineResult<Step> {
        let step = self.approvals.reject_step(approval_id, reason)?;
        self.kick(&step.project_id).await?;
        Ok(step)
    }

    pub fn pending_approvals(&self, project_id: &ProjectId) -> EngineResult<Vec<Step>> {
        self.approvals.pending_approvals(project_id)
    }

    /// Edit a step that has not started yet
    pub async fn update_step(&self, step_id: &StepId, patch: StepPatch) -> EngineResult<Step> {
        if patch.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "body",
                reason: "no fields to update".to_string(),
            }
            .into());
        }

        let step = self
            .store
            .find_step(step_id)?
            .ok_or_else(|| EngineError::NotFound(format!("Step {}", step_id)))?;

        let transition = self.store.apply(
            &step.project_id,
            step.step_number,
            StepCommand::Edit(patch),
            &self.conditions,
        )?;
        self.bus.publish(&transition.events);
        self.kick(&step.project_id).await?;

        Ok(transition.step)
    }

    /// Live event stream for a project, replaying everything after `after_seq`
    pub fn stream(
        &self,
        project_id: &ProjectId,
        after_seq: u64,
    ) -> EngineResult<impl Stream<Item = EngineResult<ExecutionEvent>> + Send + 'static> {
        if self.store.get_project(project_id)?.is_none() {
            return Err(not_found(project_id));
        }
        Ok(self.bus.stream(*project_id, after_seq))
    }

    /// Pick up projects left executing by a previous process.
    /// Returns how many run loops were started.
    pub async fn recover(&self) -> EngineResult<usize> {
        let executing = self
            .store
            .list_projects(&ProjectQuery::with_status(ProjectStatus::Executing))?;

        let mut resumed = 0;
        for project in executing.items {
            if self.config.recover_in_progress {
                self.requeue_in_progress(&project.id)?;
            }
            self.kick(&project.id).await?;
            resumed += 1;
        }

        if resumed > 0 {
            tracing::info!("Recovered {} executing projects", resumed);
        }
        Ok(resumed)
    }

    /// Stop every run loop; in-flight steps are requeued for the next start
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<(ProjectId, RunHandle)> = self.runs.write().await.drain().collect();
        for (project_id, handle) in handles {
            if let Err(e) = handle.task.await {
                tracing::warn!("Run loop for project {} ended abnormally: {}", project_id, e);
            }
        }
        tracing::info!("Project controller stopped");
    }

    /// Number of projects with a live run loop
    pub async fn active_runs(&self) -> usize {
        self.runs
            .read()
            .await
            .values()
            .filter(|h| !h.task.is_finished())
            .count()
    }

    fn requeue_in_progress(&self, project_id: &ProjectId) -> EngineResult<()> {
        let Some(detail) = self.store.get_project(project_id)? else {
            return Ok(());
        };

        for step in detail.steps.iter().filter(|s| s.status == StepStatus::InProgress) {
            match self
                .store
                .apply(project_id, step.step_number, StepCommand::Requeue, &self.conditions)
            {
                Ok(transition) => {
                    tracing::warn!(
                        "Requeued step {} of project {} left in progress",
                        step.step_number,
                        project_id
                    );
                    self.bus.publish(&transition.events);
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Make sure an executing, unpaused project has a run loop and that it
    /// looks at the latest state
    async fn kick(&self, project_id: &ProjectId) -> EngineResult<()> {
        let Some(detail) = self.store.get_project(project_id)? else {
            return Ok(());
        };
        let project = detail.project;

        if project.status == ProjectStatus::Executing && !project.pause_requested {
            self.ensure_running(*project_id).await;
        } else {
            self.wake(project_id).await;
        }
        Ok(())
    }

    async fn wake(&self, project_id: &ProjectId) {
        if let Some(handle) = self.runs.read().await.get(project_id) {
            handle.wake.notify_one();
        }
    }

    async fn ensure_running(&self, project_id: ProjectId) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut runs = self.runs.write().await;
        if let Some(handle) = runs.get(&project_id) {
            // The loop re-checks for a wake-up under this lock before it exits
            if !handle.task.is_finished() {
                handle.wake.notify_one();
                return;
            }
            tracing::warn!("Run loop for project {} died, restarting", project_id);
        }

        let cancel = self.shutdown.child_token();
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(supervise(
            self.executor.clone(),
            self.runs.clone(),
            project_id,
            cancel.clone(),
            wake.clone(),
        ));

        runs.insert(project_id, RunHandle { cancel, wake, task });
    }
}

/// Run a project's loop until it goes idle with no wake-up pending, then
/// deregister it
async fn supervise(
    executor: Arc<Executor>,
    runs: RunMap,
    project_id: ProjectId,
    cancel: CancellationToken,
    wake: Arc<Notify>,
) {
    loop {
        executor
            .clone()
            .run_project(project_id, cancel.clone(), wake.clone())
            .await;

        let mut runs = runs.write().await;
        if !cancel.is_cancelled() && wake.notified().now_or_never().is_some() {
            continue;
        }
        if runs
            .get(&project_id)
            .is_some_and(|handle| Arc::ptr_eq(&handle.wake, &wake))
        {
            runs.remove(&project_id);
        }
        break;
    }
}

fn not_found(project_id: &ProjectId) -> EngineError {
    EngineError::NotFound(format!("Project {}", project_id))
}
