use crate::condition::ConditionRegistry;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventType, ExecutionEvent, NewEvent};
use crate::types::*;
use crate::workflow::dag::{validate_plan, ProjectGraph};
use crate::workflow::transition::{self, ProjectCommand, StepCommand};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

const PROJECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");
const STEPS_TABLE: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("steps");
const STEP_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("step_index");
const DEPENDENCIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dependencies");
const EVENTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("events");
const EVENT_SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("event_seq");

/// Outcome of a committed step command
#[derive(Debug, Clone)]
pub struct StepTransition {
    pub project: Project,
    pub step: Step,
    /// Events appended by the transaction, in sequence order
    pub events: Vec<ExecutionEvent>,
}

/// Outcome of a committed project command
#[derive(Debug, Clone)]
pub struct ProjectTransition {
    pub project: Project,
    pub events: Vec<ExecutionEvent>,
}

/// A freshly created project and its `project_created` event
#[derive(Debug, Clone)]
pub struct CreatedProject {
    pub detail: ProjectDetail,
    pub events: Vec<ExecutionEvent>,
}

/// Durable storage for projects, steps, dependencies and the event log.
///
/// Every mutating call is atomic: the state change, its derived changes and
/// the events describing them commit together or not at all.
pub trait GraphStore: Send + Sync {
    /// Validate a plan and persist it in full
    fn create_project(&self, request: NewProject, default_max_retries: u32) -> EngineResult<CreatedProject>;

    fn load_graph(&self, project_id: &ProjectId) -> EngineResult<Option<ProjectGraph>>;

    /// Projects newest first, with the total before paging
    fn list_projects(&self, query: &ProjectQuery) -> EngineResult<Page<Project>>;

    /// Look up a step by its id
    fn find_step(&self, step_id: &StepId) -> EngineResult<Option<Step>>;

    /// Apply a step command as a compare-and-set on the step's status
    fn apply(
        &self,
        project_id: &ProjectId,
        step_number: StepNumber,
        command: StepCommand,
        conditions: &ConditionRegistry,
    ) -> EngineResult<StepTransition>;

    fn control(&self, project_id: &ProjectId, command: ProjectCommand) -> EngineResult<ProjectTransition>;

    /// Append an event with the project's next sequence number
    fn append_event(&self, project_id: &ProjectId, event: NewEvent) -> EngineResult<ExecutionEvent>;

    /// Events with `seq > after_seq`, oldest first
    fn events_after(&self, project_id: &ProjectId, after_seq: u64, limit: usize) -> EngineResult<Vec<ExecutionEvent>>;

    /// Remove a project with its steps, dependencies and events
    fn delete_project(&self, project_id: &ProjectId) -> EngineResult<bool>;

    fn get_project(&self, project_id: &ProjectId) -> EngineResult<Option<ProjectDetail>> {
        Ok(self.load_graph(project_id)?.map(ProjectGraph::into_detail))
    }

    fn get_graph(&self, project_id: &ProjectId) -> EngineResult<Option<GraphView>> {
        self.load_graph(project_id)?.map(|graph| graph.view()).transpose()
    }
}

/// Where a step lives, keyed by step id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StepLocation {
    project_id: ProjectId,
    step_number: StepNumber,
}

/// GraphStore backed by a redb database file
#[derive(Clone)]
pub struct RedbGraphStore {
    db: Arc<Database>,
}

impl RedbGraphStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            write_txn
                .open_table(PROJECTS_TABLE)
                .context("Failed to open projects table")?;
            write_txn
                .open_table(STEPS_TABLE)
                .context("Failed to open steps table")?;
            write_txn
                .open_table(STEP_INDEX_TABLE)
                .context("Failed to open step index table")?;
            write_txn
                .open_table(DEPENDENCIES_TABLE)
                .context("Failed to open dependencies table")?;
            write_txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;
            write_txn
                .open_table(EVENT_SEQ_TABLE)
                .context("Failed to open event sequence table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Run `f` in one write transaction; commit on success, abort otherwise
    fn transact<T>(&self, f: impl FnOnce(&WriteTransaction) -> EngineResult<T>) -> EngineResult<T> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;

        match f(&write_txn) {
            Ok(value) => {
                write_txn.commit().context("Failed to commit")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = write_txn.abort() {
                    tracing::warn!("Failed to abort transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Load a graph inside a write transaction, apply `mutate`, write back
    /// whatever changed and append the resulting events
    fn mutate_graph(
        &self,
        project_id: &ProjectId,
        mutate: impl FnOnce(&mut ProjectGraph, DateTime<Utc>) -> EngineResult<Vec<NewEvent>>,
    ) -> EngineResult<(ProjectGraph, Vec<ExecutionEvent>)> {
        self.transact(|txn| {
            let now = Utc::now();
            let mut graph = load_graph_in(txn, project_id)?
                .ok_or_else(|| EngineError::NotFound(format!("Project {}", project_id)))?;
            let before = graph.clone();

            let new_events = mutate(&mut graph, now)?;

            if graph.project != before.project {
                write_project(txn, &graph.project)?;
            }
            let changed: Vec<&Step> = graph
                .steps
                .iter()
                .zip(before.steps.iter())
                .filter(|(after, before)| after != before)
                .map(|(after, _)| after)
                .collect();
            write_steps(txn, project_id, changed)?;

            let events = append_events(txn, project_id, new_events, now)?;
            Ok((graph, events))
        })
    }
}

impl GraphStore for RedbGraphStore {
    fn create_project(&self, request: NewProject, default_max_retries: u32) -> EngineResult<CreatedProject> {
        let (_dag, dependencies) = validate_plan(&request)?;
        let now = Utc::now();
        let project_id = ProjectId::new();

        let mut steps: Vec<Step> = request
            .steps
            .into_iter()
            .map(|s| Step {
                id: StepId::new(),
                project_id,
                step_number: s.step_number,
                goal: s.goal,
                action: s.action,
                artifact: s.artifact,
                agent_name: s.agent_name,
                status: StepStatus::Pending,
                retry_count: 0,
                max_retries: s.max_retries.unwrap_or(default_max_retries),
                output: None,
                error_message: None,
                requires_approval: s.requires_approval,
                approved_at: None,
                execution_time_ms: None,
                next_attempt_at: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            })
            .collect();
        steps.sort_by_key(|s| s.step_number);

        let project = Project {
            id: project_id,
            name: request.name,
            description: request.description,
            project_type: request.project_type,
            status: ProjectStatus::Ready,
            total_steps: steps.len() as u32,
            completed_steps: 0,
            failed_steps: 0,
            pause_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        let created = NewEvent::project(
            EventType::ProjectCreated,
            format!("Project {} created with {} steps", project.name, steps.len()),
        )
        .with_data(serde_json::json!({ "totalSteps": project.total_steps }));

        let events = self.transact(|txn| {
            write_project(txn, &project)?;
            write_steps(txn, &project_id, steps.iter())?;
            {
                let mut index = txn
                    .open_table(STEP_INDEX_TABLE)
                    .context("Failed to open step index table")?;
                for step in &steps {
                    let location = StepLocation {
                        project_id,
                        step_number: step.step_number,
                    };
                    let value = serde_json::to_vec(&location).context("Failed to serialize step location")?;
                    index
                        .insert(step.id.to_string().as_str(), value.as_slice())
                        .context("Failed to index step")?;
                }

                let mut deps = txn
                    .open_table(DEPENDENCIES_TABLE)
                    .context("Failed to open dependencies table")?;
                let value = serde_json::to_vec(&dependencies).context("Failed to serialize dependencies")?;
                deps.insert(project_id.to_string().as_str(), value.as_slice())
                    .context("Failed to insert dependencies")?;
            }
            Ok(append_events(txn, &project_id, vec![created], now)?)
        })?;

        tracing::info!("Created project {} ({} steps)", project_id, steps.len());

        Ok(CreatedProject {
            detail: ProjectDetail {
                project,
                steps,
                dependencies,
            },
            events,
        })
    }

    fn load_graph(&self, project_id: &ProjectId) -> EngineResult<Option<ProjectGraph>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let projects = read_txn
            .open_table(PROJECTS_TABLE)
            .context("Failed to open projects table")?;
        let steps = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open steps table")?;
        let deps = read_txn
            .open_table(DEPENDENCIES_TABLE)
            .context("Failed to open dependencies table")?;

        Ok(read_graph(&projects, &steps, &deps, project_id)?)
    }

    fn list_projects(&self, query: &ProjectQuery) -> EngineResult<Page<Project>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(PROJECTS_TABLE)
            .context("Failed to open projects table")?;

        let mut projects = Vec::new();
        for item in table.iter().context("Failed to iterate projects")? {
            let (_key, value) = item.context("Failed to read item")?;
            let project: Project =
                serde_json::from_slice(value.value()).context("Failed to deserialize project")?;
            if query.status.map_or(true, |status| project.status == status) {
                projects.push(project);
            }
        }

        // Most recent first
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = projects.len();
        let items = projects
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();

        Ok(Page { items, total })
    }

    fn find_step(&self, step_id: &StepId) -> EngineResult<Option<Step>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let index = read_txn
            .open_table(STEP_INDEX_TABLE)
            .context("Failed to open step index table")?;

        let Some(guard) = index
            .get(step_id.to_string().as_str())
            .context("Failed to get step location")?
        else {
            return Ok(None);
        };
        let location: StepLocation =
            serde_json::from_slice(guard.value()).context("Failed to deserialize step location")?;

        let steps = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open steps table")?;
        let key = location.project_id.to_string();
        let value = steps
            .get((key.as_str(), location.step_number))
            .context("Failed to get step")?;

        match value {
            Some(guard) => {
                let step: Step =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize step")?;
                Ok(Some(step))
            }
            None => Ok(None),
        }
    }

    fn apply(
        &self,
        project_id: &ProjectId,
        step_number: StepNumber,
        command: StepCommand,
        conditions: &ConditionRegistry,
    ) -> EngineResult<StepTransition> {
        let (graph, events) = self.mutate_graph(project_id, |graph, now| {
            transition::apply_step_command(graph, step_number, command, conditions, now)
        })?;

        let step = graph
            .step(step_number)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Step {} of project {}", step_number, project_id)))?;

        Ok(StepTransition {
            project: graph.project,
            step,
            events,
        })
    }

    fn control(&self, project_id: &ProjectId, command: ProjectCommand) -> EngineResult<ProjectTransition> {
        let (graph, events) = self.mutate_graph(project_id, |graph, now| {
            transition::apply_project_command(graph, command, now)
        })?;

        Ok(ProjectTransition {
            project: graph.project,
            events,
        })
    }

    fn append_event(&self, project_id: &ProjectId, event: NewEvent) -> EngineResult<ExecutionEvent> {
        let mut events = self.transact(|txn| {
            let projects = txn
                .open_table(PROJECTS_TABLE)
                .context("Failed to open projects table")?;
            if projects
                .get(project_id.to_string().as_str())
                .context("Failed to get project")?
                .is_none()
            {
                return Err(EngineError::NotFound(format!("Project {}", project_id)));
            }
            drop(projects);

            Ok(append_events(txn, project_id, vec![event], Utc::now())?)
        })?;

        events
            .pop()
            .ok_or_else(|| EngineError::Storage(anyhow!("No event appended for project {}", project_id)))
    }

    fn events_after(&self, project_id: &ProjectId, after_seq: u64, limit: usize) -> EngineResult<Vec<ExecutionEvent>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("Failed to open events table")?;

        let key = project_id.to_string();
        let start = after_seq.saturating_add(1);
        let mut events = Vec::new();

        for item in table
            .range((key.as_str(), start)..=(key.as_str(), u64::MAX))
            .context("Failed to read event range")?
            .take(limit)
        {
            let (_key, value) = item.context("Failed to read event")?;
            let event: ExecutionEvent =
                serde_json::from_slice(value.value()).context("Failed to deserialize event")?;
            events.push(event);
        }

        Ok(events)
    }

    fn delete_project(&self, project_id: &ProjectId) -> EngineResult<bool> {
        let key = project_id.to_string();

        let deleted = self.transact(|txn| {
            let mut projects = txn
                .open_table(PROJECTS_TABLE)
                .context("Failed to open projects table")?;
            let existed = projects
                .remove(key.as_str())
                .context("Failed to delete project")?
                .is_some();
            if !existed {
                return Ok(false);
            }

            let mut steps = txn
                .open_table(STEPS_TABLE)
                .context("Failed to open steps table")?;
            let mut index = txn
                .open_table(STEP_INDEX_TABLE)
                .context("Failed to open step index table")?;

            let mut step_keys = Vec::new();
            for item in steps
                .range((key.as_str(), 0u32)..=(key.as_str(), u32::MAX))
                .context("Failed to read step range")?
            {
                let (k, v) = item.context("Failed to read step")?;
                let step: Step = serde_json::from_slice(v.value()).context("Failed to deserialize step")?;
                step_keys.push((k.value().1, step.id));
            }
            for (number, step_id) in step_keys {
                steps
                    .remove((key.as_str(), number))
                    .context("Failed to delete step")?;
                index
                    .remove(step_id.to_string().as_str())
                    .context("Failed to delete step index entry")?;
            }

            let mut deps = txn
                .open_table(DEPENDENCIES_TABLE)
                .context("Failed to open dependencies table")?;
            deps.remove(key.as_str())
                .context("Failed to delete dependencies")?;

            let mut events = txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;
            let mut seqs = Vec::new();
            for item in events
                .range((key.as_str(), 0u64)..=(key.as_str(), u64::MAX))
                .context("Failed to read event range")?
            {
                let (k, _) = item.context("Failed to read event")?;
                seqs.push(k.value().1);
            }
            for seq in seqs {
                events
                    .remove((key.as_str(), seq))
                    .context("Failed to delete event")?;
            }

            let mut seq_table = txn
                .open_table(EVENT_SEQ_TABLE)
                .context("Failed to open event sequence table")?;
            seq_table
                .remove(key.as_str())
                .context("Failed to delete event sequence")?;

            Ok(true)
        })?;

        if deleted {
            tracing::info!("Deleted project {}", project_id);
        }
        Ok(deleted)
    }
}

fn load_graph_in(txn: &WriteTransaction, project_id: &ProjectId) -> Result<Option<ProjectGraph>> {
    let projects = txn
        .open_table(PROJECTS_TABLE)
        .context("Failed to open projects table")?;
    let steps = txn
        .open_table(STEPS_TABLE)
        .context("Failed to open steps table")?;
    let deps = txn
        .open_table(DEPENDENCIES_TABLE)
        .context("Failed to open dependencies table")?;

    read_graph(&projects, &steps, &deps, project_id)
}

fn read_graph(
    projects: &impl ReadableTable<&'static str, &'static [u8]>,
    steps: &impl ReadableTable<(&'static str, u32), &'static [u8]>,
    deps: &impl ReadableTable<&'static str, &'static [u8]>,
    project_id: &ProjectId,
) -> Result<Option<ProjectGraph>> {
    let key = project_id.to_string();

    let project: Project = match projects.get(key.as_str()).context("Failed to get project")? {
        Some(guard) => serde_json::from_slice(guard.value()).context("Failed to deserialize project")?,
        None => return Ok(None),
    };

    // Tuple keys keep a project's steps contiguous and ordered by number
    let mut loaded = Vec::with_capacity(project.total_steps as usize);
    for item in steps
        .range((key.as_str(), 0u32)..=(key.as_str(), u32::MAX))
        .context("Failed to read step range")?
    {
        let (_key, value) = item.context("Failed to read step")?;
        let step: Step = serde_json::from_slice(value.value()).context("Failed to deserialize step")?;
        loaded.push(step);
    }

    let dependencies: Vec<Dependency> = match deps.get(key.as_str()).context("Failed to get dependencies")? {
        Some(guard) => serde_json::from_slice(guard.value()).context("Failed to deserialize dependencies")?,
        None => Vec::new(),
    };

    Ok(Some(ProjectGraph {
        project,
        steps: loaded,
        dependencies,
    }))
}

fn write_project(txn: &WriteTransaction, project: &Project) -> Result<()> {
    let mut table = txn
        .open_table(PROJECTS_TABLE)
        .context("Failed to open projects table")?;
    let value = serde_json::to_vec(project).context("Failed to serialize project")?;
    table
        .insert(project.id.to_string().as_str(), value.as_slice())
        .context("Failed to insert project")?;
    Ok(())
}

fn write_steps<'a>(
    txn: &WriteTransaction,
    project_id: &ProjectId,
    steps: impl IntoIterator<Item = &'a Step>,
) -> Result<()> {
    let mut table = txn
        .open_table(STEPS_TABLE)
        .context("Failed to open steps table")?;
    let key = project_id.to_string();
    for step in steps {
        let value = serde_json::to_vec(step).context("Failed to serialize step")?;
        table
            .insert((key.as_str(), step.step_number), value.as_slice())
            .context("Failed to insert step")?;
    }
    Ok(())
}

fn append_events(
    txn: &WriteTransaction,
    project_id: &ProjectId,
    new_events: Vec<NewEvent>,
    timestamp: DateTime<Utc>,
) -> Result<Vec<ExecutionEvent>> {
    if new_events.is_empty() {
        return Ok(Vec::new());
    }

    let key = project_id.to_string();
    let mut seq_table = txn
        .open_table(EVENT_SEQ_TABLE)
        .context("Failed to open event sequence table")?;
    let mut events_table = txn
        .open_table(EVENTS_TABLE)
        .context("Failed to open events table")?;

    let mut seq = seq_table
        .get(key.as_str())
        .context("Failed to get event sequence")?
        .map(|guard| guard.value())
        .unwrap_or(0);

    let mut events = Vec::with_capacity(new_events.len());
    for new_event in new_events {
        seq += 1;
        let event = new_event.into_event(*project_id, seq, timestamp);
        let value = serde_json::to_vec(&event).context("Failed to serialize event")?;
        events_table
            .insert((key.as_str(), seq), value.as_slice())
            .context("Failed to append event")?;
        events.push(event);
    }

    seq_table
        .insert(key.as_str(), seq)
        .context("Failed to update event sequence")?;

    Ok(events)
}
