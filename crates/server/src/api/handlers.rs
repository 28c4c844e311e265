use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stepgraph_core::{
    events::ExecutionEvent,
    types::{
        GraphView, NewProject, Project, ProjectDetail, ProjectId, ProjectQuery, ProjectStatus, Step,
        StepId, StepPatch, StepStatus,
    },
};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

pub(super) fn parse_project_id(raw: &str) -> ApiResult<ProjectId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid project ID: {}", raw)))
}

fn parse_step_id(raw: &str) -> ApiResult<StepId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid step ID: {}", raw)))
}

/// Create a project from a complete plan
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewProject>,
) -> ApiResult<(StatusCode, Json<CreateProjectResponse>)> {
    let detail = state.controller.create_project(req)?;
    let project = detail.project;

    tracing::info!(
        "Created project {} ({}) with {} steps",
        project.id,
        project.name,
        project.total_steps
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project_id: project.id,
            name: project.name,
            status: project.status,
            total_steps: project.total_steps,
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectResponse {
    pub project_id: ProjectId,
    pub name: String,
    pub status: ProjectStatus,
    pub total_steps: u32,
}

#[derive(Debug, Deserialize)]
pub struct ListProjectsParams {
    pub status: Option<ProjectStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// List projects, newest first
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListProjectsParams>,
) -> ApiResult<Json<ListProjectsResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);

    let page = state.controller.list_projects(&ProjectQuery {
        status: params.status,
        limit,
        offset,
    })?;

    Ok(Json(ListProjectsResponse {
        projects: page.items,
        total: page.total,
        limit,
        offset,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListProjectsResponse {
    pub projects: Vec<Project>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Get a project with all of its steps and edges
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    let project_id = parse_project_id(&project_id)?;
    Ok(Json(state.controller.get_project(&project_id)?))
}

/// Get the project's graph for visualization
pub async fn get_steps(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<GraphView>> {
    let project_id = parse_project_id(&project_id)?;
    Ok(Json(state.controller.get_graph(&project_id)?))
}

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    #[serde(default)]
    pub after: u64,
    pub limit: Option<usize>,
}

/// Durable event log, for clients that poll instead of streaming
pub async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<EventsParams>,
) -> ApiResult<Json<GetEventsResponse>> {
    let project_id = parse_project_id(&project_id)?;
    let limit = params.limit.unwrap_or(usize::MAX);
    let events = state.controller.events(&project_id, params.after, limit)?;
    Ok(Json(GetEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetEventsResponse {
    pub events: Vec<ExecutionEvent>,
}

/// Steps of a project waiting for a decision
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ListApprovalsResponse>> {
    let project_id = parse_project_id(&project_id)?;
    let approvals = state.controller.pending_approvals(&project_id)?;
    Ok(Json(ListApprovalsResponse { approvals }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListApprovalsResponse {
    pub approvals: Vec<Step>,
}

/// Delete a project, cancelling anything in flight
pub async fn delete_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<SuccessResponse>> {
    let project_id = parse_project_id(&project_id)?;
    state.controller.delete(&project_id).await?;

    tracing::info!("Deleted project {}", project_id);
    Ok(Json(SuccessResponse { success: true }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

pub async fn pause_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectStatusResponse>> {
    let project_id = parse_project_id(&project_id)?;
    let project = state.controller.pause(&project_id).await?;
    Ok(Json(ProjectStatusResponse {
        success: true,
        status: project.status,
    }))
}

/// Start or resume without holding a stream open
pub async fn resume_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<ProjectStatusResponse>> {
    let project_id = parse_project_id(&project_id)?;
    let project = state.controller.execute(&project_id).await?;
    Ok(Json(ProjectStatusResponse {
        success: true,
        status: project.status,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProjectStatusResponse {
    pub success: bool,
    pub status: ProjectStatus,
}

pub async fn approve_step(
    State(state): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
) -> ApiResult<Json<StepStatusResponse>> {
    let approval_id = parse_step_id(&approval_id)?;
    let step = state.controller.approve_step(&approval_id).await?;

    tracing::info!("Approved step {} of project {}", step.step_number, step.project_id);
    Ok(Json(StepStatusResponse {
        success: true,
        status: step.status,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

/// Reject a waiting step. The body is optional.
pub async fn reject_step(
    State(state): State<Arc<AppState>>,
    Path(approval_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<StepStatusResponse>> {
    let approval_id = parse_step_id(&approval_id)?;
    let req: RejectRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RejectRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
    };

    let step = state.controller.reject_step(&approval_id, req.reason).await?;

    tracing::info!(
        "Rejected step {} of project {}: {}",
        step.step_number,
        step.project_id,
        step.error_message.as_deref().unwrap_or_default()
    );
    Ok(Json(StepStatusResponse {
        success: true,
        status: step.status,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepStatusResponse {
    pub success: bool,
    pub status: StepStatus,
}

/// Edit a step that has not started
pub async fn update_step(
    State(state): State<Arc<AppState>>,
    Path(step_id): Path<String>,
    Json(patch): Json<StepPatch>,
) -> ApiResult<Json<Step>> {
    let step_id = parse_step_id(&step_id)?;
    Ok(Json(state.controller.update_step(&step_id, patch).await?))
}
