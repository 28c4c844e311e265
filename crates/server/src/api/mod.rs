use crate::config::{AppState, ServerConfig};
use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use stepgraph_core::EngineError;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;
mod stream;

/// Start the API server; returns after `shutdown` fires and in-flight
/// requests have drained
pub async fn serve(addr: &str, config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::new(&config)?;

    let recovered = state
        .controller
        .recover()
        .await
        .context("Failed to recover executing projects")?;
    if recovered > 0 {
        tracing::info!("Resumed {} projects from the previous run", recovered);
    }

    let controller = state.controller.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    controller.shutdown().await;

    Ok(())
}

/// Create the API router
pub(crate) fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/planner/projects",
            post(handlers::create_project).get(handlers::list_projects),
        )
        .route(
            "/planner/projects/{project_id}",
            get(handlers::get_project).delete(handlers::delete_project),
        )
        .route("/planner/projects/{project_id}/steps", get(handlers::get_steps))
        .route("/planner/projects/{project_id}/events", get(handlers::get_events))
        .route("/planner/projects/{project_id}/approvals", get(handlers::list_approvals))
        .route("/planner/projects/{project_id}/execute", get(stream::execute_project))
        .route("/planner/projects/{project_id}/pause", post(handlers::pause_project))
        .route("/planner/projects/{project_id}/resume", post(handlers::resume_project))
        .route("/planner/approvals/{approval_id}/approve", post(handlers::approve_step))
        .route("/planner/approvals/{approval_id}/reject", post(handlers::reject_step))
        .route("/planner/steps/{step_id}", patch(handlers::update_step))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "stepgraph",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers; the status follows the engine error kind
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

fn status_for(error: &anyhow::Error) -> StatusCode {
    match error.downcast_ref::<EngineError>() {
        Some(EngineError::Validation(_)) => StatusCode::BAD_REQUEST,
        Some(EngineError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(EngineError::Conflict { .. }) | Some(EngineError::InvalidState(_)) => StatusCode::CONFLICT,
        Some(EngineError::Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self.error.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::SimulatedRunner;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use std::time::Duration;
    use stepgraph_core::storage::RedbGraphStore;
    use stepgraph_core::{EngineConfig, ProjectController, RunnerRegistry};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RedbGraphStore::new(dir.path().join("api.redb")).unwrap());
        let runners = RunnerRegistry::with_default(Arc::new(SimulatedRunner::new(Duration::from_millis(1))));
        let mut config = EngineConfig::default();
        config.poll_interval_ms = 20;
        let controller = Arc::new(ProjectController::new(store, runners, config));
        (dir, create_router(AppState { controller }))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn plan(gated: bool) -> Value {
        json!({
            "name": "Landing page",
            "projectType": "web_app",
            "steps": [
                { "stepNumber": 1, "goal": "Scaffold", "action": "build" },
                { "stepNumber": 2, "goal": "Style", "action": "modify", "dependencies": [1] },
                {
                    "stepNumber": 3,
                    "goal": "Ship",
                    "action": "deploy",
                    "requiresApproval": gated,
                    "dependencies": [{ "stepNumber": 2, "type": "requires" }]
                }
            ]
        })
    }

    async fn create(app: &Router, gated: bool) -> String {
        let (status, body) = send(app, Method::POST, "/planner/projects", Some(plan(gated))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["projectId"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, app) = app();
        let (status, body) = send(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "stepgraph");
    }

    #[tokio::test]
    async fn test_create_and_inspect_project() {
        let (_dir, app) = app();
        let (status, body) = send(&app, Method::POST, "/planner/projects", Some(plan(false))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["totalSteps"], 3);
        let id = body["projectId"].as_str().unwrap();

        let (status, detail) = send(&app, Method::GET, &format!("/planner/projects/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["steps"].as_array().unwrap().len(), 3);
        assert_eq!(detail["dependencies"].as_array().unwrap().len(), 2);

        let (status, graph) = send(&app, Method::GET, &format!("/planner/projects/{}/steps", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(graph["nodes"][1]["dependencies"], json!([1]));
        assert_eq!(graph["nodes"][1]["dependents"], json!([3]));
    }

    #[tokio::test]
    async fn test_invalid_plans_are_bad_requests() {
        let (_dir, app) = app();
        let cyclic = json!({
            "name": "Loop",
            "projectType": "web_app",
            "steps": [
                { "stepNumber": 1, "goal": "A", "action": "build", "dependencies": [2] },
                { "stepNumber": 2, "goal": "B", "action": "build", "dependencies": [1] }
            ]
        });
        let (status, body) = send(&app, Method::POST, "/planner/projects", Some(cyclic)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("circular"));

        let (_, list) = send(&app, Method::GET, "/planner/projects", None).await;
        assert_eq!(list["total"], 0);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_ids() {
        let (_dir, app) = app();
        let missing = stepgraph_core::ProjectId::new();

        let (status, _) = send(&app, Method::GET, &format!("/planner/projects/{}", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::DELETE, &format!("/planner/projects/{}", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/planner/projects/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let (_dir, app) = app();
        for _ in 0..3 {
            create(&app, false).await;
        }

        let (status, body) = send(&app, Method::GET, "/planner/projects?limit=2&offset=1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["limit"], 2);
        assert_eq!(body["offset"], 1);
        assert_eq!(body["projects"].as_array().unwrap().len(), 2);

        let (_, executing) = send(&app, Method::GET, "/planner/projects?status=executing", None).await;
        assert_eq!(executing["total"], 0);
    }

    #[tokio::test]
    async fn test_execute_streams_until_completion() {
        let (_dir, app) = app();
        let id = create(&app, false).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/planner/projects/{}/execute", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "text/event-stream"
        );

        let body = tokio::time::timeout(
            Duration::from_secs(10),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("id: 1\n"));
        assert!(text.contains("event: project_created"));
        assert!(text.contains("event: step_completed"));
        assert!(text.contains("event: project_completed"));

        let (_, events) = send(&app, Method::GET, &format!("/planner/projects/{}/events?after=1", id), None).await;
        assert_eq!(events["events"][0]["seq"], 2);
    }

    #[tokio::test]
    async fn test_resume_stream_with_last_event_id() {
        let (_dir, app) = app();
        let id = create(&app, false).await;
        let (status, body) = send(&app, Method::POST, &format!("/planner/projects/{}/resume", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/planner/projects/{}/execute", id))
                    .header("Last-Event-ID", "2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = tokio::time::timeout(
            Duration::from_secs(10),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("id: 1\n"));
        assert!(!text.contains("id: 2\n"));
        assert!(text.contains("id: 3\n"));
        assert!(text.contains("event: project_completed"));
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let (_dir, app) = app();
        let id = create(&app, true).await;

        let (_, detail) = send(&app, Method::GET, &format!("/planner/projects/{}", id), None).await;
        let gated_step = detail["steps"][2]["id"].as_str().unwrap().to_string();

        // Not waiting yet
        let (status, _) = send(&app, Method::POST, &format!("/planner/approvals/{}/approve", gated_step), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(&app, Method::POST, &format!("/planner/projects/{}/resume", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let approvals_uri = format!("/planner/projects/{}/approvals", id);
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let (_, body) = send(&app, Method::GET, &approvals_uri, None).await;
                if !body["approvals"].as_array().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (status, body) = send(
            &app,
            Method::POST,
            &format!("/planner/approvals/{}/reject", gated_step),
            Some(json!({ "reason": "not safe" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");

        let (_, detail) = send(&app, Method::GET, &format!("/planner/projects/{}", id), None).await;
        assert_eq!(detail["steps"][2]["errorMessage"], "not safe");
    }

    #[tokio::test]
    async fn test_patch_and_delete() {
        let (_dir, app) = app();
        let id = create(&app, false).await;
        let (_, detail) = send(&app, Method::GET, &format!("/planner/projects/{}", id), None).await;
        let step_id = detail["steps"][0]["id"].as_str().unwrap().to_string();

        let (status, step) = send(
            &app,
            Method::PATCH,
            &format!("/planner/steps/{}", step_id),
            Some(json!({ "goal": "Scaffold with vite", "maxRetries": 4 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(step["goal"], "Scaffold with vite");
        assert_eq!(step["maxRetries"], 4);

        let (status, _) = send(&app, Method::PATCH, &format!("/planner/steps/{}", step_id), Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, Method::DELETE, &format!("/planner/projects/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = send(&app, Method::GET, &format!("/planner/projects/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pause_unstarted_project_conflicts() {
        let (_dir, app) = app();
        let id = create(&app, false).await;
        let (status, body) = send(&app, Method::POST, &format!("/planner/projects/{}/pause", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not been started"));
    }
}
