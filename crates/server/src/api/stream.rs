use super::{handlers::parse_project_id, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub after: Option<u64>,
}

/// Start or resume the project and stream its events as SSE.
///
/// Reconnecting clients send `Last-Event-ID` (or `?after=`) and receive only
/// the events they missed. The stream closes after the terminal project event.
pub async fn execute_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::BoxError>>>> {
    let project_id = parse_project_id(&project_id)?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let after = last_event_id.or(params.after).unwrap_or(0);

    // Subscribe before starting so the first events are not missed
    let events = state.controller.stream(&project_id, after)?;
    state.controller.execute(&project_id).await?;

    tracing::debug!("Streaming project {} from seq {}", project_id, after);

    let stream = events.map(|item| -> Result<Event, axum::BoxError> {
        let event = item?;
        let frame = Event::default()
            .id(event.seq.to_string())
            .event(event.event_type.as_str())
            .json_data(&event)?;
        Ok(frame)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
