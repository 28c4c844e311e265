use crate::error::EngineResult;
use crate::storage::GraphStore;
use crate::types::*;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;

/// A durable entry in a project's execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// Per-project sequence number, starting at 1
    pub seq: u64,
    pub project_id: ProjectId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<StepNumber>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Types of events recorded during a project's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Project lifecycle events
    ProjectCreated,
    ProjectStarted,
    ProjectResumed,
    ProjectPausing,
    ProjectPaused,
    ProjectCompleted,
    ProjectFailed,

    // Step lifecycle events
    StepReady,
    StepAwaitingApproval,
    StepApproved,
    StepRejected,
    StepStarted,
    StepCompleted,
    StepRetryScheduled,
    StepFailed,
    StepBlocked,
    StepUpdated,
    StepRequeued,
}

impl EventType {
    /// Events after which a project's stream has nothing more to say
    pub fn ends_stream(&self) -> bool {
        matches!(self, Self::ProjectCompleted | Self::ProjectFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectCreated => "project_created",
            Self::ProjectStarted => "project_started",
            Self::ProjectResumed => "project_resumed",
            Self::ProjectPausing => "project_pausing",
            Self::ProjectPaused => "project_paused",
            Self::ProjectCompleted => "project_completed",
            Self::ProjectFailed => "project_failed",
            Self::StepReady => "step_ready",
            Self::StepAwaitingApproval => "step_awaiting_approval",
            Self::StepApproved => "step_approved",
            Self::StepRejected => "step_rejected",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepRetryScheduled => "step_retry_scheduled",
            Self::StepFailed => "step_failed",
            Self::StepBlocked => "step_blocked",
            Self::StepUpdated => "step_updated",
            Self::StepRequeued => "step_requeued",
        }
    }
}

/// An event before the store has assigned its sequence number
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub step_id: Option<StepId>,
    pub step_number: Option<StepNumber>,
    pub message: String,
    pub data: serde_json::Value,
}

impl NewEvent {
    pub fn project(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            event_type,
            step_id: None,
            step_number: None,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn step(event_type: EventType, step: &Step, message: impl Into<String>) -> Self {
        Self {
            event_type,
            step_id: Some(step.id),
            step_number: Some(step.step_number),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Stamp the event with its sequence number
    pub fn into_event(self, project_id: ProjectId, seq: u64, timestamp: DateTime<Utc>) -> ExecutionEvent {
        ExecutionEvent {
            seq,
            project_id,
            event_type: self.event_type,
            step_id: self.step_id,
            step_number: self.step_number,
            message: self.message,
            timestamp,
            data: self.data,
        }
    }
}

/// Message carried on the live bus
#[derive(Debug, Clone)]
pub enum BusMessage {
    Event(ExecutionEvent),
    ProjectDeleted(ProjectId),
}

/// What woke a live stream up
enum Wake {
    Bus(Result<BusMessage, RecvError>),
    Tick,
}

/// Live fan-out of persisted events, backed by the durable log for replay.
///
/// Publishing never blocks: a subscriber that falls behind loses live
/// messages and catches up from the store instead. Streams also re-read the
/// log every `poll_interval`, which picks up events committed by other
/// processes sharing the store.
pub struct EventBus {
    tx: broadcast::Sender<BusMessage>,
    store: Arc<dyn GraphStore>,
    poll_interval: Duration,
}

impl EventBus {
    pub fn new(store: Arc<dyn GraphStore>, capacity: usize, poll_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            store,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Publish events that have already been committed to the store
    pub fn publish(&self, events: &[ExecutionEvent]) {
        for event in events {
            // Ignore error if no receivers
            let _ = self.tx.send(BusMessage::Event(event.clone()));
        }
    }

    pub fn publish_deleted(&self, project_id: ProjectId) {
        let _ = self.tx.send(BusMessage::ProjectDeleted(project_id));
    }

    /// Stream a project's events with a sequence number above `after_seq`:
    /// the durable backlog first, then the live tail, without duplicates or
    /// gaps. Ends after the project's terminal event or on deletion.
    pub fn stream(
        &self,
        project_id: ProjectId,
        after_seq: u64,
    ) -> impl Stream<Item = EngineResult<ExecutionEvent>> + Send + 'static {
        // Subscribe before reading the backlog so nothing committed in between is lost
        let mut rx = self.tx.subscribe();
        let store = self.store.clone();
        let poll_interval = self.poll_interval;

        async_stream::try_stream! {
            let mut cursor = after_seq;
            let mut finished = false;

            for event in store.events_after(&project_id, cursor, usize::MAX)? {
                cursor = event.seq;
                finished = event.event_type.ends_stream();
                yield event;
                if finished {
                    break;
                }
            }

            if !finished {
                match store.get_project(&project_id)? {
                    Some(detail) if detail.project.status.is_terminal() => {
                        // Finished while the backlog was being sent; the log holds the rest
                        for event in store.events_after(&project_id, cursor, usize::MAX)? {
                            cursor = event.seq;
                            yield event;
                        }
                        finished = true;
                    }
                    Some(_) => {}
                    None => finished = true,
                }
            }

            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.reset();

            while !finished {
                let wake = tokio::select! {
                    message = rx.recv() => Wake::Bus(message),
                    _ = tick.tick() => Wake::Tick,
                };
                let polled = matches!(wake, Wake::Tick);

                let needs_replay = match wake {
                    Wake::Bus(Ok(BusMessage::Event(event))) if event.project_id == project_id => {
                        if event.seq <= cursor {
                            continue;
                        }
                        if event.seq == cursor + 1 {
                            cursor = event.seq;
                            finished = event.event_type.ends_stream();
                            yield event;
                            false
                        } else {
                            // Published out of order by concurrent writers
                            true
                        }
                    }
                    Wake::Bus(Ok(BusMessage::ProjectDeleted(id))) if id == project_id => {
                        tracing::debug!("Project {} deleted, closing stream", project_id);
                        break;
                    }
                    Wake::Bus(Ok(_)) => false,
                    Wake::Bus(Err(RecvError::Lagged(skipped))) => {
                        tracing::debug!(
                            "Stream for project {} lagged by {} messages, replaying from log",
                            project_id,
                            skipped
                        );
                        true
                    }
                    Wake::Bus(Err(RecvError::Closed)) => break,
                    Wake::Tick => true,
                };

                if needs_replay {
                    let backlog = store.events_after(&project_id, cursor, usize::MAX)?;
                    if polled && backlog.is_empty() && store.get_project(&project_id)?.is_none() {
                        tracing::debug!("Project {} is gone, closing stream", project_id);
                        break;
                    }
                    for event in backlog {
                        cursor = event.seq;
                        finished = event.event_type.ends_stream();
                        yield event;
                        if finished {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_match_wire_format() {
        for event_type in [
            EventType::ProjectCreated,
            EventType::StepAwaitingApproval,
            EventType::StepRetryScheduled,
            EventType::ProjectFailed,
        ] {
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
        assert!(EventType::ProjectCompleted.ends_stream());
        assert!(!EventType::ProjectPaused.ends_stream());
    }

    #[test]
    fn test_event_serialization() {
        let project_id = ProjectId::new();
        let event = NewEvent::project(EventType::ProjectStarted, "Project demo started")
            .with_data(serde_json::json!({ "totalSteps": 3 }))
            .into_event(project_id, 7, Utc::now());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seq"], 7);
        assert_eq!(value["type"], "project_started");
        assert_eq!(value["data"]["totalSteps"], 3);
        assert!(value.get("stepId").is_none());

        let parsed: ExecutionEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
