//! Durable agent events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type tags emitted by the dispatch engine.
pub mod event_types {
    pub const CASE_CREATED: &str = "CaseCreated";
    pub const CASE_ASSIGNED: &str = "CaseAssigned";
    pub const CASE_UNASSIGNED: &str = "CaseUnassigned";
    pub const CASE_STATUS_CHANGED: &str = "CaseStatusChanged";
    pub const CASE_ACKNOWLEDGED: &str = "CaseAcknowledged";
}

/// Processing state of an event. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            _ => Err(format!("Unknown event status: {}", s)),
        }
    }
}

/// What caused an event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventTrigger {
    /// Agent or system label
    pub source: String,
    pub case_id: Option<String>,
    pub session_id: Option<String>,
}

impl EventTrigger {
    pub fn for_case(source: impl Into<String>, case_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            case_id: Some(case_id.into()),
            session_id: None,
        }
    }
}

/// Result of one handler for one event delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub handler: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// A durable, typed notification consumed by zero or more handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub triggered_by: EventTrigger,
    pub status: EventStatus,
    /// Handler results from the delivery that finished the event
    pub outcomes: Vec<HandlerOutcome>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When a delivery path claimed the event
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl AgentEvent {
    /// Create a pending event.
    pub fn new(event_type: impl Into<String>, payload: Value, triggered_by: EventTrigger) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            triggered_by,
            status: EventStatus::Pending,
            outcomes: Vec::new(),
            error: None,
            created_at: super::now(),
            claimed_at: None,
            processed_at: None,
        }
    }

    /// Case this event is about, if any.
    pub fn case_id(&self) -> Option<&str> {
        self.triggered_by.case_id.as_deref()
    }

    /// Handlers that failed in the finishing delivery.
    pub fn failed_handlers(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| !o.ok)
    }
}
