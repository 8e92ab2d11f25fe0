//! Outbound notifications for assignment and acknowledgement events.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use rescue_dispatch_core::models::event_types;
use rescue_dispatch_core::{Agent, AgentContext, AgentError, AgentOutput};

use crate::{CasePayload, SeenEvents};

/// Recipient for cases nobody could be assigned to.
pub const DISPATCH_DESK: &str = "dispatch-desk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub event_id: Option<String>,
    pub case_id: String,
    pub recipient: String,
    pub message: String,
}

/// Where notifications go. SMS, push and similar transports plug in here.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification) -> Result<(), AgentError>;
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryOutbox {
    pub fn messages(&self) -> Result<Vec<Notification>, AgentError> {
        let sent = self
            .sent
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        Ok(sent.clone())
    }
}

impl NotificationSink for MemoryOutbox {
    fn deliver(&self, notification: &Notification) -> Result<(), AgentError> {
        self.sent
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, notification: &Notification) -> Result<(), AgentError> {
        info!(
            case_id = %notification.case_id,
            recipient = %notification.recipient,
            "{}",
            notification.message
        );
        Ok(())
    }
}

pub struct NotificationAgent {
    sink: Arc<dyn NotificationSink>,
    seen: Mutex<SeenEvents>,
}

impl NotificationAgent {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            seen: Mutex::new(SeenEvents::default()),
        }
    }

    fn compose(event_type: &str, payload: &CasePayload) -> Option<(String, String)> {
        match event_type {
            event_types::CASE_ASSIGNED => {
                let assignment = payload.assignment.as_ref()?;
                let eta = payload
                    .score
                    .as_ref()
                    .and_then(|s| s.eta_millis)
                    .map(|ms| format!(", ETA {} min", (ms / 60_000.0).ceil() as u64))
                    .unwrap_or_default();
                Some((
                    assignment.responder_id.clone(),
                    format!(
                        "Priority {} case {} at {:.5},{:.5}{}",
                        payload.priority.value(),
                        payload.case_id,
                        payload.origin.latitude,
                        payload.origin.longitude,
                        eta
                    ),
                ))
            }
            event_types::CASE_UNASSIGNED => Some((
                DISPATCH_DESK.to_string(),
                format!(
                    "No responder available for priority {} case {}",
                    payload.priority.value(),
                    payload.case_id
                ),
            )),
            event_types::CASE_ACKNOWLEDGED => {
                let ack = payload.acknowledgement.as_ref()?;
                Some((
                    payload.patient_id.clone(),
                    format!("Help is on the way: {} acknowledged your case", ack.actor.id),
                ))
            }
            _ => None,
        }
    }

    fn seen(&self, event_id: Option<&str>) -> Result<bool, AgentError> {
        let seen = self
            .seen
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        Ok(seen.contains(event_id))
    }

    fn mark_seen(&self, event_id: Option<&str>) -> Result<(), AgentError> {
        self.seen
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?
            .insert(event_id);
        Ok(())
    }
}

#[async_trait]
impl Agent for NotificationAgent {
    async fn handle(&self, ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError> {
        let event_type = ctx.event_type.as_deref().unwrap_or_default();
        let event_id = ctx.event_id.as_deref();

        if self.seen(event_id)? {
            debug!(?event_id, "Notification already sent");
            return Ok(AgentOutput::Text("duplicate".into()));
        }

        let payload = CasePayload::parse(&input)?;
        let Some((recipient, message)) = Self::compose(event_type, &payload) else {
            return Ok(AgentOutput::Text("ignored".into()));
        };

        let notification = Notification {
            event_id: event_id.map(str::to_string),
            case_id: payload.case_id,
            recipient,
            message,
        };
        // A failed delivery leaves the event unseen so a retry sends it
        self.sink.deliver(&notification)?;
        self.mark_seen(event_id)?;

        Ok(AgentOutput::Structured(json!(notification)))
    }
}
