//! Agent contract: one operation, reached by direct routing or as an event subscriber.

mod registry;

pub use registry::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::AgentEvent;

/// Failure inside an agent. The core treats agents as opaque.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Agent failed: {0}")]
    Failed(String),
}

/// What an agent is working on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Interactive session for direct routing
    pub session_id: Option<String>,
    pub case_id: Option<String>,
    /// Set when invoked as an event subscriber
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    /// BCP 47 tag for any generated text
    pub language: String,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self {
            session_id: None,
            case_id: None,
            event_id: None,
            event_type: None,
            language: "en".to_string(),
        }
    }
}

impl AgentContext {
    /// Context for one interactive turn.
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// Context for an event delivery.
    pub fn for_event(event: &AgentEvent) -> Self {
        Self {
            session_id: event.triggered_by.session_id.clone(),
            case_id: event.triggered_by.case_id.clone(),
            event_id: Some(event.event_id.clone()),
            event_type: Some(event.event_type.clone()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// Agent result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AgentOutput {
    Text(String),
    Structured(Value),
}

impl AgentOutput {
    /// Flatten to JSON for callers that do not care about the shape.
    pub fn into_value(self) -> Value {
        match self {
            AgentOutput::Text(text) => Value::String(text),
            AgentOutput::Structured(value) => value,
        }
    }
}

/// A named consumer implementing the single-method capability contract.
///
/// When subscribed to the event bus, an agent receives the event payload as
/// `input` and may see the same `ctx.event_id` more than once; it must be
/// idempotent per event id.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle(&self, ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError>;
}
