//! Autonomous consumers for the rescue dispatch event bus.
//!
//! Every agent here implements [`rescue_dispatch_core::Agent`] and is safe to
//! run twice for the same event: each keeps the ids of events it already
//! handled and skips repeats.

pub mod analytics;
pub mod notify;
pub mod pattern;
pub mod triage;

pub use analytics::*;
pub use notify::*;
pub use pattern::*;
pub use triage::*;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use rescue_dispatch_core::config::SubscriptionConfig;
use rescue_dispatch_core::models::{event_types, Acknowledgement, Assignment, ResponderKind};
use rescue_dispatch_core::{AgentError, AgentRegistry, CaseStatus, Coordinate, Priority};

pub const PATTERN_AGENT: &str = "pattern";
pub const NOTIFY_AGENT: &str = "notify";
pub const ANALYTICS_AGENT: &str = "analytics";
pub const TRIAGE_AGENT: &str = "triage";

/// Event wiring for the default agents as `(event type, agent name)`.
///
/// `triage` is reached by direct routing only.
pub const DEFAULT_SUBSCRIPTIONS: &[(&str, &str)] = &[
    (event_types::CASE_CREATED, PATTERN_AGENT),
    (event_types::CASE_CREATED, ANALYTICS_AGENT),
    (event_types::CASE_ASSIGNED, NOTIFY_AGENT),
    (event_types::CASE_ASSIGNED, ANALYTICS_AGENT),
    (event_types::CASE_UNASSIGNED, NOTIFY_AGENT),
    (event_types::CASE_UNASSIGNED, ANALYTICS_AGENT),
    (event_types::CASE_STATUS_CHANGED, ANALYTICS_AGENT),
    (event_types::CASE_ACKNOWLEDGED, NOTIFY_AGENT),
    (event_types::CASE_ACKNOWLEDGED, ANALYTICS_AGENT),
];

/// [`DEFAULT_SUBSCRIPTIONS`] in configuration form.
pub fn default_subscriptions() -> Vec<SubscriptionConfig> {
    DEFAULT_SUBSCRIPTIONS
        .iter()
        .map(|(event, agent)| SubscriptionConfig {
            event: (*event).to_string(),
            agent: (*agent).to_string(),
        })
        .collect()
}

/// Registry with all four agents, notifications going to `sink`.
pub fn default_registry(sink: Arc<dyn NotificationSink>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    registry.register(PATTERN_AGENT, Arc::new(PatternDetector::default()));
    registry.register(NOTIFY_AGENT, Arc::new(NotificationAgent::new(sink)));
    registry.register(ANALYTICS_AGENT, Arc::new(AnalyticsAgent::default()));
    registry.register(TRIAGE_AGENT, Arc::new(KeywordTriage::default()));
    registry
}

/// The case fields every engine event carries.
#[derive(Debug, Clone, Deserialize)]
pub struct CasePayload {
    pub case_id: String,
    pub patient_id: String,
    pub status: CaseStatus,
    pub priority: Priority,
    pub origin: Coordinate,
    pub assignment: Option<Assignment>,
    pub reported_at: DateTime<Utc>,
    /// Present on `CaseAssigned`
    #[serde(default)]
    pub score: Option<ScoreView>,
    /// Present on `CaseAcknowledged`
    #[serde(default)]
    pub acknowledgement: Option<Acknowledgement>,
    /// Present on `CaseStatusChanged`
    #[serde(default)]
    pub from: Option<CaseStatus>,
}

/// Candidate score as it appears in JSON, where an unreachable ETA is `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoreView {
    pub kind: ResponderKind,
    pub id: String,
    pub distance_meters: f64,
    pub eta_millis: Option<f64>,
}

impl CasePayload {
    pub fn parse(input: &Value) -> Result<Self, AgentError> {
        Self::deserialize(input).map_err(|e| AgentError::InvalidInput(e.to_string()))
    }
}

/// How many event ids an agent remembers before forgetting the oldest.
/// A redelivery older than that is handled as a new event.
pub const SEEN_EVENTS_CAPACITY: usize = 10_000;

/// Event ids an agent has already handled, bounded to the most recent ones.
#[derive(Debug)]
pub(crate) struct SeenEvents {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for SeenEvents {
    fn default() -> Self {
        Self::with_capacity(SEEN_EVENTS_CAPACITY)
    }
}

impl SeenEvents {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn contains(&self, event_id: Option<&str>) -> bool {
        event_id.is_some_and(|id| self.ids.contains(id))
    }

    /// Remember an event. Returns `false` if it was already known.
    pub(crate) fn insert(&mut self, event_id: Option<&str>) -> bool {
        let Some(id) = event_id else {
            return true;
        };
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use rescue_dispatch_core::AgentContext;
    use serde_json::{json, Value};

    pub fn ctx(event_type: &str, event_id: &str) -> AgentContext {
        AgentContext {
            event_id: Some(event_id.to_string()),
            event_type: Some(event_type.to_string()),
            case_id: Some("case-1".to_string()),
            ..AgentContext::default()
        }
    }

    pub fn payload(latitude: f64, longitude: f64) -> Value {
        json!({
            "case_id": "case-1",
            "patient_id": "patient-1",
            "status": "new",
            "priority": 3,
            "origin": { "latitude": latitude, "longitude": longitude },
            "assignment": null,
            "reported_at": "2026-03-01T10:00:00.000000Z",
        })
    }
}
