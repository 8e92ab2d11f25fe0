//! Running counters over the event stream.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use rescue_dispatch_core::models::event_types;
use rescue_dispatch_core::{Agent, AgentContext, AgentError, AgentOutput, CaseStatus};

use crate::{CasePayload, SeenEvents};

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsSnapshot {
    pub events_by_type: BTreeMap<String, u64>,
    pub completed_cases: u64,
    /// Assignments whose winner has no finite ETA
    pub unreachable_assignments: u64,
    pub mean_eta_secs: Option<f64>,
}

#[derive(Default)]
struct AnalyticsState {
    seen: SeenEvents,
    events_by_type: BTreeMap<String, u64>,
    completed_cases: u64,
    unreachable_assignments: u64,
    eta_total_millis: f64,
    eta_samples: u64,
}

#[derive(Default)]
pub struct AnalyticsAgent {
    state: Mutex<AnalyticsState>,
}

impl AnalyticsAgent {
    pub fn snapshot(&self) -> Result<AnalyticsSnapshot, AgentError> {
        let state = self
            .state
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        Ok(AnalyticsSnapshot {
            events_by_type: state.events_by_type.clone(),
            completed_cases: state.completed_cases,
            unreachable_assignments: state.unreachable_assignments,
            mean_eta_secs: (state.eta_samples > 0)
                .then(|| state.eta_total_millis / state.eta_samples as f64 / 1000.0),
        })
    }
}

#[async_trait]
impl Agent for AnalyticsAgent {
    async fn handle(&self, ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError> {
        let Some(event_type) = ctx.event_type.as_deref() else {
            return Err(AgentError::InvalidInput(
                "analytics only consumes events".into(),
            ));
        };
        let payload = CasePayload::parse(&input)?;

        let mut state = self
            .state
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        if !state.seen.insert(ctx.event_id.as_deref()) {
            return Ok(AgentOutput::Text("duplicate".into()));
        }

        *state
            .events_by_type
            .entry(event_type.to_string())
            .or_default() += 1;

        match event_type {
            event_types::CASE_ASSIGNED => match payload.score.and_then(|s| s.eta_millis) {
                Some(eta) => {
                    state.eta_total_millis += eta;
                    state.eta_samples += 1;
                }
                None => state.unreachable_assignments += 1,
            },
            event_types::CASE_STATUS_CHANGED if payload.status == CaseStatus::Completed => {
                state.completed_cases += 1;
            }
            _ => {}
        }

        let count = state.events_by_type[event_type];
        Ok(AgentOutput::Structured(
            json!({ "event_type": event_type, "count": count }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx, payload};

    fn assigned(eta_millis: Option<f64>) -> Value {
        let mut value = payload(24.86, 67.0);
        value["status"] = json!("assigned");
        value["score"] = json!({
            "kind": "field_unit",
            "id": "unit-1",
            "distance_meters": 100.0,
            "eta_millis": eta_millis,
        });
        value
    }

    #[tokio::test]
    async fn test_counts_and_mean_eta() {
        let agent = AnalyticsAgent::default();
        agent
            .handle(&ctx(event_types::CASE_CREATED, "e1"), payload(24.86, 67.0))
            .await
            .unwrap();
        agent
            .handle(&ctx(event_types::CASE_ASSIGNED, "e2"), assigned(Some(60_000.0)))
            .await
            .unwrap();
        agent
            .handle(&ctx(event_types::CASE_ASSIGNED, "e3"), assigned(Some(120_000.0)))
            .await
            .unwrap();
        agent
            .handle(&ctx(event_types::CASE_ASSIGNED, "e4"), assigned(None))
            .await
            .unwrap();

        let snapshot = agent.snapshot().unwrap();
        assert_eq!(snapshot.events_by_type["CaseCreated"], 1);
        assert_eq!(snapshot.events_by_type["CaseAssigned"], 3);
        assert_eq!(snapshot.unreachable_assignments, 1);
        assert_eq!(snapshot.mean_eta_secs, Some(90.0));
    }

    #[tokio::test]
    async fn test_completion_counted_once() {
        let agent = AnalyticsAgent::default();
        let mut value = payload(24.86, 67.0);
        value["status"] = json!("completed");
        value["from"] = json!("in_progress");
        for _ in 0..2 {
            agent
                .handle(&ctx(event_types::CASE_STATUS_CHANGED, "e9"), value.clone())
                .await
                .unwrap();
        }
        let snapshot = agent.snapshot().unwrap();
        assert_eq!(snapshot.completed_cases, 1);
        assert_eq!(snapshot.events_by_type["CaseStatusChanged"], 1);
        assert_eq!(snapshot.mean_eta_secs, None);
    }

    #[test]
    fn test_poisoned_counters_are_reported() {
        let agent = std::sync::Arc::new(AnalyticsAgent::default());
        let holder = agent.clone();
        let _ = std::thread::spawn(move || {
            let _guard = holder.state.lock().unwrap();
            panic!("poison the lock");
        })
        .join();
        assert!(matches!(agent.snapshot(), Err(AgentError::Failed(_))));
    }

    #[tokio::test]
    async fn test_direct_routing_rejected() {
        let agent = AnalyticsAgent::default();
        let err = agent
            .handle(&AgentContext::session("s1"), payload(24.86, 67.0))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidInput(_)));
    }
}
