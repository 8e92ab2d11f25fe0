//! Name-keyed agent registry.
//!
//! Built once at startup and passed by reference to whatever routes turns or
//! wires event subscriptions. There is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::{debug, warn};

use super::{Agent, AgentContext, AgentError, AgentOutput};
use crate::events::{EventBus, EventHandler, HandlerError};
use crate::models::AgentEvent;

/// Minimum similarity for an unknown-name suggestion.
const SUGGESTION_THRESHOLD: f64 = 0.8;

/// Routing errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("Unknown agent '{name}'{}", suggestion_hint(.suggestion))]
    UnknownAgent {
        name: String,
        suggestion: Option<String>,
    },

    #[error("Agent '{name}' failed: {source}")]
    Agent {
        name: String,
        #[source]
        source: AgentError,
    },
}

fn suggestion_hint(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(" (did you mean '{}'?)", s),
        None => String::new(),
    }
}

/// Registry of named agents.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. The last registration for a name wins.
    ///
    /// Returns the replaced agent, if any.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Option<Arc<dyn Agent>> {
        let name = name.into();
        let previous = self.agents.insert(name.clone(), agent);
        if previous.is_some() {
            warn!(agent = %name, "Agent re-registered, replacing previous handler");
        } else {
            debug!(agent = %name, "Registered agent");
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Route one interactive turn to a named agent.
    pub async fn route(
        &self,
        name: &str,
        ctx: &AgentContext,
        input: Value,
    ) -> Result<AgentOutput, RouteError> {
        let agent = self.resolve(name)?;
        agent.handle(ctx, input).await.map_err(|source| RouteError::Agent {
            name: name.to_string(),
            source,
        })
    }

    /// Subscribe a registered agent to an event type on `bus`.
    pub fn subscribe(
        &self,
        bus: &mut EventBus,
        event_type: &str,
        agent_name: &str,
    ) -> Result<(), RouteError> {
        let agent = self.resolve(agent_name)?;
        bus.subscribe(
            event_type,
            Arc::new(AgentSubscriber::new(agent_name, agent)),
        );
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Arc<dyn Agent>, RouteError> {
        self.get(name).ok_or_else(|| RouteError::UnknownAgent {
            name: name.to_string(),
            suggestion: self.closest_name(name),
        })
    }

    fn closest_name(&self, name: &str) -> Option<String> {
        self.agents
            .keys()
            .map(|candidate| (candidate, jaro_winkler(name, candidate)))
            .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(candidate, _)| candidate.clone())
    }
}

/// Adapts an [`Agent`] to the event bus.
///
/// The event payload becomes the agent's input; the output is discarded.
pub struct AgentSubscriber {
    name: String,
    agent: Arc<dyn Agent>,
}

impl AgentSubscriber {
    pub fn new(name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        Self {
            name: name.into(),
            agent,
        }
    }
}

#[async_trait]
impl EventHandler for AgentSubscriber {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &AgentEvent) -> Result<(), HandlerError> {
        let ctx = AgentContext::for_event(event);
        match self.agent.handle(&ctx, event.payload.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(HandlerError::failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventBusConfig;
    use crate::db::Database;
    use serde_json::json;
    use std::sync::Mutex;

    struct Echo(&'static str);

    #[async_trait]
    impl Agent for Echo {
        async fn handle(&self, _ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError> {
            Ok(AgentOutput::Structured(json!({ "by": self.0, "input": input })))
        }
    }

    struct Refuse;

    #[async_trait]
    impl Agent for Refuse {
        async fn handle(&self, _ctx: &AgentContext, _input: Value) -> Result<AgentOutput, AgentError> {
            Err(AgentError::InvalidInput("nothing to do".into()))
        }
    }

    #[tokio::test]
    async fn test_route_to_registered() {
        let mut registry = AgentRegistry::new();
        registry.register("triage", Arc::new(Echo("triage")));

        let output = registry
            .route("triage", &AgentContext::session("s-1"), json!("fever"))
            .await
            .unwrap();
        assert_eq!(output.into_value()["by"], "triage");
    }

    #[tokio::test]
    async fn test_unknown_agent_with_suggestion() {
        let mut registry = AgentRegistry::new();
        registry.register("triage", Arc::new(Echo("triage")));

        let err = registry
            .route("triag", &AgentContext::default(), Value::Null)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RouteError::UnknownAgent {
                name: "triag".into(),
                suggestion: Some("triage".into()),
            }
        );
        assert!(err.to_string().contains("did you mean 'triage'"));

        let err = registry
            .route("knowledge", &AgentContext::default(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::UnknownAgent { suggestion: None, .. }));
    }

    #[tokio::test]
    async fn test_agent_failure_is_named() {
        let mut registry = AgentRegistry::new();
        registry.register("refuse", Arc::new(Refuse));
        let err = registry
            .route("refuse", &AgentContext::default(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Agent { ref name, .. } if name == "refuse"));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let mut registry = AgentRegistry::new();
        assert!(registry.register("a", Arc::new(Echo("first"))).is_none());
        assert!(registry.register("a", Arc::new(Echo("second"))).is_some());
        assert_eq!(registry.len(), 1);

        let output = registry
            .route("a", &AgentContext::default(), Value::Null)
            .await
            .unwrap();
        assert_eq!(output.into_value()["by"], "second");
    }

    #[test]
    fn test_subscribe_requires_known_agent() {
        let db = Arc::new(Mutex::new(Database::open_in_memory().unwrap()));
        let mut bus = EventBus::new(db, EventBusConfig::default());
        let mut registry = AgentRegistry::new();
        registry.register("pattern", Arc::new(Echo("pattern")));

        registry
            .subscribe(&mut bus, "CaseCreated", "pattern")
            .unwrap();
        assert_eq!(bus.subscriber_count("CaseCreated"), 1);

        assert!(registry.subscribe(&mut bus, "CaseCreated", "nope").is_err());
        assert_eq!(bus.subscriber_count("CaseCreated"), 1);
    }
}
