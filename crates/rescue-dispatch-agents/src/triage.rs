//! Keyword triage for free-text emergency reports.
//!
//! Suggests a priority from symptoms mentioned in a caller's message. Meant
//! for direct routing from a reporting session; a dispatcher confirms the
//! priority before the case is created.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use rescue_dispatch_core::{Agent, AgentContext, AgentError, AgentOutput, Priority};

/// One keyword rule. Matching is case-insensitive substring search.
#[derive(Debug, Clone, Copy)]
pub struct TriageRule {
    pub keyword: &'static str,
    pub priority: u8,
    pub advice: &'static str,
}

const DEFAULT_RULES: &[TriageRule] = &[
    TriageRule { keyword: "not breathing", priority: 5, advice: "Start chest compressions" },
    TriageRule { keyword: "unconscious", priority: 5, advice: "Check breathing, place in recovery position" },
    TriageRule { keyword: "cardiac", priority: 5, advice: "Start chest compressions" },
    TriageRule { keyword: "heart attack", priority: 5, advice: "Keep the patient seated and calm" },
    TriageRule { keyword: "chest pain", priority: 4, advice: "Keep the patient seated and calm" },
    TriageRule { keyword: "bleeding", priority: 4, advice: "Apply firm pressure to the wound" },
    TriageRule { keyword: "seizure", priority: 4, advice: "Clear the area, do not restrain" },
    TriageRule { keyword: "burn", priority: 3, advice: "Cool the burn with running water" },
    TriageRule { keyword: "accident", priority: 3, advice: "Do not move the injured" },
    TriageRule { keyword: "fracture", priority: 2, advice: "Immobilise the limb" },
    TriageRule { keyword: "fever", priority: 2, advice: "Keep the patient hydrated" },
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriageResult {
    pub priority: Priority,
    pub matched: Vec<String>,
    pub advice: Vec<String>,
}

pub struct KeywordTriage {
    rules: Vec<TriageRule>,
}

impl Default for KeywordTriage {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec())
    }
}

impl KeywordTriage {
    pub fn new(rules: Vec<TriageRule>) -> Self {
        Self { rules }
    }

    /// Highest matched priority, or the lowest priority if nothing matches.
    pub fn assess(&self, message: &str) -> TriageResult {
        let lower = message.to_lowercase();
        let mut matched = Vec::new();
        let mut advice: Vec<String> = Vec::new();
        let mut level = Priority::MIN;

        for rule in self.rules.iter().filter(|r| lower.contains(r.keyword)) {
            matched.push(rule.keyword.to_string());
            if !advice.iter().any(|a| a == rule.advice) {
                advice.push(rule.advice.to_string());
            }
            level = level.max(rule.priority.clamp(Priority::MIN, Priority::MAX));
        }

        TriageResult {
            priority: Priority::new(level).unwrap_or_default(),
            matched,
            advice,
        }
    }
}

fn message_from(input: &Value) -> Option<&str> {
    match input {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("message").and_then(Value::as_str),
        _ => None,
    }
}

#[async_trait]
impl Agent for KeywordTriage {
    async fn handle(&self, _ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError> {
        let message = message_from(&input)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| AgentError::InvalidInput("message is required".into()))?;

        Ok(AgentOutput::Structured(json!(self.assess(message))))
    }
}
