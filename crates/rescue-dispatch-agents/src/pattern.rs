//! Spatial clustering of incoming cases.
//!
//! Case origins are bucketed into grid cells of roughly one kilometre. When
//! one cell collects `threshold` reports within `window`, the detector raises
//! a cluster alert (possible outbreak or mass-casualty incident).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use rescue_dispatch_core::models::event_types;
use rescue_dispatch_core::{Agent, AgentContext, AgentError, AgentOutput, Coordinate};

use crate::{CasePayload, SeenEvents};

/// About 1.1 km of latitude.
const DEFAULT_CELL_DEGREES: f64 = 0.01;

/// Alerts kept for inspection; older ones are dropped.
pub const MAX_RETAINED_ALERTS: usize = 256;

/// A grid cell, as integer multiples of the cell size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct GridCell {
    pub row: i64,
    pub col: i64,
}

impl GridCell {
    pub fn containing(point: &Coordinate, cell_degrees: f64) -> Self {
        Self {
            row: (point.latitude / cell_degrees).floor() as i64,
            col: (point.longitude / cell_degrees).floor() as i64,
        }
    }
}

/// Raised when a cell reaches the threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterAlert {
    pub cell: GridCell,
    pub case_count: usize,
    pub window_start: DateTime<Utc>,
    pub latest_case_id: String,
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub cell_degrees: f64,
    pub window: Duration,
    pub threshold: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            cell_degrees: DEFAULT_CELL_DEGREES,
            window: Duration::minutes(30),
            threshold: 3,
        }
    }
}

#[derive(Default)]
struct PatternState {
    seen: SeenEvents,
    sightings: HashMap<GridCell, VecDeque<DateTime<Utc>>>,
    alerts: Vec<ClusterAlert>,
}

/// Consumes `CaseCreated`.
#[derive(Default)]
pub struct PatternDetector {
    config: PatternConfig,
    state: Mutex<PatternState>,
}

impl PatternDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PatternState::default()),
        }
    }

    /// Most recent alerts, oldest first.
    pub fn alerts(&self) -> Result<Vec<ClusterAlert>, AgentError> {
        let state = self
            .state
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        Ok(state.alerts.clone())
    }

    #[cfg(test)]
    fn tracked_cells(&self) -> usize {
        self.state.lock().unwrap().sightings.len()
    }

    fn observe(
        &self,
        event_id: Option<&str>,
        payload: &CasePayload,
    ) -> Result<Value, AgentError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| AgentError::Failed(e.to_string()))?;

        if !state.seen.insert(event_id) {
            debug!(case_id = %payload.case_id, "Pattern detector already saw event");
            return Ok(json!({ "duplicate": true }));
        }

        let cell = GridCell::containing(&payload.origin, self.config.cell_degrees);
        let window_start = payload.reported_at - self.config.window;

        // Expire every cell, not only this one, so quiet cells are dropped
        state.sightings.retain(|_, times| {
            times.retain(|t| *t >= window_start);
            !times.is_empty()
        });
        let times = state.sightings.entry(cell).or_default();
        times.push_back(payload.reported_at);
        let count = times.len();

        let alert = (count >= self.config.threshold).then(|| ClusterAlert {
            cell,
            case_count: count,
            window_start,
            latest_case_id: payload.case_id.clone(),
        });

        if let Some(alert) = &alert {
            warn!(
                case_id = %payload.case_id,
                row = cell.row,
                col = cell.col,
                count,
                "Case cluster detected"
            );
            state.alerts.push(alert.clone());
            if state.alerts.len() > MAX_RETAINED_ALERTS {
                let excess = state.alerts.len() - MAX_RETAINED_ALERTS;
                state.alerts.drain(..excess);
            }
        }

        Ok(json!({ "cell": cell, "count": count, "alert": alert }))
    }
}

#[async_trait]
impl Agent for PatternDetector {
    async fn handle(&self, ctx: &AgentContext, input: Value) -> Result<AgentOutput, AgentError> {
        if ctx.event_type.as_deref() != Some(event_types::CASE_CREATED) {
            return Ok(AgentOutput::Text("ignored".into()));
        }
        let payload = CasePayload::parse(&input)?;
        Ok(AgentOutput::Structured(
            self.observe(ctx.event_id.as_deref(), &payload)?,
        ))
    }
}
