//! Dispatch engine: case creation, automatic assignment and the status lifecycle.
//!
//! Every mutation writes the case row, its log entry and the events it
//! caused in one store transaction. Events are handed to the bus only after
//! that transaction commits.

mod ranking;

pub use ranking::*;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{DispatchConfig, EstimationConfig};
use crate::db::{Database, DbError};
use crate::directory::{NearbyResponder, ResponderDirectory};
use crate::events::EventBus;
use crate::geo::Coordinate;
use crate::models::{
    event_types, Actor, ActorRole, AgentEvent, Assignment, CandidateScore, CaseRejection,
    CaseStatus, EmergencyCase, EventTrigger, Priority,
};

/// Label recorded as the source of engine-emitted events.
pub const ENGINE_SOURCE: &str = "dispatch-engine";

/// Dispatch errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition for case {case_id}: {from} -> {to}")]
    InvalidTransition {
        case_id: String,
        from: CaseStatus,
        to: CaseStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Case {0} is already assigned")]
    AlreadyAssigned(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
}

impl DispatchError {
    /// Caller errors are not retried; everything else is infrastructure.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DispatchError::StoreUnavailable(_))
    }

    fn rejected(case_id: &str, rejection: CaseRejection) -> Self {
        match rejection {
            CaseRejection::InvalidTransition { from, to } => DispatchError::InvalidTransition {
                case_id: case_id.to_string(),
                from,
                to,
            },
            CaseRejection::AlreadyAssigned => DispatchError::AlreadyAssigned(case_id.to_string()),
        }
    }
}

impl From<DbError> for DispatchError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => DispatchError::NotFound(what),
            other => DispatchError::StoreUnavailable(other.to_string()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for DispatchError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DispatchError::StoreUnavailable(err.to_string())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Input for [`DispatchEngine::create_case`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewCase {
    pub patient_id: String,
    pub origin: Coordinate,
    /// Defaults to the lowest priority
    pub priority: Option<u8>,
    pub note: Option<String>,
    /// Defaults to the patient
    pub reported_by: Option<Actor>,
}

impl NewCase {
    pub fn new(patient_id: impl Into<String>, origin: Coordinate) -> Self {
        Self {
            patient_id: patient_id.into(),
            origin,
            priority: None,
            note: None,
            reported_by: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Result of creating (or re-trying) a case: the case plus the winning score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseCreation {
    pub case: EmergencyCase,
    /// `None` when no candidate was available
    pub assignment: Option<CandidateScore>,
}

/// Orchestrates ranking, assignment and status transitions.
#[derive(Clone)]
pub struct DispatchEngine {
    db: Arc<Mutex<Database>>,
    bus: Arc<EventBus>,
    dispatch: DispatchConfig,
    estimation: EstimationConfig,
}

impl DispatchEngine {
    pub fn new(
        db: Arc<Mutex<Database>>,
        bus: Arc<EventBus>,
        dispatch: DispatchConfig,
        estimation: EstimationConfig,
    ) -> Self {
        Self {
            db,
            bus,
            dispatch,
            estimation,
        }
    }

    /// Create a case and try to assign it right away.
    ///
    /// Finding no candidate is a successful outcome: the case stays `new`
    /// and joins the unassigned backlog.
    pub fn create_case(&self, request: NewCase) -> DispatchResult<CaseCreation> {
        if request.patient_id.trim().is_empty() {
            return Err(DispatchError::Validation("patient id is required".into()));
        }
        let origin = request
            .origin
            .validated()
            .map_err(|e| DispatchError::Validation(e.to_string()))?;
        let priority = match request.priority {
            Some(value) => Priority::new(value).map_err(DispatchError::Validation)?,
            None => Priority::default(),
        };
        let reporter = request
            .reported_by
            .unwrap_or_else(|| Actor::new(request.patient_id.clone(), ActorRole::Patient));

        let mut case = EmergencyCase::new(request.patient_id, origin, priority, reporter, request.note);
        let mut events = vec![case_event(event_types::CASE_CREATED, &case, Value::Null)];

        let winner = {
            let mut db = self.store()?;
            let winner = best_candidate(self.nearby(&db, &case.origin)?, &self.dispatch);
            events.push(self.apply_winner(&mut case, winner.as_ref())?);
            db.insert_case_with_events(&case, &events)?;
            winner
        };

        info!(
            case_id = %case.case_id,
            priority = case.priority.value(),
            status = %case.status,
            "Case created"
        );
        self.bus.deliver(events.into_iter().map(|e| e.event_id));

        Ok(CaseCreation {
            case,
            assignment: winner,
        })
    }

    /// Re-run ranking for a case still waiting in the backlog.
    ///
    /// Never replaces an existing assignment.
    pub fn retry_assignment(&self, case_id: &str) -> DispatchResult<CaseCreation> {
        let (case, events, winner) = {
            let mut db = self.store()?;
            let current = db
                .get_case(case_id)?
                .ok_or_else(|| DispatchError::NotFound(format!("case {}", case_id)))?;
            if current.is_assigned() {
                return Err(DispatchError::AlreadyAssigned(case_id.to_string()));
            }
            if current.status != CaseStatus::New {
                return Err(DispatchError::InvalidTransition {
                    case_id: case_id.to_string(),
                    from: current.status,
                    to: CaseStatus::Assigned,
                });
            }

            let winner = best_candidate(self.nearby(&db, &current.origin)?, &self.dispatch);
            let (case, events) = db.update_case(case_id, |case| {
                Ok::<_, DispatchError>(vec![self.apply_winner(case, winner.as_ref())?])
            })?;
            (case, events, winner)
        };

        self.bus.deliver(events.into_iter().map(|e| e.event_id));
        Ok(CaseCreation {
            case,
            assignment: winner,
        })
    }

    /// Move a case to the immediate successor of its current status.
    ///
    /// `new -> assigned` is a self-claim: only a field unit or facility may
    /// make it, and the actor becomes the assignee.
    pub fn update_status(
        &self,
        case_id: &str,
        new_status: CaseStatus,
        actor: Actor,
        note: Option<String>,
    ) -> DispatchResult<EmergencyCase> {
        let result = {
            let mut db = self.store()?;
            db.update_case(case_id, |case| {
                let from = case.status;
                if !from.can_transition_to(new_status) {
                    return Err(DispatchError::InvalidTransition {
                        case_id: case_id.to_string(),
                        from,
                        to: new_status,
                    });
                }

                if new_status == CaseStatus::Assigned {
                    let kind = actor.role.responder_kind().ok_or_else(|| {
                        DispatchError::InvalidTransition {
                            case_id: case_id.to_string(),
                            from,
                            to: new_status,
                        }
                    })?;
                    let assignment = Assignment {
                        kind,
                        responder_id: actor.id.clone(),
                    };
                    case.assign(assignment, actor.clone(), note.clone())
                        .map_err(|r| DispatchError::rejected(case_id, r))?;
                } else {
                    case.transition(new_status, actor.clone(), note.clone())
                        .map_err(|r| DispatchError::rejected(case_id, r))?;
                }

                Ok(vec![case_event(
                    event_types::CASE_STATUS_CHANGED,
                    case,
                    json!({ "from": from, "to": new_status, "actor": &actor }),
                )])
            })
        };

        let (case, events) = match result {
            Ok(updated) => updated,
            Err(e) => {
                if let DispatchError::InvalidTransition { .. } = e {
                    debug!(case_id = %case_id, "Rejected status change: {}", e);
                }
                return Err(e);
            }
        };

        info!(case_id = %case.case_id, status = %case.status, actor = %actor.id, "Case status changed");
        self.bus.deliver(events.into_iter().map(|e| e.event_id));
        Ok(case)
    }

    /// Record the first acknowledgement. Later calls return the case unchanged.
    pub fn acknowledge(&self, case_id: &str, actor: Actor) -> DispatchResult<EmergencyCase> {
        if actor.role.responder_kind().is_none() {
            return Err(DispatchError::Validation(format!(
                "role {} cannot acknowledge a case",
                actor.role.as_str()
            )));
        }

        let (case, events) = {
            let mut db = self.store()?;
            db.update_case(case_id, |case| {
                if !case.acknowledge(actor.clone()) {
                    return Ok::<_, DispatchError>(Vec::new());
                }
                Ok(vec![case_event(
                    event_types::CASE_ACKNOWLEDGED,
                    case,
                    json!({ "acknowledgement": &case.acknowledgement }),
                )])
            })?
        };

        if !events.is_empty() {
            info!(case_id = %case.case_id, actor = %actor.id, "Case acknowledged");
        }
        self.bus.deliver(events.into_iter().map(|e| e.event_id));
        Ok(case)
    }

    pub fn get_case(&self, case_id: &str) -> DispatchResult<EmergencyCase> {
        self.store()?
            .get_case(case_id)?
            .ok_or_else(|| DispatchError::NotFound(format!("case {}", case_id)))
    }

    /// Cases assigned to a responder, newest first.
    pub fn cases_for_responder(
        &self,
        responder_id: &str,
        open_only: bool,
    ) -> DispatchResult<Vec<EmergencyCase>> {
        Ok(self
            .store()?
            .list_cases_for_responder(responder_id, open_only)?)
    }

    pub fn cases_by_status(&self, status: CaseStatus) -> DispatchResult<Vec<EmergencyCase>> {
        Ok(self.store()?.list_cases_by_status(status)?)
    }

    /// Cases still `new` with nobody assigned, oldest first.
    pub fn unassigned_backlog(&self) -> DispatchResult<Vec<EmergencyCase>> {
        Ok(self.store()?.list_unassigned_cases()?)
    }

    /// Score every candidate near `origin` without assigning anything.
    pub fn rank_for(&self, origin: &Coordinate) -> DispatchResult<Vec<CandidateScore>> {
        let db = self.store()?;
        Ok(rank_candidates(self.nearby(&db, origin)?, &self.dispatch))
    }

    /// Nearest field units and facilities, up to the configured limits.
    fn nearby(&self, db: &Database, origin: &Coordinate) -> DispatchResult<Vec<NearbyResponder>> {
        let directory =
            ResponderDirectory::new(db, self.estimation.anchor, self.estimation.radius_meters);
        let mut nearby = directory.nearest_field_units(origin, self.dispatch.field_unit_candidates)?;
        nearby.extend(directory.nearest_facilities(origin, self.dispatch.facility_candidates)?);
        Ok(nearby)
    }

    /// Assign the winner, or report the case as unassigned. Returns the event to emit.
    fn apply_winner(
        &self,
        case: &mut EmergencyCase,
        winner: Option<&CandidateScore>,
    ) -> DispatchResult<AgentEvent> {
        let Some(score) = winner else {
            warn!(case_id = %case.case_id, "No candidate available, case left unassigned");
            return Ok(case_event(event_types::CASE_UNASSIGNED, case, Value::Null));
        };

        let assignment = Assignment {
            kind: score.kind,
            responder_id: score.id.clone(),
        };
        case.assign(assignment, Actor::system(), Some(score.summary()))
            .map_err(|r| DispatchError::rejected(&case.case_id, r))?;

        info!(
            case_id = %case.case_id,
            responder_kind = %score.kind,
            responder_id = %score.id,
            distance_meters = score.distance_meters,
            eta_secs = ?score.eta_seconds(),
            "Case assigned"
        );
        Ok(case_event(
            event_types::CASE_ASSIGNED,
            case,
            json!({ "score": score }),
        ))
    }

    fn store(&self) -> DispatchResult<MutexGuard<'_, Database>> {
        Ok(self.db.lock()?)
    }
}

/// Build an event about a case. `details` fields are merged into the payload.
fn case_event(event_type: &str, case: &EmergencyCase, details: Value) -> AgentEvent {
    let mut payload = json!({
        "case_id": &case.case_id,
        "patient_id": &case.patient_id,
        "status": case.status,
        "priority": case.priority,
        "origin": case.origin,
        "assignment": &case.assignment,
        "reported_at": case.created_at,
    });
    if let (Some(fields), Value::Object(extra)) = (payload.as_object_mut(), details) {
        fields.extend(extra);
    }
    AgentEvent::new(
        event_type,
        payload,
        EventTrigger::for_case(ENGINE_SOURCE, case.case_id.clone()),
    )
}
