//! Emergency case models and the status lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::candidate::ResponderKind;
use crate::geo::Coordinate;

/// Current version of the [`LogEntry`] record layout.
pub const LOG_ENTRY_VERSION: u16 = 1;

/// Case status. Transitions only ever move one step forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Reported, not yet assigned
    New,
    /// A responder has been chosen
    Assigned,
    /// The responder confirmed it is on the way
    Acknowledged,
    /// Treatment or transport under way
    InProgress,
    /// Case closed
    Completed,
}

impl CaseStatus {
    /// All statuses in lifecycle order.
    pub const LIFECYCLE: [CaseStatus; 5] = [
        CaseStatus::New,
        CaseStatus::Assigned,
        CaseStatus::Acknowledged,
        CaseStatus::InProgress,
        CaseStatus::Completed,
    ];

    /// The only status this one may move to, if any.
    pub fn successor(self) -> Option<CaseStatus> {
        match self {
            CaseStatus::New => Some(CaseStatus::Assigned),
            CaseStatus::Assigned => Some(CaseStatus::Acknowledged),
            CaseStatus::Acknowledged => Some(CaseStatus::InProgress),
            CaseStatus::InProgress => Some(CaseStatus::Completed),
            CaseStatus::Completed => None,
        }
    }

    /// Whether `next` is the immediate successor of `self`.
    pub fn can_transition_to(self, next: CaseStatus) -> bool {
        self.successor() == Some(next)
    }

    pub fn is_open(self) -> bool {
        self != CaseStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::New => "new",
            CaseStatus::Assigned => "assigned",
            CaseStatus::Acknowledged => "acknowledged",
            CaseStatus::InProgress => "in_progress",
            CaseStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(CaseStatus::New),
            "assigned" => Ok(CaseStatus::Assigned),
            "acknowledged" => Ok(CaseStatus::Acknowledged),
            "in_progress" => Ok(CaseStatus::InProgress),
            "completed" => Ok(CaseStatus::Completed),
            _ => Err(format!("Unknown case status: {}", s)),
        }
    }
}

/// Case urgency, 1 (lowest) to 5 (most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    /// Create a priority, rejecting values outside 1..=5.
    pub fn new(value: u8) -> Result<Self, String> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!(
                "Priority must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            ))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p.0
    }
}

/// Role of whoever caused a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// The engine itself (automatic assignment)
    System,
    /// Human operator at the dispatch desk
    Dispatcher,
    /// Mobile responder crew
    FieldUnit,
    /// Hospital staff
    Facility,
    /// The reporting patient or a bystander
    Patient,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::System => "system",
            ActorRole::Dispatcher => "dispatcher",
            ActorRole::FieldUnit => "field_unit",
            ActorRole::Facility => "facility",
            ActorRole::Patient => "patient",
        }
    }

    /// The responder kind an actor of this role can be assigned as.
    pub fn responder_kind(self) -> Option<ResponderKind> {
        match self {
            ActorRole::FieldUnit => Some(ResponderKind::FieldUnit),
            ActorRole::Facility => Some(ResponderKind::Facility),
            _ => None,
        }
    }
}

impl FromStr for ActorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(ActorRole::System),
            "dispatcher" => Ok(ActorRole::Dispatcher),
            "field_unit" => Ok(ActorRole::FieldUnit),
            "facility" => Ok(ActorRole::Facility),
            "patient" => Ok(ActorRole::Patient),
            _ => Err(format!("Unknown actor role: {}", s)),
        }
    }
}

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: ActorRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// The engine acting on its own behalf.
    pub fn system() -> Self {
        Self::new("dispatch-engine", ActorRole::System)
    }
}

/// One entry in a case's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Record layout version
    pub version: u16,
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    /// Case status at the time of the entry
    pub status: CaseStatus,
    pub note: Option<String>,
}

impl LogEntry {
    pub fn new(actor: Actor, status: CaseStatus, note: Option<String>) -> Self {
        Self {
            version: LOG_ENTRY_VERSION,
            timestamp: super::now(),
            actor,
            status,
            note,
        }
    }
}

/// The responder a case is assigned to. Kind and id only ever travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: ResponderKind,
    pub responder_id: String,
}

/// First acknowledgement of a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub actor: Actor,
    pub acknowledged_at: DateTime<Utc>,
}

/// Why an in-memory case mutation was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseRejection {
    /// Target status is not the immediate successor
    InvalidTransition { from: CaseStatus, to: CaseStatus },
    /// An assignment already exists and cannot be replaced
    AlreadyAssigned,
}

/// A reported emergency and its full lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCase {
    pub case_id: String,
    pub patient_id: String,
    pub origin: Coordinate,
    pub priority: Priority,
    pub assignment: Option<Assignment>,
    pub status: CaseStatus,
    pub log: Vec<LogEntry>,
    pub acknowledgement: Option<Acknowledgement>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmergencyCase {
    /// Create a case in `new`, with its opening log entry.
    pub fn new(
        patient_id: String,
        origin: Coordinate,
        priority: Priority,
        reported_by: Actor,
        note: Option<String>,
    ) -> Self {
        let opening = LogEntry::new(reported_by, CaseStatus::New, note);
        let now = opening.timestamp;
        Self {
            case_id: uuid::Uuid::new_v4().to_string(),
            patient_id,
            origin,
            priority,
            assignment: None,
            status: CaseStatus::New,
            log: vec![opening],
            acknowledgement: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.assignment.is_some()
    }

    /// Unassigned backlog: still `new` with nobody attached.
    pub fn is_unassigned(&self) -> bool {
        self.status == CaseStatus::New && self.assignment.is_none()
    }

    /// Attach a responder and move `new -> assigned` in one step.
    pub fn assign(
        &mut self,
        assignment: Assignment,
        actor: Actor,
        note: Option<String>,
    ) -> Result<(), CaseRejection> {
        if self.assignment.is_some() {
            return Err(CaseRejection::AlreadyAssigned);
        }
        if !self.status.can_transition_to(CaseStatus::Assigned) {
            return Err(CaseRejection::InvalidTransition {
                from: self.status,
                to: CaseStatus::Assigned,
            });
        }
        self.assignment = Some(assignment);
        self.push_status(CaseStatus::Assigned, actor, note);
        Ok(())
    }

    /// Move to `next`, which must be the immediate successor.
    ///
    /// `assigned` is reached through [`EmergencyCase::assign`] instead.
    pub fn transition(
        &mut self,
        next: CaseStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<(), CaseRejection> {
        if next == CaseStatus::Assigned || !self.status.can_transition_to(next) {
            return Err(CaseRejection::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.push_status(next, actor, note);
        Ok(())
    }

    /// Record the first acknowledgement. Returns `false` if one already exists.
    pub fn acknowledge(&mut self, actor: Actor) -> bool {
        if self.acknowledgement.is_some() {
            return false;
        }
        let entry = LogEntry::new(actor.clone(), self.status, Some("acknowledged".into()));
        self.acknowledgement = Some(Acknowledgement {
            actor,
            acknowledged_at: entry.timestamp,
        });
        self.updated_at = entry.timestamp;
        self.log.push(entry);
        true
    }

    /// The most recent log entry.
    pub fn last_entry(&self) -> Option<&LogEntry> {
        self.log.last()
    }

    fn push_status(&mut self, status: CaseStatus, actor: Actor, note: Option<String>) {
        let entry = LogEntry::new(actor, status, note);
        self.status = status;
        self.updated_at = entry.timestamp;
        self.log.push(entry);
    }
}
