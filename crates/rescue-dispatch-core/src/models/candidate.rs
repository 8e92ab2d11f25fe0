//! Ranking candidates and their transient scores.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

/// The two populations a case can be assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponderKind {
    /// Mobile crew with a live location
    FieldUnit,
    /// Hospital at a fixed (possibly estimated) location
    Facility,
}

impl ResponderKind {
    /// Tie-break order: field units can start treatment sooner.
    pub fn preference_rank(self) -> u8 {
        match self {
            ResponderKind::FieldUnit => 0,
            ResponderKind::Facility => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponderKind::FieldUnit => "field_unit",
            ResponderKind::Facility => "facility",
        }
    }
}

impl fmt::Display for ResponderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "field_unit" => Ok(ResponderKind::FieldUnit),
            "facility" => Ok(ResponderKind::Facility),
            _ => Err(format!("Unknown responder kind: {}", s)),
        }
    }
}

/// A responder eligible for ranking: it has a usable location.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub kind: ResponderKind,
    pub id: String,
    pub location: Coordinate,
}

/// Score of one candidate for one case. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub kind: ResponderKind,
    pub id: String,
    pub distance_meters: f64,
    /// `f64::INFINITY` when the candidate cannot be reached
    pub eta_millis: f64,
}

impl CandidateScore {
    /// ETA in whole seconds, or `None` when unreachable.
    pub fn eta_seconds(&self) -> Option<u64> {
        self.eta_millis
            .is_finite()
            .then(|| (self.eta_millis / 1000.0).round() as u64)
    }

    /// Human-readable summary folded into the case log on assignment.
    pub fn summary(&self) -> String {
        let eta = match self.eta_seconds() {
            Some(secs) => format!("{}s", secs),
            None => "unreachable".to_string(),
        };
        format!(
            "assigned {} {} (distance {:.0} m, eta {})",
            self.kind, self.id, self.distance_meters, eta
        )
    }
}
