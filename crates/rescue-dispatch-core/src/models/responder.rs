//! Responder models: mobile field units and fixed facilities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{estimated_coordinate, Coordinate};

/// A mobile responder (ambulance crew, frontliner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUnit {
    pub unit_id: String,
    pub name: String,
    /// Last self-reported position, `None` until the first report
    pub location: Option<Coordinate>,
    pub is_available: bool,
    /// Time of the last self-report
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl FieldUnit {
    /// Register a unit. It stays out of ranking until it reports a position.
    pub fn new(unit_id: String, name: String) -> Self {
        Self {
            unit_id,
            name,
            location: None,
            is_available: false,
            last_seen_at: None,
            created_at: super::now(),
        }
    }

    /// Whether the unit can be ranked at all.
    pub fn is_candidate(&self) -> bool {
        self.is_available && self.location.is_some()
    }
}

/// A hospital or clinic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub facility_id: String,
    pub name: String,
    /// Authoritative geocoded position
    pub geocode: Option<Coordinate>,
    /// Centroid of the facility's area, used to estimate a position
    pub area: Option<Coordinate>,
    /// Capability tags (e.g. "trauma", "maternity")
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Where a facility is believed to be, and how that was determined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum FacilityLocation {
    Geocoded { coordinate: Coordinate },
    Estimated { coordinate: Coordinate },
}

impl FacilityLocation {
    pub fn coordinate(&self) -> Coordinate {
        match self {
            FacilityLocation::Geocoded { coordinate } | FacilityLocation::Estimated { coordinate } => {
                *coordinate
            }
        }
    }
}

impl Facility {
    pub fn new(facility_id: String, name: String) -> Self {
        Self {
            facility_id,
            name,
            geocode: None,
            area: None,
            tags: Vec::new(),
            created_at: super::now(),
        }
    }

    /// Resolve a usable position.
    ///
    /// Prefers the geocode. Otherwise places the facility deterministically
    /// around its area centroid, or around `fallback_anchor`. Returns `None`
    /// when there is nothing to anchor an estimate on.
    pub fn resolve_location(
        &self,
        fallback_anchor: Option<&Coordinate>,
        radius_meters: f64,
    ) -> Option<FacilityLocation> {
        if let Some(coordinate) = self.geocode {
            return Some(FacilityLocation::Geocoded { coordinate });
        }
        let anchor = self.area.as_ref().or(fallback_anchor)?;
        Some(FacilityLocation::Estimated {
            coordinate: estimated_coordinate(&self.facility_id, anchor, radius_meters),
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor() -> Coordinate {
        Coordinate::new(24.8607, 67.0011).unwrap()
    }

    #[test]
    fn test_new_unit_is_not_candidate() {
        let mut unit = FieldUnit::new("unit-1".into(), "Edhi 12".into());
        assert!(!unit.is_candidate());

        unit.is_available = true;
        assert!(!unit.is_candidate(), "no location yet");

        unit.location = Some(anchor());
        assert!(unit.is_candidate());
    }

    #[test]
    fn test_geocode_wins() {
        let mut facility = Facility::new("hosp-1".into(), "Civil Hospital".into());
        facility.geocode = Some(anchor());
        facility.area = Some(Coordinate::new(25.0, 67.1).unwrap());

        assert_eq!(
            facility.resolve_location(None, 3000.0),
            Some(FacilityLocation::Geocoded {
                coordinate: anchor()
            })
        );
    }

    #[test]
    fn test_estimate_stable() {
        let mut facility = Facility::new("hosp-2".into(), "Jinnah".into());
        facility.area = Some(anchor());

        let first = facility.resolve_location(None, 3000.0).unwrap();
        let second = facility.resolve_location(None, 3000.0).unwrap();
        assert!(matches!(first, FacilityLocation::Estimated { .. }));
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_anchor_no_location() {
        let facility = Facility::new("hosp-3".into(), "Unknown".into());
        assert_eq!(facility.resolve_location(None, 3000.0), None);
        assert!(facility.resolve_location(Some(&anchor()), 3000.0).is_some());
    }

    #[test]
    fn test_tags_case_insensitive() {
        let mut facility = Facility::new("hosp-4".into(), "Aga Khan".into());
        facility.tags = vec!["Trauma".into()];
        assert!(facility.has_tag("trauma"));
        assert!(!facility.has_tag("burns"));
    }
}
