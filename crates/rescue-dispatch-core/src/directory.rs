//! Responder directory: k-nearest queries over field units and facilities.
//!
//! Read-only from the dispatch engine's perspective. Availability and
//! positions are written by the responders' own self-reports.

use std::cmp::Ordering;

use crate::db::{Database, DbResult};
use crate::geo::{distance_meters, Coordinate};
use crate::models::{Candidate, ResponderKind};

/// A candidate with its straight-line distance from the query origin.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyResponder {
    pub candidate: Candidate,
    pub distance_meters: f64,
}

/// Nearest-responder lookups.
pub struct ResponderDirectory<'a> {
    db: &'a Database,
    anchor: Option<Coordinate>,
    radius_meters: f64,
}

impl<'a> ResponderDirectory<'a> {
    /// Create a directory view.
    ///
    /// `anchor` and `radius_meters` place facilities that have neither a
    /// geocode nor an area centroid.
    pub fn new(db: &'a Database, anchor: Option<Coordinate>, radius_meters: f64) -> Self {
        Self {
            db,
            anchor,
            radius_meters,
        }
    }

    /// Up to `limit` available field units with a known position, nearest first.
    ///
    /// Equal distances prefer the unit that reported most recently.
    pub fn nearest_field_units(
        &self,
        origin: &Coordinate,
        limit: usize,
    ) -> DbResult<Vec<NearbyResponder>> {
        let mut scored: Vec<_> = self
            .db
            .list_candidate_field_units()?
            .into_iter()
            .filter_map(|unit| {
                let location = unit.location.filter(|_| unit.is_available)?;
                Some((
                    NearbyResponder {
                        distance_meters: distance_meters(origin, &location),
                        candidate: Candidate {
                            kind: ResponderKind::FieldUnit,
                            id: unit.unit_id,
                            location,
                        },
                    },
                    unit.last_seen_at,
                ))
            })
            .collect();

        // None sorts before Some, so reverse the option comparison for "newest first"
        scored.sort_by(|(a, seen_a), (b, seen_b)| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| seen_b.cmp(seen_a))
                .then_with(|| a.candidate.id.cmp(&b.candidate.id))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(nearby, _)| nearby)
            .collect())
    }

    /// Up to `limit` facilities with a usable position, nearest first.
    ///
    /// Facilities without a geocode use their deterministic estimate, so
    /// repeated queries return the same answer.
    pub fn nearest_facilities(
        &self,
        origin: &Coordinate,
        limit: usize,
    ) -> DbResult<Vec<NearbyResponder>> {
        let mut scored: Vec<NearbyResponder> = self
            .db
            .list_facilities()?
            .into_iter()
            .filter_map(|facility| {
                let location = facility
                    .resolve_location(self.anchor.as_ref(), self.radius_meters)?
                    .coordinate();
                Some(NearbyResponder {
                    distance_meters: distance_meters(origin, &location),
                    candidate: Candidate {
                        kind: ResponderKind::Facility,
                        id: facility.facility_id,
                        location,
                    },
                })
            })
            .collect();

        scored.sort_by(|a, b| match a.distance_meters.total_cmp(&b.distance_meters) {
            Ordering::Equal => a.candidate.id.cmp(&b.candidate.id),
            other => other,
        });
        scored.truncate(limit);

        Ok(scored)
    }
}
