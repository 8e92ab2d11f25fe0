//! Candidate ranking by projected arrival time.
//!
//! Order:
//! 1. ETA ascending (unreachable candidates last)
//! 2. Distance ascending
//! 3. Field units before facilities

use crate::config::DispatchConfig;
use crate::directory::NearbyResponder;
use crate::geo::eta_for_distance;
use crate::models::CandidateScore;

/// Score every candidate with its type-specific speed and sort best first.
pub fn rank_candidates(
    candidates: impl IntoIterator<Item = NearbyResponder>,
    speeds: &DispatchConfig,
) -> Vec<CandidateScore> {
    let mut scored: Vec<CandidateScore> = candidates
        .into_iter()
        .map(|nearby| {
            let speed = speeds.speed_for(nearby.candidate.kind);
            CandidateScore {
                kind: nearby.candidate.kind,
                id: nearby.candidate.id,
                distance_meters: nearby.distance_meters,
                eta_millis: eta_for_distance(nearby.distance_meters, speed),
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        a.eta_millis
            .total_cmp(&b.eta_millis)
            .then_with(|| a.distance_meters.total_cmp(&b.distance_meters))
            .then_with(|| a.kind.preference_rank().cmp(&b.kind.preference_rank()))
    });

    scored
}

/// The winning candidate, if any.
pub fn best_candidate(
    candidates: impl IntoIterator<Item = NearbyResponder>,
    speeds: &DispatchConfig,
) -> Option<CandidateScore> {
    rank_candidates(candidates, speeds).into_iter().next()
}
