//! End-to-end dispatch scenarios.
//!
//! These drive the engine through the public facade over a real database.

use std::sync::Arc;

use rescue_dispatch_core::geo::distance_meters;
use rescue_dispatch_core::models::{event_types, Assignment};
use rescue_dispatch_core::{
    Actor, ActorRole, AgentRegistry, AppConfig, CaseStatus, Coordinate, DispatchError,
    DispatchSystem, Facility, NewCase, ResponderKind,
};

fn karachi() -> Coordinate {
    Coordinate::new(24.8607, 67.0011).unwrap()
}

/// A point 10 km due north of Karachi's centre.
fn ten_km_north() -> Coordinate {
    let point = Coordinate::new(24.8607 + 10_000.0 / 111_195.0, 67.0011).unwrap();
    let d = distance_meters(&karachi(), &point);
    assert!((d - 10_000.0).abs() < 10.0, "fixture drifted: {}", d);
    point
}

fn system() -> DispatchSystem {
    DispatchSystem::open_in_memory(AppConfig::default(), AgentRegistry::new()).unwrap()
}

fn crew(id: &str) -> Actor {
    Actor::new(id, ActorRole::FieldUnit)
}

#[test]
fn unit_on_scene_beats_distant_facility() {
    let system = system();
    system.register_field_unit("unit-1", "Edhi 12").unwrap();
    system.report_field_unit("unit-1", karachi(), true).unwrap();

    let mut hospital = Facility::new("hosp-1".into(), "Civil Hospital".into());
    hospital.geocode = Some(ten_km_north());
    system.register_facility(hospital).unwrap();

    let created = system
        .engine()
        .create_case(NewCase::new("patient-1", karachi()).with_note("collapsed"))
        .unwrap();

    let score = created.assignment.unwrap();
    assert_eq!(score.kind, ResponderKind::FieldUnit);
    assert_eq!(score.id, "unit-1");
    assert_eq!(score.eta_millis, 0.0);

    let facility_eta = system
        .engine()
        .rank_for(&karachi())
        .unwrap()
        .into_iter()
        .find(|s| s.kind == ResponderKind::Facility)
        .unwrap()
        .eta_millis;
    // About 20 minutes at 30 km/h
    assert!((facility_eta - 1_200_000.0).abs() < 2_000.0, "got {}", facility_eta);

    let case = system.engine().get_case(&created.case.case_id).unwrap();
    assert_eq!(case.status, CaseStatus::Assigned);
    assert_eq!(case.log.len(), 2);
    assert_eq!(case.log[0].note.as_deref(), Some("collapsed"));
}

#[test]
fn no_candidates_leaves_case_new() {
    let system = system();
    // Registered but never reported: not a candidate
    system.register_field_unit("unit-1", "Edhi 12").unwrap();
    // No geocode, no area, no configured anchor: not a candidate
    system
        .register_facility(Facility::new("hosp-1".into(), "Unknown".into()))
        .unwrap();

    let created = system
        .engine()
        .create_case(NewCase::new("patient-1", karachi()))
        .unwrap();
    assert!(created.assignment.is_none());
    assert_eq!(created.case.status, CaseStatus::New);
    assert!(created.case.assignment.is_none());

    let backlog = system.engine().unassigned_backlog().unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].case_id, created.case.case_id);
}

#[test]
fn unavailable_unit_is_skipped() {
    let system = system();
    system.register_field_unit("busy", "Busy").unwrap();
    system.report_field_unit("busy", karachi(), false).unwrap();
    system.register_field_unit("free", "Free").unwrap();
    system
        .report_field_unit("free", Coordinate::new(24.87, 67.0011).unwrap(), true)
        .unwrap();

    let created = system
        .engine()
        .create_case(NewCase::new("patient-1", karachi()))
        .unwrap();
    assert_eq!(created.assignment.unwrap().id, "free");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_cases_may_win_same_unit() {
    let system = Arc::new(system());
    system.register_field_unit("unit-1", "Edhi 12").unwrap();
    system.report_field_unit("unit-1", karachi(), true).unwrap();

    let spawn_case = |patient: &'static str| {
        let system = system.clone();
        tokio::task::spawn_blocking(move || {
            system
                .engine()
                .create_case(NewCase::new(patient, karachi()))
        })
    };
    let first = spawn_case("patient-a");
    let second = spawn_case("patient-b");

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    // No reservation at ranking time: both cases get the same unit
    let expected = Some(Assignment {
        kind: ResponderKind::FieldUnit,
        responder_id: "unit-1".into(),
    });
    assert_eq!(first.case.assignment, expected);
    assert_eq!(second.case.assignment, expected);
    assert_eq!(
        system
            .engine()
            .cases_for_responder("unit-1", true)
            .unwrap()
            .len(),
        2
    );
}

/// Transition attempts from a fresh `new` case.
struct TransitionCase {
    id: &'static str,
    target: CaseStatus,
    role: ActorRole,
    allowed: bool,
}

fn transitions_from_new() -> Vec<TransitionCase> {
    vec![
        TransitionCase {
            id: "skip-to-in-progress",
            target: CaseStatus::InProgress,
            role: ActorRole::FieldUnit,
            allowed: false,
        },
        TransitionCase {
            id: "skip-to-acknowledged",
            target: CaseStatus::Acknowledged,
            role: ActorRole::Facility,
            allowed: false,
        },
        TransitionCase {
            id: "skip-to-completed",
            target: CaseStatus::Completed,
            role: ActorRole::Dispatcher,
            allowed: false,
        },
        TransitionCase {
            id: "stay-new",
            target: CaseStatus::New,
            role: ActorRole::FieldUnit,
            allowed: false,
        },
        TransitionCase {
            id: "patient-cannot-claim",
            target: CaseStatus::Assigned,
            role: ActorRole::Patient,
            allowed: false,
        },
        TransitionCase {
            id: "facility-claims",
            target: CaseStatus::Assigned,
            role: ActorRole::Facility,
            allowed: true,
        },
        TransitionCase {
            id: "unit-claims",
            target: CaseStatus::Assigned,
            role: ActorRole::FieldUnit,
            allowed: true,
        },
    ]
}

#[test]
fn transitions_from_new_case() {
    for tc in transitions_from_new() {
        let system = system();
        let created = system
            .engine()
            .create_case(NewCase::new("patient-1", karachi()))
            .unwrap();
        let id = created.case.case_id;

        let result = system.engine().update_status(
            &id,
            tc.target,
            Actor::new("actor-1", tc.role),
            None,
        );

        if tc.allowed {
            let case = result.unwrap_or_else(|e| panic!("{}: {}", tc.id, e));
            assert_eq!(case.status, tc.target, "{}", tc.id);
            assert_eq!(
                case.assignment.map(|a| a.responder_id),
                Some("actor-1".to_string()),
                "{}",
                tc.id
            );
        } else {
            let err = result.expect_err(tc.id);
            assert!(
                matches!(err, DispatchError::InvalidTransition { .. }),
                "{}: {:?}",
                tc.id,
                err
            );
            assert!(err.is_client_error());
            let case = system.engine().get_case(&id).unwrap();
            assert_eq!(case.status, CaseStatus::New, "{}", tc.id);
            assert_eq!(case.log.len(), 1, "{}", tc.id);
        }
    }
}

#[test]
fn full_lifecycle_and_no_going_back() {
    let system = system();
    system.register_field_unit("unit-1", "Edhi 12").unwrap();
    system.report_field_unit("unit-1", karachi(), true).unwrap();
    let id = system
        .engine()
        .create_case(NewCase::new("patient-1", karachi()).with_priority(5))
        .unwrap()
        .case
        .case_id;

    for next in [
        CaseStatus::Acknowledged,
        CaseStatus::InProgress,
        CaseStatus::Completed,
    ] {
        system
            .engine()
            .update_status(&id, next, crew("unit-1"), None)
            .unwrap();
    }

    let err = system
        .engine()
        .update_status(&id, CaseStatus::InProgress, crew("unit-1"), None)
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));

    let case = system.engine().get_case(&id).unwrap();
    let statuses: Vec<_> = case.log.iter().map(|e| e.status).collect();
    assert_eq!(statuses, CaseStatus::LIFECYCLE.to_vec());

    let changes: Vec<_> = system
        .bus()
        .events_for_case(&id)
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        changes,
        vec![
            event_types::CASE_CREATED,
            event_types::CASE_ASSIGNED,
            event_types::CASE_STATUS_CHANGED,
            event_types::CASE_STATUS_CHANGED,
            event_types::CASE_STATUS_CHANGED,
        ]
    );
}

#[test]
fn acknowledge_twice_keeps_first() {
    let system = system();
    let id = system
        .engine()
        .create_case(NewCase::new("patient-1", karachi()))
        .unwrap()
        .case
        .case_id;

    let first = system
        .engine()
        .acknowledge(&id, Actor::new("hosp-1", ActorRole::Facility))
        .unwrap();
    let second = system
        .engine()
        .acknowledge(&id, Actor::new("hosp-1", ActorRole::Facility))
        .unwrap();

    let first_ack = first.acknowledgement.unwrap();
    let second_ack = second.acknowledgement.unwrap();
    assert_eq!(first_ack.acknowledged_at, second_ack.acknowledged_at);
    assert_eq!(first_ack.actor.id, "hosp-1");

    let stored = system.engine().get_case(&id).unwrap();
    assert_eq!(stored.acknowledgement, Some(first_ack));
}

#[test]
fn cases_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.storage.path = dir.path().join("dispatch.db");

    let id = {
        let system = DispatchSystem::open(config.clone(), AgentRegistry::new()).unwrap();
        system
            .engine()
            .create_case(NewCase::new("patient-1", karachi()))
            .unwrap()
            .case
            .case_id
    };

    let system = DispatchSystem::open(config, AgentRegistry::new()).unwrap();
    let case = system.engine().get_case(&id).unwrap();
    assert_eq!(case.status, CaseStatus::New);
    assert_eq!(system.engine().unassigned_backlog().unwrap().len(), 1);
}
