//! Emergency case database operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::events::insert_event_row;
use super::{format_ts, parse_ts, Database, DbError, DbResult};
use crate::geo::Coordinate;
use crate::models::{
    Acknowledgement, AgentEvent, Assignment, CaseStatus, EmergencyCase, LogEntry, Priority,
    ResponderKind,
};

const CASE_COLUMNS: &str = r#"
    case_id, patient_id, origin_latitude, origin_longitude, priority,
    assigned_to_type, assigned_to_id, status, log, acknowledgement,
    created_at, updated_at
"#;

impl Database {
    /// Insert a case together with the events it produced, atomically.
    pub fn insert_case_with_events(
        &mut self,
        case: &EmergencyCase,
        events: &[AgentEvent],
    ) -> DbResult<()> {
        let tx = self.conn.transaction()?;
        insert_case_row(&tx, case)?;
        for event in events {
            insert_event_row(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a case by ID.
    pub fn get_case(&self, case_id: &str) -> DbResult<Option<EmergencyCase>> {
        load_case(&self.conn, case_id)
    }

    /// Atomically load, mutate and store a case.
    ///
    /// `mutate` returns the events caused by the change; they are inserted in
    /// the same transaction. Readers never see the new status without its log
    /// entry, or either without the events. If `mutate` fails nothing is written.
    pub fn update_case<E, F>(
        &mut self,
        case_id: &str,
        mutate: F,
    ) -> Result<(EmergencyCase, Vec<AgentEvent>), E>
    where
        E: From<DbError>,
        F: FnOnce(&mut EmergencyCase) -> Result<Vec<AgentEvent>, E>,
    {
        let tx = self.conn.transaction().map_err(DbError::from)?;

        let mut case = load_case(&tx, case_id)?
            .ok_or_else(|| DbError::NotFound(format!("case {}", case_id)))?;

        let events = mutate(&mut case)?;

        update_case_row(&tx, &case)?;
        for event in &events {
            insert_event_row(&tx, event)?;
        }
        tx.commit().map_err(DbError::from)?;

        Ok((case, events))
    }

    /// List cases assigned to a responder, newest first.
    pub fn list_cases_for_responder(
        &self,
        responder_id: &str,
        open_only: bool,
    ) -> DbResult<Vec<EmergencyCase>> {
        let sql = format!(
            "SELECT {} FROM emergency_cases
             WHERE assigned_to_id = ?1 AND (?2 = 0 OR status != 'completed')
             ORDER BY created_at DESC, rowid DESC",
            CASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![responder_id, open_only], CaseRow::from_row)?;

        let mut cases = Vec::new();
        for row in rows {
            cases.push(row?.try_into()?);
        }
        Ok(cases)
    }

    /// List cases still in `new` with no assignment, oldest first.
    pub fn list_unassigned_cases(&self) -> DbResult<Vec<EmergencyCase>> {
        let sql = format!(
            "SELECT {} FROM emergency_cases
             WHERE status = 'new' AND assigned_to_type = 'none'
             ORDER BY created_at ASC, rowid ASC",
            CASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], CaseRow::from_row)?;

        let mut cases = Vec::new();
        for row in rows {
            cases.push(row?.try_into()?);
        }
        Ok(cases)
    }

    /// List cases by status, newest first.
    pub fn list_cases_by_status(&self, status: CaseStatus) -> DbResult<Vec<EmergencyCase>> {
        let sql = format!(
            "SELECT {} FROM emergency_cases WHERE status = ? ORDER BY created_at DESC, rowid DESC",
            CASE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], CaseRow::from_row)?;

        let mut cases = Vec::new();
        for row in rows {
            cases.push(row?.try_into()?);
        }
        Ok(cases)
    }
}

fn load_case(conn: &Connection, case_id: &str) -> DbResult<Option<EmergencyCase>> {
    let sql = format!("SELECT {} FROM emergency_cases WHERE case_id = ?", CASE_COLUMNS);
    conn.query_row(&sql, [case_id], CaseRow::from_row)
        .optional()?
        .map(|row| row.try_into())
        .transpose()
}

fn insert_case_row(conn: &Connection, case: &EmergencyCase) -> DbResult<()> {
    let (assigned_type, assigned_id) = assignment_columns(case.assignment.as_ref());
    let log_json = serde_json::to_string(&case.log)?;
    let ack_json = case
        .acknowledgement
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO emergency_cases (
            case_id, patient_id, origin_latitude, origin_longitude, priority,
            assigned_to_type, assigned_to_id, status, log, acknowledgement,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            case.case_id,
            case.patient_id,
            case.origin.latitude,
            case.origin.longitude,
            case.priority.value(),
            assigned_type,
            assigned_id,
            case.status.as_str(),
            log_json,
            ack_json,
            format_ts(&case.created_at),
            format_ts(&case.updated_at),
        ],
    )?;
    Ok(())
}

fn update_case_row(conn: &Connection, case: &EmergencyCase) -> DbResult<()> {
    let (assigned_type, assigned_id) = assignment_columns(case.assignment.as_ref());
    let log_json = serde_json::to_string(&case.log)?;
    let ack_json = case
        .acknowledgement
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let rows_affected = conn.execute(
        r#"
        UPDATE emergency_cases SET
            assigned_to_type = ?2,
            assigned_to_id = ?3,
            status = ?4,
            log = ?5,
            acknowledgement = ?6,
            updated_at = ?7
        WHERE case_id = ?1
        "#,
        params![
            case.case_id,
            assigned_type,
            assigned_id,
            case.status.as_str(),
            log_json,
            ack_json,
            format_ts(&case.updated_at),
        ],
    )?;

    if rows_affected == 0 {
        return Err(DbError::NotFound(format!("case {}", case.case_id)));
    }
    Ok(())
}

fn assignment_columns(assignment: Option<&Assignment>) -> (&'static str, Option<&str>) {
    match assignment {
        Some(a) => (a.kind.as_str(), Some(a.responder_id.as_str())),
        None => ("none", None),
    }
}

/// Intermediate row struct for database mapping.
struct CaseRow {
    case_id: String,
    patient_id: String,
    origin_latitude: f64,
    origin_longitude: f64,
    priority: u8,
    assigned_to_type: String,
    assigned_to_id: Option<String>,
    status: String,
    log: String,
    acknowledgement: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CaseRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            case_id: row.get(0)?,
            patient_id: row.get(1)?,
            origin_latitude: row.get(2)?,
            origin_longitude: row.get(3)?,
            priority: row.get(4)?,
            assigned_to_type: row.get(5)?,
            assigned_to_id: row.get(6)?,
            status: row.get(7)?,
            log: row.get(8)?,
            acknowledgement: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

impl TryFrom<CaseRow> for EmergencyCase {
    type Error = DbError;

    fn try_from(row: CaseRow) -> Result<Self, Self::Error> {
        let log: Vec<LogEntry> = serde_json::from_str(&row.log)?;
        let acknowledgement: Option<Acknowledgement> = row
            .acknowledgement
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let status: CaseStatus = row.status.parse().map_err(DbError::Constraint)?;
        let priority = Priority::new(row.priority).map_err(DbError::Constraint)?;

        let assignment = match (row.assigned_to_type.as_str(), row.assigned_to_id) {
            ("none", None) => None,
            (kind, Some(responder_id)) if kind != "none" => Some(Assignment {
                kind: kind.parse::<ResponderKind>().map_err(DbError::Constraint)?,
                responder_id,
            }),
            (kind, _) => {
                return Err(DbError::Constraint(format!(
                    "Inconsistent assignment columns for case {} (type {})",
                    row.case_id, kind
                )))
            }
        };

        Ok(EmergencyCase {
            case_id: row.case_id,
            patient_id: row.patient_id,
            origin: Coordinate {
                latitude: row.origin_latitude,
                longitude: row.origin_longitude,
            },
            priority,
            assignment,
            status,
            log,
            acknowledgement,
            created_at: parse_ts(&row.created_at)?,
            updated_at: parse_ts(&row.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{event_types, Actor, ActorRole, CaseRejection, EventStatus, EventTrigger};
    use serde_json::json;

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn make_case(patient: &str) -> EmergencyCase {
        EmergencyCase::new(
            patient.into(),
            Coordinate::new(24.8607, 67.0011).unwrap(),
            Priority::new(3).unwrap(),
            Actor::new(patient, ActorRole::Patient),
            Some("fall from stairs".into()),
        )
    }

    fn assign_to_unit(case: &mut EmergencyCase, unit: &str) {
        case.assign(
            Assignment {
                kind: ResponderKind::FieldUnit,
                responder_id: unit.into(),
            },
            Actor::system(),
            None,
        )
        .unwrap();
    }

    #[test]
    fn test_insert_and_get() {
        let mut db = setup_db();
        let case = make_case("p-1");
        db.insert_case_with_events(&case, &[]).unwrap();

        let retrieved = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(retrieved, case);
    }

    #[test]
    fn test_get_missing() {
        let db = setup_db();
        assert!(db.get_case("nope").unwrap().is_none());
    }

    #[test]
    fn test_insert_with_events_atomic() {
        let mut db = setup_db();
        let case = make_case("p-1");
        let event = AgentEvent::new(
            event_types::CASE_CREATED,
            json!({"case_id": case.case_id}),
            EventTrigger::for_case("test", case.case_id.clone()),
        );
        db.insert_case_with_events(&case, std::slice::from_ref(&event))
            .unwrap();

        assert!(db.get_case(&case.case_id).unwrap().is_some());
        assert_eq!(
            db.get_event(&event.event_id).unwrap().unwrap().status,
            EventStatus::Pending
        );

        // Re-inserting the same event id fails and must not leave the second case behind
        let second = make_case("p-2");
        assert!(db
            .insert_case_with_events(&second, std::slice::from_ref(&event))
            .is_err());
        assert!(db.get_case(&second.case_id).unwrap().is_none());
    }

    #[test]
    fn test_update_case_appends_log_and_events() {
        let mut db = setup_db();
        let case = make_case("p-1");
        db.insert_case_with_events(&case, &[]).unwrap();

        let (updated, events) = db
            .update_case::<DbError, _>(&case.case_id, |c| {
                assign_to_unit(c, "unit-9");
                Ok(vec![AgentEvent::new(
                    event_types::CASE_ASSIGNED,
                    json!({}),
                    EventTrigger::for_case("test", c.case_id.clone()),
                )])
            })
            .unwrap();

        assert_eq!(updated.status, CaseStatus::Assigned);
        assert_eq!(events.len(), 1);

        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored.status, CaseStatus::Assigned);
        assert_eq!(stored.log.len(), 2);
        assert_eq!(
            stored.assignment.as_ref().map(|a| a.responder_id.as_str()),
            Some("unit-9")
        );
        assert!(db.get_event(&events[0].event_id).unwrap().is_some());
    }

    #[test]
    fn test_failed_mutation_writes_nothing() {
        let mut db = setup_db();
        let case = make_case("p-1");
        db.insert_case_with_events(&case, &[]).unwrap();

        #[derive(Debug)]
        enum TestError {
            Db(DbError),
            Rejected(CaseRejection),
        }
        impl From<DbError> for TestError {
            fn from(e: DbError) -> Self {
                TestError::Db(e)
            }
        }

        let result = db.update_case::<TestError, _>(&case.case_id, |c| {
            c.transition(CaseStatus::Completed, Actor::system(), None)
                .map_err(TestError::Rejected)?;
            Ok(vec![])
        });
        assert!(matches!(result, Err(TestError::Rejected(_))));

        let stored = db.get_case(&case.case_id).unwrap().unwrap();
        assert_eq!(stored, case);
    }

    #[test]
    fn test_update_missing_case() {
        let mut db = setup_db();
        let result = db.update_case::<DbError, _>("missing", |_| Ok(vec![]));
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_list_for_responder_and_backlog() {
        let mut db = setup_db();

        let mut assigned = make_case("p-1");
        assign_to_unit(&mut assigned, "unit-1");
        db.insert_case_with_events(&assigned, &[]).unwrap();

        let mut done = make_case("p-2");
        assign_to_unit(&mut done, "unit-1");
        let crew = Actor::new("unit-1", ActorRole::FieldUnit);
        done.transition(CaseStatus::Acknowledged, crew.clone(), None)
            .unwrap();
        done.transition(CaseStatus::InProgress, crew.clone(), None)
            .unwrap();
        done.transition(CaseStatus::Completed, crew, None).unwrap();
        db.insert_case_with_events(&done, &[]).unwrap();

        let backlog_case = make_case("p-3");
        db.insert_case_with_events(&backlog_case, &[]).unwrap();

        assert_eq!(db.list_cases_for_responder("unit-1", false).unwrap().len(), 2);
        let open = db.list_cases_for_responder("unit-1", true).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].case_id, assigned.case_id);

        let backlog = db.list_unassigned_cases().unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].case_id, backlog_case.case_id);

        assert_eq!(
            db.list_cases_by_status(CaseStatus::Completed).unwrap().len(),
            1
        );
    }
}
