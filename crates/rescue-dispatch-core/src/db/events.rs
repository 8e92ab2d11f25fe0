//! Agent event database operations.
//!
//! Status moves `pending -> processing -> completed | failed`. The claim step is
//! a compare-and-set so that two delivery paths never finish the same event.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{format_ts, parse_opt_ts, parse_ts, Database, DbError, DbResult};
use crate::models::{AgentEvent, EventStatus, EventTrigger, HandlerOutcome};

/// Result of trying to claim an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventClaim {
    Claimed(AgentEvent),
    /// Another path holds it, or it already finished
    NotPending,
    /// The stored row could not be decoded and was marked `failed`
    Unreadable(String),
}

const EVENT_COLUMNS: &str = r#"
    event_id, event_type, payload, source, case_id, session_id,
    status, outcomes, error, created_at, claimed_at, processed_at
"#;

impl Database {
    /// Persist a new event.
    pub fn insert_event(&self, event: &AgentEvent) -> DbResult<()> {
        insert_event_row(&self.conn, event)
    }

    /// Get an event by ID.
    pub fn get_event(&self, event_id: &str) -> DbResult<Option<AgentEvent>> {
        load_event(&self.conn, event_id)
    }

    /// List events in a status, oldest first.
    pub fn list_events_by_status(&self, status: EventStatus) -> DbResult<Vec<AgentEvent>> {
        let sql = format!(
            "SELECT {} FROM agent_events WHERE status = ? ORDER BY created_at ASC, rowid ASC",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], EventRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.try_into()?);
        }
        Ok(events)
    }

    /// List all events about a case, oldest first.
    pub fn list_events_for_case(&self, case_id: &str) -> DbResult<Vec<AgentEvent>> {
        let sql = format!(
            "SELECT {} FROM agent_events WHERE case_id = ? ORDER BY created_at ASC, rowid ASC",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([case_id], EventRow::from_row)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.try_into()?);
        }
        Ok(events)
    }

    /// Ids of events in a status, oldest first. Rows are not parsed.
    pub fn list_event_ids_by_status(&self, status: EventStatus) -> DbResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id FROM agent_events WHERE status = ? ORDER BY created_at ASC, rowid ASC",
        )?;
        let ids = stmt
            .query_map([status.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    /// Claim a pending event for processing.
    ///
    /// `claimed_at` doubles as the claim token that [`Database::finish_event`]
    /// must present. A row that cannot be decoded is moved straight to
    /// `failed` with its raw payload kept as a JSON string.
    pub fn claim_event(
        &mut self,
        event_id: &str,
        claimed_at: DateTime<Utc>,
    ) -> DbResult<EventClaim> {
        let tx = self.conn.transaction()?;
        let rows_affected = tx.execute(
            "UPDATE agent_events SET status = 'processing', claimed_at = ?2
             WHERE event_id = ?1 AND status = 'pending'",
            params![event_id, format_ts(&claimed_at)],
        )?;
        if rows_affected == 0 {
            return Ok(EventClaim::NotPending);
        }

        let sql = format!("SELECT {} FROM agent_events WHERE event_id = ?", EVENT_COLUMNS);
        let row = tx.query_row(&sql, [event_id], EventRow::from_row)?;
        let raw = RawEvent::from(&row);
        let claim = match AgentEvent::try_from(row) {
            Ok(event) => EventClaim::Claimed(event),
            Err(e) => {
                let reason = format!("unreadable event: {}", e);
                quarantine_event(&tx, event_id, &raw, &reason, &claimed_at)?;
                EventClaim::Unreadable(reason)
            }
        };
        tx.commit()?;
        Ok(claim)
    }

    /// Move a claimed event to a terminal status.
    ///
    /// Only the holder of the claim made at `claimed_at` can finish it; returns
    /// `false` if the event is no longer in `processing` under that claim.
    pub fn finish_event(
        &self,
        event_id: &str,
        claimed_at: DateTime<Utc>,
        status: EventStatus,
        outcomes: &[HandlerOutcome],
        error: Option<&str>,
        processed_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        if !status.is_terminal() {
            return Err(DbError::Constraint(format!(
                "Cannot finish event {} as {}",
                event_id, status
            )));
        }
        let outcomes_json = serde_json::to_string(outcomes)?;
        let rows_affected = self.conn.execute(
            r#"
            UPDATE agent_events SET
                status = ?2,
                outcomes = ?3,
                error = ?4,
                processed_at = ?5
            WHERE event_id = ?1 AND status = 'processing' AND claimed_at = ?6
            "#,
            params![
                event_id,
                status.as_str(),
                outcomes_json,
                error,
                format_ts(&processed_at),
                format_ts(&claimed_at),
            ],
        )?;
        Ok(rows_affected > 0)
    }

    /// Return events stuck in `processing` since before `claimed_before` to `pending`.
    pub fn release_stale_claims(&self, claimed_before: DateTime<Utc>) -> DbResult<usize> {
        let rows_affected = self.conn.execute(
            "UPDATE agent_events SET status = 'pending', claimed_at = NULL
             WHERE status = 'processing' AND claimed_at < ?1",
            [format_ts(&claimed_before)],
        )?;
        Ok(rows_affected)
    }

    /// Count events per status.
    pub fn count_events_by_status(&self, status: EventStatus) -> DbResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM agent_events WHERE status = ?",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

pub(super) fn insert_event_row(conn: &Connection, event: &AgentEvent) -> DbResult<()> {
    let payload_json = serde_json::to_string(&event.payload)?;
    let outcomes_json = serde_json::to_string(&event.outcomes)?;

    conn.execute(
        r#"
        INSERT INTO agent_events (
            event_id, event_type, payload, source, case_id, session_id,
            status, outcomes, error, created_at, claimed_at, processed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            event.event_id,
            event.event_type,
            payload_json,
            event.triggered_by.source,
            event.triggered_by.case_id,
            event.triggered_by.session_id,
            event.status.as_str(),
            outcomes_json,
            event.error,
            format_ts(&event.created_at),
            event.claimed_at.as_ref().map(format_ts),
            event.processed_at.as_ref().map(format_ts),
        ],
    )?;
    Ok(())
}

fn load_event(conn: &Connection, event_id: &str) -> DbResult<Option<AgentEvent>> {
    let sql = format!("SELECT {} FROM agent_events WHERE event_id = ?", EVENT_COLUMNS);
    conn.query_row(&sql, [event_id], EventRow::from_row)
        .optional()?
        .map(|row| row.try_into())
        .transpose()
}

/// Columns that must decode for a row to be readable later.
struct RawEvent {
    payload: String,
    outcomes: String,
    created_at: String,
}

impl From<&EventRow> for RawEvent {
    fn from(row: &EventRow) -> Self {
        Self {
            payload: row.payload.clone(),
            outcomes: row.outcomes.clone(),
            created_at: row.created_at.clone(),
        }
    }
}

/// Mark an undecodable event `failed` and rewrite the broken columns so that
/// listing it afterwards succeeds.
fn quarantine_event(
    conn: &Connection,
    event_id: &str,
    raw: &RawEvent,
    reason: &str,
    at: &DateTime<Utc>,
) -> DbResult<()> {
    let payload = match serde_json::from_str::<serde_json::Value>(&raw.payload) {
        Ok(_) => raw.payload.clone(),
        Err(_) => serde_json::to_string(&raw.payload)?,
    };
    let created_at = match parse_ts(&raw.created_at) {
        Ok(_) => raw.created_at.clone(),
        Err(_) => format_ts(at),
    };
    let outcomes = match serde_json::from_str::<Vec<HandlerOutcome>>(&raw.outcomes) {
        Ok(_) => raw.outcomes.clone(),
        Err(_) => "[]".to_string(),
    };
    conn.execute(
        r#"
        UPDATE agent_events SET
            status = 'failed',
            payload = ?2,
            outcomes = ?3,
            error = ?4,
            created_at = ?5,
            processed_at = ?6
        WHERE event_id = ?1
        "#,
        params![event_id, payload, outcomes, reason, created_at, format_ts(at)],
    )?;
    Ok(())
}

/// Intermediate row struct for database mapping.
struct EventRow {
    event_id: String,
    event_type: String,
    payload: String,
    source: String,
    case_id: Option<String>,
    session_id: Option<String>,
    status: String,
    outcomes: String,
    error: Option<String>,
    created_at: String,
    claimed_at: Option<String>,
    processed_at: Option<String>,
}

impl EventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            event_id: row.get(0)?,
            event_type: row.get(1)?,
            payload: row.get(2)?,
            source: row.get(3)?,
            case_id: row.get(4)?,
            session_id: row.get(5)?,
            status: row.get(6)?,
            outcomes: row.get(7)?,
            error: row.get(8)?,
            created_at: row.get(9)?,
            claimed_at: row.get(10)?,
            processed_at: row.get(11)?,
        })
    }
}

impl TryFrom<EventRow> for AgentEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(AgentEvent {
            event_id: row.event_id,
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            triggered_by: EventTrigger {
                source: row.source,
                case_id: row.case_id,
                session_id: row.session_id,
            },
            status: row.status.parse().map_err(DbError::Constraint)?,
            outcomes: serde_json::from_str(&row.outcomes)?,
            error: row.error,
            created_at: parse_ts(&row.created_at)?,
            claimed_at: parse_opt_ts(row.claimed_at)?,
            processed_at: parse_opt_ts(row.processed_at)?,
        })
    }
}
