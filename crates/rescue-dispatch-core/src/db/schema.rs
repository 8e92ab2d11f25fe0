//! SQLite schema definition.

/// Complete database schema for the dispatch store.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Responders
-- ============================================================================

CREATE TABLE IF NOT EXISTS field_units (
    unit_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    latitude REAL,                               -- NULL until first self-report
    longitude REAL,
    is_available INTEGER NOT NULL DEFAULT 0,
    last_seen_at TEXT,
    created_at TEXT NOT NULL,
    CHECK ((latitude IS NULL) = (longitude IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_units_available ON field_units(is_available);

CREATE TABLE IF NOT EXISTS facilities (
    facility_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    latitude REAL,                               -- authoritative geocode
    longitude REAL,
    area_latitude REAL,                          -- centroid used for estimates
    area_longitude REAL,
    tags TEXT NOT NULL DEFAULT '[]',             -- JSON array of strings
    created_at TEXT NOT NULL,
    CHECK ((latitude IS NULL) = (longitude IS NULL)),
    CHECK ((area_latitude IS NULL) = (area_longitude IS NULL))
);

-- ============================================================================
-- Emergency Cases (never deleted)
-- ============================================================================

CREATE TABLE IF NOT EXISTS emergency_cases (
    case_id TEXT PRIMARY KEY,
    patient_id TEXT NOT NULL,
    origin_latitude REAL NOT NULL,
    origin_longitude REAL NOT NULL,
    priority INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 5),
    assigned_to_type TEXT NOT NULL DEFAULT 'none'
        CHECK (assigned_to_type IN ('none', 'field_unit', 'facility')),
    assigned_to_id TEXT,
    status TEXT NOT NULL DEFAULT 'new'
        CHECK (status IN ('new', 'assigned', 'acknowledged', 'in_progress', 'completed')),
    log TEXT NOT NULL DEFAULT '[]',              -- JSON array of LogEntry
    acknowledgement TEXT,                        -- JSON Acknowledgement
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK ((assigned_to_type = 'none') = (assigned_to_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_cases_status ON emergency_cases(status);
CREATE INDEX IF NOT EXISTS idx_cases_assignee ON emergency_cases(assigned_to_id);

CREATE TRIGGER IF NOT EXISTS emergency_cases_no_delete BEFORE DELETE ON emergency_cases
BEGIN
    SELECT RAISE(ABORT, 'Emergency cases are retained as audit records');
END;

-- ============================================================================
-- Agent Events
-- ============================================================================

CREATE TABLE IF NOT EXISTS agent_events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,                       -- JSON
    source TEXT NOT NULL,
    case_id TEXT,
    session_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    outcomes TEXT NOT NULL DEFAULT '[]',         -- JSON array of HandlerOutcome
    error TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_status ON agent_events(status, created_at);
CREATE INDEX IF NOT EXISTS idx_events_case ON agent_events(case_id);
"#;
