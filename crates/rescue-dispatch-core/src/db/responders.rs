//! Field unit and facility database operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{format_ts, parse_opt_ts, parse_ts, Database, DbError, DbResult};
use crate::geo::Coordinate;
use crate::models::{Facility, FieldUnit};

const UNIT_COLUMNS: &str =
    "unit_id, name, latitude, longitude, is_available, last_seen_at, created_at";

const FACILITY_COLUMNS: &str =
    "facility_id, name, latitude, longitude, area_latitude, area_longitude, tags, created_at";

impl Database {
    // =========================================================================
    // Field units
    // =========================================================================

    /// Register a field unit. Re-registering keeps position and availability.
    pub fn upsert_field_unit(&self, unit: &FieldUnit) -> DbResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO field_units (
                unit_id, name, latitude, longitude, is_available, last_seen_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(unit_id) DO UPDATE SET name = excluded.name
            "#,
            params![
                unit.unit_id,
                unit.name,
                unit.location.map(|c| c.latitude),
                unit.location.map(|c| c.longitude),
                unit.is_available,
                unit.last_seen_at.as_ref().map(format_ts),
                format_ts(&unit.created_at),
            ],
        )?;
        Ok(())
    }

    /// Apply a unit's periodic self-report.
    pub fn report_field_unit(
        &self,
        unit_id: &str,
        location: Coordinate,
        is_available: bool,
        seen_at: DateTime<Utc>,
    ) -> DbResult<()> {
        let rows_affected = self.conn.execute(
            r#"
            UPDATE field_units SET
                latitude = ?2,
                longitude = ?3,
                is_available = ?4,
                last_seen_at = ?5
            WHERE unit_id = ?1
            "#,
            params![
                unit_id,
                location.latitude,
                location.longitude,
                is_available,
                format_ts(&seen_at),
            ],
        )?;
        if rows_affected == 0 {
            return Err(DbError::NotFound(format!("field unit {}", unit_id)));
        }
        Ok(())
    }

    /// Get a field unit by ID.
    pub fn get_field_unit(&self, unit_id: &str) -> DbResult<Option<FieldUnit>> {
        let sql = format!("SELECT {} FROM field_units WHERE unit_id = ?", UNIT_COLUMNS);
        self.conn
            .query_row(&sql, [unit_id], UnitRow::from_row)
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// Units that may be ranked: available and with a reported position.
    pub fn list_candidate_field_units(&self) -> DbResult<Vec<FieldUnit>> {
        let sql = format!(
            "SELECT {} FROM field_units
             WHERE is_available = 1 AND latitude IS NOT NULL AND longitude IS NOT NULL",
            UNIT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], UnitRow::from_row)?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?.try_into()?);
        }
        Ok(units)
    }

    /// List all field units.
    pub fn list_field_units(&self) -> DbResult<Vec<FieldUnit>> {
        let sql = format!("SELECT {} FROM field_units ORDER BY unit_id", UNIT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], UnitRow::from_row)?;

        let mut units = Vec::new();
        for row in rows {
            units.push(row?.try_into()?);
        }
        Ok(units)
    }

    // =========================================================================
    // Facilities
    // =========================================================================

    /// Add or update a facility.
    pub fn upsert_facility(&self, facility: &Facility) -> DbResult<()> {
        let tags_json = serde_json::to_string(&facility.tags)?;
        self.conn.execute(
            r#"
            INSERT INTO facilities (
                facility_id, name, latitude, longitude, area_latitude, area_longitude,
                tags, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(facility_id) DO UPDATE SET
                name = excluded.name,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                area_latitude = excluded.area_latitude,
                area_longitude = excluded.area_longitude,
                tags = excluded.tags
            "#,
            params![
                facility.facility_id,
                facility.name,
                facility.geocode.map(|c| c.latitude),
                facility.geocode.map(|c| c.longitude),
                facility.area.map(|c| c.latitude),
                facility.area.map(|c| c.longitude),
                tags_json,
                format_ts(&facility.created_at),
            ],
        )?;
        Ok(())
    }

    /// Get a facility by ID.
    pub fn get_facility(&self, facility_id: &str) -> DbResult<Option<Facility>> {
        let sql = format!(
            "SELECT {} FROM facilities WHERE facility_id = ?",
            FACILITY_COLUMNS
        );
        self.conn
            .query_row(&sql, [facility_id], FacilityRow::from_row)
            .optional()?
            .map(|row| row.try_into())
            .transpose()
    }

    /// List all facilities.
    pub fn list_facilities(&self) -> DbResult<Vec<Facility>> {
        let sql = format!(
            "SELECT {} FROM facilities ORDER BY facility_id",
            FACILITY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], FacilityRow::from_row)?;

        let mut facilities = Vec::new();
        for row in rows {
            facilities.push(row?.try_into()?);
        }
        Ok(facilities)
    }
}

fn coordinate_columns(lat: Option<f64>, lon: Option<f64>) -> Option<Coordinate> {
    match (lat, lon) {
        (Some(latitude), Some(longitude)) => Some(Coordinate {
            latitude,
            longitude,
        }),
        _ => None,
    }
}

struct UnitRow {
    unit_id: String,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    is_available: bool,
    last_seen_at: Option<String>,
    created_at: String,
}

impl UnitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            unit_id: row.get(0)?,
            name: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            is_available: row.get(4)?,
            last_seen_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

impl TryFrom<UnitRow> for FieldUnit {
    type Error = DbError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        Ok(FieldUnit {
            unit_id: row.unit_id,
            name: row.name,
            location: coordinate_columns(row.latitude, row.longitude),
            is_available: row.is_available,
            last_seen_at: parse_opt_ts(row.last_seen_at)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

struct FacilityRow {
    facility_id: String,
    name: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    area_latitude: Option<f64>,
    area_longitude: Option<f64>,
    tags: String,
    created_at: String,
}

impl FacilityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            facility_id: row.get(0)?,
            name: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            area_latitude: row.get(4)?,
            area_longitude: row.get(5)?,
            tags: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

impl TryFrom<FacilityRow> for Facility {
    type Error = DbError;

    fn try_from(row: FacilityRow) -> Result<Self, Self::Error> {
        Ok(Facility {
            facility_id: row.facility_id,
            name: row.name,
            geocode: coordinate_columns(row.latitude, row.longitude),
            area: coordinate_columns(row.area_latitude, row.area_longitude),
            tags: serde_json::from_str(&row.tags)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn here() -> Coordinate {
        Coordinate::new(24.8607, 67.0011).unwrap()
    }

    #[test]
    fn test_register_and_report_unit() {
        let db = setup_db();
        let unit = FieldUnit::new("unit-1".into(), "Chhipa 4".into());
        db.upsert_field_unit(&unit).unwrap();

        assert!(db.list_candidate_field_units().unwrap().is_empty());

        let seen = Utc::now();
        db.report_field_unit("unit-1", here(), true, seen).unwrap();

        let stored = db.get_field_unit("unit-1").unwrap().unwrap();
        assert_eq!(stored.location, Some(here()));
        assert!(stored.is_available);
        assert_eq!(
            stored.last_seen_at.map(|t| t.timestamp_micros()),
            Some(seen.timestamp_micros())
        );
        assert_eq!(db.list_candidate_field_units().unwrap().len(), 1);
    }

    #[test]
    fn test_reregister_keeps_position() {
        let db = setup_db();
        db.upsert_field_unit(&FieldUnit::new("unit-1".into(), "Old".into()))
            .unwrap();
        db.report_field_unit("unit-1", here(), true, Utc::now())
            .unwrap();

        db.upsert_field_unit(&FieldUnit::new("unit-1".into(), "Renamed".into()))
            .unwrap();
        let stored = db.get_field_unit("unit-1").unwrap().unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.location, Some(here()));
        assert!(stored.is_available);
    }

    #[test]
    fn test_unavailable_unit_excluded() {
        let db = setup_db();
        db.upsert_field_unit(&FieldUnit::new("unit-1".into(), "A".into()))
            .unwrap();
        db.report_field_unit("unit-1", here(), false, Utc::now())
            .unwrap();
        assert!(db.list_candidate_field_units().unwrap().is_empty());
        assert_eq!(db.list_field_units().unwrap().len(), 1);
    }

    #[test]
    fn test_report_unknown_unit() {
        let db = setup_db();
        let result = db.report_field_unit("ghost", here(), true, Utc::now());
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_facility_round_trip() {
        let db = setup_db();
        let mut facility = Facility::new("hosp-1".into(), "Civil Hospital".into());
        facility.area = Some(here());
        facility.tags = vec!["trauma".into(), "burns".into()];
        db.upsert_facility(&facility).unwrap();

        let stored = db.get_facility("hosp-1").unwrap().unwrap();
        assert_eq!(stored.geocode, None);
        assert_eq!(stored.area, Some(here()));
        assert_eq!(stored.tags, facility.tags);

        facility.geocode = Some(here());
        db.upsert_facility(&facility).unwrap();
        assert_eq!(db.list_facilities().unwrap()[0].geocode, Some(here()));
    }
}
