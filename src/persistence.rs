//! # SQLite Store
//!
//! Single-file storage for the whole pipeline:
//!
//! - **Inputs**: `driving_log` (raw readings), `plants`, `driver_cost_ticket`,
//!   `vehicle_master`
//! - **Outputs**: `raw_engineon`, `summary_engineon`, `engineon_trip_summary`
//!
//! Output tables are keyed by the deterministic row key and written with
//! `INSERT OR REPLACE` inside one transaction per batch, so rerunning a date
//! or a month replaces its rows. NaN coordinates and distances are stored
//! as NULL.

use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};
use rusqlite::{params, Connection};

use crate::error::{EngineOnError, Result};
use crate::store::{FacilitySource, ReadingSource, RecordSink};
use crate::trip_summary::{
    build_trip_summary, FuelConfig, TripCostRow, TripRecord, TripSummaryRequest,
    VehicleMasterRecord,
};
use crate::{
    date_key, DailySummary, EngineOnEvent, Facility, GpsPoint, RawVoltage, ReadingRecord,
    VersionType, EXPORT_DATE_FORMAT,
};

const STORED_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn nan_to_null(value: f64) -> Option<f64> {
    (!value.is_nan()).then_some(value)
}

fn stored_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| EngineOnError::Persistence {
        message: format!("invalid stored date '{}'", text),
    })
}

fn stored_datetime(text: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, STORED_DATETIME_FORMAT).map_err(|_| {
        EngineOnError::Persistence {
            message: format!("invalid stored timestamp '{}'", text),
        }
    })
}

fn stored_version(label: &str) -> Result<VersionType> {
    VersionType::from_label(label).ok_or_else(|| EngineOnError::Persistence {
        message: format!("invalid stored version type '{}'", label),
    })
}

/// SQLite-backed implementation of every store trait.
pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the database at `db_path`.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;
        info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Raw driving log, dates as exported (dd/mm/YYYY)
            CREATE TABLE IF NOT EXISTS driving_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                vehicle_id TEXT,
                date TEXT NOT NULL,
                time TEXT,
                voltage_num REAL,
                voltage_text TEXT,
                status TEXT,
                place TEXT,
                coordinates TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_driving_log_date ON driving_log(date);

            -- Facility reference set, load order = id order; codes may repeat
            CREATE TABLE IF NOT EXISTS plants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT NOT NULL,
                latitude REAL,
                longitude REAL
            );

            CREATE TABLE IF NOT EXISTS raw_engineon (
                key TEXT PRIMARY KEY,
                vehicle_id TEXT NOT NULL,
                date TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                interval_count INTEGER NOT NULL,
                total_on_minutes REAL NOT NULL,
                centroid_lat REAL,
                centroid_lng REAL,
                nearest_facility TEXT,
                facility_distance_m REAL
            );

            CREATE TABLE IF NOT EXISTS summary_engineon (
                key TEXT PRIMARY KEY,
                vehicle_id TEXT NOT NULL,
                date TEXT NOT NULL,
                version_type TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                at_facility_minutes REAL NOT NULL,
                at_facility_hours REAL NOT NULL,
                not_at_facility_minutes REAL NOT NULL,
                not_at_facility_hours REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_summary_engineon_date ON summary_engineon(date);

            CREATE TABLE IF NOT EXISTS driver_cost_ticket (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plate TEXT NOT NULL,
                supervisor TEXT,
                date TEXT NOT NULL,
                trip_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS vehicle_master (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plate TEXT NOT NULL,
                vehicle_type TEXT
            );

            -- Trip cost rows, serialized as JSON
            CREATE TABLE IF NOT EXISTS engineon_trip_summary (
                key TEXT PRIMARY KEY,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trip_summary_month
                ON engineon_trip_summary(year, month);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|e| EngineOnError::Persistence {
            message: format!("connection lock poisoned: {}", e),
        })
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Append raw driving-log records.
    pub fn insert_readings(&self, records: &[ReadingRecord]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO driving_log
                 (vehicle_id, date, time, voltage_num, voltage_text, status, place, coordinates)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in records {
                let (num, text) = match &r.voltage {
                    Some(RawVoltage::Number(v)) => (nan_to_null(*v), None),
                    Some(RawVoltage::Text(t)) => (None, Some(t.as_str())),
                    None => (None, None),
                };
                stmt.execute(params![
                    r.vehicle_id,
                    r.date.trim(),
                    r.time,
                    num,
                    text,
                    r.status,
                    r.place,
                    r.coordinates,
                ])?;
            }
        }
        tx.commit()?;
        debug!("[SqliteStore] Inserted {} readings", records.len());
        Ok(records.len())
    }

    /// Replace the whole facility set, keeping the given order.
    pub fn replace_facilities(&self, facilities: &[Facility]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM plants", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO plants (code, latitude, longitude) VALUES (?, ?, ?)",
            )?;
            for f in facilities {
                stmt.execute(params![
                    f.code,
                    nan_to_null(f.latitude),
                    nan_to_null(f.longitude)
                ])?;
            }
        }
        tx.commit()?;
        Ok(facilities.len())
    }

    /// Append trip cost ticket rows.
    pub fn insert_trip_records(&self, trips: &[TripRecord]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO driver_cost_ticket (plate, supervisor, date, trip_count)
                 VALUES (?, ?, ?, ?)",
            )?;
            for t in trips {
                stmt.execute(params![t.plate, t.supervisor, t.date, t.trip_count])?;
            }
        }
        tx.commit()?;
        Ok(trips.len())
    }

    /// Replace the vehicle master.
    pub fn replace_vehicle_master(&self, vehicles: &[VehicleMasterRecord]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM vehicle_master", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO vehicle_master (plate, vehicle_type) VALUES (?, ?)")?;
            for v in vehicles {
                stmt.execute(params![v.plate, v.vehicle_type])?;
            }
        }
        tx.commit()?;
        Ok(vehicles.len())
    }

    pub fn load_trip_records(&self) -> Result<Vec<TripRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT plate, supervisor, date, trip_count FROM driver_cost_ticket ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TripRecord {
                    plate: row.get(0)?,
                    supervisor: row.get(1)?,
                    date: row.get(2)?,
                    trip_count: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn load_vehicle_master(&self) -> Result<Vec<VehicleMasterRecord>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT plate, vehicle_type FROM vehicle_master ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VehicleMasterRecord {
                    plate: row.get(0)?,
                    vehicle_type: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // Outputs
    // ========================================================================

    pub fn event_count(&self) -> Result<usize> {
        self.count("raw_engineon")
    }

    pub fn summary_count(&self) -> Result<usize> {
        self.count("summary_engineon")
    }

    fn count(&self, table: &str) -> Result<usize> {
        let db = self.lock()?;
        let n: i64 = db.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }

    /// Every stored event, ordered by key.
    pub fn load_events(&self) -> Result<Vec<EngineOnEvent>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT key, vehicle_id, date, ordinal, start_time, end_time, interval_count,
                    total_on_minutes, centroid_lat, centroid_lng, nearest_facility,
                    facility_distance_m
             FROM raw_engineon ORDER BY key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, Option<f64>>(8)?,
                    row.get::<_, Option<f64>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, Option<f64>>(11)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (key, vehicle_id, date, ordinal, start, end, count, minutes, lat, lng, facility, dist) in
            rows
        {
            events.push(EngineOnEvent {
                key,
                vehicle_id,
                date: stored_date(&date)?,
                ordinal,
                start: stored_datetime(&start)?,
                end: stored_datetime(&end)?,
                interval_count: count,
                total_on_minutes: minutes,
                centroid: GpsPoint::new(lat.unwrap_or(f64::NAN), lng.unwrap_or(f64::NAN)),
                nearest_facility: facility,
                facility_distance_m: dist,
            });
        }
        Ok(events)
    }

    /// Stored summaries, ordered by key. With a month, only that month.
    pub fn load_summaries(&self, month: Option<(i32, u32)>) -> Result<Vec<DailySummary>> {
        let pattern = match month {
            Some((year, month)) => format!("{:04}-{:02}-%", year, month),
            None => "%".to_string(),
        };
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT key, vehicle_id, date, version_type, event_count, at_facility_minutes,
                    at_facility_hours, not_at_facility_minutes, not_at_facility_hours
             FROM summary_engineon WHERE date LIKE ? ORDER BY key",
        )?;
        let rows = stmt
            .query_map([pattern], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut summaries = Vec::with_capacity(rows.len());
        for (key, vehicle_id, date, version, count, at, at_h, not_at, not_at_h) in rows {
            summaries.push(DailySummary {
                key,
                vehicle_id,
                date: stored_date(&date)?,
                version_type: stored_version(&version)?,
                event_count: count,
                at_facility_minutes: at,
                at_facility_hours: at_h,
                not_at_facility_minutes: not_at,
                not_at_facility_hours: not_at_h,
            });
        }
        Ok(summaries)
    }

    /// Upsert trip cost rows by key.
    pub fn upsert_trip_rows(&self, rows: &[TripCostRow]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO engineon_trip_summary (key, year, month, data)
                 VALUES (?, ?, ?, ?)",
            )?;
            for row in rows {
                let data = serde_json::to_string(row)?;
                stmt.execute(params![row.key, row.year, row.month, data])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn load_trip_rows(&self, year: i32, month: u32) -> Result<Vec<TripCostRow>> {
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT data FROM engineon_trip_summary WHERE year = ? AND month = ? ORDER BY key",
        )?;
        let data = stmt
            .query_map(params![year, month], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        data.iter()
            .map(|d| serde_json::from_str(d).map_err(EngineOnError::from))
            .collect()
    }

    /// Build the trip cost join for one month from stored inputs and upsert it.
    pub fn run_trip_summary(
        &self,
        request: &TripSummaryRequest,
        fuel: &FuelConfig,
    ) -> Result<Vec<TripCostRow>> {
        let summaries = self.load_summaries(Some((request.year, request.month)))?;
        let trips = self.load_trip_records()?;
        let vehicles = self.load_vehicle_master()?;

        let rows = build_trip_summary(&summaries, &trips, &vehicles, request, fuel)?;
        let written = self.upsert_trip_rows(&rows)?;
        info!(
            "[SqliteStore] Trip summary {}/{}: {} rows",
            request.month, request.year, written
        );
        Ok(rows)
    }
}

impl ReadingSource for SqliteStore {
    fn readings_for_date(&self, date: NaiveDate) -> Result<Vec<ReadingRecord>> {
        let wanted = date.format(EXPORT_DATE_FORMAT).to_string();
        let db = self.lock()?;
        let mut stmt = db.prepare(
            "SELECT vehicle_id, date, time, voltage_num, voltage_text, status, place, coordinates
             FROM driving_log WHERE date = ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([wanted], |row| {
                let num: Option<f64> = row.get(3)?;
                let text: Option<String> = row.get(4)?;
                let voltage = match (num, text) {
                    (Some(v), _) => Some(RawVoltage::Number(v)),
                    (None, Some(t)) => Some(RawVoltage::Text(t)),
                    (None, None) => None,
                };
                Ok(ReadingRecord {
                    vehicle_id: row.get(0)?,
                    date: row.get(1)?,
                    time: row.get(2)?,
                    voltage,
                    status: row.get(5)?,
                    place: row.get(6)?,
                    coordinates: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl FacilitySource for SqliteStore {
    fn load_facilities(&self) -> Result<Vec<Facility>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT code, latitude, longitude FROM plants ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                let lat: Option<f64> = row.get(1)?;
                let lng: Option<f64> = row.get(2)?;
                Ok(Facility {
                    code: row.get(0)?,
                    latitude: lat.unwrap_or(f64::NAN),
                    longitude: lng.unwrap_or(f64::NAN),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl RecordSink for SqliteStore {
    fn upsert_events(&self, events: &[EngineOnEvent]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO raw_engineon
                 (key, vehicle_id, date, ordinal, start_time, end_time, interval_count,
                  total_on_minutes, centroid_lat, centroid_lng, nearest_facility,
                  facility_distance_m)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for e in events {
                stmt.execute(params![
                    e.key,
                    e.vehicle_id,
                    date_key(e.date),
                    e.ordinal,
                    e.start.format(STORED_DATETIME_FORMAT).to_string(),
                    e.end.format(STORED_DATETIME_FORMAT).to_string(),
                    e.interval_count,
                    e.total_on_minutes,
                    nan_to_null(e.centroid.latitude),
                    nan_to_null(e.centroid.longitude),
                    e.nearest_facility,
                    e.facility_distance_m.and_then(nan_to_null),
                ])?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    fn upsert_summaries(&self, summaries: &[DailySummary]) -> Result<usize> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO summary_engineon
                 (key, vehicle_id, date, version_type, event_count, at_facility_minutes,
                  at_facility_hours, not_at_facility_minutes, not_at_facility_hours)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for s in summaries {
                stmt.execute(params![
                    s.key,
                    s.vehicle_id,
                    date_key(s.date),
                    s.version_type.as_str(),
                    s.event_count,
                    s.at_facility_minutes,
                    s.at_facility_hours,
                    s.not_at_facility_minutes,
                    s.not_at_facility_hours,
                ])?;
            }
        }
        tx.commit()?;
        Ok(summaries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()
    }

    fn event(ordinal: u32, facility: Option<&str>) -> EngineOnEvent {
        let at = d().and_hms_opt(10, 0, 0).unwrap();
        EngineOnEvent {
            key: EngineOnEvent::event_key("X1", d(), ordinal),
            vehicle_id: "X1".to_string(),
            date: d(),
            ordinal,
            start: at,
            end: at,
            interval_count: 2,
            total_on_minutes: 6.0,
            centroid: GpsPoint::nan(),
            nearest_facility: facility.map(str::to_string),
            facility_distance_m: facility.map(|_| 12.5),
        }
    }

    #[test]
    fn test_schema_is_reentrant() {
        let store = SqliteStore::in_memory().unwrap();
        let db = store.lock().unwrap();
        SqliteStore::init_schema(&db).unwrap();
    }

    #[test]
    fn test_event_round_trip_keeps_nan_centroid() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_events(&[event(0, Some("P01")), event(1, None)]).unwrap();

        let events = store.load_events().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].centroid.has_nan());
        assert_eq!(events[0].nearest_facility.as_deref(), Some("P01"));
        assert_eq!(events[1].facility_distance_m, None);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let summary = DailySummary::from_events("X1", d(), VersionType::Unsupported, &[event(0, None)]);
        store.upsert_summaries(&[summary.clone()]).unwrap();
        store.upsert_summaries(&[summary.clone()]).unwrap();

        assert_eq!(store.summary_count().unwrap(), 1);
        assert_eq!(store.load_summaries(None).unwrap(), vec![summary]);
        assert!(store.load_summaries(Some((2025, 11))).unwrap().is_empty());
    }

    #[test]
    fn test_readings_by_export_date() {
        let store = SqliteStore::in_memory().unwrap();
        let record = ReadingRecord {
            vehicle_id: Some("X1".to_string()),
            date: "01/12/2025".to_string(),
            time: Some("10:00:00".to_string()),
            voltage: Some(RawVoltage::Text("เฟิร์มแวร์ไม่รองรับ".to_string())),
            status: Some("จอดรถ".to_string()),
            place: None,
            coordinates: Some("13.75,100.50".to_string()),
        };
        store.insert_readings(&[record.clone()]).unwrap();

        assert_eq!(store.readings_for_date(d()).unwrap(), vec![record]);
        let next = NaiveDate::from_ymd_opt(2025, 12, 2).unwrap();
        assert!(store.readings_for_date(next).unwrap().is_empty());
    }

    #[test]
    fn test_facilities_keep_load_order() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .replace_facilities(&[Facility::new("B", 1.0, 1.0), Facility::new("A", 2.0, 2.0)])
            .unwrap();
        let codes: Vec<String> = store
            .load_facilities()
            .unwrap()
            .into_iter()
            .map(|f| f.code)
            .collect();
        assert_eq!(codes, vec!["B", "A"]);
    }

    #[test]
    fn test_duplicate_codes_keep_load_order() {
        let store = SqliteStore::in_memory().unwrap();
        let plants = vec![
            Facility::new("P01", 13.75, 100.5),
            Facility::new("P02", 13.75, 100.5),
            Facility::new("P01", 13.76, 100.5),
        ];
        store.replace_facilities(&plants).unwrap();
        // Replacing twice must not reorder anything either
        store.replace_facilities(&plants).unwrap();

        let loaded = store.load_facilities().unwrap();
        assert_eq!(loaded, plants);

        // First loaded wins the tie at the shared position
        let index = crate::FacilityIndex::new(loaded).unwrap();
        let m = index
            .nearest_within(&crate::GpsPoint::new(13.7501, 100.5), 200.0)
            .unwrap();
        assert_eq!((m.code.as_str(), m.index), ("P01", 0));
    }
}
