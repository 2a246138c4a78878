//! # Engine-On Analytics
//!
//! Detection of "engine running while parked" events from fleet telematics,
//! attribution of those events to known facilities (plants), and fuel
//! estimates joined with trip records.
//!
//! This library provides:
//! - Per-reading voltage/engine-state classification
//! - Per vehicle-day segmentation into engine-on intervals and spatial events
//! - Nearest-facility attribution within a radius
//! - Date-range scheduling, sequential or on a bounded worker pool
//! - Trip/fuel cost joining of the daily summaries
//!
//! ## Features
//!
//! - **`persistence`** - SQLite stores for readings, facilities and results (default)
//! - **`parallel`** - Segment the vehicles of one date in parallel with rayon
//! - **`cli`** - The `engineon` command line runner
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::NaiveDate;
//! use engineon::{segment_vehicle_day, Facility, FacilityIndex, Reading, SegmentConfig};
//!
//! let date = NaiveDate::from_ymd_opt(2025, 12, 1).unwrap();
//! let readings: Vec<Reading> = [0, 3, 6]
//!     .iter()
//!     .map(|m| {
//!         let at = date.and_hms_opt(10, *m, 0).unwrap();
//!         Reading::parked("X1", at, 30.0, "Yard", "13.75,100.50")
//!     })
//!     .collect();
//!
//! let plants = FacilityIndex::new(vec![Facility::new("P01", 13.7501, 100.5001)]).unwrap();
//! let day = segment_vehicle_day("X1", date, &readings, &plants, &SegmentConfig::default())
//!     .unwrap();
//!
//! assert_eq!(day.events.len(), 1);
//! assert_eq!(day.events[0].total_on_minutes, 6.0);
//! assert_eq!(day.events[0].nearest_facility.as_deref(), Some("P01"));
//! ```

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{EngineOnError, OptionExt, Result};

// Geographic utilities (haversine, distance matrix, NaN-safe argmin)
pub mod geo_utils;

// Facility reference set with spatial index
pub mod facility;
pub use facility::{FacilityIndex, FacilityMatch};

// Reading classification (voltage type, engine state, version)
pub mod classify;
pub use classify::{
    classify_engine_state, classify_voltage, parse_location, parse_voltage, EngineState,
    VersionType, VoltageType,
};

// Per vehicle-day segmentation
pub mod segment;
pub use segment::{
    cluster_intervals, detect_intervals, segment_vehicle_day, segment_with_version, Interval,
    VehicleDay,
};

// One calendar date across all vehicles
pub mod aggregate;
pub use aggregate::{aggregate_day, DayOutcome, DayRows};

// Sources and sinks
pub mod store;
pub use store::{FacilitySource, MemoryStore, ReadingSource, RecordSink};

// Date range fan-out
pub mod scheduler;
pub use scheduler::{
    run_date_range, DateOutcome, DateStatus, DayKind, OutcomeCallback, RunConfig, RunReport,
};

// Trip / fuel cost join
pub mod trip_summary;
pub use trip_summary::{
    build_trip_summary, FuelConfig, TripCostRow, TripRecord, TripSummaryRequest,
    VehicleMasterRecord,
};

// SQLite persistence
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

/// Date format used by the telematics export (`01/12/2025`).
pub const EXPORT_DATE_FORMAT: &str = "%d/%m/%Y";

/// Date+time format of a reading (`01/12/2025 10:03:00`).
pub const EXPORT_DATETIME_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Key fragment for a date (`2025-12-01`).
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Parse a user supplied date, accepting `dd/mm/YYYY` and `YYYY-MM-DD`.
pub fn parse_date(input: &str) -> Result<NaiveDate> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, EXPORT_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .map_err(|_| EngineOnError::InvalidDate {
            input: input.to_string(),
        })
}

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// Components may be NaN when the source text could not be parsed; NaN
/// propagates through every distance computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// A point with both components NaN.
    pub fn nan() -> Self {
        Self::new(f64::NAN, f64::NAN)
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }

    /// True if either component is NaN.
    pub fn has_nan(&self) -> bool {
        self.latitude.is_nan() || self.longitude.is_nan()
    }
}

/// A known business location (plant) used for event attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    #[serde(alias = "plant_code")]
    pub code: String,
    #[serde(alias = "Latitude")]
    pub latitude: f64,
    #[serde(alias = "Longitude")]
    pub longitude: f64,
}

impl Facility {
    pub fn new(code: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            code: code.to_string(),
            latitude,
            longitude,
        }
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Voltage field as delivered by the device: either a number or free text
/// (including the "firmware not supported" sentinel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawVoltage {
    Number(f64),
    Text(String),
}

impl From<f64> for RawVoltage {
    fn from(v: f64) -> Self {
        RawVoltage::Number(v)
    }
}

impl From<&str> for RawVoltage {
    fn from(v: &str) -> Self {
        RawVoltage::Text(v.to_string())
    }
}

/// Status labels that mean the vehicle is parked.
pub const PARKED_STATUS_LABELS: [&str; 2] = ["จอดรถ", "Parked"];

/// Vehicle status as classified by the telematics provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VehicleStatus {
    Parked,
    Other(String),
}

impl VehicleStatus {
    /// Classify a raw status label. Missing status is never parked.
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if PARKED_STATUS_LABELS.contains(&s.trim()) => VehicleStatus::Parked,
            Some(s) => VehicleStatus::Other(s.to_string()),
            None => VehicleStatus::Other(String::new()),
        }
    }

    pub fn is_parked(&self) -> bool {
        matches!(self, VehicleStatus::Parked)
    }
}

/// A raw driving-log row as stored by the telematics export.
///
/// Field aliases accept the export's original column names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadingRecord {
    #[serde(alias = "ทะเบียนพาหนะ", default)]
    pub vehicle_id: Option<String>,
    /// Export date, `dd/mm/YYYY`
    #[serde(alias = "วันที่")]
    pub date: String,
    /// Export time, `HH:MM:SS`
    #[serde(alias = "เวลา", default)]
    pub time: Option<String>,
    #[serde(alias = "Voltage", default)]
    pub voltage: Option<RawVoltage>,
    #[serde(alias = "สถานะ", default)]
    pub status: Option<String>,
    #[serde(alias = "สถานที่", default)]
    pub place: Option<String>,
    /// `"lat,lng"`
    #[serde(alias = "พิกัด", default)]
    pub coordinates: Option<String>,
}

/// One device reading for a vehicle, with a parsed timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub vehicle_id: String,
    pub timestamp: NaiveDateTime,
    pub voltage: Option<RawVoltage>,
    pub status: VehicleStatus,
    /// `"lat,lng"` text, parsed lazily for qualifying readings only
    pub location_text: Option<String>,
    pub raw_place: Option<String>,
}

impl Reading {
    /// Build a reading from a raw record.
    ///
    /// Returns `None` when the vehicle id is missing or the date/time does
    /// not parse; such rows cannot be placed on a vehicle timeline.
    pub fn from_record(record: &ReadingRecord) -> Option<Self> {
        let vehicle_id = record.vehicle_id.as_ref()?.trim();
        if vehicle_id.is_empty() {
            return None;
        }
        let time = record.time.as_ref()?;
        let stamp = format!("{} {}", record.date.trim(), time.trim());
        let timestamp = NaiveDateTime::parse_from_str(&stamp, EXPORT_DATETIME_FORMAT).ok()?;

        Some(Self {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            voltage: record.voltage.clone(),
            status: VehicleStatus::from_raw(record.status.as_deref()),
            location_text: record.coordinates.clone(),
            raw_place: record.place.clone(),
        })
    }

    /// Convenience constructor for a parked reading with a numeric voltage.
    pub fn parked(
        vehicle_id: &str,
        timestamp: NaiveDateTime,
        voltage: f64,
        place: &str,
        location: &str,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            voltage: Some(RawVoltage::Number(voltage)),
            status: VehicleStatus::Parked,
            location_text: Some(location.to_string()),
            raw_place: Some(place.to_string()),
        }
    }
}

/// A spatial cluster of engine-on intervals for one vehicle-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOnEvent {
    /// Upsert key: `{vehicle}_{YYYY-MM-DD}_{ordinal}`
    pub key: String,
    pub vehicle_id: String,
    pub date: NaiveDate,
    /// 0-based, in time order within the vehicle-day
    pub ordinal: u32,
    /// Timestamp of the first interval's closing reading
    pub start: NaiveDateTime,
    /// Timestamp of the last interval's closing reading
    pub end: NaiveDateTime,
    pub interval_count: u32,
    pub total_on_minutes: f64,
    /// Mean position of the member intervals (NaN if unknown)
    pub centroid: GpsPoint,
    /// Facility code within the radius of the centroid
    pub nearest_facility: Option<String>,
    /// Distance to `nearest_facility` in meters
    pub facility_distance_m: Option<f64>,
}

impl EngineOnEvent {
    pub fn event_key(vehicle_id: &str, date: NaiveDate, ordinal: u32) -> String {
        format!("{}_{}_{}", vehicle_id, date_key(date), ordinal)
    }

    pub fn at_facility(&self) -> bool {
        self.nearest_facility.is_some()
    }
}

/// Per vehicle-day engine-on totals, split by facility attribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    /// Upsert key: `{vehicle}_{YYYY-MM-DD}`
    pub key: String,
    pub vehicle_id: String,
    pub date: NaiveDate,
    pub version_type: VersionType,
    pub event_count: u32,
    pub at_facility_minutes: f64,
    pub at_facility_hours: f64,
    pub not_at_facility_minutes: f64,
    pub not_at_facility_hours: f64,
}

impl DailySummary {
    pub fn summary_key(vehicle_id: &str, date: NaiveDate) -> String {
        format!("{}_{}", vehicle_id, date_key(date))
    }

    /// Sum event minutes into the at-facility / not-at-facility totals.
    pub fn from_events(
        vehicle_id: &str,
        date: NaiveDate,
        version_type: VersionType,
        events: &[EngineOnEvent],
    ) -> Self {
        let (at, not_at) = events.iter().fold((0.0, 0.0), |(at, not_at), e| {
            if e.at_facility() {
                (at + e.total_on_minutes, not_at)
            } else {
                (at, not_at + e.total_on_minutes)
            }
        });

        Self {
            key: Self::summary_key(vehicle_id, date),
            vehicle_id: vehicle_id.to_string(),
            date,
            version_type,
            event_count: events.len() as u32,
            at_facility_minutes: at,
            at_facility_hours: at / 60.0,
            not_at_facility_minutes: not_at,
            not_at_facility_hours: not_at / 60.0,
        }
    }
}

/// Configuration for interval detection and event clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Maximum distance between consecutive intervals of one event, and
    /// maximum centroid-to-facility distance for attribution.
    /// Default: 200.0 meters
    pub max_distance_m: f64,

    /// Voltage at or above which a parked vehicle counts as engine-on.
    /// Default: 25.0 volts
    pub engine_on_voltage: f64,

    /// Largest gap between two readings that still counts as continuous.
    /// Default: 5.0 minutes
    pub max_gap_minutes: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_distance_m: 200.0,
            engine_on_voltage: 25.0,
            max_gap_minutes: 5.0,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(13.75, 100.50).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::nan().is_valid());
        assert!(GpsPoint::new(f64::NAN, 1.0).has_nan());
    }

    #[test]
    fn test_reading_from_record() {
        let record = ReadingRecord {
            vehicle_id: Some("70-1234".to_string()),
            date: "01/12/2025".to_string(),
            time: Some("10:03:00".to_string()),
            voltage: Some(RawVoltage::Text("27.4".to_string())),
            status: Some("จอดรถ".to_string()),
            place: Some("Yard".to_string()),
            coordinates: Some("13.75,100.50".to_string()),
        };
        let reading = Reading::from_record(&record).unwrap();
        assert_eq!(reading.vehicle_id, "70-1234");
        assert!(reading.status.is_parked());
        assert_eq!(reading.timestamp, day().and_hms_opt(10, 3, 0).unwrap());
    }

    #[test]
    fn test_reading_from_record_drops_bad_rows() {
        let mut record = ReadingRecord {
            vehicle_id: Some("X1".to_string()),
            date: "01/12/2025".to_string(),
            time: Some("25:99:00".to_string()),
            ..Default::default()
        };
        assert!(Reading::from_record(&record).is_none());

        record.time = None;
        assert!(Reading::from_record(&record).is_none());

        record.time = Some("10:00:00".to_string());
        record.vehicle_id = None;
        assert!(Reading::from_record(&record).is_none());
    }

    #[test]
    fn test_record_accepts_export_column_names() {
        let json = r#"{
            "ทะเบียนพาหนะ": "X1",
            "วันที่": "01/12/2025",
            "เวลา": "10:00:00",
            "Voltage": 28.1,
            "สถานะ": "จอดรถ",
            "สถานที่": "Yard",
            "พิกัด": "13.75,100.50"
        }"#;
        let record: ReadingRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.vehicle_id.as_deref(), Some("X1"));
        assert_eq!(record.voltage, Some(RawVoltage::Number(28.1)));
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(VehicleStatus::from_raw(Some(" จอดรถ ")), VehicleStatus::Parked);
        assert_eq!(VehicleStatus::from_raw(Some("Parked")), VehicleStatus::Parked);
        assert!(!VehicleStatus::from_raw(Some("วิ่ง")).is_parked());
        assert!(!VehicleStatus::from_raw(None).is_parked());
    }

    #[test]
    fn test_keys() {
        assert_eq!(EngineOnEvent::event_key("X1", day(), 2), "X1_2025-12-01_2");
        assert_eq!(DailySummary::summary_key("X1", day()), "X1_2025-12-01");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("01/12/2025").unwrap(), day());
        assert_eq!(parse_date("2025-12-01").unwrap(), day());
        assert!(matches!(
            parse_date("12/31/2025"),
            Err(EngineOnError::InvalidDate { .. })
        ));
    }
}
