//! Trip / fuel cost join.
//!
//! Joins one month of daily engine-on summaries with trip counts and the
//! vehicle master, and estimates the fuel burnt while idling. Each trip
//! earns a loading reserve (30 minutes by default); only engine-on time
//! beyond the reserve is charged, at an hourly rate per vehicle type.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{Datelike, NaiveDate};
use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{EngineOnError, Result};
use crate::{date_key, parse_date, DailySummary, VersionType};

/// Liters per engine-on hour for the known vehicle types.
static DEFAULT_FUEL_RATES: Lazy<BTreeMap<String, f64>> = Lazy::new(|| {
    BTreeMap::from([
        ("Mixer 10 ล้อ".to_string(), 2.0),
        ("Mixer 6 ล้อ".to_string(), 1.0),
    ])
});

/// Fuel estimation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConfig {
    /// Liters per hour by vehicle type. Unknown types burn nothing.
    /// Default: Mixer 10 ล้อ = 2.0, Mixer 6 ล้อ = 1.0
    pub rates: BTreeMap<String, f64>,

    /// Engine-on minutes allowed per trip before fuel is charged.
    /// Default: 30.0
    pub reserve_minutes_per_trip: f64,
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            rates: DEFAULT_FUEL_RATES.clone(),
            reserve_minutes_per_trip: 30.0,
        }
    }
}

impl FuelConfig {
    pub fn rate_for(&self, vehicle_type: Option<&str>) -> f64 {
        vehicle_type
            .and_then(|t| self.rates.get(t.trim()))
            .copied()
            .unwrap_or(0.0)
    }

    /// `rate * max(0, minutes - reserve) / 60`, rounded to 2 decimals.
    pub fn liters(&self, rate: f64, minutes: f64, reserve: f64) -> f64 {
        round2(rate * excess_minutes(minutes, reserve) / 60.0)
    }
}

/// One row of the trip cost ticket export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    #[serde(alias = "หัว")]
    pub plate: String,
    #[serde(alias = "พจส1", default)]
    pub supervisor: Option<String>,
    /// Dispatch date, `dd/mm/YYYY` (a trailing time is ignored)
    #[serde(alias = "ออก LDT_fmt")]
    pub date: String,
    #[serde(alias = "LDT_unique_count", default)]
    pub trip_count: u32,
}

/// One row of the vehicle master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleMasterRecord {
    #[serde(alias = "ทะเบียน")]
    pub plate: String,
    #[serde(alias = "ประเภทยานพาหนะ", default)]
    pub vehicle_type: Option<String>,
}

/// Month selection for a trip summary run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripSummaryRequest {
    pub year: i32,
    pub month: u32,
    /// Only summaries of this firmware class
    #[serde(default)]
    pub version_type: Option<VersionType>,
}

/// One (plate, date) row of the fuel cost join.
///
/// Fields from a side of the join that had no row for the key are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripCostRow {
    /// Upsert key: `{plate}_{YYYY-MM-DD}`
    pub key: String,
    pub plate: String,
    pub date: NaiveDate,
    pub supervisor: Option<String>,
    pub trips: Option<u32>,
    pub version_type: Option<VersionType>,
    pub vehicle_type: Option<String>,
    pub at_facility_minutes: Option<f64>,
    pub at_facility_hms: Option<String>,
    pub reserve_minutes: Option<f64>,
    pub excess_minutes: Option<f64>,
    pub excess_hms: Option<String>,
    pub liters: Option<f64>,
    pub not_at_facility_minutes: f64,
    pub not_at_facility_hms: String,
    pub not_at_facility_liters: f64,
    pub year: i32,
    pub month: u32,
}

/// Strip the province prefix from a plate and trim it.
pub fn clean_plate(plate: &str) -> String {
    plate.replace("สบ.", "").replace("สบ", "").trim().to_string()
}

/// Format minutes as `H:MM:SS`, rounded to whole seconds.
pub fn to_hms(minutes: f64) -> Option<String> {
    if !minutes.is_finite() {
        return None;
    }
    let secs = (minutes * 60.0).round() as i64;
    let (h, rem) = (secs / 3600, secs % 3600);
    Some(format!("{}:{:02}:{:02}", h, rem / 60, rem % 60))
}

fn excess_minutes(minutes: f64, reserve: f64) -> f64 {
    (minutes - reserve).max(0.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn in_month(date: NaiveDate, request: &TripSummaryRequest) -> bool {
    date.year() == request.year && date.month() == request.month
}

#[derive(Debug, Default)]
struct TripSide {
    trips: u32,
    supervisors: BTreeSet<String>,
}

#[derive(Debug)]
struct EngineSide {
    version_type: VersionType,
    at_facility_minutes: f64,
    not_at_facility_minutes: f64,
}

#[derive(Debug, Default)]
struct JoinRow {
    trips: Option<TripSide>,
    engine: Option<EngineSide>,
}

/// Build the fuel cost rows of one month.
///
/// Trips and summaries are aggregated per (cleaned plate, date) and full
/// outer joined on that key; the vehicle type comes from the master by
/// plate. Rows are ordered by plate, then date.
pub fn build_trip_summary(
    summaries: &[DailySummary],
    trips: &[TripRecord],
    vehicles: &[VehicleMasterRecord],
    request: &TripSummaryRequest,
    fuel: &FuelConfig,
) -> Result<Vec<TripCostRow>> {
    if !(1..=12).contains(&request.month) {
        return Err(EngineOnError::InvalidConfig {
            message: format!("month must be 1-12, got {}", request.month),
        });
    }

    let mut joined: BTreeMap<(String, NaiveDate), JoinRow> = BTreeMap::new();

    let mut bad_dates = 0usize;
    for trip in trips {
        // Dispatch dates may carry a time component
        let day_part = trip.date.split_whitespace().next().unwrap_or("");
        let Ok(date) = parse_date(day_part) else {
            bad_dates += 1;
            continue;
        };
        if !in_month(date, request) {
            continue;
        }
        let side = joined
            .entry((clean_plate(&trip.plate), date))
            .or_default()
            .trips
            .get_or_insert_with(TripSide::default);
        side.trips += trip.trip_count;
        if let Some(s) = trip.supervisor.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            side.supervisors.insert(s.to_string());
        }
    }
    if bad_dates > 0 {
        warn!("[TripSummary] Skipped {} trip records with unparseable dates", bad_dates);
    }

    for summary in summaries {
        if !in_month(summary.date, request) {
            continue;
        }
        if request.version_type.is_some_and(|v| v != summary.version_type) {
            continue;
        }
        let row = joined
            .entry((clean_plate(&summary.vehicle_id), summary.date))
            .or_default();
        match &mut row.engine {
            Some(engine) => {
                engine.version_type = engine.version_type.min(summary.version_type);
                engine.at_facility_minutes += summary.at_facility_minutes;
                engine.not_at_facility_minutes += summary.not_at_facility_minutes;
            }
            None => {
                row.engine = Some(EngineSide {
                    version_type: summary.version_type,
                    at_facility_minutes: summary.at_facility_minutes,
                    not_at_facility_minutes: summary.not_at_facility_minutes,
                });
            }
        }
    }

    let mut vehicle_types: BTreeMap<String, Option<String>> = BTreeMap::new();
    for vehicle in vehicles {
        vehicle_types
            .entry(clean_plate(&vehicle.plate))
            .or_insert_with(|| vehicle.vehicle_type.clone());
    }

    let rows: Vec<TripCostRow> = joined
        .into_iter()
        .map(|((plate, date), row)| {
            let vehicle_type = vehicle_types.get(&plate).cloned().flatten();
            cost_row(plate, date, row, vehicle_type, request, fuel)
        })
        .collect();

    debug!(
        "[TripSummary] {}/{}: {} rows from {} trips, {} summaries",
        request.month,
        request.year,
        rows.len(),
        trips.len(),
        summaries.len()
    );

    Ok(rows)
}

fn cost_row(
    plate: String,
    date: NaiveDate,
    row: JoinRow,
    vehicle_type: Option<String>,
    request: &TripSummaryRequest,
    fuel: &FuelConfig,
) -> TripCostRow {
    let rate = fuel.rate_for(vehicle_type.as_deref());
    let trips = row.trips.as_ref().map(|t| t.trips);
    let supervisor = row
        .trips
        .as_ref()
        .filter(|t| !t.supervisors.is_empty())
        .map(|t| t.supervisors.iter().cloned().collect::<Vec<_>>().join(", "));

    let reserve = trips.map(|n| f64::from(n) * fuel.reserve_minutes_per_trip);
    let at_minutes = row.engine.as_ref().map(|e| e.at_facility_minutes);
    let excess = at_minutes.zip(reserve).map(|(m, r)| excess_minutes(m, r));

    // Missing values on the not-at-facility side count as zero
    let not_at_minutes = row
        .engine
        .as_ref()
        .map(|e| e.not_at_facility_minutes)
        .unwrap_or(0.0);
    let not_at_liters = fuel.liters(rate, not_at_minutes, reserve.unwrap_or(0.0));

    TripCostRow {
        key: format!("{}_{}", plate, date_key(date)),
        plate,
        date,
        supervisor,
        trips,
        version_type: row.engine.as_ref().map(|e| e.version_type),
        vehicle_type,
        at_facility_minutes: at_minutes,
        at_facility_hms: at_minutes.and_then(to_hms),
        reserve_minutes: reserve,
        excess_minutes: excess,
        excess_hms: excess.and_then(to_hms),
        liters: excess.map(|e| round2(rate * e / 60.0)),
        not_at_facility_minutes: not_at_minutes,
        not_at_facility_hms: to_hms(not_at_minutes).unwrap_or_default(),
        not_at_facility_liters: not_at_liters,
        year: request.year,
        month: request.month,
    }
}
