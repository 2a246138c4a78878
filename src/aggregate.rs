//! Daily aggregation: one calendar date across all vehicles.
//!
//! Records are filtered, grouped by vehicle, sorted by timestamp and handed
//! to [`segment_with_version`] one vehicle at a time. Vehicles share no
//! state, so with the `parallel` feature they are segmented on rayon.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::classify::{classify_voltage, VoltageType};
use crate::segment::{segment_with_version, VehicleDay};
use crate::{
    DailySummary, EngineOnEvent, FacilityIndex, Reading, ReadingRecord, SegmentConfig, VersionType,
};

/// Rows produced for one date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DayRows {
    /// One row per event, all vehicles
    pub events: Vec<EngineOnEvent>,
    /// One row per vehicle with at least one event
    pub summaries: Vec<DailySummary>,
    /// Distinct vehicles that had usable readings
    pub vehicles: usize,
    /// Records left off the timeline for a missing vehicle id, bad timestamp
    /// or wrong date
    pub dropped_records: usize,
}

impl DayRows {
    /// `(raw event rows, summary rows)`
    pub fn counts(&self) -> (usize, usize) {
        (self.events.len(), self.summaries.len())
    }
}

/// Outcome of aggregating one date.
///
/// `NoData` and `EmptyAfterFiltering` are distinct from a processed day
/// that simply had zero events.
#[derive(Debug, Clone, PartialEq)]
pub enum DayOutcome {
    /// The source returned no records for the date
    NoData,
    /// Records existed, but none survived filtering
    EmptyAfterFiltering,
    Processed(DayRows),
}

impl DayOutcome {
    /// `(raw event rows, summary rows)`; zero for the empty outcomes.
    pub fn counts(&self) -> (usize, usize) {
        match self {
            DayOutcome::Processed(rows) => rows.counts(),
            _ => (0, 0),
        }
    }
}

/// One vehicle's rows for the day.
#[derive(Default)]
struct VehicleGroup {
    /// Voltage shape of every row with a plate and a time
    voltages: Vec<VoltageType>,
    /// Rows whose timestamp parsed and falls on the date
    readings: Vec<Reading>,
}

#[cfg(feature = "parallel")]
fn inside_worker_pool() -> bool {
    rayon::current_thread_index().is_some()
}

/// Aggregate every vehicle of one date.
///
/// A vehicle's version is resolved over all of its rows that carry a time,
/// including rows whose time text does not parse. Only parseable readings
/// make up the timeline.
///
/// With `debug_vehicle` set, only that vehicle is processed and each of its
/// intervals and events is logged.
pub fn aggregate_day(
    date: NaiveDate,
    records: &[ReadingRecord],
    facilities: &FacilityIndex,
    config: &SegmentConfig,
    debug_vehicle: Option<&str>,
) -> DayOutcome {
    if records.is_empty() {
        return DayOutcome::NoData;
    }

    let mut dropped = 0usize;
    let mut groups: BTreeMap<String, VehicleGroup> = BTreeMap::new();

    for record in records {
        // Rows without a plate or a time are unusable; every other row
        // counts toward the vehicle's version, even if its time is garbage
        let Some(vehicle_id) = record
            .vehicle_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        else {
            dropped += 1;
            continue;
        };
        if record.time.is_none() {
            dropped += 1;
            continue;
        }
        if debug_vehicle.is_some_and(|v| v != vehicle_id) {
            continue;
        }

        let group = groups.entry(vehicle_id.to_string()).or_default();
        group.voltages.push(classify_voltage(record.voltage.as_ref()));

        match Reading::from_record(record) {
            // Intervals must never cross a date boundary
            Some(reading) if reading.timestamp.date() == date => group.readings.push(reading),
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        warn!(
            "[Aggregator] {}: dropped {} of {} records (missing vehicle, bad timestamp or other date)",
            date,
            dropped,
            records.len()
        );
    }

    if groups.is_empty() {
        return DayOutcome::EmptyAfterFiltering;
    }

    let vehicles = groups.len();
    let mut groups: Vec<(String, VehicleGroup)> = groups.into_iter().collect();
    for (_, group) in groups.iter_mut() {
        group.readings.sort_by_key(|r| r.timestamp);
    }

    let segment = |(vehicle_id, group): &(String, VehicleGroup)| {
        let version_type = VersionType::resolve(group.voltages.iter().copied())?;
        segment_with_version(
            vehicle_id,
            date,
            version_type,
            &group.readings,
            facilities,
            config,
        )
    };

    // Inside the date pool a nested fan-out would let work stealing start
    // another date on this thread before the current one finishes
    #[cfg(feature = "parallel")]
    let days: Vec<VehicleDay> = if inside_worker_pool() {
        groups.iter().filter_map(segment).collect()
    } else {
        groups.par_iter().filter_map(segment).collect()
    };

    #[cfg(not(feature = "parallel"))]
    let days: Vec<VehicleDay> = groups.iter().filter_map(segment).collect();

    if let Some(vehicle) = debug_vehicle {
        trace_vehicle(vehicle, date, &days);
    }

    let mut rows = DayRows {
        vehicles,
        dropped_records: dropped,
        ..Default::default()
    };
    for day in days {
        debug!(
            "[Aggregator] {} {}: {} intervals, {} events, {:.1} min at facility",
            day.vehicle_id,
            date,
            day.intervals.len(),
            day.events.len(),
            day.summary.at_facility_minutes
        );
        rows.events.extend(day.events);
        rows.summaries.push(day.summary);
    }

    DayOutcome::Processed(rows)
}

fn trace_vehicle(vehicle: &str, date: NaiveDate, days: &[VehicleDay]) {
    let Some(day) = days.iter().find(|d| d.vehicle_id == vehicle) else {
        info!("[Aggregator] debug {} {}: no qualifying intervals", vehicle, date);
        return;
    };
    for interval in &day.intervals {
        info!(
            "[Aggregator] debug {} interval at {} +{:.2} min ({}, {})",
            vehicle,
            interval.at,
            interval.minutes,
            interval.position.latitude,
            interval.position.longitude
        );
    }
    for event in &day.events {
        info!(
            "[Aggregator] debug {} event {}: {} .. {}, {:.2} min, facility={:?}",
            vehicle,
            event.ordinal,
            event.start,
            event.end,
            event.total_on_minutes,
            event.nearest_facility
        );
    }
}
