//! # Event Segmentation
//!
//! Turns the time-ordered readings of one vehicle-day into engine-on events.
//!
//! ## Algorithm
//!
//! 1. Resolve the day's [`VersionType`] from the voltage field shapes;
//!    a day with no Unsupported or Numeric reading produces nothing
//! 2. Classify each reading's [`EngineState`]
//! 3. An **interval** closes at reading `i` when readings `i-1` and `i` are
//!    both `ParkedOn`, report the same place, and `0 < Δt ≤ max_gap_minutes`
//! 4. Each interval is positioned at reading `i`'s coordinates (NaN if the
//!    text does not parse)
//! 5. Consecutive intervals stay in the same **event** while their positions
//!    are within `max_distance_m`; a larger or NaN distance starts a new one
//! 6. Events carry summed minutes and the mean position of their intervals
//! 7. Each event is attributed to the nearest facility within
//!    `max_distance_m`, if any
//!
//! The whole pipeline is a pure function of its inputs.

use std::ops::Range;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::classify::{classify_engine_state, classify_voltage, parse_location, parse_voltage};
use crate::geo_utils::{haversine_distance, mean_point};
use crate::{
    DailySummary, EngineOnEvent, EngineState, FacilityIndex, GpsPoint, Reading, SegmentConfig,
    VersionType,
};

/// One qualifying gap between two consecutive engine-on readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Timestamp of the closing reading
    pub at: NaiveDateTime,
    /// Gap length in minutes
    pub minutes: f64,
    /// Position of the closing reading
    pub position: GpsPoint,
}

/// Segmentation output for one vehicle-day.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleDay {
    pub vehicle_id: String,
    pub date: NaiveDate,
    pub version_type: VersionType,
    pub intervals: Vec<Interval>,
    pub events: Vec<EngineOnEvent>,
    pub summary: DailySummary,
}

/// Gap between two timestamps in (fractional) minutes.
fn minutes_between(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 60_000.0
}

fn same_place(a: &Reading, b: &Reading) -> bool {
    match (&a.raw_place, &b.raw_place) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Find the engine-on intervals of a time-ordered reading sequence.
///
/// Fewer than two readings never produce an interval.
pub fn detect_intervals(readings: &[Reading], config: &SegmentConfig) -> Vec<Interval> {
    let states: Vec<EngineState> = readings
        .iter()
        .map(|r| {
            classify_engine_state(
                parse_voltage(r.voltage.as_ref()),
                &r.status,
                config.engine_on_voltage,
            )
        })
        .collect();

    readings
        .windows(2)
        .zip(states.windows(2))
        .filter_map(|(pair, state)| {
            let (prev, cur) = (&pair[0], &pair[1]);
            if state[0] != EngineState::ParkedOn || state[1] != EngineState::ParkedOn {
                return None;
            }
            if !same_place(prev, cur) {
                return None;
            }
            let minutes = minutes_between(prev.timestamp, cur.timestamp);
            if minutes <= 0.0 || minutes > config.max_gap_minutes {
                return None;
            }
            Some(Interval {
                at: cur.timestamp,
                minutes,
                position: parse_location(cur.location_text.as_deref()),
            })
        })
        .collect()
}

/// Split intervals into events, returned as index ranges into `intervals`.
///
/// The first interval always opens an event. Every later interval opens a
/// new one when its distance to the previous interval exceeds
/// `max_distance_m` or is NaN.
pub fn cluster_intervals(intervals: &[Interval], max_distance_m: f64) -> Vec<Range<usize>> {
    let mut events: Vec<Range<usize>> = Vec::new();

    for (i, interval) in intervals.iter().enumerate() {
        let continues = i > 0 && {
            let d = haversine_distance(&intervals[i - 1].position, &interval.position);
            // NaN compares false, so it breaks the run
            d <= max_distance_m
        };

        match events.last_mut() {
            Some(current) if continues => current.end = i + 1,
            _ => events.push(i..i + 1),
        }
    }

    events
}

/// Segment one vehicle-day.
///
/// `readings` must belong to a single vehicle and date and be sorted by
/// timestamp. Returns `None` when the day has no resolvable version or no
/// qualifying interval.
pub fn segment_vehicle_day(
    vehicle_id: &str,
    date: NaiveDate,
    readings: &[Reading],
    facilities: &FacilityIndex,
    config: &SegmentConfig,
) -> Option<VehicleDay> {
    let version_type =
        VersionType::resolve(readings.iter().map(|r| classify_voltage(r.voltage.as_ref())))?;
    segment_with_version(vehicle_id, date, version_type, readings, facilities, config)
}

/// Segment one vehicle-day whose version was resolved elsewhere.
///
/// Used when the version must also count rows that never reach the
/// timeline, such as readings whose time text does not parse.
pub fn segment_with_version(
    vehicle_id: &str,
    date: NaiveDate,
    version_type: VersionType,
    readings: &[Reading],
    facilities: &FacilityIndex,
    config: &SegmentConfig,
) -> Option<VehicleDay> {
    let intervals = detect_intervals(readings, config);
    if intervals.is_empty() {
        return None;
    }

    let events: Vec<EngineOnEvent> = cluster_intervals(&intervals, config.max_distance_m)
        .into_iter()
        .enumerate()
        .map(|(ordinal, range)| {
            let members = &intervals[range];
            let positions: Vec<GpsPoint> = members.iter().map(|i| i.position).collect();
            let centroid = mean_point(&positions);
            let matched = facilities.nearest_within(&centroid, config.max_distance_m);
            let ordinal = ordinal as u32;

            EngineOnEvent {
                key: EngineOnEvent::event_key(vehicle_id, date, ordinal),
                vehicle_id: vehicle_id.to_string(),
                date,
                ordinal,
                start: members[0].at,
                end: members[members.len() - 1].at,
                interval_count: members.len() as u32,
                total_on_minutes: members.iter().map(|i| i.minutes).sum(),
                centroid,
                facility_distance_m: matched.as_ref().map(|m| m.distance_m),
                nearest_facility: matched.map(|m| m.code),
            }
        })
        .collect();

    let summary = DailySummary::from_events(vehicle_id, date, version_type, &events);

    Some(VehicleDay {
        vehicle_id: vehicle_id.to_string(),
        date,
        version_type,
        intervals,
        events,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Facility, RawVoltage, VehicleStatus};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 1).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        date().and_hms_opt(h, m, s).unwrap()
    }

    fn on(h: u32, m: u32, location: &str) -> Reading {
        Reading::parked("X1", at(h, m, 0), 30.0, "Yard", location)
    }

    fn plants() -> FacilityIndex {
        FacilityIndex::new(vec![Facility::new("P01", 13.7500, 100.5000)]).unwrap()
    }

    fn interval(m: u32, lat: f64, lng: f64) -> Interval {
        Interval {
            at: at(10, m, 0),
            minutes: 1.0,
            position: GpsPoint::new(lat, lng),
        }
    }

    #[test]
    fn test_gap_boundaries() {
        let config = SegmentConfig::default();
        let mut readings = vec![on(10, 0, "13.75,100.5"), on(10, 5, "13.75,100.5")];
        assert_eq!(detect_intervals(&readings, &config).len(), 1);

        // 5.01 minutes
        readings[1].timestamp = at(10, 5, 0) + chrono::Duration::milliseconds(600);
        assert!(detect_intervals(&readings, &config).is_empty());

        // Same timestamp
        readings[1].timestamp = at(10, 0, 0);
        assert!(detect_intervals(&readings, &config).is_empty());
    }

    #[test]
    fn test_place_change_breaks_interval() {
        let mut readings = vec![on(10, 0, "13.75,100.5"), on(10, 3, "13.75,100.5")];
        readings[1].raw_place = Some("Gate".to_string());
        assert!(detect_intervals(&readings, &SegmentConfig::default()).is_empty());

        readings[0].raw_place = None;
        readings[1].raw_place = None;
        assert!(detect_intervals(&readings, &SegmentConfig::default()).is_empty());
    }

    #[test]
    fn test_engine_off_breaks_chain() {
        let mut readings = vec![
            on(10, 0, "13.75,100.5"),
            on(10, 3, "13.75,100.5"),
            on(10, 6, "13.75,100.5"),
        ];
        readings[1].voltage = Some(RawVoltage::Number(24.0));
        assert!(detect_intervals(&readings, &SegmentConfig::default()).is_empty());

        readings[1].voltage = Some(RawVoltage::Number(26.0));
        readings[1].status = VehicleStatus::Other("วิ่ง".to_string());
        assert!(detect_intervals(&readings, &SegmentConfig::default()).is_empty());
    }

    #[test]
    fn test_cluster_breaks_on_distance_and_nan() {
        let intervals = vec![
            interval(1, 13.75, 100.5),
            interval(2, 13.7501, 100.5),
            // ~1.1 km away
            interval(3, 13.76, 100.5),
            interval(4, f64::NAN, f64::NAN),
            interval(5, 13.76, 100.5),
        ];
        let events = cluster_intervals(&intervals, 200.0);
        assert_eq!(events, vec![0..2, 2..3, 3..4, 4..5]);
    }

    #[test]
    fn test_cluster_is_deterministic() {
        let intervals: Vec<Interval> = (0..20)
            .map(|i| interval(i, 13.75 + (i % 7) as f64 * 0.001, 100.5))
            .collect();
        let first = cluster_intervals(&intervals, 150.0);
        for _ in 0..5 {
            assert_eq!(cluster_intervals(&intervals, 150.0), first);
        }
    }

    #[test]
    fn test_segment_single_event_at_facility() {
        let readings = vec![
            on(10, 0, "13.75,100.50"),
            on(10, 3, "13.75,100.50"),
            on(10, 6, "13.75,100.50"),
        ];
        let day =
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .unwrap();

        assert_eq!(day.intervals.len(), 2);
        assert_eq!(day.events.len(), 1);
        let event = &day.events[0];
        assert_eq!(event.total_on_minutes, 6.0);
        assert_eq!(event.nearest_facility.as_deref(), Some("P01"));
        assert_eq!(event.key, "X1_2025-12-01_0");
        assert_eq!(event.start, at(10, 3, 0));
        assert_eq!(event.end, at(10, 6, 0));
        assert_eq!(day.summary.at_facility_minutes, 6.0);
        assert_eq!(day.summary.at_facility_hours, 0.1);
        assert_eq!(day.summary.not_at_facility_minutes, 0.0);
        assert_eq!(day.version_type, VersionType::Numeric);
    }

    #[test]
    fn test_segment_not_at_facility() {
        let readings = vec![on(10, 0, "14.0,101.0"), on(10, 4, "14.0,101.0")];
        let day =
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .unwrap();
        assert!(day.events[0].nearest_facility.is_none());
        assert_eq!(day.summary.at_facility_minutes, 0.0);
        assert_eq!(day.summary.not_at_facility_minutes, 4.0);
    }

    #[test]
    fn test_nan_interval_is_its_own_event() {
        let readings = vec![
            on(10, 0, "13.75,100.50"),
            on(10, 2, "13.75,100.50"),
            on(10, 4, "garbage"),
            on(10, 6, "13.75,100.50"),
        ];
        let day =
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .unwrap();
        assert_eq!(day.events.len(), 3);
        assert!(day.events[1].centroid.has_nan());
        assert!(day.events[1].nearest_facility.is_none());
        assert_eq!(day.summary.at_facility_minutes, 4.0);
        assert_eq!(day.summary.not_at_facility_minutes, 2.0);
    }

    #[test]
    fn test_unsupported_firmware_sets_version() {
        let mut readings = vec![
            on(10, 0, "13.75,100.50"),
            on(10, 3, "13.75,100.50"),
            on(10, 6, "13.75,100.50"),
        ];
        readings.push(Reading {
            voltage: Some(RawVoltage::Text("เฟิร์มแวร์ไม่รองรับ".to_string())),
            timestamp: at(11, 0, 0),
            ..readings[0].clone()
        });
        let day =
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .unwrap();
        assert_eq!(day.version_type, VersionType::Unsupported);
        assert_eq!(day.summary.version_type, VersionType::Unsupported);
    }

    #[test]
    fn test_no_version_no_output() {
        let readings: Vec<Reading> = (0..3)
            .map(|m| Reading {
                voltage: Some(RawVoltage::Text("n/a".to_string())),
                ..on(10, m, "13.75,100.50")
            })
            .collect();
        assert!(
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .is_none()
        );
    }

    #[test]
    fn test_single_reading_no_output() {
        let readings = vec![on(10, 0, "13.75,100.50")];
        assert!(
            segment_vehicle_day("X1", date(), &readings, &plants(), &SegmentConfig::default())
                .is_none()
        );
    }
}
