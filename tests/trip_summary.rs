//! Tests for the trip / fuel cost join

use chrono::NaiveDate;
use engineon::trip_summary::{clean_plate, to_hms};
use engineon::{
    build_trip_summary, DailySummary, FuelConfig, TripCostRow, TripRecord, TripSummaryRequest,
    VehicleMasterRecord, VersionType,
};

fn summary(plate: &str, day: u32, version: VersionType, at: f64, not_at: f64) -> DailySummary {
    let date = NaiveDate::from_ymd_opt(2025, 12, day).unwrap();
    DailySummary {
        key: DailySummary::summary_key(plate, date),
        vehicle_id: plate.to_string(),
        date,
        version_type: version,
        event_count: 1,
        at_facility_minutes: at,
        at_facility_hours: at / 60.0,
        not_at_facility_minutes: not_at,
        not_at_facility_hours: not_at / 60.0,
    }
}

fn trip(plate: &str, supervisor: &str, date: &str, count: u32) -> TripRecord {
    TripRecord {
        plate: plate.to_string(),
        supervisor: Some(supervisor.to_string()),
        date: date.to_string(),
        trip_count: count,
    }
}

fn vehicles() -> Vec<VehicleMasterRecord> {
    vec![
        VehicleMasterRecord {
            plate: "สบ.70-1111".to_string(),
            vehicle_type: Some("Mixer 10 ล้อ".to_string()),
        },
        VehicleMasterRecord {
            plate: "70-2222".to_string(),
            vehicle_type: Some("Mixer 6 ล้อ".to_string()),
        },
    ]
}

fn december(version_type: Option<VersionType>) -> TripSummaryRequest {
    TripSummaryRequest {
        year: 2025,
        month: 12,
        version_type,
    }
}

fn row<'a>(rows: &'a [TripCostRow], key: &str) -> &'a TripCostRow {
    rows.iter().find(|r| r.key == key).unwrap()
}

#[test]
fn test_helpers() {
    assert_eq!(clean_plate("สบ.70-1111"), "70-1111");
    assert_eq!(to_hms(90.0).as_deref(), Some("1:30:00"));
}

#[test]
fn test_join_and_fuel() {
    let summaries = vec![
        summary("70-1111", 1, VersionType::Numeric, 150.0, 45.0),
        summary("70-2222", 1, VersionType::Unsupported, 20.0, 0.0),
    ];
    let trips = vec![
        trip("สบ.70-1111", "Somchai", "01/12/2025", 1),
        trip("70-1111", "Anan", "01/12/2025 07:45", 1),
        trip("70-2222", "Anan", "01/12/2025", 1),
    ];

    let rows = build_trip_summary(
        &summaries,
        &trips,
        &vehicles(),
        &december(None),
        &FuelConfig::default(),
    )
    .unwrap();
    assert_eq!(rows.len(), 2);

    let r = row(&rows, "70-1111_2025-12-01");
    assert_eq!(r.trips, Some(2));
    assert_eq!(r.supervisor.as_deref(), Some("Anan, Somchai"));
    assert_eq!(r.vehicle_type.as_deref(), Some("Mixer 10 ล้อ"));
    assert_eq!(r.reserve_minutes, Some(60.0));
    assert_eq!(r.excess_minutes, Some(90.0));
    assert_eq!(r.excess_hms.as_deref(), Some("1:30:00"));
    assert_eq!(r.at_facility_hms.as_deref(), Some("2:30:00"));
    assert_eq!(r.liters, Some(3.0));
    // 45 minutes are within the 60 minute reserve
    assert_eq!(r.not_at_facility_liters, 0.0);
    assert_eq!(r.not_at_facility_hms, "0:45:00");
    assert_eq!((r.year, r.month), (2025, 12));

    let r = row(&rows, "70-2222_2025-12-01");
    assert_eq!(r.version_type, Some(VersionType::Unsupported));
    assert_eq!(r.excess_minutes, Some(0.0));
    assert_eq!(r.liters, Some(0.0));
}

#[test]
fn test_outer_join_keeps_both_sides() {
    let summaries = vec![summary("70-1111", 2, VersionType::Numeric, 100.0, 130.0)];
    let trips = vec![trip("70-2222", "Anan", "03/12/2025", 2)];

    let rows = build_trip_summary(
        &summaries,
        &trips,
        &vehicles(),
        &december(None),
        &FuelConfig::default(),
    )
    .unwrap();
    assert_eq!(rows.len(), 2);

    // Engine-on only: no trips, so no reserve and no at-facility estimate
    let engine_only = row(&rows, "70-1111_2025-12-02");
    assert_eq!(engine_only.trips, None);
    assert_eq!(engine_only.liters, None);
    assert_eq!(engine_only.not_at_facility_liters, 4.33);

    // Trips only
    let trips_only = row(&rows, "70-2222_2025-12-03");
    assert_eq!(trips_only.trips, Some(2));
    assert_eq!(trips_only.version_type, None);
    assert_eq!(trips_only.at_facility_minutes, None);
    assert_eq!(trips_only.not_at_facility_minutes, 0.0);
    assert_eq!(trips_only.not_at_facility_liters, 0.0);
}

#[test]
fn test_month_and_version_filters() {
    let summaries = vec![
        summary("70-1111", 1, VersionType::Numeric, 100.0, 0.0),
        summary("70-2222", 1, VersionType::Unsupported, 100.0, 0.0),
    ];
    let trips = vec![trip("70-1111", "Anan", "30/11/2025", 1)];

    let rows = build_trip_summary(
        &summaries,
        &trips,
        &vehicles(),
        &december(Some(VersionType::Unsupported)),
        &FuelConfig::default(),
    )
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].plate, "70-2222");
}

#[test]
fn test_unknown_vehicle_type_burns_nothing() {
    let summaries = vec![summary("99-9999", 1, VersionType::Numeric, 500.0, 500.0)];
    let trips = vec![trip("99-9999", "Anan", "01/12/2025", 1)];
    let rows = build_trip_summary(
        &summaries,
        &trips,
        &vehicles(),
        &december(None),
        &FuelConfig::default(),
    )
    .unwrap();
    assert_eq!(rows[0].vehicle_type, None);
    assert_eq!(rows[0].liters, Some(0.0));
    assert_eq!(rows[0].not_at_facility_liters, 0.0);
}

#[test]
fn test_request_payload() {
    let request: TripSummaryRequest =
        serde_json::from_str(r#"{"year": 2025, "month": 12, "version_type": "v1"}"#).unwrap();
    assert_eq!(request.version_type, Some(VersionType::Unsupported));

    let trip: TripRecord = serde_json::from_str(
        r#"{"หัว": "สบ.70-1111", "พจส1": "Anan", "ออก LDT_fmt": "01/12/2025", "LDT_unique_count": 3}"#,
    )
    .unwrap();
    assert_eq!(trip.trip_count, 3);
}
