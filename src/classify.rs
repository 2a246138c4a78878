//! Reading classification.
//!
//! Pure, deterministic functions that tag each reading:
//! - [`VoltageType`]: the shape of the voltage field (firmware sentinel, number, junk)
//! - [`EngineState`]: parked with engine on/off, moving, or unknown
//! - [`VersionType`]: the device firmware class of a whole vehicle-day
//!
//! Malformed input never fails here. It degrades to `Unknown` (voltage, state)
//! or NaN (coordinates) and drops out of the computation that needs it.

use serde::{Deserialize, Serialize};

use crate::{GpsPoint, RawVoltage, VehicleStatus};

/// Voltage texts reported by devices whose firmware cannot measure voltage.
pub const FIRMWARE_UNSUPPORTED_LABELS: [&str; 2] = ["เฟิร์มแวร์ไม่รองรับ", "firmware not supported"];

/// Shape of a reading's voltage field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoltageType {
    /// Firmware sentinel text
    Unsupported,
    /// Parseable as a number
    Numeric,
    /// Anything else; excluded from version determination
    Unknown,
}

/// Engine state of a single reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    ParkedOn,
    ParkedOff,
    /// Vehicle not parked
    Other,
    /// Parked, but the voltage is missing or not a number
    Unknown,
}

/// Firmware class of a vehicle-day.
///
/// Stored as `"v1"` / `"v2"` to match the analytics tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VersionType {
    /// At least one reading carried the firmware sentinel
    #[serde(rename = "v1")]
    Unsupported,
    /// Numeric voltages only
    #[serde(rename = "v2")]
    Numeric,
}

impl VersionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionType::Unsupported => "v1",
            VersionType::Numeric => "v2",
        }
    }

    /// Parse the stored label (`"v1"`, `"v2"`).
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "v1" => Some(VersionType::Unsupported),
            "v2" => Some(VersionType::Numeric),
            _ => None,
        }
    }

    /// Resolve the version of a vehicle-day from its readings' voltage types.
    ///
    /// Priority: Unsupported > Numeric > Unknown. A single Unsupported
    /// reading makes the whole day Unsupported. `None` when no reading is
    /// Unsupported or Numeric.
    pub fn resolve<I>(types: I) -> Option<Self>
    where
        I: IntoIterator<Item = VoltageType>,
    {
        types.into_iter().fold(None, |acc, t| match (acc, t) {
            (_, VoltageType::Unsupported) | (Some(VersionType::Unsupported), _) => {
                Some(VersionType::Unsupported)
            }
            (_, VoltageType::Numeric) => Some(VersionType::Numeric),
            (acc, VoltageType::Unknown) => acc,
        })
    }
}

impl std::fmt::Display for VersionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify the shape of a voltage field.
pub fn classify_voltage(raw: Option<&RawVoltage>) -> VoltageType {
    match raw {
        None => VoltageType::Unknown,
        Some(RawVoltage::Number(_)) => VoltageType::Numeric,
        Some(RawVoltage::Text(text)) => {
            let text = text.trim();
            if FIRMWARE_UNSUPPORTED_LABELS.contains(&text) {
                VoltageType::Unsupported
            } else if text.parse::<f64>().is_ok() {
                VoltageType::Numeric
            } else {
                VoltageType::Unknown
            }
        }
    }
}

/// Numeric value of a voltage field, if any. NaN counts as no value.
pub fn parse_voltage(raw: Option<&RawVoltage>) -> Option<f64> {
    let value = match raw? {
        RawVoltage::Number(v) => *v,
        RawVoltage::Text(text) => text.trim().parse::<f64>().ok()?,
    };
    (!value.is_nan()).then_some(value)
}

/// Engine state of one reading.
///
/// Not parked is always `Other`, whatever the voltage. While parked, a
/// voltage at or above `on_threshold` (inclusive) is `ParkedOn`.
pub fn classify_engine_state(
    voltage: Option<f64>,
    status: &VehicleStatus,
    on_threshold: f64,
) -> EngineState {
    if !status.is_parked() {
        return EngineState::Other;
    }
    match voltage {
        Some(v) if v.is_nan() => EngineState::Unknown,
        Some(v) if v >= on_threshold => EngineState::ParkedOn,
        Some(_) => EngineState::ParkedOff,
        None => EngineState::Unknown,
    }
}

/// Parse `"lat,lng"` into a point, splitting on the first comma.
///
/// Each component that fails to parse becomes NaN.
pub fn parse_location(text: Option<&str>) -> GpsPoint {
    let Some(text) = text else {
        return GpsPoint::nan();
    };
    let mut parts = text.splitn(2, ',');
    let mut component = || {
        parts
            .next()
            .and_then(|p| p.trim().parse::<f64>().ok())
            .unwrap_or(f64::NAN)
    };
    let latitude = component();
    let longitude = component();
    GpsPoint::new(latitude, longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawVoltage {
        RawVoltage::Text(s.to_string())
    }

    #[test]
    fn test_voltage_types() {
        assert_eq!(classify_voltage(Some(&text(" เฟิร์มแวร์ไม่รองรับ "))), VoltageType::Unsupported);
        assert_eq!(classify_voltage(Some(&text("firmware not supported"))), VoltageType::Unsupported);
        assert_eq!(classify_voltage(Some(&text("27.5"))), VoltageType::Numeric);
        assert_eq!(classify_voltage(Some(&RawVoltage::Number(12.0))), VoltageType::Numeric);
        assert_eq!(classify_voltage(Some(&text("--"))), VoltageType::Unknown);
        assert_eq!(classify_voltage(None), VoltageType::Unknown);
    }

    #[test]
    fn test_version_priority() {
        use VoltageType::*;
        assert_eq!(
            VersionType::resolve([Numeric, Unsupported, Numeric]),
            Some(VersionType::Unsupported)
        );
        assert_eq!(
            VersionType::resolve([Unknown, Numeric, Unknown]),
            Some(VersionType::Numeric)
        );
        assert_eq!(VersionType::resolve([Unknown, Unknown]), None);
        assert_eq!(VersionType::resolve(Vec::new()), None);
    }

    #[test]
    fn test_threshold_inclusive() {
        let parked = VehicleStatus::Parked;
        assert_eq!(classify_engine_state(Some(25.0), &parked, 25.0), EngineState::ParkedOn);
        assert_eq!(classify_engine_state(Some(24.999), &parked, 25.0), EngineState::ParkedOff);
        assert_eq!(classify_engine_state(None, &parked, 25.0), EngineState::Unknown);
    }

    #[test]
    fn test_not_parked_is_other() {
        let moving = VehicleStatus::Other("วิ่ง".to_string());
        assert_eq!(classify_engine_state(Some(30.0), &moving, 25.0), EngineState::Other);
        assert_eq!(classify_engine_state(None, &moving, 25.0), EngineState::Other);
    }

    #[test]
    fn test_parse_voltage() {
        assert_eq!(parse_voltage(Some(&text(" 26.4 "))), Some(26.4));
        assert_eq!(parse_voltage(Some(&text("เฟิร์มแวร์ไม่รองรับ"))), None);
        assert_eq!(parse_voltage(Some(&text("NaN"))), None);
    }

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location(Some("13.75, 100.50")), GpsPoint::new(13.75, 100.50));

        let half = parse_location(Some("13.75,abc"));
        assert_eq!(half.latitude, 13.75);
        assert!(half.longitude.is_nan());

        assert!(parse_location(Some("no comma")).has_nan());
        assert!(parse_location(None).has_nan());
    }
}
