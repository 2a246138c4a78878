//! Geographic utilities.
//!
//! Great-circle distances on a spherical Earth (R = 6,371,000 m). Every
//! function is NaN-transparent: a NaN coordinate yields a NaN distance, and
//! NaN distances are skipped by [`nan_argmin`].

use crate::GpsPoint;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Approximate meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Haversine distance in meters between two coordinate pairs (degrees).
#[inline]
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Haversine distance in meters between two points.
#[inline]
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    haversine(p1.latitude, p1.longitude, p2.latitude, p2.longitude)
}

/// Distance from every point to every target: an `N×M` matrix in meters.
///
/// Row `i` holds the distances from `points[i]`; column `j` follows the
/// order of `targets`.
pub fn distance_matrix(points: &[GpsPoint], targets: &[GpsPoint]) -> Vec<Vec<f64>> {
    points
        .iter()
        .map(|p| targets.iter().map(|t| haversine_distance(p, t)).collect())
        .collect()
}

/// Index and value of the smallest non-NaN entry.
///
/// The first index wins ties. Returns `None` when the slice is empty or
/// every entry is NaN.
pub fn nan_argmin(values: &[f64]) -> Option<(usize, f64)> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, b)) if b <= v => best,
            _ => Some((i, v)),
        })
}

/// Convert a distance in meters to degree offsets `(lat, lng)` at a latitude.
///
/// The longitude span grows towards the poles; it is capped at 360 degrees.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> (f64, f64) {
    let lat_deg = meters / METERS_PER_DEGREE;
    let cos_lat = latitude.to_radians().cos().abs();
    let lng_deg = if cos_lat < 1e-9 {
        360.0
    } else {
        (meters / (METERS_PER_DEGREE * cos_lat)).min(360.0)
    };
    (lat_deg, lng_deg)
}

/// Arithmetic mean of a set of points, component-wise.
///
/// Returns a NaN point for an empty slice.
pub fn mean_point(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::nan();
    }
    let n = points.len() as f64;
    let (lat, lng) = points
        .iter()
        .fold((0.0, 0.0), |(lat, lng), p| (lat + p.latitude, lng + p.longitude));
    GpsPoint::new(lat / n, lng / n)
}
