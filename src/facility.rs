//! Facility reference set and nearest-facility attribution.
//!
//! Facilities are indexed in an R-tree of `[lng, lat]` points. A lookup
//! pre-filters candidates with a degree envelope slightly larger than the
//! search radius, then ranks the candidates by exact haversine distance.
//! Equidistant facilities resolve to the one loaded first (input order),
//! which is also what a full scan over [`distance_matrix`] returns.
//!
//! [`distance_matrix`]: crate::geo_utils::distance_matrix

use log::{debug, warn};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::error::{EngineOnError, Result};
use crate::geo_utils::{distance_matrix, haversine_distance, meters_to_degrees, nan_argmin};
use crate::{Facility, GpsPoint};

/// Envelope padding on top of the search radius, as a ratio.
const ENVELOPE_PADDING: f64 = 1.05;

/// A facility position in the spatial index.
#[derive(Debug, Clone)]
struct FacilityEntry {
    /// Position in load order (tie-break key)
    index: usize,
    latitude: f64,
    longitude: f64,
}

impl RTreeObject for FacilityEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.longitude, self.latitude])
    }
}

/// Result of attributing a point to a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityMatch {
    pub code: String,
    /// Position of the facility in load order
    pub index: usize,
    pub distance_m: f64,
}

/// Immutable facility set for one run.
pub struct FacilityIndex {
    facilities: Vec<Facility>,
    tree: RTree<FacilityEntry>,
}

impl std::fmt::Debug for FacilityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilityIndex")
            .field("facilities", &self.facilities.len())
            .finish()
    }
}

impl FacilityIndex {
    /// Build the index, dropping facilities without usable coordinates.
    ///
    /// Fails with `UpstreamUnavailable` when no facility survives: without
    /// reference locations no event can be attributed.
    pub fn new(facilities: Vec<Facility>) -> Result<Self> {
        let total = facilities.len();
        let facilities: Vec<Facility> = facilities
            .into_iter()
            .filter(|f| f.position().is_valid())
            .collect();

        if facilities.len() < total {
            warn!(
                "[FacilityIndex] Dropped {} facilities with invalid coordinates",
                total - facilities.len()
            );
        }

        if facilities.is_empty() {
            return Err(EngineOnError::UpstreamUnavailable {
                message: "No facility data found".to_string(),
            });
        }

        let entries: Vec<FacilityEntry> = facilities
            .iter()
            .enumerate()
            .map(|(index, f)| FacilityEntry {
                index,
                latitude: f.latitude,
                longitude: f.longitude,
            })
            .collect();

        debug!("[FacilityIndex] Indexed {} facilities", entries.len());

        Ok(Self {
            facilities,
            tree: RTree::bulk_load(entries),
        })
    }

    pub fn len(&self) -> usize {
        self.facilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facilities.is_empty()
    }

    pub fn facilities(&self) -> &[Facility] {
        &self.facilities
    }

    /// Distances from each point to every facility, in load order.
    pub fn distance_matrix(&self, points: &[GpsPoint]) -> Vec<Vec<f64>> {
        let targets: Vec<GpsPoint> = self.facilities.iter().map(Facility::position).collect();
        distance_matrix(points, &targets)
    }

    /// Nearest facility within `max_distance_m` of `point`.
    ///
    /// NaN or out-of-range points never match.
    pub fn nearest_within(&self, point: &GpsPoint, max_distance_m: f64) -> Option<FacilityMatch> {
        if !point.is_valid() || max_distance_m.is_nan() || max_distance_m < 0.0 {
            return None;
        }

        let radius = max_distance_m * ENVELOPE_PADDING + 1.0;
        let (dlat, _) = meters_to_degrees(radius, point.latitude);
        // Widest longitude span occurs at the poleward edge of the envelope
        let edge_lat = (point.latitude.abs() + dlat).min(90.0);
        let (_, dlng) = meters_to_degrees(radius, edge_lat);

        let min_lng = point.longitude - dlng;
        let max_lng = point.longitude + dlng;
        if min_lng < -180.0 || max_lng > 180.0 || edge_lat >= 90.0 {
            // Envelope wraps; fall back to the exhaustive scan
            return self.nearest_within_scan(point, max_distance_m);
        }

        let envelope = AABB::from_corners(
            [min_lng, point.latitude - dlat],
            [max_lng, point.latitude + dlat],
        );

        let best = self
            .tree
            .locate_in_envelope(&envelope)
            .map(|e| {
                let d = haversine_distance(point, &GpsPoint::new(e.latitude, e.longitude));
                (e.index, d)
            })
            .filter(|(_, d)| !d.is_nan())
            .min_by(|(ia, da), (ib, db)| da.total_cmp(db).then(ia.cmp(ib)))?;

        self.accept(best, max_distance_m)
    }

    /// Nearest facility within `max_distance_m`, by scanning every facility.
    pub fn nearest_within_scan(
        &self,
        point: &GpsPoint,
        max_distance_m: f64,
    ) -> Option<FacilityMatch> {
        let row = self.distance_matrix(std::slice::from_ref(point)).pop()?;
        let best = nan_argmin(&row)?;
        self.accept(best, max_distance_m)
    }

    fn accept(
        &self,
        (index, distance_m): (usize, f64),
        max_distance_m: f64,
    ) -> Option<FacilityMatch> {
        if distance_m > max_distance_m {
            return None;
        }
        Some(FacilityMatch {
            code: self.facilities[index].code.clone(),
            index,
            distance_m,
        })
    }
}
