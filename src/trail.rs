//! Trail construction from raw position streams.
//!
//! A trail is a simplified, distance-annotated polyline built from a finite
//! window of time-ordered position samples. Construction computes cumulative
//! haversine distance and duration over the raw samples, then thins the
//! stored points with Douglas-Peucker so long trails stay cheap to persist
//! and render.
//!
//! ## Preconditions
//!
//! Positions must be supplied sorted by timestamp ascending. The builder does
//! not sort; out-of-order input produces undefined distance and duration.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{perpendicular_distance, polyline_length};
use crate::Position;

/// Configuration for trail construction.
#[derive(Debug, Clone)]
pub struct TrailConfig {
    /// Tolerance for Douglas-Peucker simplification (in degrees).
    /// Smaller values preserve more detail. Default: 0.0001 (~11 meters)
    pub simplify_tolerance: f64,
}

impl Default for TrailConfig {
    fn default() -> Self {
        Self {
            simplify_tolerance: 0.0001,
        }
    }
}

/// A simplified, distance-annotated trail for one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trail {
    /// Identifier derived from the device and window start.
    pub id: String,
    pub device_id: String,
    /// Fleet vehicle bound to the device, when known.
    pub vehicle_id: Option<String>,
    /// Simplified, time-ordered samples.
    pub points: Vec<Position>,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    /// Haversine sum over consecutive raw samples, rounded to 2 decimals.
    pub total_distance_km: f64,
    /// Whole minutes elapsed between the first and last sample.
    pub total_duration_minutes: i64,
}

impl Trail {
    /// Attach the owning vehicle id.
    pub fn with_vehicle(mut self, vehicle_id: impl Into<String>) -> Self {
        self.vehicle_id = Some(vehicle_id.into());
        self
    }
}

/// Build a trail from a device's position window.
///
/// Returns `None` for fewer than 2 positions: a single sample cannot form a
/// trail. This is a defined edge case, not an error.
///
/// Distance and duration are computed over the raw input; only the stored
/// `points` are simplified.
pub fn build_trail(positions: &[Position], config: &TrailConfig) -> Option<Trail> {
    if positions.len() < 2 {
        return None;
    }

    let device_id = positions[0].device_id.clone();
    let start_time_ms = positions[0].timestamp_ms;
    let end_time_ms = positions[positions.len() - 1].timestamp_ms;

    let path: Vec<crate::GpsPoint> = positions.iter().map(|p| p.point()).collect();
    let distance_m = polyline_length(&path);
    let total_distance_km = (distance_m / 1000.0 * 100.0).round() / 100.0;

    let total_duration_minutes = (end_time_ms - start_time_ms) / 60_000;

    let points = simplify(positions, config.simplify_tolerance);

    Some(Trail {
        id: format!("{}-{}", device_id, start_time_ms),
        device_id,
        vehicle_id: None,
        points,
        start_time_ms,
        end_time_ms,
        total_distance_km,
        total_duration_minutes,
    })
}

/// Douglas-Peucker simplification over position samples.
///
/// Runs directly on the samples (not bare coordinates) so the surviving
/// points keep their timestamps, speed and course. Perpendicular distance is
/// the planar lat/lng approximation from [`crate::geo_utils`] — adequate for
/// the small tolerances used here and deliberately left as-is, since a
/// geodesic version would change which points survive.
///
/// Deterministic: identical input and tolerance produce identical output,
/// and the output is a fixed point (re-simplifying changes nothing).
pub fn simplify(points: &[Position], tolerance: f64) -> Vec<Position> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let first = points[0].point();
    let last = points[points.len() - 1].point();

    let mut max_distance = 0.0;
    let mut max_index = 0;
    for (i, p) in points.iter().enumerate().skip(1).take(points.len() - 2) {
        let d = perpendicular_distance(&p.point(), &first, &last);
        if d > max_distance {
            max_distance = d;
            max_index = i;
        }
    }

    if max_distance > tolerance {
        let mut left = simplify(&points[..=max_index], tolerance);
        let right = simplify(&points[max_index..], tolerance);
        // The split point appears in both halves; drop the duplicate.
        left.pop();
        left.extend(right);
        left
    } else {
        vec![points[0].clone(), points[points.len() - 1].clone()]
    }
}
