//! Geographic utilities: distances, bounds and polygon containment.
//!
//! All distance functions return meters. Containment and perpendicular
//! distance operate directly on raw lat/lng degrees; see the individual
//! function docs for where that planar approximation applies.

use geo::{Contains, Coord, LineString, Point, Polygon};

use crate::{Bounds, GpsPoint};

/// Mean Earth radius in meters (6371 km).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let d_lat = (p2.latitude - p1.latitude).to_radians();
    let d_lng = (p2.longitude - p1.longitude).to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Total distance along a polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Perpendicular distance from `point` to the line through `start` and `end`,
/// in coordinate degrees.
///
/// This is a planar approximation over raw lat/lng, not a geodesic distance.
/// It is only meaningful for the small tolerances used in track
/// simplification; changing it to a true geodesic would alter simplification
/// output and the stored trail sizes downstream.
pub fn perpendicular_distance(point: &GpsPoint, start: &GpsPoint, end: &GpsPoint) -> f64 {
    let dx = end.longitude - start.longitude;
    let dy = end.latitude - start.latitude;

    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        // Degenerate segment: distance to the single point.
        let px = point.longitude - start.longitude;
        let py = point.latitude - start.latitude;
        return (px * px + py * py).sqrt();
    }

    let num = (dy * point.longitude - dx * point.latitude + end.longitude * start.latitude
        - end.latitude * start.longitude)
        .abs();
    num / len_sq.sqrt()
}

/// Test whether a point lies inside the polygon described by `ring`.
///
/// Only the exterior ring is considered; holes are not part of the geofence
/// model. The ring does not need to repeat its first point — it is closed
/// automatically. Rings with fewer than 3 vertices contain nothing.
pub fn point_in_ring(point: &GpsPoint, ring: &[GpsPoint]) -> bool {
    if ring.len() < 3 {
        return false;
    }

    let coords: Vec<Coord<f64>> = ring
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    let polygon = Polygon::new(LineString::new(coords), vec![]);
    polygon.contains(&Point::new(point.longitude, point.latitude))
}

/// Compute the bounding box of a set of points.
///
/// Returns `None` for an empty slice.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    Bounds::from_points(points)
}
