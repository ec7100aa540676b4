//! # Fleet Sync
//!
//! GP51 fleet-tracking synchronization, trail processing and geofence
//! alerting.
//!
//! This library provides:
//! - An authenticated GP51 API client with typed actions, bounded retry and
//!   error classification
//! - Conversion of raw position streams into simplified, distance-annotated
//!   trails
//! - Geofence membership evaluation with enter/exit alerting
//! - A sync orchestrator with parallel vendor fetches, per-item conflict
//!   resolution and pollable job progress
//!
//! It is a library, not a service: every component exposes one primary
//! operation callable from UI code or a scheduled job runner.
//!
//! ## Quick Start
//!
//! ```rust
//! use fleet_sync::{build_trail, Position, TrailConfig};
//!
//! let positions = vec![
//!     Position::new("truck-7", 51.5074, -0.1278, 0),
//!     Position::new("truck-7", 51.5090, -0.1300, 60_000),
//!     Position::new("truck-7", 51.5110, -0.1320, 120_000),
//! ];
//!
//! let trail = build_trail(&positions, &TrailConfig::default()).unwrap();
//! println!("{} km in {} min", trail.total_distance_km, trail.total_duration_minutes);
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling and the classified-error taxonomy
pub mod error;
pub use error::{ClassifiedError, ErrorKind, Result, Severity};

// Geographic utilities (distance, bounds, containment)
pub mod geo_utils;

// Trail construction (distance annotation + Douglas-Peucker)
pub mod trail;
pub use trail::{build_trail, simplify, Trail, TrailConfig};

// Geofence types and the vehicle monitor
pub mod geofence;
pub use geofence::{
    moved_beyond_threshold, AlertKind, FenceKind, Geofence, GeofenceAlert, GeofenceIndex,
    MonitorError, VehicleMonitor, DEFAULT_MOVEMENT_THRESHOLD_M,
};

// GP51 vendor API client (typed actions, session lifecycle, retry)
pub mod gp51;
pub use gp51::{DeviceRecord, Gp51Action, Gp51Client, Gp51Config, Gp51Session, UserRecord};

// Persistence boundary (storage traits + in-memory implementations)
pub mod store;
pub use store::{
    AlertStore, DeviceStore, GeofenceStore, MemoryStore, PositionStore, StoreError, UserStore,
};

// Sync orchestration (job state machine, conflict resolution, progress)
pub mod sync;
pub use sync::{ConflictPolicy, JobStatus, SyncJob, SyncOrchestrator, SyncProgress, VendorFeed};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use fleet_sync::GpsPoint;
/// let point = GpsPoint::new(51.5074, -0.1278); // London
/// ```
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

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// A single position sample from a tracked device.
///
/// Immutable once recorded; produced by the GP51 API or read from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Speed in km/h as reported by the device.
    pub speed: f64,
    /// Heading in degrees clockwise from north.
    pub course: f64,
    /// Sample time in Unix milliseconds.
    pub timestamp_ms: i64,
}

impl Position {
    /// Create a position sample with zero speed and course.
    pub fn new(
        device_id: impl Into<String>,
        latitude: f64,
        longitude: f64,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            latitude,
            longitude,
            speed: 0.0,
            course: 0.0,
            timestamp_ms,
        }
    }

    /// The sample's coordinate.
    pub fn point(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }

    /// Check if the sample's coordinates are valid.
    pub fn is_valid(&self) -> bool {
        self.point().is_valid()
    }
}

/// Bounding box for a set of points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in points {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
