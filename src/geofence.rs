//! Geofence types and the vehicle monitor.
//!
//! A geofence is a named polygon with enter/exit alerting rules. The
//! [`VehicleMonitor`] evaluates a device position against every active fence
//! and emits one alert per fence whose rules match. Fences are read-many /
//! write-rare: the monitor works from a cached [`GeofenceIndex`] and a few
//! seconds of staleness after an operator edit is acceptable; call
//! [`VehicleMonitor::reload`] to pick up changes.
//!
//! The monitor performs no temporal debouncing. Callers gate invocation on a
//! movement threshold (see [`moved_beyond_threshold`]) so a parked vehicle is
//! not re-evaluated on every sample.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};

use log::warn;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

use crate::geo_utils::{compute_bounds, haversine_distance, point_in_ring};
use crate::store::{AlertStore, GeofenceStore, StoreError};
use crate::{Bounds, GpsPoint};

/// Movement below this distance does not warrant a re-evaluation.
pub const DEFAULT_MOVEMENT_THRESHOLD_M: f64 = 10.0;

/// Whether the fence marks an allowed region or a forbidden one.
///
/// Carried as operator intent; the alerting behavior itself is controlled by
/// the `alert_on_enter` / `alert_on_exit` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FenceKind {
    Inclusion,
    Exclusion,
}

/// Alert direction for a geofence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Enter,
    Exit,
}

/// A named polygon region with enter/exit alerting rules.
///
/// Operators soft-delete fences by clearing `is_active`; rows are never
/// removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    /// Exterior ring of the polygon. Not required to repeat the first point.
    pub ring: Vec<GpsPoint>,
    pub fence_kind: FenceKind,
    pub alert_on_enter: bool,
    pub alert_on_exit: bool,
    pub is_active: bool,
}

impl Geofence {
    /// Exact membership test against the fence's exterior ring.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point_in_ring(point, &self.ring)
    }

    /// Bounding box of the ring, `None` for an empty ring.
    pub fn bounds(&self) -> Option<Bounds> {
        compute_bounds(&self.ring)
    }
}

/// An alert emitted for one geofence transition.
///
/// Created once per detected transition; the only later mutation is
/// acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeofenceAlert {
    pub id: String,
    pub geofence_id: String,
    pub device_id: String,
    pub alert_kind: AlertKind,
    pub triggered_at_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub acknowledged: bool,
}

impl GeofenceAlert {
    /// Mark the alert as seen by an operator.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }
}

/// Errors from monitor construction and reloading.
#[derive(Debug)]
pub enum MonitorError {
    Store(StoreError),
    /// A fence's geometry cannot form a polygon. This is a contract
    /// violation by whoever wrote the fence, so it fails loudly instead of
    /// being skipped.
    InvalidGeofence { geofence_id: String, reason: String },
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Store(err) => write!(f, "geofence store error: {}", err),
            MonitorError::InvalidGeofence { geofence_id, reason } => {
                write!(f, "geofence '{}' is invalid: {}", geofence_id, reason)
            }
        }
    }
}

impl std::error::Error for MonitorError {}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        MonitorError::Store(err)
    }
}

/// Envelope wrapper for R-tree indexing of fence bounds.
#[derive(Debug, Clone)]
struct FenceEnvelope {
    slot: usize,
    bounds: Bounds,
}

impl RTreeObject for FenceEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// Spatially-indexed snapshot of the active geofences.
#[derive(Debug)]
pub struct GeofenceIndex {
    fences: Vec<Geofence>,
    tree: RTree<FenceEnvelope>,
}

impl GeofenceIndex {
    /// Build an index over the given fences.
    ///
    /// Inactive fences are dropped. A fence whose ring has fewer than 3
    /// vertices is rejected outright.
    pub fn new(fences: Vec<Geofence>) -> Result<Self, MonitorError> {
        let fences: Vec<Geofence> = fences.into_iter().filter(|f| f.is_active).collect();

        let mut envelopes = Vec::with_capacity(fences.len());
        for (slot, fence) in fences.iter().enumerate() {
            if fence.ring.len() < 3 {
                return Err(MonitorError::InvalidGeofence {
                    geofence_id: fence.id.clone(),
                    reason: format!("ring has {} vertices, need at least 3", fence.ring.len()),
                });
            }
            let bounds = fence.bounds().expect("non-empty ring has bounds");
            envelopes.push(FenceEnvelope { slot, bounds });
        }

        Ok(Self {
            tree: RTree::bulk_load(envelopes),
            fences,
        })
    }

    /// Slots of fences whose bounding box contains the point.
    fn candidate_slots(&self, point: &GpsPoint) -> HashSet<usize> {
        self.tree
            .locate_in_envelope_intersecting(&AABB::from_point([point.longitude, point.latitude]))
            .map(|e| e.slot)
            .collect()
    }

    /// Number of indexed (active) fences.
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    /// True when no fences are indexed.
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}

/// Evaluates device positions against the active geofences and records
/// alerts.
///
/// The monitor is the sole writer of [`GeofenceAlert`] rows. Alert
/// persistence is fire-and-forget per fence: one sink failure is logged and
/// does not block the remaining fences in the same call.
pub struct VehicleMonitor {
    geofences: Arc<dyn GeofenceStore>,
    alerts: Arc<dyn AlertStore>,
    index: RwLock<GeofenceIndex>,
}

impl VehicleMonitor {
    /// Create a monitor, loading the initial fence snapshot from the store.
    pub fn new(
        geofences: Arc<dyn GeofenceStore>,
        alerts: Arc<dyn AlertStore>,
    ) -> Result<Self, MonitorError> {
        let index = GeofenceIndex::new(geofences.active_geofences()?)?;
        Ok(Self {
            geofences,
            alerts,
            index: RwLock::new(index),
        })
    }

    /// Refresh the fence snapshot after operator edits.
    pub fn reload(&self) -> Result<(), MonitorError> {
        let index = GeofenceIndex::new(self.geofences.active_geofences()?)?;
        *self.index.write().unwrap() = index;
        Ok(())
    }

    /// Evaluate a device position against every active geofence.
    ///
    /// For each fence: `alert_on_enter` and the point inside emits an Enter
    /// alert; `alert_on_exit` and the point outside emits an Exit alert.
    /// Multiple fences can each emit in the same call. Every emitted alert is
    /// returned even when its persistence failed.
    pub fn check_position(
        &self,
        device_id: &str,
        latitude: f64,
        longitude: f64,
        now_ms: i64,
    ) -> Vec<GeofenceAlert> {
        let point = GpsPoint::new(latitude, longitude);
        let index = self.index.read().unwrap();
        let candidates = index.candidate_slots(&point);

        let mut emitted = Vec::new();
        for (slot, fence) in index.fences.iter().enumerate() {
            // Bounding-box rejection first; exact ring test only for
            // candidates the R-tree returned.
            let inside = candidates.contains(&slot) && fence.contains(&point);

            let alert_kind = if fence.alert_on_enter && inside {
                Some(AlertKind::Enter)
            } else if fence.alert_on_exit && !inside {
                Some(AlertKind::Exit)
            } else {
                None
            };

            let Some(alert_kind) = alert_kind else {
                continue;
            };

            let alert = GeofenceAlert {
                id: format!("{}-{}-{}", fence.id, device_id, now_ms),
                geofence_id: fence.id.clone(),
                device_id: device_id.to_string(),
                alert_kind,
                triggered_at_ms: now_ms,
                latitude,
                longitude,
                acknowledged: false,
            };

            if let Err(err) = self.alerts.insert_alert(&alert) {
                warn!(
                    "[VehicleMonitor] failed to persist {:?} alert for fence {}: {}",
                    alert_kind, fence.id, err
                );
            }
            emitted.push(alert);
        }

        emitted
    }
}

/// Whether a device moved far enough since its last evaluated position to be
/// worth re-evaluating.
///
/// This is the caller-side gate in front of [`VehicleMonitor::check_position`].
pub fn moved_beyond_threshold(previous: &GpsPoint, current: &GpsPoint, threshold_m: f64) -> bool {
    haversine_distance(previous, current) >= threshold_m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unit_square(id: &str, enter: bool, exit: bool) -> Geofence {
        Geofence {
            id: id.to_string(),
            name: format!("fence {}", id),
            ring: vec![
                GpsPoint::new(0.0, 0.0),
                GpsPoint::new(0.0, 1.0),
                GpsPoint::new(1.0, 1.0),
                GpsPoint::new(1.0, 0.0),
            ],
            fence_kind: FenceKind::Inclusion,
            alert_on_enter: enter,
            alert_on_exit: exit,
            is_active: true,
        }
    }

    fn monitor_with(fences: Vec<Geofence>) -> (VehicleMonitor, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for fence in fences {
            store.upsert_geofence(fence).unwrap();
        }
        let monitor = VehicleMonitor::new(store.clone(), store.clone()).unwrap();
        (monitor, store)
    }

    #[test]
    fn test_enter_alert_inside_square() {
        let (monitor, _store) = monitor_with(vec![unit_square("g1", true, false)]);

        let alerts = monitor.check_position("device-a", 0.5, 0.5, 1_000);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_kind, AlertKind::Enter);
        assert_eq!(alerts[0].geofence_id, "g1");
        assert_eq!(alerts[0].device_id, "device-a");
        assert!(!alerts[0].acknowledged);
    }

    #[test]
    fn test_no_alert_outside_when_exit_disabled() {
        let (monitor, _store) = monitor_with(vec![unit_square("g1", true, false)]);
        let alerts = monitor.check_position("device-a", 5.0, 5.0, 1_000);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_exit_alert_outside_square() {
        let (monitor, _store) = monitor_with(vec![unit_square("g1", false, true)]);
        let alerts = monitor.check_position("device-a", 5.0, 5.0, 1_000);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_kind, AlertKind::Exit);
    }

    #[test]
    fn test_multiple_fences_emit_independently() {
        // Inside g1 (enter alert) and outside g2 (exit alert).
        let mut far = unit_square("g2", false, true);
        far.ring = vec![
            GpsPoint::new(10.0, 10.0),
            GpsPoint::new(10.0, 11.0),
            GpsPoint::new(11.0, 11.0),
            GpsPoint::new(11.0, 10.0),
        ];
        let (monitor, _store) = monitor_with(vec![unit_square("g1", true, false), far]);

        let alerts = monitor.check_position("device-a", 0.5, 0.5, 1_000);
        assert_eq!(alerts.len(), 2);
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.alert_kind).collect();
        assert!(kinds.contains(&AlertKind::Enter));
        assert!(kinds.contains(&AlertKind::Exit));
    }

    #[test]
    fn test_inactive_fence_is_ignored() {
        let mut fence = unit_square("g1", true, true);
        fence.is_active = false;
        let (monitor, _store) = monitor_with(vec![fence]);
        assert!(monitor.check_position("device-a", 0.5, 0.5, 1_000).is_empty());
    }

    #[test]
    fn test_degenerate_ring_fails_loudly() {
        let mut fence = unit_square("bad", true, false);
        fence.ring.truncate(2);
        let err = GeofenceIndex::new(vec![fence]).unwrap_err();
        assert!(matches!(
            err,
            MonitorError::InvalidGeofence { ref geofence_id, .. } if geofence_id == "bad"
        ));
    }

    #[test]
    fn test_reload_picks_up_new_fence() {
        let (monitor, store) = monitor_with(vec![unit_square("g1", true, false)]);
        store.upsert_geofence(unit_square("g2", true, false)).unwrap();

        // Not seen until reload.
        assert_eq!(monitor.check_position("d", 0.5, 0.5, 1).len(), 1);
        monitor.reload().unwrap();
        assert_eq!(monitor.check_position("d", 0.5, 0.5, 2).len(), 2);
    }

    /// Alert sink that rejects every insert, counting attempts.
    struct RejectingSink {
        attempts: AtomicUsize,
    }

    impl AlertStore for RejectingSink {
        fn insert_alert(&self, _alert: &GeofenceAlert) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            Err(StoreError::new("disk full"))
        }

        fn acknowledge_alert(&self, _id: &str) -> Result<(), StoreError> {
            Err(StoreError::new("disk full"))
        }

        fn alerts_for_device(&self, _device_id: &str) -> Result<Vec<GeofenceAlert>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_persist_failure_does_not_block_other_fences() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_geofence(unit_square("g1", true, false)).unwrap();
        store.upsert_geofence(unit_square("g2", true, false)).unwrap();

        let sink = Arc::new(RejectingSink {
            attempts: AtomicUsize::new(0),
        });
        let monitor = VehicleMonitor::new(store, sink.clone()).unwrap();

        let alerts = monitor.check_position("device-a", 0.5, 0.5, 1_000);
        // Both fences evaluated and both alerts surfaced despite sink failures.
        assert_eq!(alerts.len(), 2);
        assert_eq!(sink.attempts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_movement_threshold_gate() {
        let origin = GpsPoint::new(51.5074, -0.1278);
        let nearby = GpsPoint::new(51.50745, -0.1278); // ~5.5 m north
        let farther = GpsPoint::new(51.5076, -0.1278); // ~22 m north

        assert!(!moved_beyond_threshold(&origin, &nearby, DEFAULT_MOVEMENT_THRESHOLD_M));
        assert!(moved_beyond_threshold(&origin, &farther, DEFAULT_MOVEMENT_THRESHOLD_M));
    }

    #[test]
    fn test_acknowledge_alert() {
        let mut alert = GeofenceAlert {
            id: "a1".into(),
            geofence_id: "g1".into(),
            device_id: "d1".into(),
            alert_kind: AlertKind::Enter,
            triggered_at_ms: 0,
            latitude: 0.5,
            longitude: 0.5,
            acknowledged: false,
        };
        alert.acknowledge();
        assert!(alert.acknowledged);
    }
}
