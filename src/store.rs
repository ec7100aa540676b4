//! Persistence boundary: storage traits and in-memory implementations.
//!
//! Rows are read and written through a generic table-per-entity data-access
//! layer with plain CRUD semantics (insert, upsert-by-key, update,
//! soft-delete). No query language is prescribed; SQL, Supabase or anything
//! else sits behind these traits. The traits are synchronous — async
//! backends wrap calls in their runtime's blocking adapter.
//!
//! [`MemoryStore`] backs the tests and small single-process deployments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::geofence::{Geofence, GeofenceAlert};
use crate::gp51::{DeviceRecord, UserRecord};
use crate::Position;

/// Failure reported by a storage backend.
#[derive(Debug, Clone)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store error: {}", self.message)
    }
}

impl std::error::Error for StoreError {}

/// Read/write access to geofence rows.
pub trait GeofenceStore: Send + Sync {
    /// All fences with `is_active` set.
    fn active_geofences(&self) -> Result<Vec<Geofence>, StoreError>;

    /// Insert or replace a fence by id.
    fn upsert_geofence(&self, fence: Geofence) -> Result<(), StoreError>;

    /// Soft-delete: clear `is_active`, keep the row.
    fn deactivate_geofence(&self, id: &str) -> Result<(), StoreError>;
}

/// Write access to geofence alerts.
pub trait AlertStore: Send + Sync {
    fn insert_alert(&self, alert: &GeofenceAlert) -> Result<(), StoreError>;

    /// Set `acknowledged` on an existing alert.
    fn acknowledge_alert(&self, id: &str) -> Result<(), StoreError>;

    fn alerts_for_device(&self, device_id: &str) -> Result<Vec<GeofenceAlert>, StoreError>;
}

/// Keyed access to synced device records.
pub trait DeviceStore: Send + Sync {
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError>;
    fn put_device(&self, record: DeviceRecord) -> Result<(), StoreError>;
}

/// Keyed access to synced user records.
pub trait UserStore: Send + Sync {
    fn get_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;
    fn put_user(&self, record: UserRecord) -> Result<(), StoreError>;
}

/// Append-only position log.
pub trait PositionStore: Send + Sync {
    fn append_positions(&self, positions: &[Position]) -> Result<(), StoreError>;

    /// Most recent sample for a device, by timestamp.
    fn latest_position(&self, device_id: &str) -> Result<Option<Position>, StoreError>;
}

/// HashMap-backed store implementing every storage trait.
#[derive(Default)]
pub struct MemoryStore {
    geofences: Mutex<HashMap<String, Geofence>>,
    alerts: Mutex<Vec<GeofenceAlert>>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
    users: Mutex<HashMap<String, UserRecord>>,
    positions: Mutex<Vec<Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GeofenceStore for MemoryStore {
    fn active_geofences(&self) -> Result<Vec<Geofence>, StoreError> {
        let fences = self.geofences.lock().unwrap();
        Ok(fences.values().filter(|f| f.is_active).cloned().collect())
    }

    fn upsert_geofence(&self, fence: Geofence) -> Result<(), StoreError> {
        self.geofences
            .lock()
            .unwrap()
            .insert(fence.id.clone(), fence);
        Ok(())
    }

    fn deactivate_geofence(&self, id: &str) -> Result<(), StoreError> {
        let mut fences = self.geofences.lock().unwrap();
        match fences.get_mut(id) {
            Some(fence) => {
                fence.is_active = false;
                Ok(())
            }
            None => Err(StoreError::new(format!("no geofence with id '{}'", id))),
        }
    }
}

impl AlertStore for MemoryStore {
    fn insert_alert(&self, alert: &GeofenceAlert) -> Result<(), StoreError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    fn acknowledge_alert(&self, id: &str) -> Result<(), StoreError> {
        let mut alerts = self.alerts.lock().unwrap();
        match alerts.iter_mut().find(|a| a.id == id) {
            Some(alert) => {
                alert.acknowledged = true;
                Ok(())
            }
            None => Err(StoreError::new(format!("no alert with id '{}'", id))),
        }
    }

    fn alerts_for_device(&self, device_id: &str) -> Result<Vec<GeofenceAlert>, StoreError> {
        let alerts = self.alerts.lock().unwrap();
        Ok(alerts
            .iter()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect())
    }
}

impl DeviceStore for MemoryStore {
    fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.devices.lock().unwrap().get(device_id).cloned())
    }

    fn put_device(&self, record: DeviceRecord) -> Result<(), StoreError> {
        self.devices
            .lock()
            .unwrap()
            .insert(record.device_id.clone(), record);
        Ok(())
    }
}

impl UserStore for MemoryStore {
    fn get_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.lock().unwrap().get(username).cloned())
    }

    fn put_user(&self, record: UserRecord) -> Result<(), StoreError> {
        self.users
            .lock()
            .unwrap()
            .insert(record.username.clone(), record);
        Ok(())
    }
}

impl PositionStore for MemoryStore {
    fn append_positions(&self, positions: &[Position]) -> Result<(), StoreError> {
        self.positions.lock().unwrap().extend_from_slice(positions);
        Ok(())
    }

    fn latest_position(&self, device_id: &str) -> Result<Option<Position>, StoreError> {
        let positions = self.positions.lock().unwrap();
        Ok(positions
            .iter()
            .filter(|p| p.device_id == device_id)
            .max_by_key(|p| p.timestamp_ms)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geofence::{AlertKind, FenceKind};
    use crate::GpsPoint;

    fn fence(id: &str) -> Geofence {
        Geofence {
            id: id.to_string(),
            name: id.to_string(),
            ring: vec![
                GpsPoint::new(0.0, 0.0),
                GpsPoint::new(0.0, 1.0),
                GpsPoint::new(1.0, 0.0),
            ],
            fence_kind: FenceKind::Inclusion,
            alert_on_enter: true,
            alert_on_exit: false,
            is_active: true,
        }
    }

    #[test]
    fn test_geofence_soft_delete() {
        let store = MemoryStore::new();
        store.upsert_geofence(fence("g1")).unwrap();
        store.upsert_geofence(fence("g2")).unwrap();
        assert_eq!(store.active_geofences().unwrap().len(), 2);

        store.deactivate_geofence("g1").unwrap();
        let active = store.active_geofences().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "g2");

        assert!(store.deactivate_geofence("missing").is_err());
    }

    #[test]
    fn test_alert_roundtrip_and_acknowledge() {
        let store = MemoryStore::new();
        let alert = GeofenceAlert {
            id: "a1".into(),
            geofence_id: "g1".into(),
            device_id: "d1".into(),
            alert_kind: AlertKind::Enter,
            triggered_at_ms: 5,
            latitude: 0.5,
            longitude: 0.5,
            acknowledged: false,
        };
        store.insert_alert(&alert).unwrap();

        store.acknowledge_alert("a1").unwrap();
        let alerts = store.alerts_for_device("d1").unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].acknowledged);

        assert!(store.acknowledge_alert("missing").is_err());
    }

    #[test]
    fn test_device_upsert_replaces() {
        let store = MemoryStore::new();
        let mut record = DeviceRecord::new("d1", "Truck 7");
        store.put_device(record.clone()).unwrap();

        record.device_name = "Truck 7 (renamed)".into();
        store.put_device(record).unwrap();

        let stored = store.get_device("d1").unwrap().unwrap();
        assert_eq!(stored.device_name, "Truck 7 (renamed)");
    }

    #[test]
    fn test_latest_position_by_timestamp() {
        let store = MemoryStore::new();
        store
            .append_positions(&[
                Position::new("d1", 1.0, 1.0, 100),
                Position::new("d1", 2.0, 2.0, 300),
                Position::new("d2", 3.0, 3.0, 200),
            ])
            .unwrap();

        let latest = store.latest_position("d1").unwrap().unwrap();
        assert_eq!(latest.timestamp_ms, 300);
        assert!(store.latest_position("d3").unwrap().is_none());
    }
}
