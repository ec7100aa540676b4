//! Sync orchestration: pull live data from GP51 and reconcile it with
//! storage.
//!
//! A sync run is a [`SyncJob`] moving through `Pending -> Processing ->
//! {Completed | Failed}`. Terminal states are final; retrying means starting
//! a new job. The orchestrator fetches devices, users and positions in
//! parallel, applies the caller-selected [`ConflictPolicy`] per item, and
//! keeps counters current so [`SyncOrchestrator::job_status`] can be polled
//! from another task mid-flight (the reference UI polls about every 2
//! seconds). There is no timer logic in here — pacing belongs to the caller.
//!
//! Partial failure is normal: one bad item increments `failed_items` and is
//! appended to the error log, and the batch keeps going. A job only fails
//! outright when every vendor feed fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gp51::{DeviceRecord, Gp51Client, UserRecord};
use crate::store::{DeviceStore, PositionStore, StoreError, UserStore};
use crate::Position;

/// Lifecycle state of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and Failed are final; a finished job is never resurrected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// How to reconcile an incoming record with one already in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the stored record untouched.
    Skip,
    /// Replace the stored record wholesale.
    Update,
    /// Record-level merge: non-empty incoming fields win, empty ones keep
    /// the stored value.
    Merge,
}

/// Progress and bookkeeping for one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: u64,
    pub status: JobStatus,
    pub total_items: usize,
    pub processed_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub errors: Vec<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

/// Snapshot returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub status: JobStatus,
    /// Processed share of the batch, 0–100.
    pub percent: f64,
    pub processed_items: usize,
    pub total_items: usize,
}

/// Source of live vendor data for a sync run.
///
/// [`Gp51Client`] is the production implementation; tests substitute stubs.
pub trait VendorFeed: Send + Sync {
    fn fetch_devices<'a>(
        &'a self,
        username: &'a str,
        now_ms: i64,
    ) -> BoxFuture<'a, Result<Vec<DeviceRecord>>>;

    fn fetch_users<'a>(&'a self, now_ms: i64) -> BoxFuture<'a, Result<Vec<UserRecord>>>;

    fn fetch_positions<'a>(
        &'a self,
        device_ids: &'a [String],
        now_ms: i64,
    ) -> BoxFuture<'a, Result<Vec<Position>>>;
}

impl VendorFeed for Gp51Client {
    fn fetch_devices<'a>(
        &'a self,
        username: &'a str,
        now_ms: i64,
    ) -> BoxFuture<'a, Result<Vec<DeviceRecord>>> {
        Box::pin(self.query_monitor_list(username, now_ms))
    }

    fn fetch_users<'a>(&'a self, now_ms: i64) -> BoxFuture<'a, Result<Vec<UserRecord>>> {
        Box::pin(self.query_all_users(now_ms))
    }

    fn fetch_positions<'a>(
        &'a self,
        device_ids: &'a [String],
        now_ms: i64,
    ) -> BoxFuture<'a, Result<Vec<Position>>> {
        Box::pin(self.last_positions(device_ids, 0, now_ms))
    }
}

/// Drives sync jobs and owns their lifecycle.
pub struct SyncOrchestrator {
    feed: Arc<dyn VendorFeed>,
    devices: Arc<dyn DeviceStore>,
    users: Arc<dyn UserStore>,
    positions: Arc<dyn PositionStore>,
    jobs: Mutex<HashMap<u64, SyncJob>>,
    next_job_id: AtomicU64,
}

impl SyncOrchestrator {
    pub fn new(
        feed: Arc<dyn VendorFeed>,
        devices: Arc<dyn DeviceStore>,
        users: Arc<dyn UserStore>,
        positions: Arc<dyn PositionStore>,
    ) -> Self {
        Self {
            feed,
            devices,
            users,
            positions,
            jobs: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// Run one sync pass and return its job id.
    ///
    /// Devices, users and positions are fetched in parallel, then applied
    /// item by item under `policy`. The returned id can be polled with
    /// [`SyncOrchestrator::job_status`] while the run is still in flight.
    pub async fn run_sync(
        &self,
        username: &str,
        device_ids: &[String],
        policy: ConflictPolicy,
        now_ms: i64,
    ) -> u64 {
        let job_id = self.create_job(now_ms);
        self.update_job(job_id, |job| job.status = JobStatus::Processing);

        let (devices_res, users_res, positions_res) = futures::join!(
            self.feed.fetch_devices(username, now_ms),
            self.feed.fetch_users(now_ms),
            self.feed.fetch_positions(device_ids, now_ms),
        );

        let mut failed_feeds = 0;
        let devices = self.unwrap_feed(job_id, "device fetch", devices_res, &mut failed_feeds);
        let users = self.unwrap_feed(job_id, "user fetch", users_res, &mut failed_feeds);
        let positions = self.unwrap_feed(job_id, "position fetch", positions_res, &mut failed_feeds);

        if failed_feeds == 3 {
            warn!("[SyncOrchestrator] job {}: every vendor feed failed", job_id);
            self.update_job(job_id, |job| {
                job.status = JobStatus::Failed;
                job.finished_at_ms = Some(now_ms);
            });
            return job_id;
        }

        let total = devices.len() + users.len() + positions.len();
        self.update_job(job_id, |job| job.total_items = total);

        for device in devices {
            let label = format!("device {}", device.device_id);
            let outcome = self.apply_device(device, policy);
            self.record_item(job_id, &label, outcome);
        }

        for user in users {
            let label = format!("user {}", user.username);
            let outcome = self.apply_user(user, policy);
            self.record_item(job_id, &label, outcome);
        }

        for position in positions {
            let label = format!("position for {}", position.device_id);
            let outcome = self
                .positions
                .append_positions(std::slice::from_ref(&position));
            self.record_item(job_id, &label, outcome);
        }

        self.update_job(job_id, |job| {
            job.status = JobStatus::Completed;
            job.finished_at_ms = Some(now_ms);
        });

        let job = self.job(job_id).expect("job exists until orchestrator drops");
        info!(
            "[SyncOrchestrator] job {} completed: {}/{} items ok, {} failed",
            job_id, job.successful_items, job.total_items, job.failed_items
        );

        job_id
    }

    /// Snapshot of a job's progress, if the job exists.
    pub fn job_status(&self, job_id: u64) -> Option<SyncProgress> {
        let jobs = self.jobs.lock().unwrap();
        jobs.get(&job_id).map(|job| SyncProgress {
            status: job.status,
            percent: if job.total_items == 0 {
                if job.status == JobStatus::Completed {
                    100.0
                } else {
                    0.0
                }
            } else {
                job.processed_items as f64 / job.total_items as f64 * 100.0
            },
            processed_items: job.processed_items,
            total_items: job.total_items,
        })
    }

    /// Full snapshot of a job, if it exists.
    pub fn job(&self, job_id: u64) -> Option<SyncJob> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    fn create_job(&self, now_ms: i64) -> u64 {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let job = SyncJob {
            id,
            status: JobStatus::Pending,
            total_items: 0,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            errors: Vec::new(),
            started_at_ms: now_ms,
            finished_at_ms: None,
        };
        self.jobs.lock().unwrap().insert(id, job);
        id
    }

    fn update_job(&self, job_id: u64, apply: impl FnOnce(&mut SyncJob)) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            apply(job);
        }
    }

    fn unwrap_feed<T>(
        &self,
        job_id: u64,
        label: &str,
        result: Result<Vec<T>>,
        failed_feeds: &mut u32,
    ) -> Vec<T> {
        match result {
            Ok(items) => items,
            Err(err) => {
                *failed_feeds += 1;
                warn!("[SyncOrchestrator] job {}: {} failed: {}", job_id, label, err);
                self.update_job(job_id, |job| {
                    job.errors.push(format!("{}: {}", label, err));
                });
                Vec::new()
            }
        }
    }

    fn record_item(
        &self,
        job_id: u64,
        label: &str,
        outcome: std::result::Result<(), StoreError>,
    ) {
        self.update_job(job_id, |job| {
            job.processed_items += 1;
            match outcome {
                Ok(()) => job.successful_items += 1,
                Err(err) => {
                    job.failed_items += 1;
                    job.errors.push(format!("{}: {}", label, err));
                }
            }
        });
    }

    fn apply_device(
        &self,
        incoming: DeviceRecord,
        policy: ConflictPolicy,
    ) -> std::result::Result<(), StoreError> {
        let existing = self.devices.get_device(&incoming.device_id)?;
        let resolved = match (existing, policy) {
            (None, _) => Some(incoming),
            (Some(_), ConflictPolicy::Skip) => None,
            (Some(_), ConflictPolicy::Update) => Some(incoming),
            (Some(stored), ConflictPolicy::Merge) => Some(merge_device(stored, incoming)),
        };
        if let Some(record) = resolved {
            self.devices.put_device(record)?;
        }
        Ok(())
    }

    fn apply_user(
        &self,
        incoming: UserRecord,
        policy: ConflictPolicy,
    ) -> std::result::Result<(), StoreError> {
        let existing = self.users.get_user(&incoming.username)?;
        let resolved = match (existing, policy) {
            (None, _) => Some(incoming),
            (Some(_), ConflictPolicy::Skip) => None,
            (Some(_), ConflictPolicy::Update) => Some(incoming),
            (Some(stored), ConflictPolicy::Merge) => Some(merge_user(stored, incoming)),
        };
        if let Some(record) = resolved {
            self.users.put_user(record)?;
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Record-level merge: non-empty incoming fields win.
fn merge_device(stored: DeviceRecord, incoming: DeviceRecord) -> DeviceRecord {
    DeviceRecord {
        device_id: incoming.device_id,
        device_name: if incoming.device_name.is_empty() {
            stored.device_name
        } else {
            incoming.device_name
        },
        device_type: incoming.device_type.or(stored.device_type),
        sim_number: non_empty(incoming.sim_number).or(stored.sim_number),
        group_name: non_empty(incoming.group_name).or(stored.group_name),
        last_active_ms: incoming.last_active_ms.or(stored.last_active_ms),
    }
}

fn merge_user(stored: UserRecord, incoming: UserRecord) -> UserRecord {
    UserRecord {
        username: incoming.username,
        show_name: non_empty(incoming.show_name).or(stored.show_name),
        email: non_empty(incoming.email).or(stored.email),
        user_type: incoming.user_type.or(stored.user_type),
    }
}
