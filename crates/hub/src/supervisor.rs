//! Worker supervisor: one live worker per known device.
//!
//! The supervisor owns the only shared mutable structure in the controller,
//! the device → worker handle map. Every handle carries its own
//! [`CancellationToken`], created as a child of the global shutdown token, so
//! cancelling the global token stops every worker while a single device can
//! still be stopped on its own.
//!
//! Discovery is a periodic [`Supervisor::reconcile`] pass. Devices that
//! disappear from the directory keep their worker until an operator calls
//! [`Supervisor::remove`]. Every path that takes a handle out of the map
//! keeps the map locked until the old task has exited.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::db::{Device, DeviceId};
use crate::worker::{Services, Worker};

struct WorkerHandle {
    cancel: CancellationToken,
    reconfigure: Arc<Notify>,
    task: JoinHandle<()>,
    poll_frequency_sec: i64,
    started_at: Instant,
}

impl WorkerHandle {
    /// Signal the worker and wait for it to exit.
    async fn stop(self, device_id: DeviceId) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(device = device_id, "worker panicked: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub device_id: DeviceId,
    pub poll_frequency_sec: i64,
    pub running: bool,
    pub uptime_secs: u64,
}

/// Result of [`Supervisor::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub had_worker: bool,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub shutting_down: bool,
    pub workers: Vec<WorkerStatus>,
}

pub struct Supervisor {
    services: Services,
    workers: Mutex<HashMap<DeviceId, WorkerHandle>>,
    shutdown: CancellationToken,
    reconcile_interval: Duration,
    started_at: Instant,
}

impl Supervisor {
    pub fn new(services: Services, reconcile_interval: Duration) -> Self {
        Self {
            services,
            workers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            reconcile_interval,
            started_at: Instant::now(),
        }
    }

    /// Token cancelled by [`Supervisor::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn spawn(&self, device: &Device) -> WorkerHandle {
        let cancel = self.shutdown.child_token();
        let reconfigure = Arc::new(Notify::new());
        let worker = Worker::new(device, self.services.clone(), cancel.clone())
            .with_reconfigure(reconfigure.clone());
        WorkerHandle {
            cancel,
            reconfigure,
            task: tokio::spawn(worker.run()),
            poll_frequency_sec: device.poll_frequency_sec,
            started_at: Instant::now(),
        }
    }

    /// Start a worker for every directory device that lacks a live one.
    /// Returns how many were started.
    pub async fn reconcile(&self) -> usize {
        if self.shutdown.is_cancelled() {
            return 0;
        }

        // Listing under the lock keeps a concurrent `remove` from slipping
        // between the snapshot and the spawn.
        let mut workers = self.workers.lock().await;
        let devices = match self.services.directory.list_devices().await {
            Ok(d) => d,
            Err(e) => {
                error!("reconcile: failed to list devices: {e:#}");
                return 0;
            }
        };

        let mut started = 0;
        for device in devices {
            if let Some(existing) = workers.get(&device.id) {
                if !existing.task.is_finished() {
                    continue;
                }
                warn!(device = device.id, "worker exited unexpectedly, replacing");
                if let Some(dead) = workers.remove(&device.id) {
                    dead.stop(device.id).await;
                }
            }

            info!(
                device = device.id,
                name = %device.name,
                poll_sec = device.poll_frequency_sec,
                "starting worker"
            );
            workers.insert(device.id, self.spawn(&device));
            started += 1;
        }
        started
    }

    /// Replace a device's worker, discarding its runtime state.
    pub async fn restart(&self, device: &Device) {
        let mut workers = self.workers.lock().await;
        if let Some(old) = workers.remove(&device.id) {
            old.stop(device.id).await;
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(
            device = device.id,
            poll_sec = device.poll_frequency_sec,
            "restarting worker"
        );
        workers.insert(device.id, self.spawn(device));
    }

    /// Tell a device's worker its directory settings changed, so an ongoing
    /// humidity hold picks them up. Returns false when there is no worker.
    pub async fn reconfigure(&self, device_id: DeviceId) -> bool {
        match self.workers.lock().await.get(&device_id) {
            Some(h) => {
                h.reconfigure.notify_one();
                true
            }
            None => false,
        }
    }

    /// Stop a device's worker and delete it from the directory as one step
    /// with respect to reconcile. `delete` runs after the worker has exited
    /// and while the registry is still locked, so no reconcile can start a
    /// second worker or resurrect the device in between.
    pub async fn remove<F, Fut>(&self, device_id: DeviceId, delete: F) -> anyhow::Result<Removal>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>>,
    {
        let mut workers = self.workers.lock().await;
        let had_worker = match workers.remove(&device_id) {
            Some(handle) => {
                handle.stop(device_id).await;
                true
            }
            None => false,
        };
        let deleted = delete().await?;
        info!(device = device_id, had_worker, deleted, "worker stopped by operator");
        Ok(Removal {
            had_worker,
            deleted,
        })
    }

    /// Reconcile every `reconcile_interval` until shutdown.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_sec = self.reconcile_interval.as_secs(),
            "supervisor started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let started = self.reconcile().await;
                    if started > 0 {
                        info!(started, "reconcile started new workers");
                    }
                }
            }
        }

        info!("supervisor loop exited");
    }

    /// Signal every worker and wait for all of them. Safe to call twice.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<(DeviceId, WorkerHandle)> = self.workers.lock().await.drain().collect();
        if handles.is_empty() {
            return;
        }

        info!(workers = handles.len(), "waiting for workers to exit");
        for (id, handle) in handles {
            handle.stop(id).await;
        }
        info!("all workers stopped");
    }

    pub async fn status(&self) -> StatusResponse {
        let workers = self.workers.lock().await;
        let mut list: Vec<WorkerStatus> = workers
            .iter()
            .map(|(id, h)| WorkerStatus {
                device_id: *id,
                poll_frequency_sec: h.poll_frequency_sec,
                running: !h.task.is_finished(),
                uptime_secs: h.started_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by_key(|w| w.device_id);

        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            shutting_down: self.shutdown.is_cancelled(),
            workers: list,
        }
    }

    #[cfg(test)]
    async fn live_workers(&self) -> Vec<DeviceId> {
        let workers = self.workers.lock().await;
        let mut ids: Vec<DeviceId> = workers
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }
}

// ===========================================================================
// Tests
// ===========================================================================
