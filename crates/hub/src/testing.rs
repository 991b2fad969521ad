//! In-process fakes for the worker/supervisor collaborator traits.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::db::{Device, DeviceDirectory, DeviceId, Reading, ReadingStore};
use crate::device::{DeviceClient, DeviceError, RelayState, SensorData, TimerConfig};

pub(crate) fn device(id: DeviceId) -> Device {
    Device {
        id,
        name: format!("dev-{id}"),
        url: format!("http://dev-{id}.local"),
        hostname: "unknown".into(),
        poll_frequency_sec: 5,
        humidity_control: false,
        humidity_threshold: 40.0,
        humidity_on_sec: 300,
        humidity_cooldown_sec: 600,
    }
}

pub(crate) fn humidity_device(id: DeviceId, threshold: f64, on_sec: i64, cooldown_sec: i64) -> Device {
    Device {
        humidity_control: true,
        humidity_threshold: threshold,
        humidity_on_sec: on_sec,
        humidity_cooldown_sec: cooldown_sec,
        ..device(id)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeDirectory {
    devices: Mutex<Vec<Device>>,
    pub(crate) fail: AtomicBool,
}

impl FakeDirectory {
    pub(crate) fn with(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
            fail: AtomicBool::new(false),
        }
    }

    pub(crate) fn put(&self, device: Device) {
        let mut devices = self.devices.lock().unwrap();
        devices.retain(|d| d.id != device.id);
        devices.push(device);
    }

    pub(crate) fn remove(&self, id: DeviceId) {
        self.devices.lock().unwrap().retain(|d| d.id != id);
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn list_devices(&self) -> Result<Vec<Device>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("directory unavailable");
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("directory unavailable");
        }
        Ok(self.devices.lock().unwrap().iter().find(|d| d.id == id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Reading store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct FakeStore {
    readings: Mutex<Vec<Reading>>,
    pub(crate) fail: AtomicBool,
}

impl FakeStore {
    pub(crate) fn readings(&self) -> Vec<Reading> {
        self.readings.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReadingStore for FakeStore {
    async fn append(
        &self,
        device_id: DeviceId,
        ts: OffsetDateTime,
        temperature: f64,
        humidity: f64,
    ) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.readings.lock().unwrap().push(Reading {
            ts: ts.unix_timestamp(),
            device_id,
            temperature,
            humidity,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device client
// ---------------------------------------------------------------------------

/// Scriptable device: `None` for the sensor or timer answers with a device
/// error, `relay_fails` rejects every relay command (still recorded),
/// `hostname_fails` makes hostname lookups fail. A timer delay keeps the
/// caller mid-tick; `max_in_flight` records the most overlapping timer reads.
#[derive(Default)]
pub(crate) struct FakeClient {
    sensor: Mutex<Option<SensorData>>,
    timer: Mutex<Option<TimerConfig>>,
    pub(crate) relay_fails: AtomicBool,
    pub(crate) hostname_fails: AtomicBool,
    pub(crate) sensor_reads: AtomicUsize,
    timer_delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    pub(crate) max_in_flight: AtomicUsize,
    commands: Mutex<Vec<(Instant, String, RelayState)>>,
}

impl FakeClient {
    pub(crate) fn set_humidity(&self, humidity: f64) {
        *self.sensor.lock().unwrap() = Some(SensorData {
            temperature: 22.0,
            humidity,
        });
    }

    pub(crate) fn set_sensor_offline(&self) {
        *self.sensor.lock().unwrap() = None;
    }

    pub(crate) fn set_timer(&self, timer: Option<TimerConfig>) {
        *self.timer.lock().unwrap() = timer;
    }

    pub(crate) fn set_timer_delay(&self, delay: Duration) {
        *self.timer_delay.lock().unwrap() = Some(delay);
    }

    /// Relay commands in issue order.
    pub(crate) fn commands(&self) -> Vec<RelayState> {
        self.commands.lock().unwrap().iter().map(|c| c.2).collect()
    }

    pub(crate) fn timed_commands(&self) -> Vec<(Instant, RelayState)> {
        self.commands.lock().unwrap().iter().map(|c| (c.0, c.2)).collect()
    }

    pub(crate) fn endpoints(&self) -> Vec<String> {
        self.commands.lock().unwrap().iter().map(|c| c.1.clone()).collect()
    }
}

#[async_trait]
impl DeviceClient for FakeClient {
    async fn read_sensor(&self, _endpoint: &str) -> Result<SensorData, DeviceError> {
        self.sensor_reads.fetch_add(1, Ordering::SeqCst);
        (*self.sensor.lock().unwrap()).ok_or_else(|| DeviceError::Device("Failed to read sensor".into()))
    }

    async fn set_relay(&self, endpoint: &str, state: RelayState) -> Result<(), DeviceError> {
        self.commands
            .lock()
            .unwrap()
            .push((Instant::now(), endpoint.to_string(), state));
        if self.relay_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::Status(503));
        }
        Ok(())
    }

    async fn read_timer_config(&self, _endpoint: &str) -> Result<TimerConfig, DeviceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.timer_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        (*self.timer.lock().unwrap()).ok_or_else(|| DeviceError::Device("timer unavailable".into()))
    }

    async fn read_hostname(&self, endpoint: &str) -> Result<String, DeviceError> {
        if self.hostname_fails.load(Ordering::SeqCst) {
            return Err(DeviceError::Status(503));
        }
        Ok(endpoint.trim_start_matches("http://").to_string())
    }
}
