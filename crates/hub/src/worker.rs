//! Per-device control loop.
//!
//! A worker owns exactly one device. Every `poll_frequency_sec` it refreshes
//! the device's directory snapshot, asks the device for its timer config, and
//! runs exactly one of three policies:
//!
//! ```text
//!              timer enabled on device?
//!                 │yes            │no
//!                 ▼               ▼
//!           ┌──────────┐   humidity control in directory?
//!           │  Timer   │      │yes              │no
//!           └──────────┘      ▼                 ▼
//!   Off ──[off elapsed]──▶ ┌──────────┐    ┌──────────┐
//!    ▲                 │   │ Humidity │    │   Idle   │
//!    └──[on elapsed]── On  └──────────┘    └──────────┘
//!                          read, persist,   read, persist
//!                          ON/hold/OFF when
//!                          dry + cooled down
//! ```
//!
//! Every failure inside a tick is logged and the tick simply has no effect;
//! the next tick is a fresh attempt. Runtime state (timer phase, last
//! activation) lives only here and is dropped with the worker.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Device, DeviceDirectory, DeviceId, HumiditySettings, ReadingStore};
use crate::device::{DeviceClient, RelayState, SensorData, TimerConfig};

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct Services {
    pub client: Arc<dyn DeviceClient>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub store: Arc<dyn ReadingStore>,
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    pub phase: TimerPhase,
    /// `None` until the first switch; counts as "longer ago than any
    /// duration".
    pub last_switch: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerState {
    pub timer: TimerState,
    pub last_activation: Option<Instant>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            timer: TimerState {
                phase: TimerPhase::Off,
                last_switch: None,
            },
            last_activation: None,
        }
    }
}

impl TimerState {
    /// The relay command due at `now`, if the current phase has run its
    /// course.
    pub fn due(&self, cfg: &TimerConfig, now: Instant) -> Option<RelayState> {
        let (limit, next) = match self.phase {
            TimerPhase::Off => (cfg.off(), RelayState::On),
            TimerPhase::On => (cfg.on(), RelayState::Off),
        };
        let elapsed_enough = match self.last_switch {
            Some(at) => now.saturating_duration_since(at) >= limit,
            None => true,
        };
        elapsed_enough.then_some(next)
    }

    fn record_switch(&mut self, to: RelayState, now: Instant) {
        self.phase = match to {
            RelayState::On => TimerPhase::On,
            RelayState::Off => TimerPhase::Off,
        };
        self.last_switch = Some(now);
    }
}

impl WorkerState {
    /// Humidity below threshold and the cooldown since the last attempted
    /// activation has passed.
    pub fn should_activate(&self, settings: &HumiditySettings, humidity: f64, now: Instant) -> bool {
        if humidity >= settings.threshold {
            return false;
        }
        match self.last_activation {
            Some(at) => now.saturating_duration_since(at) >= settings.cooldown,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Mode selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    Timer(TimerConfig),
    Humidity(HumiditySettings),
    Idle,
}

/// Timer wins over humidity; both absent means idle.
pub fn select_mode(timer: Option<TimerConfig>, humidity: Option<HumiditySettings>) -> Mode {
    match (timer, humidity) {
        (Some(t), _) if t.enabled => Mode::Timer(t),
        (_, Some(h)) => Mode::Humidity(h),
        _ => Mode::Idle,
    }
}

/// What a single tick did. Used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Timer { switched: Option<RelayState> },
    Humidity { recorded: bool, activated: bool },
    Idle { recorded: bool },
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct Worker {
    device_id: DeviceId,
    endpoint: String,
    poll_interval: Duration,
    services: Services,
    cancel: CancellationToken,
    reconfigure: Arc<Notify>,
    state: WorkerState,
}

impl Worker {
    pub fn new(device: &Device, services: Services, cancel: CancellationToken) -> Self {
        Self {
            device_id: device.id,
            endpoint: device.url.clone(),
            poll_interval: device.poll_interval(),
            services,
            cancel,
            reconfigure: Arc::new(Notify::new()),
            state: WorkerState::default(),
        }
    }

    /// Signal used to re-read humidity settings in the middle of a hold.
    pub fn with_reconfigure(mut self, reconfigure: Arc<Notify>) -> Self {
        self.reconfigure = reconfigure;
        self
    }

    #[cfg(test)]
    fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Tick until cancelled. Intended to be `tokio::spawn`-ed by the
    /// supervisor.
    pub async fn run(mut self) {
        info!(
            device = self.device_id,
            endpoint = %self.endpoint,
            poll_sec = self.poll_interval.as_secs(),
            "worker started"
        );

        while !self.cancel.is_cancelled() {
            let outcome = self.tick().await;
            debug!(device = self.device_id, ?outcome, "tick done");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(device = self.device_id, "worker stopped");
    }

    pub async fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();

        let snapshot = match self.services.directory.get_device(self.device_id).await {
            Ok(Some(d)) => Some(d),
            Ok(None) => {
                warn!(device = self.device_id, "device missing from directory; control disabled");
                None
            }
            Err(e) => {
                error!(device = self.device_id, "directory lookup failed: {e:#}");
                None
            }
        };
        if let Some(d) = &snapshot {
            if d.url != self.endpoint {
                info!(device = self.device_id, endpoint = %d.url, "endpoint changed");
                self.endpoint = d.url.clone();
            }
        }

        let timer = match self.services.client.read_timer_config(&self.endpoint).await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(device = self.device_id, "timer config unavailable: {e}");
                None
            }
        };
        let humidity = snapshot.as_ref().and_then(Device::humidity_settings);

        match select_mode(timer, humidity) {
            Mode::Timer(cfg) => self.handle_timer(&cfg, now).await,
            Mode::Humidity(settings) => self.handle_humidity(&settings, now).await,
            Mode::Idle => TickOutcome::Idle {
                recorded: self.sample().await.is_some_and(|(_, stored)| stored),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Policies
    // -----------------------------------------------------------------------

    /// Timer: flip the relay once the current phase's duration has elapsed.
    /// The phase only advances when the device acknowledged the command.
    async fn handle_timer(&mut self, cfg: &TimerConfig, now: Instant) -> TickOutcome {
        let Some(next) = self.state.timer.due(cfg, now) else {
            return TickOutcome::Timer { switched: None };
        };

        if !self.actuate(next).await {
            return TickOutcome::Timer { switched: None };
        }

        info!(
            device = self.device_id,
            state = %next,
            on_sec = cfg.on_duration,
            off_sec = cfg.off_duration,
            "timer: relay switched"
        );
        self.state.timer.record_switch(next, now);
        TickOutcome::Timer {
            switched: Some(next),
        }
    }

    /// Humidity: sample, persist, and run one ON/hold/OFF pulse when the air
    /// is too dry and the cooldown has passed.
    async fn handle_humidity(&mut self, settings: &HumiditySettings, now: Instant) -> TickOutcome {
        let Some((data, recorded)) = self.sample().await else {
            return TickOutcome::Humidity {
                recorded: false,
                activated: false,
            };
        };

        if !self.state.should_activate(settings, data.humidity, now) {
            return TickOutcome::Humidity {
                recorded,
                activated: false,
            };
        }

        info!(
            device = self.device_id,
            humidity = data.humidity,
            threshold = settings.threshold,
            on_sec = settings.on_duration.as_secs(),
            "humidity: below threshold, pulsing relay"
        );

        self.actuate(RelayState::On).await;
        self.hold(now, settings.on_duration).await;
        self.actuate(RelayState::Off).await;

        // Cooldown counts from the attempt, whether or not the device acked.
        self.state.last_activation = Some(now);

        TickOutcome::Humidity {
            recorded,
            activated: true,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Keep the relay on until `started + on_duration`. A stop signal ends
    /// the hold at once; a reconfigure signal re-reads the directory and
    /// shortens the hold, or ends it when humidity control was turned off.
    async fn hold(&self, started: Instant, mut on_duration: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(device = self.device_id, "stop requested during hold; releasing relay early");
                    return;
                }
                _ = tokio::time::sleep_until(started + on_duration) => return,
                _ = self.reconfigure.notified() => {
                    match self.services.directory.get_device(self.device_id).await {
                        Ok(Some(d)) => match d.humidity_settings() {
                            Some(h) => {
                                if h.on_duration != on_duration {
                                    info!(
                                        device = self.device_id,
                                        on_sec = h.on_duration.as_secs(),
                                        "hold duration changed"
                                    );
                                }
                                on_duration = h.on_duration;
                            }
                            None => {
                                info!(device = self.device_id, "humidity control disabled during hold");
                                return;
                            }
                        },
                        Ok(None) => {
                            warn!(device = self.device_id, "device left the directory during hold");
                            return;
                        }
                        Err(e) => {
                            error!(device = self.device_id, "directory lookup failed during hold: {e:#}");
                        }
                    }
                }
            }
        }
    }

    /// Read the sensor and append the sample. Returns the data and whether
    /// it was stored, or `None` when the device gave no data.
    async fn sample(&self) -> Option<(SensorData, bool)> {
        let data = match self.services.client.read_sensor(&self.endpoint).await {
            Ok(d) => d,
            Err(e) => {
                warn!(device = self.device_id, "sensor read failed: {e}");
                return None;
            }
        };

        let stored = match self
            .services
            .store
            .append(
                self.device_id,
                OffsetDateTime::now_utc(),
                data.temperature,
                data.humidity,
            )
            .await
        {
            Ok(()) => {
                info!(
                    device = self.device_id,
                    temperature = data.temperature,
                    humidity = data.humidity,
                    "reading stored"
                );
                true
            }
            Err(e) => {
                error!(device = self.device_id, "failed to store reading: {e:#}");
                false
            }
        };

        Some((data, stored))
    }

    async fn actuate(&self, state: RelayState) -> bool {
        match self.services.client.set_relay(&self.endpoint, state).await {
            Ok(()) => true,
            Err(e) => {
                error!(device = self.device_id, %state, "relay command failed: {e}");
                false
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
