//! Stateful climate simulator for a relay-controlled grow tent.
//!
//! Models a temperature/humidity sensor sitting next to a dehumidifier:
//! - Temporal coherence via random walk with mean reversion
//! - Slow humidity rise while the relay is off (transpiration, watering)
//! - Per-reading sensor noise
//! - Humidity pulled down while the relay is on
//!
//! Readings are rounded to one decimal, the way a DHT22/SHT31 reports them.

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Humidity creeps upward until the relay pulls it back. Exercises the
    /// hub's threshold trigger.
    Humid,
    /// Sits near 40% with little noise.
    Stable,
    /// Starts low and stays low; the hub should never trigger.
    Dry,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "dry" => Self::Dry,
            _ => Self::Humid,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Humid => write!(f, "humid"),
            Self::Stable => write!(f, "stable"),
            Self::Dry => write!(f, "dry"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
}

pub struct ClimateSim {
    temperature: f64,
    humidity: f64,

    temp_center: f64,
    humidity_center: f64,

    // Random walk parameters
    humidity_drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,

    relay_on: bool,
    dry_rate: f64,
}

impl ClimateSim {
    pub fn new(scenario: Scenario) -> Self {
        // (start humidity, centre, drift per sample, walk sigma, noise sigma)
        let (start, center, drift, walk_sigma, noise_sigma) = match scenario {
            Scenario::Humid => (45.0, 55.0, 0.4, 0.5, 0.3),
            Scenario::Stable => (40.0, 40.0, 0.0, 0.2, 0.1),
            Scenario::Dry => (28.0, 28.0, 0.0, 0.3, 0.2),
        };

        Self {
            temperature: gaussian(22.0, 0.5),
            humidity: start,
            temp_center: 22.0,
            humidity_center: center,
            humidity_drift: drift,
            walk_sigma,
            mean_reversion: 0.03,
            noise_sigma,
            relay_on: false,
            dry_rate: -1.5,
        }
    }

    /// Inform the simulator whether the relay (dehumidifier) is energised.
    pub fn set_relay(&mut self, on: bool) {
        self.relay_on = on;
    }

    /// Advance one step and return the instantaneous reading.
    pub fn sample(&mut self) -> Climate {
        let pull = self.mean_reversion * (self.humidity_center - self.humidity);
        let walk = gaussian(0.0, self.walk_sigma);
        let dry = if self.relay_on { self.dry_rate } else { 0.0 };
        self.humidity = (self.humidity + self.humidity_drift + pull + walk + dry).clamp(5.0, 95.0);

        let temp_pull = self.mean_reversion * (self.temp_center - self.temperature);
        self.temperature = (self.temperature + temp_pull + gaussian(0.0, 0.1)).clamp(-10.0, 50.0);

        Climate {
            temperature: round1(self.temperature + gaussian(0.0, 0.05)),
            humidity: round1((self.humidity + gaussian(0.0, self.noise_sigma)).clamp(0.0, 100.0)),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
