//! TOML config file loading, validation, and directory seeding for devices.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::db::{Db, NewDevice, MIN_POLL_FREQUENCY_SEC};
use crate::device::DeviceClient;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ControllerSettings {
    #[serde(default = "default_reconcile_interval_sec")]
    pub reconcile_interval_sec: u64,
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub url: String,
    #[serde(default = "default_poll_frequency_sec")]
    pub poll_frequency_sec: i64,
    #[serde(default)]
    pub humidity_control: bool,
    #[serde(default = "default_humidity_threshold")]
    pub humidity_threshold: f64,
    #[serde(default = "default_humidity_on_sec")]
    pub humidity_on_sec: i64,
    #[serde(default = "default_humidity_cooldown_sec")]
    pub humidity_cooldown_sec: i64,
}

fn default_reconcile_interval_sec() -> u64 {
    10
}

fn default_request_timeout_sec() -> u64 {
    5
}

fn default_poll_frequency_sec() -> i64 {
    60
}

fn default_humidity_threshold() -> f64 {
    40.0
}

fn default_humidity_on_sec() -> i64 {
    300
}

fn default_humidity_cooldown_sec() -> i64 {
    600
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval_sec: default_reconcile_interval_sec(),
            request_timeout_sec: default_request_timeout_sec(),
        }
    }
}

impl ControllerSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_sec)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_controller(&mut errors);
        self.validate_devices(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.reconcile_interval_sec == 0 {
            errors.push("controller: reconcile_interval_sec must be positive".into());
        }
        if c.request_timeout_sec == 0 {
            errors.push("controller: request_timeout_sec must be positive".into());
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.name.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&d.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if !(d.url.starts_with("http://") || d.url.starts_with("https://")) {
                errors.push(format!(
                    "{}: url '{}' must start with http:// or https://",
                    ctx(),
                    d.url
                ));
            }

            // ── Polling ─────────────────────────────────────────
            if d.poll_frequency_sec < MIN_POLL_FREQUENCY_SEC {
                errors.push(format!(
                    "{}: poll_frequency_sec must be at least {MIN_POLL_FREQUENCY_SEC}, got {}",
                    ctx(),
                    d.poll_frequency_sec
                ));
            }

            // ── Humidity control ────────────────────────────────
            if !(0.0..=100.0).contains(&d.humidity_threshold) {
                errors.push(format!(
                    "{}: humidity_threshold {} out of range [0, 100]",
                    ctx(),
                    d.humidity_threshold
                ));
            }
            if d.humidity_on_sec <= 0 {
                errors.push(format!(
                    "{}: humidity_on_sec must be positive, got {}",
                    ctx(),
                    d.humidity_on_sec
                ));
            }
            if d.humidity_cooldown_sec < 0 {
                errors.push(format!(
                    "{}: humidity_cooldown_sec must not be negative, got {}",
                    ctx(),
                    d.humidity_cooldown_sec
                ));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// default (empty) config.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every configured device into the directory, asking each device
/// for its hostname on the way.
pub async fn apply(config: &Config, db: &Db, client: &dyn DeviceClient) -> Result<()> {
    for d in &config.devices {
        let hostname = match client.read_hostname(&d.url).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(device = %d.name, "could not read hostname: {e}");
                "unknown".to_string()
            }
        };

        db.upsert_device(&NewDevice {
            name: d.name.clone(),
            url: d.url.clone(),
            hostname,
            poll_frequency_sec: d.poll_frequency_sec,
            humidity_control: d.humidity_control,
            humidity_threshold: d.humidity_threshold,
            humidity_on_sec: d.humidity_on_sec,
            humidity_cooldown_sec: d.humidity_cooldown_sec,
        })
        .await
        .with_context(|| format!("failed to upsert device '{}'", d.name))?;
    }

    tracing::info!(devices = config.devices.len(), "config applied");

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DeviceDirectory;
    use crate::testing::FakeClient;

    fn valid_device() -> DeviceEntry {
        DeviceEntry {
            name: "tent".into(),
            url: "http://192.168.1.50".into(),
            poll_frequency_sec: 60,
            humidity_control: true,
            humidity_threshold: 40.0,
            humidity_on_sec: 300,
            humidity_cooldown_sec: 600,
        }
    }

    fn valid_config() -> Config {
        Config {
            controller: ControllerSettings::default(),
            devices: vec![valid_device()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[controller]
reconcile_interval_sec = 15
request_timeout_sec = 3

[[devices]]
name = "tent"
url = "http://192.168.1.50"
poll_frequency_sec = 30
humidity_control = true
humidity_threshold = 45.5
humidity_on_sec = 120
humidity_cooldown_sec = 900
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.controller.reconcile_interval(), Duration::from_secs(15));
        assert_eq!(config.controller.request_timeout(), Duration::from_secs(3));
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].humidity_threshold, 45.5);
        config.validate().unwrap();
    }

    #[test]
    fn parse_applies_defaults() {
        let toml_str = r#"
[[devices]]
name = "closet"
url = "http://10.0.0.7"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.controller.reconcile_interval_sec, 10);
        assert_eq!(config.controller.request_timeout_sec, 5);
        let d = &config.devices[0];
        assert_eq!(d.poll_frequency_sec, 60);
        assert!(!d.humidity_control);
        assert_eq!(d.humidity_threshold, 40.0);
        assert_eq!(d.humidity_on_sec, 300);
        assert_eq!(d.humidity_cooldown_sec, 600);
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load("/nonexistent/relay-config.toml").unwrap();
        assert!(config.devices.is_empty());
    }

    // -- Controller -------------------------------------------------------

    #[test]
    fn zero_reconcile_interval_rejected() {
        let mut cfg = valid_config();
        cfg.controller.reconcile_interval_sec = 0;
        assert_validation_err(&cfg, "reconcile_interval_sec must be positive");
    }

    #[test]
    fn zero_request_timeout_rejected() {
        let mut cfg = valid_config();
        cfg.controller.request_timeout_sec = 0;
        assert_validation_err(&cfg, "request_timeout_sec must be positive");
    }

    // -- Devices ----------------------------------------------------------

    #[test]
    fn device_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    #[test]
    fn device_duplicate_name_rejected() {
        let mut cfg = valid_config();
        cfg.devices.push(DeviceEntry {
            url: "http://192.168.1.51".into(),
            ..valid_device()
        });
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn device_url_scheme_required() {
        let mut cfg = valid_config();
        cfg.devices[0].url = "192.168.1.50".into();
        assert_validation_err(&cfg, "must start with http://");
    }

    #[test]
    fn poll_frequency_minimum_enforced() {
        let mut cfg = valid_config();
        cfg.devices[0].poll_frequency_sec = 4;
        assert_validation_err(&cfg, "poll_frequency_sec must be at least 5, got 4");

        cfg.devices[0].poll_frequency_sec = 5;
        cfg.validate().unwrap();
    }

    #[test]
    fn humidity_threshold_out_of_range() {
        let mut cfg = valid_config();
        cfg.devices[0].humidity_threshold = 101.0;
        assert_validation_err(&cfg, "humidity_threshold 101 out of range");
    }

    #[test]
    fn humidity_on_sec_zero_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].humidity_on_sec = 0;
        assert_validation_err(&cfg, "humidity_on_sec must be positive");
    }

    #[test]
    fn humidity_cooldown_negative_rejected() {
        let mut cfg = valid_config();
        cfg.devices[0].humidity_cooldown_sec = -1;
        assert_validation_err(&cfg, "humidity_cooldown_sec must not be negative");
    }

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            controller: ControllerSettings {
                reconcile_interval_sec: 0,
                request_timeout_sec: 5,
            },
            devices: vec![DeviceEntry {
                name: "".into(),
                url: "ftp://x".into(),
                poll_frequency_sec: 1,
                ..valid_device()
            }],
        };
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("reconcile_interval_sec"), "missing controller error in: {msg}");
        assert!(msg.contains("name is empty"), "missing name error in: {msg}");
        assert!(msg.contains("http://"), "missing url error in: {msg}");
        assert!(msg.contains("poll_frequency_sec"), "missing poll error in: {msg}");
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_directory_with_hostnames() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        apply(&config, &db, &FakeClient::default()).await.unwrap();
        // Applying twice must not duplicate.
        apply(&config, &db, &FakeClient::default()).await.unwrap();

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "tent");
        assert_eq!(devices[0].hostname, "192.168.1.50");
        assert!(devices[0].humidity_control);
    }

    #[tokio::test]
    async fn apply_falls_back_to_unknown_hostname() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let client = FakeClient::default();
        client
            .hostname_fails
            .store(true, std::sync::atomic::Ordering::SeqCst);

        apply(&valid_config(), &db, &client).await.unwrap();

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices[0].hostname, "unknown");
    }
}
