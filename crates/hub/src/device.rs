//! HTTP client for a single relay device.
//!
//! Wire contract (per device base URL):
//!
//! ```text
//! GET  /api/sensor    -> {"temperature":21.4,"humidity":38.0,"status":"ok"}
//!                        {"error":"Sensor not connected","status":"error"}
//! POST /api/relay     {"state":"on"|"off"} -> {"status":"ok","state":"on"}
//! GET  /api/timer     -> {"enabled":true,"onDuration":60,"offDuration":300}
//! GET  /api/hostname  -> {"hostname":"temcontrol"}
//! ```
//!
//! Every call is bounded by the client's request timeout and is never
//! retried. Transport errors, non-2xx statuses, error payloads and malformed
//! JSON all surface as a [`DeviceError`].

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorData {
    pub temperature: f64,
    pub humidity: f64,
}

/// Duty-cycle timer as reported by the device. Durations are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerConfig {
    pub enabled: bool,
    #[serde(default)]
    pub on_duration: u64,
    #[serde(default)]
    pub off_duration: u64,
}

impl TimerConfig {
    pub fn on(&self) -> Duration {
        Duration::from_secs(self.on_duration)
    }

    pub fn off(&self) -> Duration {
        Duration::from_secs(self.off_duration)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("device reported error: {0}")]
    Device(String),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Requests a worker can issue against one device endpoint.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn read_sensor(&self, endpoint: &str) -> Result<SensorData, DeviceError>;
    async fn set_relay(&self, endpoint: &str, state: RelayState) -> Result<(), DeviceError>;
    async fn read_timer_config(&self, endpoint: &str) -> Result<TimerConfig, DeviceError>;
    async fn read_hostname(&self, endpoint: &str) -> Result<String, DeviceError>;
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SensorPayload {
    temperature: Option<f64>,
    humidity: Option<f64>,
    #[serde(flatten)]
    status: StatusFields,
}

#[derive(Debug, Default, Deserialize)]
struct StatusFields {
    status: Option<String>,
    error: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostnamePayload {
    hostname: String,
}

#[derive(Serialize)]
struct RelayRequest {
    state: RelayState,
}

impl StatusFields {
    /// An explicit `error` field or `"status":"error"` means the device
    /// answered but could not do what was asked.
    fn check(&self) -> Result<(), DeviceError> {
        if let Some(err) = &self.error {
            return Err(DeviceError::Device(err.clone()));
        }
        if self.status.as_deref() == Some("error") {
            let msg = self.message.clone().unwrap_or_else(|| "unspecified".into());
            return Err(DeviceError::Device(msg));
        }
        Ok(())
    }
}

pub(crate) fn decode_sensor(body: &[u8]) -> Result<SensorData, DeviceError> {
    let payload: SensorPayload = serde_json::from_slice(body)?;
    payload.status.check()?;
    match (payload.temperature, payload.humidity) {
        (Some(temperature), Some(humidity)) => Ok(SensorData {
            temperature,
            humidity,
        }),
        _ => Err(DeviceError::Device(
            "sensor payload missing temperature or humidity".into(),
        )),
    }
}

pub(crate) fn decode_ack(body: &[u8]) -> Result<(), DeviceError> {
    // Some firmware answers with an empty body.
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let fields: StatusFields = serde_json::from_slice(body)?;
    fields.check()
}

pub(crate) fn decode_timer(body: &[u8]) -> Result<TimerConfig, DeviceError> {
    let fields: StatusFields = serde_json::from_slice(body)?;
    fields.check()?;
    Ok(serde_json::from_slice(body)?)
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpDeviceClient {
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build device http client")?;
        Ok(Self { http })
    }

    fn url(endpoint: &str, path: &str) -> String {
        format!("{}{path}", endpoint.trim_end_matches('/'))
    }

    async fn body(resp: reqwest::Response) -> Result<Vec<u8>, DeviceError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(DeviceError::Status(status.as_u16()));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn get(&self, endpoint: &str, path: &str) -> Result<Vec<u8>, DeviceError> {
        let resp = self.http.get(Self::url(endpoint, path)).send().await?;
        Self::body(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, path: &str) -> Result<T, DeviceError> {
        let body = self.get(endpoint, path).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn read_sensor(&self, endpoint: &str) -> Result<SensorData, DeviceError> {
        decode_sensor(&self.get(endpoint, "/api/sensor").await?)
    }

    async fn set_relay(&self, endpoint: &str, state: RelayState) -> Result<(), DeviceError> {
        let resp = self
            .http
            .post(Self::url(endpoint, "/api/relay"))
            .json(&RelayRequest { state })
            .send()
            .await?;
        decode_ack(&Self::body(resp).await?)
    }

    async fn read_timer_config(&self, endpoint: &str) -> Result<TimerConfig, DeviceError> {
        decode_timer(&self.get(endpoint, "/api/timer").await?)
    }

    async fn read_hostname(&self, endpoint: &str) -> Result<String, DeviceError> {
        let payload: HostnamePayload = self.get_json(endpoint, "/api/hostname").await?;
        Ok(payload.hostname)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
