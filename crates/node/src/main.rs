mod sim;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sim::{ClimateSim, Scenario};
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerSettings {
    enabled: bool,
    on_duration: u64,
    off_duration: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            on_duration: 60,
            off_duration: 300,
        }
    }
}

struct DeviceState {
    sim: ClimateSim,
    relay_on: bool,
    timer: TimerSettings,
    /// When the on-board timer last flipped the relay (or was reconfigured).
    last_toggle: Instant,
    hostname: String,
    /// Probability in [0,1] that a sensor read answers with an error payload.
    fault_rate: f32,
}

impl DeviceState {
    fn new(sim: ClimateSim, hostname: String, fault_rate: f32) -> Self {
        Self {
            sim,
            relay_on: false,
            timer: TimerSettings::default(),
            last_toggle: Instant::now(),
            hostname,
            fault_rate,
        }
    }

    fn set_relay(&mut self, on: bool) {
        self.relay_on = on;
        self.sim.set_relay(on);
    }

    /// One pass of the on-board duty cycle. Returns the new relay state when
    /// the timer flipped it.
    fn step_timer(&mut self, now: Instant) -> Option<bool> {
        if !self.timer.enabled {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.last_toggle);
        let limit = if self.relay_on {
            self.timer.on_duration
        } else {
            self.timer.off_duration
        };
        if elapsed < Duration::from_secs(limit) {
            return None;
        }
        let next = !self.relay_on;
        self.set_relay(next);
        self.last_toggle = now;
        Some(next)
    }
}

const TIMER_CHECK_EVERY: Duration = Duration::from_millis(100);

/// Drive the on-board timer until the process exits.
async fn timer_loop(state: Shared) {
    let mut ticker = tokio::time::interval(TIMER_CHECK_EVERY);
    loop {
        ticker.tick().await;
        if let Some(on) = state.lock().await.step_timer(Instant::now()) {
            let s = if on { "on" } else { "off" };
            info!(state = s, "timer: relay switched");
        }
    }
}

type Shared = Arc<Mutex<DeviceState>>;

#[derive(Debug, Deserialize)]
struct RelayRequest {
    state: String,
}

#[derive(Debug, Deserialize)]
struct HostnameRequest {
    hostname: String,
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": message.into() })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(state: Shared) -> Router {
    Router::new()
        .route("/api/sensor", get(api_sensor))
        .route("/api/relay", get(api_relay_state).post(api_set_relay))
        .route("/api/timer", get(api_timer).post(api_set_timer))
        .route("/api/hostname", get(api_hostname).post(api_set_hostname))
        .with_state(state)
}

async fn api_sensor(State(state): State<Shared>) -> Json<serde_json::Value> {
    let mut st = state.lock().await;
    if st.fault_rate > 0.0 && fastrand::f32() < st.fault_rate {
        warn!("injected sensor fault");
        return Json(json!({ "error": "Sensor not connected", "status": "error" }));
    }
    let c = st.sim.sample();
    Json(json!({
        "temperature": c.temperature,
        "humidity": c.humidity,
        "status": "ok",
    }))
}

async fn api_relay_state(State(state): State<Shared>) -> Json<serde_json::Value> {
    let st = state.lock().await;
    let s = if st.relay_on { "on" } else { "off" };
    Json(json!({ "status": "ok", "state": s }))
}

async fn api_set_relay(State(state): State<Shared>, Json(req): Json<RelayRequest>) -> Response {
    let on = match req.state.as_str() {
        "on" => true,
        "off" => false,
        other => return bad_request(format!("invalid relay state '{other}'")),
    };
    let mut st = state.lock().await;
    st.set_relay(on);
    if st.timer.enabled {
        info!("manual relay command disables the timer");
        st.timer.enabled = false;
    }
    info!(state = %req.state, "relay switched");
    Json(json!({ "status": "ok", "state": req.state })).into_response()
}

async fn api_timer(State(state): State<Shared>) -> Json<serde_json::Value> {
    let st = state.lock().await;
    Json(json!({
        "enabled": st.timer.enabled,
        "onDuration": st.timer.on_duration,
        "offDuration": st.timer.off_duration,
        "currentState": st.relay_on,
    }))
}

async fn api_set_timer(State(state): State<Shared>, Json(timer): Json<TimerSettings>) -> Response {
    if timer.enabled && (timer.on_duration == 0 || timer.off_duration == 0) {
        return bad_request("enabled timer needs non-zero durations");
    }
    let mut st = state.lock().await;
    st.timer = timer;
    st.last_toggle = Instant::now();
    if !timer.enabled {
        st.set_relay(false);
    }
    drop(st);
    info!(
        enabled = timer.enabled,
        on = timer.on_duration,
        off = timer.off_duration,
        "timer updated"
    );
    Json(json!({ "status": "ok" })).into_response()
}

async fn api_hostname(State(state): State<Shared>) -> Json<serde_json::Value> {
    let hostname = state.lock().await.hostname.clone();
    Json(json!({ "hostname": hostname }))
}

async fn api_set_hostname(
    State(state): State<Shared>,
    Json(req): Json<HostnameRequest>,
) -> Response {
    let name = req.hostname.trim();
    if name.is_empty() {
        return bad_request("hostname must not be empty");
    }
    state.lock().await.hostname = name.to_string();
    info!(hostname = name, "hostname updated");
    Json(json!({ "status": "ok", "hostname": name })).into_response()
}

// ---------------------------------------------------------------------------
// Entry-point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let port: u16 = env::var("NODE_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let fault_rate: f32 = env::var("SIM_FAULT_RATE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0_f32)
        .clamp(0.0, 1.0);
    let hostname = env::var("DEVICE_HOSTNAME").unwrap_or_else(|_| "temcontrol".to_string());

    let state = Arc::new(Mutex::new(DeviceState::new(
        ClimateSim::new(scenario),
        hostname.clone(),
        fault_rate,
    )));
    tokio::spawn(timer_loop(state.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%scenario, fault_rate, %hostname, "simulated device listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("simulated device stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
