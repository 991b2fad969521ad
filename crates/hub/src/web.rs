//! Operator HTTP API: worker status, directory listing, reading history,
//! and the explicit restart/remove actions the supervisor does not take on
//! its own.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::db::{Db, DeviceId, MIN_POLL_FREQUENCY_SEC};
use crate::supervisor::Supervisor;

const DEFAULT_HISTORY_HOURS: i64 = 24;
const MAX_HISTORY_HOURS: i64 = 72;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub db: Db,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Internal failures surface as 500 with a JSON body.
struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("api error: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: format!("{:#}", self.0),
            }),
        )
            .into_response()
    }
}

fn not_found(id: DeviceId) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: format!("device {id} not found"),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    hours: Option<i64>,
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    poll_frequency_sec: Option<i64>,
    humidity_control: Option<bool>,
    humidity_threshold: Option<f64>,
    humidity_on_sec: Option<i64>,
    humidity_cooldown_sec: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    device_id: DeviceId,
    action: &'static str,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/devices", get(api_devices))
        .route(
            "/api/devices/{id}",
            axum::routing::patch(api_update_device).delete(api_remove_device),
        )
        .route("/api/devices/{id}/readings", get(api_readings))
        .route("/api/devices/{id}/restart", post(api_restart))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.status().await)
}

async fn api_devices(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.db.load_devices().await?).into_response())
}

async fn api_readings(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    Query(q): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    if state.db.find_device(id).await?.is_none() {
        return Ok(not_found(id));
    }
    let hours = q
        .hours
        .unwrap_or(DEFAULT_HISTORY_HOURS)
        .clamp(1, MAX_HISTORY_HOURS);
    let readings = state.db.readings_since_hours(id, hours).await?;
    Ok(Json(readings).into_response())
}

async fn api_restart(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
) -> Result<Response, ApiError> {
    let Some(device) = state.db.find_device(id).await? else {
        return Ok(not_found(id));
    };
    state.supervisor.restart(&device).await;
    Ok(Json(ActionResponse {
        device_id: id,
        action: "restarted",
    })
    .into_response())
}

/// Humidity settings are read by the worker every tick and re-read by an
/// ongoing hold when signalled; a new polling frequency only takes effect
/// through a restart.
async fn api_update_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Response, ApiError> {
    let Some(current) = state.db.find_device(id).await? else {
        return Ok(not_found(id));
    };

    if let Some(secs) = update.poll_frequency_sec {
        if secs < MIN_POLL_FREQUENCY_SEC {
            return Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ErrorBody {
                    error: format!("poll_frequency_sec must be at least {MIN_POLL_FREQUENCY_SEC}"),
                }),
            )
                .into_response());
        }
        state.db.update_poll_frequency(id, secs).await?;
    }

    state
        .db
        .update_humidity_control(
            id,
            update.humidity_control.unwrap_or(current.humidity_control),
            update.humidity_threshold.unwrap_or(current.humidity_threshold),
            update.humidity_on_sec.unwrap_or(current.humidity_on_sec),
            update.humidity_cooldown_sec.unwrap_or(current.humidity_cooldown_sec),
        )
        .await?;

    let Some(updated) = state.db.find_device(id).await? else {
        return Ok(not_found(id));
    };
    if updated.poll_frequency_sec != current.poll_frequency_sec {
        state.supervisor.restart(&updated).await;
    } else {
        state.supervisor.reconfigure(id).await;
    }
    Ok(Json(updated).into_response())
}

/// The worker is joined and the rows deleted under the supervisor's
/// registry lock, so reconcile never sees the device half-removed.
async fn api_remove_device(
    State(state): State<AppState>,
    Path(id): Path<DeviceId>,
) -> Result<Response, ApiError> {
    let db = state.db.clone();
    let removal = state
        .supervisor
        .remove(id, || async move { db.remove_device(id).await })
        .await?;
    if !removal.deleted && !removal.had_worker {
        return Ok(not_found(id));
    }
    info!(device = id, "device removed");
    Ok(Json(ActionResponse {
        device_id: id,
        action: "removed",
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let shutdown = state.supervisor.shutdown_token();

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
