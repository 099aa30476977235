use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gaggimate_client::{trim_history, ConnectionState, Error};
use gaggimate_core::MachineMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::AppState;

// ----- Payloads -----

#[derive(Deserialize)]
pub struct ModePayload {
    mode: String,
}

#[derive(Deserialize)]
pub struct TemperaturePayload {
    value: f64,
}

#[derive(Deserialize)]
pub struct SelectProfilePayload {
    id: Option<String>,
    label: Option<String>,
}

#[derive(Deserialize)]
pub struct TrimPayload {
    max_shots: usize,
}

#[derive(Serialize)]
struct ProfileItem<'a> {
    label: &'a str,
    id: &'a str,
}

#[derive(Serialize)]
struct ConnectionResponse {
    state: &'static str,
    available: bool,
    reconnect_attempt: u32,
    pending_requests: usize,
}

pub(crate) fn connection_label(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Disconnected => "disconnected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Connected => "connected",
        ConnectionState::Reconnecting => "reconnecting",
    }
}

// ----- Error mapping -----

fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NoStatus | Error::TargetTemperatureUnavailable => StatusCode::CONFLICT,
        Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        Error::Send(_) | Error::WriteTimeout { .. } => StatusCode::BAD_GATEWAY,
        Error::NotConnected
        | Error::Connect { .. }
        | Error::ConnectTimeout { .. }
        | Error::RequestAborted(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::Decode(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn client_error(e: Error) -> Response {
    let status = status_for(&e);
    if status.is_server_error() {
        warn!(error = %e, "Device command failed");
    }
    (status, e.to_string()).into_response()
}

fn command_result(state: &AppState, result: gaggimate_client::Result<()>) -> Response {
    match result {
        Ok(()) => {
            state.metrics.commands_total.inc();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => client_error(e),
    }
}

// History ids come back as numbers from the firmware; keep them numeric when they look it.
fn history_id(raw: &str) -> Value {
    raw.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(raw.to_string()))
}

// ----- Read endpoints -----

pub async fn get_status(State(state): State<AppState>) -> Response {
    match state.device.snapshot().await {
        Some(status) => Json(&*status).into_response(),
        None => (StatusCode::NOT_FOUND, "No status").into_response(),
    }
}

pub async fn get_profiles(State(state): State<AppState>) -> Response {
    let catalog = state.device.profiles().await;
    let selected = state
        .device
        .snapshot()
        .await
        .and_then(|s| s.selected_profile().map(str::to_string));
    let profiles: Vec<_> = catalog.iter().map(|(label, id)| ProfileItem { label, id }).collect();
    Json(json!({ "profiles": profiles, "selected": selected })).into_response()
}

pub async fn get_ota(State(state): State<AppState>) -> Response {
    let settings = state.device.ota_settings().await;
    if settings.is_empty() {
        return (StatusCode::NOT_FOUND, "No OTA settings").into_response();
    }
    Json(&*settings).into_response()
}

pub async fn get_connection(State(state): State<AppState>) -> Response {
    let device = &state.device;
    Json(ConnectionResponse {
        state: connection_label(device.connection_state()),
        available: device.is_available().await,
        reconnect_attempt: device.reconnect_attempt(),
        pending_requests: device.pending_requests(),
    })
    .into_response()
}

// ----- Control endpoints -----

pub async fn set_mode(State(state): State<AppState>, Json(body): Json<ModePayload>) -> Response {
    let Some(mode) = MachineMode::parse(&body.mode) else {
        return (StatusCode::BAD_REQUEST, "mode must be one of standby, brew, steam, water, grind").into_response();
    };
    command_result(&state, state.device.set_mode(mode).await)
}

pub async fn set_temperature(State(state): State<AppState>, Json(body): Json<TemperaturePayload>) -> Response {
    if !(0.0..=160.0).contains(&body.value) {
        return (StatusCode::BAD_REQUEST, "temperature must be between 0 and 160 C").into_response();
    }
    command_result(&state, state.device.set_temperature(body.value).await)
}

pub async fn start_brew(State(state): State<AppState>) -> Response {
    command_result(&state, state.device.start_brew().await)
}

pub async fn stop_brew(State(state): State<AppState>) -> Response {
    command_result(&state, state.device.stop_brew().await)
}

pub async fn clear_process(State(state): State<AppState>) -> Response {
    command_result(&state, state.device.clear_process().await)
}

pub async fn start_steam(State(state): State<AppState>) -> Response {
    command_result(&state, state.device.start_steam().await)
}

pub async fn start_flush(State(state): State<AppState>) -> Response {
    command_result(&state, state.device.start_flush().await)
}

pub async fn select_profile(State(state): State<AppState>, Json(body): Json<SelectProfilePayload>) -> Response {
    let result = match (body.id, body.label) {
        (Some(id), _) => state.device.select_profile(&id).await,
        (None, Some(label)) => state.device.select_profile_by_label(&label).await,
        (None, None) => return (StatusCode::BAD_REQUEST, "either id or label is required").into_response(),
    };
    command_result(&state, result)
}

/// Replies update the caches asynchronously, so these return before the device answers.
pub async fn refresh_profiles(State(state): State<AppState>) -> Response {
    let device = state.device.clone();
    tokio::spawn(async move { device.request_profiles_list().await });
    StatusCode::ACCEPTED.into_response()
}

pub async fn refresh_ota(State(state): State<AppState>) -> Response {
    state.device.request_ota_settings().await;
    StatusCode::ACCEPTED.into_response()
}

// ----- Shot history -----

pub async fn list_history(State(state): State<AppState>) -> Response {
    match state.device.request_history_list().await {
        Ok(items) => Json(json!({ "count": items.len(), "items": items })).into_response(),
        Err(e) => client_error(e),
    }
}

pub async fn delete_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    command_result(&state, state.device.delete_history_item(history_id(&id)).await)
}

pub async fn trim(State(state): State<AppState>, Json(body): Json<TrimPayload>) -> Response {
    info!(max_shots = body.max_shots, "Shot history trim requested via API");
    match trim_history(&state.device, body.max_shots).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => client_error(e),
    }
}
