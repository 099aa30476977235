use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use dotenvy::dotenv;
use gaggimate_client::{ClientConfig, ConnectionState, Device, DeviceEvent};
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod api;

#[derive(Clone)]
pub(crate) struct AppState {
    device: Device,
    metrics: Arc<Metrics>,
}

pub(crate) struct Metrics {
    connected: IntGauge,
    status_rx_total: IntCounter,
    status_last_seen: IntGauge,
    unavailable_total: IntCounter,
    disconnects_total: IntCounter,
    commands_total: IntCounter,
    profiles: IntGauge,
    ws_clients: IntGauge,
}

impl Metrics {
    fn new() -> prometheus::Result<Arc<Self>> {
        let connected = IntGauge::new("gaggimate_connected", "Device connection status (1 connected, 0 otherwise)")?;
        let status_rx_total = IntCounter::new("gaggimate_status_messages_received_total", "Total status pushes received")?;
        let status_last_seen = IntGauge::new("gaggimate_status_last_seen", "Last seen status epoch seconds")?;
        let unavailable_total = IntCounter::new("gaggimate_unavailable_total", "Times the status went stale")?;
        let disconnects_total = IntCounter::new("gaggimate_disconnects_total", "Total WebSocket disconnects")?;
        let commands_total = IntCounter::new("gaggimate_commands_sent_total", "Total control commands accepted by the device")?;
        let profiles = IntGauge::new("gaggimate_profiles", "Number of profiles in the cached catalog")?;
        let ws_clients = IntGauge::new("gaggimate_ws_clients", "Number of connected status WebSocket clients")?;

        let registry = prometheus::default_registry();
        registry.register(Box::new(connected.clone()))?;
        registry.register(Box::new(status_rx_total.clone()))?;
        registry.register(Box::new(status_last_seen.clone()))?;
        registry.register(Box::new(unavailable_total.clone()))?;
        registry.register(Box::new(disconnects_total.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(profiles.clone()))?;
        registry.register(Box::new(ws_clients.clone()))?;

        Ok(Arc::new(Self {
            connected,
            status_rx_total,
            status_last_seen,
            unavailable_total,
            disconnects_total,
            commands_total,
            profiles,
            ws_clients,
        }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing()?;

    let client_cfg = ClientConfig::from_env();
    info!(host = %client_cfg.host, port = client_cfg.port, tls = client_cfg.use_tls, "Configuring GaggiMate client");
    let device = Device::new(client_cfg);
    let metrics = Metrics::new().context("failed to register metrics")?;

    // Subscribe before connecting so the first Connected event is counted
    tokio::spawn(device_consumer_loop(device.clone(), device.events(), metrics.clone()));
    if let Err(e) = device.start().await {
        warn!(error = %e, "Initial connection failed, retrying in background");
    }

    let state = AppState { device: device.clone(), metrics };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/version", get(version))
        .route("/metrics", get(metrics_handler))
        // Read APIs
        .route("/api/device/status", get(api::get_status))
        .route("/api/device/connection", get(api::get_connection))
        .route("/api/device/profiles", get(api::get_profiles))
        .route("/api/device/ota", get(api::get_ota))
        // Control API
        .route("/api/device/mode", post(api::set_mode))
        .route("/api/device/temperature", post(api::set_temperature))
        .route("/api/device/brew/start", post(api::start_brew))
        .route("/api/device/brew/stop", post(api::stop_brew))
        .route("/api/device/process/clear", post(api::clear_process))
        .route("/api/device/steam/start", post(api::start_steam))
        .route("/api/device/flush/start", post(api::start_flush))
        .route("/api/device/profiles/select", post(api::select_profile))
        .route("/api/device/profiles/refresh", post(api::refresh_profiles))
        .route("/api/device/ota/refresh", post(api::refresh_ota))
        // Shot history
        .route("/api/history", get(api::list_history))
        .route("/api/history/trim", post(api::trim))
        .route("/api/history/:id", delete(api::delete_history))
        // Live status stream
        .route("/ws/status", get(ws_status))
        .with_state(state);

    let addr: SocketAddr = std::env::var("GAGGIMATE_HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("Invalid GAGGIMATE_HTTP_ADDR")?;

    info!(%addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    device.shutdown().await;
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,axum=info,hyper=info,tungstenite=warn"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<AppState>) -> StatusCode {
    // Connected and receiving status pushes
    let connected = state.device.connection_state() == ConnectionState::Connected;
    if connected && state.device.is_available().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}

// ----- WebSocket status stream -----

async fn ws_status(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| status_ws_loop(state, socket))
}

async fn status_ws_loop(state: AppState, mut socket: WebSocket) {
    state.metrics.ws_clients.inc();
    info!(clients = state.metrics.ws_clients.get(), "Status WebSocket client connected");

    let mut rx = state.device.events();
    // Late joiners get the current snapshot straight away
    if let Some(status) = state.device.snapshot().await {
        if let Ok(text) = serde_json::to_string(&*status) {
            if socket.send(Message::Text(text)).await.is_err() {
                state.metrics.ws_clients.dec();
                return;
            }
        }
    }

    loop {
        tokio::select! {
            evt = rx.recv() => {
                let text = match evt {
                    Ok(DeviceEvent::Status(status)) => match serde_json::to_string(&*status) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(DeviceEvent::Unavailable) => serde_json::json!({"tp": "evt:unavailable"}).to_string(),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Status WebSocket client lagging");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    let _ = socket.close().await;
    state.metrics.ws_clients.dec();
    info!(clients = state.metrics.ws_clients.get(), "Status WebSocket client disconnected");
}

// ----- Device events -> metrics -----

async fn device_consumer_loop(device: Device, mut rx: broadcast::Receiver<DeviceEvent>, metrics: Arc<Metrics>) {
    loop {
        match rx.recv().await {
            Ok(DeviceEvent::Connected) => metrics.connected.set(1),
            Ok(DeviceEvent::Disconnected) => {
                metrics.connected.set(0);
                metrics.disconnects_total.inc();
            }
            Ok(DeviceEvent::Status(_)) => {
                metrics.status_rx_total.inc();
                metrics.status_last_seen.set(epoch_secs() as i64);
            }
            Ok(DeviceEvent::Unavailable) => metrics.unavailable_total.inc(),
            Ok(DeviceEvent::ProfilesUpdated) => metrics.profiles.set(device.profiles().await.len() as i64),
            Ok(DeviceEvent::OtaSettingsUpdated) => {
                let ota = device.ota_settings().await;
                info!(
                    hardware = ota.hardware().unwrap_or("unknown"),
                    display = ota.display_version().unwrap_or("unknown"),
                    controller = ota.controller_version().unwrap_or("unknown"),
                    "OTA settings updated"
                );
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Device event consumer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn epoch_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
