use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gaggimate_core::{Command, MachineMode, OtaSettings, ProfileCatalog, Status};
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backoff::ReconnectPolicy;
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::liveness::LivenessMonitor;
use crate::router::Router;
use crate::state::{ConnectionState, DeviceEvent, DeviceState};
use crate::transport::{Frames, Transport};

/// Live connection to one GaggiMate controller.
///
/// Cloning is cheap and every clone drives the same connection. Call
/// [`Device::start`] once, and [`Device::shutdown`] when done.
#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    state: Arc<DeviceState>,
    transport: Transport,
    correlator: Correlator,
    router: Router,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect_attempt: AtomicU32,
}

impl Device {
    pub fn new(config: ClientConfig) -> Self {
        let state = Arc::new(DeviceState::new());
        let correlator = Correlator::new();
        let router = Router::new(state.clone(), correlator.clone());
        let transport = Transport::with_write_timeout(config.write_timeout);
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                transport,
                correlator,
                router,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                reconnect_attempt: AtomicU32::new(0),
            }),
        }
    }

    /// Connect and start the background tasks.
    ///
    /// The first connection attempt happens inline. If it fails the error is
    /// returned, but reconnection keeps going in the background until
    /// [`Device::shutdown`].
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.inner.tasks.lock().await;
        if !tasks.is_empty() || self.inner.cancel.is_cancelled() {
            return Ok(());
        }

        let url = self.inner.config.ws_url();
        let first = self.connect_once(&url).await;
        let first_error = first.as_ref().err().map(|e| match e {
            Error::ConnectTimeout { url, after } => Error::ConnectTimeout { url: url.clone(), after: *after },
            Error::Connect { url, reason } => Error::Connect { url: url.clone(), reason: reason.clone() },
            other => Error::Connect { url: url.clone(), reason: other.to_string() },
        });

        let device = self.clone();
        tasks.push(tokio::spawn(async move { device.supervise(first).await }));

        let monitor = LivenessMonitor::new(
            self.inner.state.clone(),
            self.inner.transport.clone(),
            self.inner.config.unavailable_timeout,
            self.inner.config.liveness_tick,
        );
        tasks.push(tokio::spawn(monitor.run(self.inner.cancel.clone())));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every task and close the socket. No reconnect is attempted afterwards.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        self.inner.transport.close().await;
        self.inner.correlator.abort_all();
        self.inner.state.set_connection_state(ConnectionState::Disconnected);
        info!(host = %self.inner.config.host, "GaggiMate client shut down");
    }

    // ----- Connection supervision -----

    async fn connect_once(&self, url: &str) -> Result<Frames> {
        self.inner.state.set_connection_state(ConnectionState::Connecting);
        info!(%url, "Connecting to GaggiMate");
        let cfg = &self.inner.config;
        self.inner
            .transport
            .connect(url, cfg.connect_timeout, cfg.keepalive_interval)
            .await
    }

    async fn supervise(self, first: Result<Frames>) {
        let cancel = self.inner.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            _ = self.connection_loop(first) => {}
        }
        debug!("Connection supervisor stopped");
    }

    // Owns the only reconnect timer, so attempts can never overlap.
    async fn connection_loop(&self, first: Result<Frames>) {
        let url = self.inner.config.ws_url();
        let mut policy = ReconnectPolicy::new(self.inner.config.reconnect_delays.clone());
        let mut attempt = Some(first);

        loop {
            let result = match attempt.take() {
                Some(result) => result,
                None => self.connect_once(&url).await,
            };

            match result {
                Ok(frames) => {
                    policy.reset();
                    self.inner.reconnect_attempt.store(0, Ordering::Relaxed);
                    self.on_connected();
                    self.pump(frames).await;
                    self.inner.transport.close().await;
                    self.inner.state.notify(DeviceEvent::Disconnected);
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to GaggiMate");
                }
            }

            if self.inner.cancel.is_cancelled() {
                return;
            }
            self.inner.state.set_connection_state(ConnectionState::Reconnecting);
            let delay = policy.next_delay();
            self.inner.reconnect_attempt.store(policy.attempt(), Ordering::Relaxed);
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = policy.attempt(),
                "Scheduling reconnect"
            );
            sleep(delay).await;
            if self.inner.cancel.is_cancelled() {
                return;
            }
        }
    }

    fn on_connected(&self) {
        info!(host = %self.inner.config.host, "Successfully connected to GaggiMate");
        self.inner.state.set_connection_state(ConnectionState::Connected);
        self.inner.state.notify(DeviceEvent::Connected);

        // Prime the cached results without holding up the receive loop
        let device = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = async {
                    device.request_ota_settings().await;
                    device.request_profiles_list().await;
                } => {}
            }
        });
    }

    async fn pump(&self, mut frames: Frames) {
        while let Some(text) = frames.next().await {
            self.inner.router.handle_text(&text).await;
        }
        info!("WebSocket closed");
    }

    // ----- State accessors -----

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Latest status push; `None` until the first one and after the liveness window lapses.
    pub async fn snapshot(&self) -> Option<Arc<Status>> {
        self.inner.state.snapshot().await
    }

    pub async fn is_available(&self) -> bool {
        self.inner.state.snapshot().await.is_some()
    }

    /// Last known profile catalog. Kept while disconnected.
    pub async fn profiles(&self) -> Arc<ProfileCatalog> {
        self.inner.state.profiles().await
    }

    /// Last known OTA settings. Kept while disconnected.
    pub async fn ota_settings(&self) -> Arc<OtaSettings> {
        self.inner.state.ota_settings().await
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.state.events()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection_state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.watch_connection()
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.reconnect_attempt.load(Ordering::Relaxed)
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // ----- Messaging -----

    /// Fire-and-forget.
    pub async fn send(&self, command: Command) -> Result<()> {
        let message = command.to_message()?;
        self.inner.transport.send(&Value::Object(message)).await
    }

    /// Send with a fresh `rid` and wait for the matching reply.
    pub async fn request(&self, command: Command) -> Result<Map<String, Value>> {
        let mut message = command.to_message()?;
        let pending = self.inner.correlator.register(&mut message);
        // On failure `pending` is dropped, which deregisters it
        self.inner.transport.send(&Value::Object(message)).await?;
        pending.wait(self.inner.config.request_timeout).await
    }

    // ----- Commands -----

    pub async fn set_mode(&self, mode: MachineMode) -> Result<()> {
        self.send(Command::ChangeMode { mode }).await
    }

    /// Walk the target temperature to `target` one degree at a time.
    ///
    /// The firmware only accepts relative nudges, so this sends one raise or
    /// lower message per degree of difference.
    pub async fn set_temperature(&self, target: f64) -> Result<()> {
        if !target.is_finite() {
            return Err(Error::InvalidArgument(format!("temperature {} is not a number", target)));
        }
        let snapshot = self.snapshot().await.ok_or(Error::NoStatus)?;
        let current = snapshot.target_temperature().ok_or(Error::TargetTemperatureUnavailable)?;

        // Half steps round to even: 93 -> 95.5 is two nudges, 93 -> 93.5 is none
        let delta = (target - current).round_ties_even() as i64;
        if delta == 0 {
            return Ok(());
        }
        let step = if delta > 0 { Command::RaiseTemp } else { Command::LowerTemp };
        let steps = delta.unsigned_abs();
        debug!(current, target, steps, "Adjusting target temperature");

        for i in 0..steps {
            if i > 0 {
                sleep(self.inner.config.temperature_step_delay).await;
            }
            self.send(step.clone()).await?;
        }
        Ok(())
    }

    pub async fn start_brew(&self) -> Result<()> {
        self.send(Command::ProcessActivate).await
    }

    pub async fn stop_brew(&self) -> Result<()> {
        self.send(Command::ProcessDeactivate).await
    }

    pub async fn clear_process(&self) -> Result<()> {
        self.send(Command::ProcessClear).await
    }

    /// Switch to steam mode, then activate. Activating first would apply to the old mode.
    pub async fn start_steam(&self) -> Result<()> {
        self.set_mode(MachineMode::Steam).await?;
        sleep(self.inner.config.steam_activation_delay).await;
        self.send(Command::ProcessActivate).await
    }

    pub async fn start_flush(&self) -> Result<()> {
        self.request(Command::FlushStart).await.map(|_| ())
    }

    pub async fn select_profile(&self, id: &str) -> Result<()> {
        self.request(Command::SelectProfile { id: id.to_string() }).await.map(|_| ())
    }

    /// Select by label using the cached catalog.
    pub async fn select_profile_by_label(&self, label: &str) -> Result<()> {
        let catalog = self.profiles().await;
        let id = catalog
            .id_for(label)
            .ok_or_else(|| {
                let known = catalog.labels().collect::<Vec<_>>().join(", ");
                Error::InvalidArgument(format!("unknown profile `{}` (known: {})", label, known))
            })?
            .to_string();
        self.select_profile(&id).await
    }

    /// Ask for the profile list. The reply lands in [`Device::profiles`]; failures are only logged.
    pub async fn request_profiles_list(&self) {
        if let Err(e) = self.request(Command::ListProfiles).await {
            debug!(error = %e, "Failed to request profiles list");
        }
    }

    /// Ask for OTA settings. The reply lands in [`Device::ota_settings`]; failures are only logged.
    pub async fn request_ota_settings(&self) {
        if let Err(e) = self.send(Command::OtaSettings).await {
            debug!(error = %e, "Failed to request OTA settings");
        }
    }

    /// Shot history entries as reported by the machine.
    pub async fn request_history_list(&self) -> Result<Vec<Value>> {
        let reply = self.request(Command::ListHistory).await?;
        Ok(reply
            .get("history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn delete_history_item(&self, id: Value) -> Result<()> {
        self.request(Command::DeleteHistoryItem { id }).await.map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &Arc<DeviceState> {
        &self.inner.state
    }
}
