use std::sync::Arc;

use gaggimate_core::{OtaSettings, ProfileCatalog, Status};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::Instant;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Data-changed notifications for consumers of a [`crate::Device`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    Status(Arc<Status>),
    /// The status snapshot went stale and was cleared.
    Unavailable,
    ProfilesUpdated,
    OtaSettingsUpdated,
}

/// Cached device view shared between the router, the liveness monitor and readers.
///
/// Every cache is replaced as a whole, so readers never observe a half-applied update.
pub struct DeviceState {
    snapshot: RwLock<Option<Arc<Status>>>,
    profiles: RwLock<Arc<ProfileCatalog>>,
    ota_settings: RwLock<Arc<OtaSettings>>,
    last_status: Mutex<Option<Instant>>,
    connection: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<DeviceEvent>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (connection, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            snapshot: RwLock::new(None),
            profiles: RwLock::new(Arc::default()),
            ota_settings: RwLock::new(Arc::default()),
            last_status: Mutex::new(None),
            connection,
            events_tx,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn notify(&self, event: DeviceEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    pub async fn snapshot(&self) -> Option<Arc<Status>> {
        self.snapshot.read().await.clone()
    }

    pub async fn profiles(&self) -> Arc<ProfileCatalog> {
        self.profiles.read().await.clone()
    }

    pub async fn ota_settings(&self) -> Arc<OtaSettings> {
        self.ota_settings.read().await.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub(crate) fn set_connection_state(&self, state: ConnectionState) {
        self.connection.send_replace(state);
    }

    pub(crate) async fn apply_status(&self, status: Status, at: Instant) {
        let status = Arc::new(status);
        *self.last_status.lock().await = Some(at);
        *self.snapshot.write().await = Some(status.clone());
        self.notify(DeviceEvent::Status(status));
    }

    pub(crate) async fn replace_profiles(&self, catalog: ProfileCatalog) {
        *self.profiles.write().await = Arc::new(catalog);
        self.notify(DeviceEvent::ProfilesUpdated);
    }

    pub(crate) async fn replace_ota_settings(&self, settings: OtaSettings) {
        *self.ota_settings.write().await = Arc::new(settings);
        self.notify(DeviceEvent::OtaSettingsUpdated);
    }

    pub(crate) async fn last_status(&self) -> Option<Instant> {
        *self.last_status.lock().await
    }

    /// Drop the snapshot and forget the last status time, unless a newer
    /// status arrived after `observed`. Returns whether anything was cleared.
    pub(crate) async fn mark_unavailable(&self, observed: Instant) -> bool {
        let mut last = self.last_status.lock().await;
        if *last != Some(observed) {
            return false;
        }
        *last = None;
        *self.snapshot.write().await = None;
        drop(last);
        self.notify(DeviceEvent::Unavailable);
        true
    }
}
