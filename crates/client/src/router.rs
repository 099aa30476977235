use std::sync::Arc;

use gaggimate_core::{
    OtaSettings, ProfileCatalog, Status, EVT_STATUS, RES_OTA_SETTINGS, RES_PROFILES_LIST, RID_FIELD,
    TYPE_FIELD,
};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::state::DeviceState;

/// Where an incoming frame ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Status,
    OtaSettings,
    Profiles,
    /// Fulfilled a pending request.
    Reply,
    /// No matching pending request; dropped.
    Unmatched,
    /// Not a JSON object; dropped.
    Malformed,
}

#[derive(Clone)]
pub struct Router {
    state: Arc<DeviceState>,
    correlator: Correlator,
}

impl Router {
    pub fn new(state: Arc<DeviceState>, correlator: Correlator) -> Self {
        Self { state, correlator }
    }

    /// Decode one text frame and dispatch it. Bad frames are logged, never raised.
    pub async fn handle_text(&self, text: &str) -> Route {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(message)) => self.handle_message(message).await,
            Ok(other) => {
                warn!(kind = json_kind(&other), "Ignoring non-object WebSocket message");
                Route::Malformed
            }
            Err(e) => {
                warn!(error = %e, "Failed to decode WebSocket message");
                Route::Malformed
            }
        }
    }

    // Status pushes win over cached-result replies, which win over generic rid replies.
    pub async fn handle_message(&self, message: Map<String, Value>) -> Route {
        let tag = message
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        match tag.as_str() {
            EVT_STATUS => {
                self.state.apply_status(Status::new(message), Instant::now()).await;
                return Route::Status;
            }
            RES_OTA_SETTINGS => {
                self.state.replace_ota_settings(OtaSettings::new(message)).await;
                return Route::OtaSettings;
            }
            RES_PROFILES_LIST => {
                let catalog = ProfileCatalog::from_reply(&message);
                debug!(count = catalog.len(), "Profile list updated");
                self.state.replace_profiles(catalog).await;
                return Route::Profiles;
            }
            _ => {}
        }

        let rid = match message.get(RID_FIELD).and_then(Value::as_str) {
            Some(rid) => rid.to_owned(),
            None => return Route::Unmatched,
        };
        if self.correlator.resolve(&rid, message) {
            Route::Reply
        } else {
            debug!(%rid, tp = %tag, "Dropping reply with no pending request");
            Route::Unmatched
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
