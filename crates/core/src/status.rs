use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::MachineMode;

/// A full `evt:status` payload as last pushed by the machine.
///
/// Kept as the raw field map; the helpers below only interpret it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(Map<String, Value>);

impl Status {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn current_temperature(&self) -> Option<f64> {
        number(self.0.get("ct"))
    }

    pub fn target_temperature(&self) -> Option<f64> {
        number(self.0.get("tt"))
    }

    pub fn mode(&self) -> Option<MachineMode> {
        let raw = self.0.get("m")?.as_u64()?;
        u8::try_from(raw).ok().and_then(|m| MachineMode::try_from(m).ok())
    }

    pub fn selected_profile(&self) -> Option<&str> {
        self.0.get("p").and_then(Value::as_str)
    }

    pub fn scale_connected(&self) -> Option<bool> {
        self.0.get("bc").and_then(Value::as_bool)
    }

    /// Scale weight; only meaningful while a scale is connected.
    pub fn current_weight(&self) -> Option<f64> {
        if self.scale_connected() != Some(true) {
            return None;
        }
        number(self.0.get("cw"))
    }

    pub fn current_pressure(&self) -> Option<f64> {
        number(self.0.get("pr"))
    }

    pub fn target_pressure(&self) -> Option<f64> {
        number(self.0.get("pt"))
    }

    pub fn pump_flow(&self) -> Option<f64> {
        number(self.0.get("fl"))
    }

    pub fn target_volume(&self) -> Option<f64> {
        number(self.0.get("tw"))
    }

    pub fn process(&self) -> Option<&Map<String, Value>> {
        self.0.get("process").and_then(Value::as_object)
    }

    /// Progress of a running volumetric shot; `None` for time based processes.
    pub fn shot_volume_progress(&self) -> Option<f64> {
        let process = self.process()?;
        if process.get("tt").and_then(Value::as_str) != Some("volumetric") {
            return None;
        }
        number(process.get("pp"))
    }
}

/// Firmware and hardware metadata from `res:ota-settings`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OtaSettings(Map<String, Value>);

impl OtaSettings {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn hardware(&self) -> Option<&str> {
        self.0.get("hardware").and_then(Value::as_str)
    }

    pub fn display_version(&self) -> Option<&str> {
        self.0.get("displayVersion").and_then(Value::as_str)
    }

    pub fn controller_version(&self) -> Option<&str> {
        self.0.get("controllerVersion").and_then(Value::as_str)
    }

    pub fn latest_version(&self) -> Option<&str> {
        self.0.get("latestVersion").and_then(Value::as_str)
    }

    pub fn display_update_available(&self) -> Option<bool> {
        self.0.get("displayUpdateAvailable").and_then(Value::as_bool)
    }

    pub fn controller_update_available(&self) -> Option<bool> {
        self.0.get("controllerUpdateAvailable").and_then(Value::as_bool)
    }
}

/// Profile label to profile id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileCatalog(BTreeMap<String, String>);

impl ProfileCatalog {
    /// Build from a `res:profiles:list` message, skipping entries without a label or id.
    pub fn from_reply(message: &Map<String, Value>) -> Self {
        let mut profiles = BTreeMap::new();
        let entries = message.get("profiles").and_then(Value::as_array);
        for entry in entries.into_iter().flatten() {
            let label = entry.get("label").and_then(Value::as_str).filter(|s| !s.is_empty());
            let id = match entry.get("id") {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            };
            if let (Some(label), Some(id)) = (label, id) {
                profiles.insert(label.to_string(), id);
            }
        }
        Self(profiles)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn id_for(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
