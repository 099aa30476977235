use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::MachineMode;

// Outgoing request messages. Serialized tag matches the firmware `tp` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tp")]
pub enum Command {
    #[serde(rename = "req:change-mode")]
    ChangeMode { mode: MachineMode },
    #[serde(rename = "req:process:activate")]
    ProcessActivate,
    #[serde(rename = "req:process:deactivate")]
    ProcessDeactivate,
    #[serde(rename = "req:process:clear")]
    ProcessClear,
    #[serde(rename = "req:raise-temp")]
    RaiseTemp,
    #[serde(rename = "req:lower-temp")]
    LowerTemp,
    #[serde(rename = "req:flush:start")]
    FlushStart,
    #[serde(rename = "req:profiles:list")]
    ListProfiles,
    #[serde(rename = "req:profiles:select")]
    SelectProfile { id: String },
    #[serde(rename = "req:ota-settings")]
    OtaSettings,
    #[serde(rename = "req:history:list")]
    ListHistory,
    // Shot ids come back as numbers or strings depending on firmware
    #[serde(rename = "req:history:delete")]
    DeleteHistoryItem { id: Value },
}

impl Command {
    pub fn to_message(&self) -> serde_json::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(serde::ser::Error::custom("command did not serialize to an object")),
        }
    }
}
