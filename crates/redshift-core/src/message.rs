//! The tap-to-target wire protocol: newline-delimited JSON on stdin,
//! one message per line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single line of the input protocol. `#[serde(tag = "type")]`
/// dispatches on the `type` field; an unrecognized value fails to
/// deserialize, which the message loop turns into a `ProtocolError`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum TapMessage {
    #[serde(rename = "SCHEMA")]
    Schema(SchemaMessage),
    #[serde(rename = "RECORD")]
    Record(RecordMessage),
    #[serde(rename = "STATE")]
    State(StateMessage),
    #[serde(rename = "ACTIVATE_VERSION")]
    ActivateVersion(ActivateVersionMessage),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaMessage {
    pub stream: String,
    pub schema: Value,
    #[serde(default)]
    pub key_properties: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecordMessage {
    pub stream: String,
    pub record: Value,
    #[serde(default)]
    pub time_extracted: Option<String>,
    #[serde(default)]
    pub version: Option<i64>,
}

/// The checkpoint payload is forwarded verbatim; the engine never
/// interprets `value`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateMessage {
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActivateVersionMessage {
    pub stream: String,
    pub version: i64,
}
