use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::Request;

pub const EVENT_DEPLOY: &str = "deploy";
pub const EVENT_DEPLOYED: &str = "deployed";
pub const EVENT_REQUEST: &str = "request";
pub const EVENT_TEST_NETWORK: &str = "test-network";
pub const EVENT_SCRIPTS_UPDATED: &str = "scripts-updated";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_UPDATE_AVAILABLE: &str = "update-available";

/// Envelope for every text frame on the controller socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default)]
        payload: Value,
    },
    Ack {
        id: u64,
        #[serde(default)]
        payload: Value,
    },
    Ping,
    Pong,
}

impl Frame {
    pub fn event<T: Serialize>(
        event: &str,
        id: Option<u64>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Frame::Event {
            event: event.to_string(),
            id,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn ack<T: Serialize>(id: u64, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Frame::Ack {
            id,
            payload: serde_json::to_value(payload)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub version: String,
    pub os: String,
    pub arch: String,
    pub scripts_loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedPayload {
    pub repeater_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkTestType {
    Ping,
    Traceroute,
}

impl NetworkTestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkTestType::Ping => "ping",
            NetworkTestType::Traceroute => "traceroute",
        }
    }
}

/// Targets for a network test: one host, or a list of URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkTestInput {
    Single(String),
    Many(Vec<String>),
}

impl NetworkTestInput {
    pub fn targets(&self) -> Vec<&str> {
        match self {
            NetworkTestInput::Single(target) => vec![target.as_str()],
            NetworkTestInput::Many(targets) => targets.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTestPayload {
    #[serde(rename = "type")]
    pub kind: NetworkTestType,
    pub input: NetworkTestInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkTestResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Script source text: either one script for every host, or a map from
/// host wildcard to script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptSource {
    Single(String),
    ByHost(BTreeMap<String, String>),
}

impl ScriptSource {
    /// Flattens to `(host wildcard, code)` pairs; a single script
    /// applies to every host.
    pub fn into_entries(self) -> Vec<(String, String)> {
        match self {
            ScriptSource::Single(code) => vec![("*".to_string(), code)],
            ScriptSource::ByHost(map) => map.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptsUpdatedPayload {
    pub script: ScriptSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAvailablePayload {
    pub version: String,
}

/// Controller-originated events the repeater understands.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Deployed(DeployedPayload),
    Request(Request),
    TestNetwork(NetworkTestPayload),
    ScriptsUpdated(ScriptsUpdatedPayload),
    Error(ErrorPayload),
    UpdateAvailable(UpdateAvailablePayload),
}

impl InboundEvent {
    /// Decodes a named event payload. Unknown event names yield `Ok(None)`.
    pub fn decode(event: &str, payload: Value) -> Result<Option<Self>, serde_json::Error> {
        let decoded = match event {
            EVENT_DEPLOYED => InboundEvent::Deployed(serde_json::from_value(payload)?),
            EVENT_REQUEST => InboundEvent::Request(serde_json::from_value(payload)?),
            EVENT_TEST_NETWORK => InboundEvent::TestNetwork(serde_json::from_value(payload)?),
            EVENT_SCRIPTS_UPDATED => {
                InboundEvent::ScriptsUpdated(serde_json::from_value(payload)?)
            }
            EVENT_ERROR => InboundEvent::Error(serde_json::from_value(payload)?),
            EVENT_UPDATE_AVAILABLE => {
                InboundEvent::UpdateAvailable(serde_json::from_value(payload)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Deployed(_) => EVENT_DEPLOYED,
            InboundEvent::Request(_) => EVENT_REQUEST,
            InboundEvent::TestNetwork(_) => EVENT_TEST_NETWORK,
            InboundEvent::ScriptsUpdated(_) => EVENT_SCRIPTS_UPDATED,
            InboundEvent::Error(_) => EVENT_ERROR,
            InboundEvent::UpdateAvailable(_) => EVENT_UPDATE_AVAILABLE,
        }
    }
}
