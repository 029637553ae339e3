//! WebSocket protocol message definitions
//! Every frame is a `{header, payload}` envelope; the header's `type` selects the payload shape.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::physics::Termination;

/// Protocol version spoken by this server
pub const PROTOCOL_VERSION: &str = "1.0";

/// Longest display name accepted in `join_mode`
pub const MAX_NAME_LEN: usize = 32;

/// Per-session control classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    /// Watches broadcasts, owns no ship
    Observer,
    /// Ship driven by keyboard input
    Manual,
    /// Ship driven by an uploaded policy
    Model,
}

impl Default for ControlMode {
    fn default() -> Self {
        Self::Observer
    }
}

/// Envelope header, identical in both directions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub version: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Server tick at time of send
    #[serde(default)]
    pub tick: u64,
    /// Unix time in seconds
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Serialize)]
struct Envelope<'a, P: Serialize> {
    header: Header,
    payload: &'a P,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    header: Header,
    #[serde(default)]
    payload: serde_json::Value,
}

// ============================================================================
// Client -> server
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMsg {
    /// Take control of a ship, manually or with a policy
    JoinMode {
        mode: ControlMode,
        name: Option<String>,
    },
    /// Base64-encoded policy artifact
    ModelUpload { model_base64: String },
    /// Manual input for the next tick
    ManualAction { turn: f64, thrust: f64 },
    /// Give up the ship and go back to observing
    CancelControl,
}

#[derive(Deserialize)]
struct JoinModePayload {
    mode: ControlMode,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct ModelUploadPayload {
    #[serde(rename = "modelBase64")]
    model_base64: String,
}

#[derive(Deserialize)]
struct ManualActionPayload {
    turn: f64,
    thrust: f64,
}

impl ClientMsg {
    /// Parse and validate one inbound text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

        if raw.header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(raw.header.version));
        }

        match raw.header.kind.as_str() {
            "join_mode" => {
                let p: JoinModePayload = payload("join_mode", raw.payload)?;
                if p.mode == ControlMode::Observer {
                    return Err(ProtocolError::InvalidValue(
                        "mode must be \"manual\" or \"model\"",
                    ));
                }
                let name = p
                    .name
                    .map(|n| n.trim().chars().take(MAX_NAME_LEN).collect::<String>())
                    .filter(|n| !n.is_empty());
                Ok(ClientMsg::JoinMode { mode: p.mode, name })
            }
            "model_upload" => {
                let p: ModelUploadPayload = payload("model_upload", raw.payload)?;
                Ok(ClientMsg::ModelUpload {
                    model_base64: p.model_base64,
                })
            }
            "manual_action" => {
                let p: ManualActionPayload = payload("manual_action", raw.payload)?;
                if !p.turn.is_finite() || !p.thrust.is_finite() {
                    return Err(ProtocolError::InvalidValue("turn and thrust must be finite"));
                }
                Ok(ClientMsg::ManualAction {
                    turn: p.turn,
                    thrust: p.thrust,
                })
            }
            "cancel_control" => Ok(ClientMsg::CancelControl),
            "" => Err(ProtocolError::MissingType),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn payload<T: DeserializeOwned>(
    kind: &'static str,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

/// Rejected inbound frames. Reported to the sender only.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Missing message type")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("Binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    /// Stable machine-readable code for `error` responses
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed_envelope",
            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
            ProtocolError::MissingType => "missing_type",
            ProtocolError::UnknownType(_) => "unknown_type",
            ProtocolError::InvalidPayload { .. } => "invalid_payload",
            ProtocolError::InvalidValue(_) => "invalid_value",
            ProtocolError::BinaryFrame => "binary_frame",
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerMsg {
    /// Mode change accepted
    ModeConfirmed {
        mode: ControlMode,
        ship_id: Option<Uuid>,
    },

    /// Prompt for manual input, sent each tick to manual pilots
    ActionRequest {},

    /// Outcome of a `model_upload`
    ModelUploadResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Full world snapshot, broadcast every tick
    StateUpdate(StateUpdate),

    /// Rejected request
    Error { code: String, message: String },
}

impl ServerMsg {
    /// Header `type` tag for this payload
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMsg::ModeConfirmed { .. } => "mode_confirmed",
            ServerMsg::ActionRequest {} => "action_request",
            ServerMsg::ModelUploadResponse { .. } => "model_upload_response",
            ServerMsg::StateUpdate(_) => "state_update",
            ServerMsg::Error { .. } => "error",
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Wrap in an envelope and serialize to a text frame
    pub fn encode(&self, tick: u64, timestamp: f64) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            header: Header {
                version: PROTOCOL_VERSION.to_string(),
                kind: self.kind().to_string(),
                tick,
                timestamp,
            },
            payload: self,
        })
    }
}

/// `state_update` payload
#[derive(Debug, Clone, Serialize)]
pub struct StateUpdate {
    pub tick: u64,
    pub ships: Vec<ShipSnapshot>,
    pub leaderboard: Vec<LeaderboardEntry>,
    /// Recent positions per ship, oldest first
    pub trails: HashMap<Uuid, Vec<[f64; 2]>>,
}

/// Public state of one ship
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipSnapshot {
    pub id: Uuid,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    /// Heading in radians
    pub heading: f64,
    pub alive: bool,
    pub survived_ticks: u64,
    /// Whether a session still controls this ship
    pub owned: bool,
    /// Set once the ship has crashed or escaped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Termination>,
}

/// Leaderboard row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardEntry {
    pub id: Uuid,
    pub name: String,
    pub steps: u64,
    pub alive: bool,
}
