//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`.
//!
//! Inbound frames are decoded exactly once, here, into [`ClientRequest`].
//! Anything that fails to decode or validate is rejected as a whole and never
//! reaches the simulation.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};

use crate::core::clock::Millis;
use crate::core::vec3::Vec3;
use crate::game::input::{InputCommand, KeyHold, SimulationError};
use crate::game::state::{PlayerId, PlayerState};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the world.
    PlayerJoin(JoinRequest),

    /// Sequenced input sample.
    PlayerInput(InputPayload),

    /// Direct position push (legacy clients).
    PlayerMove(MovePayload),

    /// Chat bubble text.
    ChatMessage(ChatPayload),

    /// RTT ping, echoed by the server.
    Ping { timestamp: Millis },
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Display color.
    #[serde(default)]
    pub color: String,
}

/// Input command as sent on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPayload {
    /// Per-connection sequence number.
    pub sequence: u64,
    /// Client wall clock (ms).
    pub timestamp: Millis,
    /// Held keys by name.
    #[serde(default)]
    pub held_keys: BTreeMap<String, KeyHold>,
    /// Camera yaw (radians).
    #[serde(default)]
    pub camera_rotation: f64,
}

impl From<&InputCommand> for InputPayload {
    fn from(command: &InputCommand) -> Self {
        Self {
            sequence: command.sequence,
            timestamp: command.timestamp,
            held_keys: command.wire_keys(),
            camera_rotation: command.camera_rotation,
        }
    }
}

/// Legacy position push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovePayload {
    /// Client-claimed position.
    pub position: Vec3,
}

/// Chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Message text.
    pub text: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join succeeded; carries the joiner's own state.
    JoinAccepted { player: PlayerState },

    /// Join refused; the connection stays unjoined.
    JoinError { error: String },

    /// Another player joined.
    PlayerJoined { player: PlayerState },

    /// Everyone present at join time (sent to the joiner).
    CurrentPlayers { players: Vec<PlayerState> },

    /// Full world snapshot on the broadcast cadence.
    GlobalStateUpdate(StateUpdate),

    /// Authoritative acknowledgement of the newest applied input.
    ServerPositionUpdate(PositionUpdate),

    /// Active player count changed.
    PlayerCountUpdate { count: usize },

    /// A player left.
    PlayerDisconnected { id: PlayerId, name: String },

    /// Shared display content.
    WallDisplayUpdate { content: String },

    /// RTT ping echo.
    Ping {
        timestamp: Millis,
        #[serde(rename = "serverTime")]
        server_time: Millis,
    },
}

/// World snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Server wall clock when the snapshot was taken (ms).
    pub server_time: Millis,
    /// Every active player.
    pub players: Vec<PlayerState>,
}

/// Input acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    /// Sequence of the last applied command.
    pub sequence: u64,
    /// Client timestamp of that command (echoed).
    pub timestamp: Millis,
    /// Authoritative position.
    pub position: Vec3,
    /// Authoritative velocity (units/tick).
    pub velocity: Vec3,
    /// Grounded flag.
    pub is_grounded: bool,
}

impl ServerMessage {
    /// Whether losing this message would leave the client inconsistent.
    ///
    /// Snapshots, acks and ping echoes are superseded by the next one and may
    /// be skipped under backpressure.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            ServerMessage::GlobalStateUpdate(_)
                | ServerMessage::ServerPositionUpdate(_)
                | ServerMessage::Ping { .. }
        )
    }

    /// Wire event name, for logs.
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::JoinAccepted { .. } => "join_accepted",
            ServerMessage::JoinError { .. } => "join_error",
            ServerMessage::PlayerJoined { .. } => "player_joined",
            ServerMessage::CurrentPlayers { .. } => "current_players",
            ServerMessage::GlobalStateUpdate(_) => "global_state_update",
            ServerMessage::ServerPositionUpdate(_) => "server_position_update",
            ServerMessage::PlayerCountUpdate { .. } => "player_count_update",
            ServerMessage::PlayerDisconnected { .. } => "player_disconnected",
            ServerMessage::WallDisplayUpdate { .. } => "wall_display_update",
            ServerMessage::Ping { .. } => "ping",
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame is not a known message.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Join request refused.
    #[error("{0}")]
    InvalidJoin(String),

    /// Payload failed validation.
    #[error("Invalid payload: {0}")]
    Invalid(#[from] SimulationError),
}

/// Limits applied while validating inbound messages.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolLimits {
    /// Max display name length (chars).
    pub max_name_len: usize,
    /// Max display color length (chars).
    pub max_color_len: usize,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_name_len: 32,
            max_color_len: 32,
        }
    }
}

/// A decoded and validated client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Join with trimmed, non-blank name and color.
    Join { name: String, color: String },
    /// Validated input command.
    Input(InputCommand),
    /// Legacy position push with finite coordinates.
    LegacyMove(Vec3),
    /// Chat text (length is enforced by the simulator).
    Chat(String),
    /// RTT ping.
    Ping(Millis),
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Validate into a request the server can act on.
    pub fn validate(self, limits: &ProtocolLimits) -> Result<ClientRequest, ProtocolError> {
        match self {
            ClientMessage::PlayerJoin(join) => {
                let name = join.name.trim();
                let color = join.color.trim();
                if name.is_empty() || color.is_empty() {
                    return Err(ProtocolError::InvalidJoin("Missing name or color".into()));
                }
                if name.chars().count() > limits.max_name_len {
                    return Err(ProtocolError::InvalidJoin(format!(
                        "Name longer than {} characters",
                        limits.max_name_len
                    )));
                }
                if color.chars().count() > limits.max_color_len {
                    return Err(ProtocolError::InvalidJoin("Invalid color".into()));
                }
                Ok(ClientRequest::Join {
                    name: name.to_string(),
                    color: color.to_string(),
                })
            }
            ClientMessage::PlayerInput(input) => {
                let command = InputCommand::from_wire(
                    input.sequence,
                    input.timestamp,
                    &input.held_keys,
                    input.camera_rotation,
                )?;
                Ok(ClientRequest::Input(command))
            }
            ClientMessage::PlayerMove(mv) => {
                if !mv.position.is_finite() {
                    return Err(SimulationError::NonFinite("position").into());
                }
                Ok(ClientRequest::LegacyMove(mv.position))
            }
            ClientMessage::ChatMessage(chat) => Ok(ClientRequest::Chat(chat.text)),
            ClientMessage::Ping { timestamp } => Ok(ClientRequest::Ping(timestamp)),
        }
    }

    /// Decode and validate a text frame.
    pub fn decode(text: &str, limits: &ProtocolLimits) -> Result<ClientRequest, ProtocolError> {
        Self::from_json(text)?.validate(limits)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
