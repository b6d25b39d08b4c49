//! Player State
//!
//! The authoritative per-player record. Owned by the tick task; everyone
//! else only sees serialized copies of it.

use std::fmt;
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::core::clock::Millis;
use crate::core::physics::MovementState;
use crate::core::vec3::Vec3;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Server-assigned player identifier.
///
/// Serialized as a UUID string. Implements Ord so maps keyed by it iterate
/// in a stable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// First 8 hex characters, for logs.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// Authoritative state of one player, as broadcast to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    /// Session identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Display color (CSS color string, opaque to the server).
    pub color: String,
    /// World position.
    pub position: Vec3,
    /// Vertical velocity (units/tick).
    pub vertical_velocity: f64,
    /// Standing on the ground.
    pub is_grounded: bool,
    /// Highest input sequence applied. Never decreases.
    pub last_processed_sequence: u64,
    /// Current chat bubble text.
    pub chat_message: Option<String>,
    /// When the chat bubble expires (ms since epoch).
    pub chat_expiry: Option<Millis>,
}

impl PlayerState {
    /// Create a freshly joined player.
    pub fn new(id: PlayerId, name: String, color: String, movement: &MovementState) -> Self {
        let mut state = Self {
            id,
            name,
            color,
            position: Vec3::ZERO,
            vertical_velocity: 0.0,
            is_grounded: true,
            last_processed_sequence: 0,
            chat_message: None,
            chat_expiry: None,
        };
        state.sync_movement(movement);
        state
    }

    /// Copy the kinematic fields out of a movement state.
    pub fn sync_movement(&mut self, movement: &MovementState) {
        self.position = movement.position;
        self.vertical_velocity = movement.vertical_velocity;
        self.is_grounded = movement.is_grounded;
    }

    /// Show a chat bubble. Text is truncated to `max_chars` characters.
    pub fn set_chat(&mut self, text: &str, now: Millis, lifetime_ms: u64, max_chars: usize) {
        let text: String = text.chars().take(max_chars).collect();
        self.chat_message = Some(text);
        self.chat_expiry = Some(now.saturating_add(lifetime_ms));
    }

    /// Clear the chat bubble if it has expired. Returns true if cleared.
    pub fn prune_chat(&mut self, now: Millis) -> bool {
        match self.chat_expiry {
            Some(expiry) if expiry <= now => {
                self.chat_message = None;
                self.chat_expiry = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::physics::PhysicsConfig;

    fn player() -> PlayerState {
        let movement = MovementState::at(Vec3::ZERO, &PhysicsConfig::default());
        PlayerState::new(PlayerId::generate(), "ann".into(), "#ff0000".into(), &movement)
    }

    #[test]
    fn test_player_id_serializes_as_string() {
        let id = PlayerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(PlayerId::from_uuid_str(&id.to_string()), Some(id));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn test_chat_truncates_and_expires() {
        let mut p = player();
        let long = "é".repeat(200);
        p.set_chat(&long, 1_000, 15_000, 120);

        assert_eq!(p.chat_message.as_ref().unwrap().chars().count(), 120);
        assert_eq!(p.chat_expiry, Some(16_000));

        assert!(!p.prune_chat(15_999));
        assert!(p.prune_chat(16_000));
        assert!(p.chat_message.is_none());
        assert!(p.chat_expiry.is_none());
    }

    #[test]
    fn test_camel_case_fields() {
        let json = serde_json::to_value(player()).unwrap();
        assert!(json.get("lastProcessedSequence").is_some());
        assert!(json.get("isGrounded").is_some());
        assert!(json.get("verticalVelocity").is_some());
        assert!(json.get("chatMessage").is_some());
    }
}
