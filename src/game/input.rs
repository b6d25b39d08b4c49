//! Input Commands
//!
//! The validated, sequenced input unit consumed by both the server simulator
//! and the client predictor, plus the bounded per-connection queue the tick
//! task drains.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};

use crate::core::clock::Millis;
use crate::core::physics::MoveIntent;

// =============================================================================
// ACTIONS
// =============================================================================

/// Logical input action.
///
/// Ordered so `BTreeMap<Action, _>` iterates in a stable order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Move along camera forward.
    Forward,
    /// Move against camera forward.
    Backward,
    /// Strafe left.
    Left,
    /// Strafe right.
    Right,
    /// Jump (edge triggered).
    Jump,
    /// Sprint modifier.
    Sprint,
    /// Crouch modifier.
    Crouch,
}

impl Action {
    /// Every action, in key order.
    pub const ALL: [Action; 7] = [
        Action::Forward,
        Action::Backward,
        Action::Left,
        Action::Right,
        Action::Jump,
        Action::Sprint,
        Action::Crouch,
    ];

    /// Wire name of this action.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Forward => "forward",
            Action::Backward => "backward",
            Action::Left => "left",
            Action::Right => "right",
            Action::Jump => "jump",
            Action::Sprint => "sprint",
            Action::Crouch => "crouch",
        }
    }
}

impl FromStr for Action {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| SimulationError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a key has been held.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyHold {
    /// Wall-clock time the key went down (ms).
    pub pressed_at: Millis,
    /// Time held so far (ms).
    pub duration: f64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Reasons a command or a direct position update is refused by the simulator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationError {
    /// Key name outside the known action set.
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// A numeric field was NaN or infinite.
    #[error("Non-finite value in {0}")]
    NonFinite(&'static str),

    /// A value was outside its accepted range.
    #[error("Out of range: {0}")]
    OutOfRange(&'static str),

    /// The player is not part of the world.
    #[error("Unknown player")]
    UnknownPlayer,
}

// =============================================================================
// INPUT COMMAND
// =============================================================================

/// One sequenced input sample.
///
/// Produced by the client sequencer, applied exactly once by the server
/// simulator and once by the client predictor.
#[derive(Clone, Debug, PartialEq)]
pub struct InputCommand {
    /// Strictly increasing per connection.
    pub sequence: u64,
    /// Client wall clock when the command was produced (ms).
    pub timestamp: Millis,
    /// Keys held at the sample point.
    pub held_keys: BTreeMap<Action, KeyHold>,
    /// Camera yaw (radians).
    pub camera_rotation: f64,
}

impl InputCommand {
    /// Validate raw wire fields into a command.
    ///
    /// Fails closed: one unknown key or one non-finite number rejects the
    /// whole command.
    pub fn from_wire(
        sequence: u64,
        timestamp: Millis,
        held_keys: &BTreeMap<String, KeyHold>,
        camera_rotation: f64,
    ) -> Result<Self, SimulationError> {
        if !camera_rotation.is_finite() {
            return Err(SimulationError::NonFinite("cameraRotation"));
        }

        let mut keys = BTreeMap::new();
        for (name, hold) in held_keys {
            let action: Action = name.parse()?;
            if !hold.duration.is_finite() {
                return Err(SimulationError::NonFinite("heldKeys.duration"));
            }
            if hold.duration < 0.0 {
                return Err(SimulationError::OutOfRange("heldKeys.duration"));
            }
            keys.insert(action, *hold);
        }

        Ok(Self {
            sequence,
            timestamp,
            held_keys: keys,
            camera_rotation,
        })
    }

    /// Wire form of the held keys.
    pub fn wire_keys(&self) -> BTreeMap<String, KeyHold> {
        self.held_keys
            .iter()
            .map(|(action, hold)| (action.as_str().to_string(), *hold))
            .collect()
    }

    /// Check if an action is held.
    #[inline]
    pub fn is_held(&self, action: Action) -> bool {
        self.held_keys.contains_key(&action)
    }

    /// Movement intent for the integrator.
    pub fn intent(&self) -> MoveIntent {
        MoveIntent {
            forward: self.is_held(Action::Forward),
            backward: self.is_held(Action::Backward),
            left: self.is_held(Action::Left),
            right: self.is_held(Action::Right),
            jump: self.is_held(Action::Jump),
            sprint: self.is_held(Action::Sprint),
            crouch: self.is_held(Action::Crouch),
            camera_rotation: self.camera_rotation,
        }
    }
}

// =============================================================================
// INPUT QUEUE
// =============================================================================

/// Bounded FIFO of commands waiting for the next tick.
///
/// On overflow the oldest command is dropped.
#[derive(Debug)]
pub struct InputQueue {
    commands: VecDeque<InputCommand>,
    capacity: usize,
    dropped: u64,
}

impl InputQueue {
    /// Create an empty queue. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            commands: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue a command. Returns the evicted command if the queue was full.
    pub fn push(&mut self, command: InputCommand) -> Option<InputCommand> {
        let evicted = if self.commands.len() >= self.capacity {
            self.dropped += 1;
            self.commands.pop_front()
        } else {
            None
        };
        self.commands.push_back(command);
        evicted
    }

    /// Take every queued command, oldest first.
    pub fn drain(&mut self) -> Vec<InputCommand> {
        self.commands.drain(..).collect()
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands evicted by overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
