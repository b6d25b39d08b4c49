//! Input Sequencer
//!
//! Turns key press/release events into sequenced [`InputCommand`]s at a
//! bounded send rate. Render frames never emit commands; only [`poll`]
//! does, at most once per send interval.
//!
//! [`poll`]: InputSequencer::poll

use std::collections::BTreeMap;
use std::f64::consts::{PI, TAU};

use crate::core::clock::Millis;
use crate::core::physics::MoveIntent;
use crate::game::input::{Action, InputCommand, KeyHold};

/// Camera yaw change per rotation step (radians).
pub const ROTATION_STEP: f64 = PI / 36.0;

/// Produces the client's command stream.
#[derive(Debug, Clone)]
pub struct InputSequencer {
    next_sequence: u64,
    send_interval_ms: u64,
    last_emit: Option<Millis>,
    pressed: BTreeMap<Action, Millis>,
    camera_rotation: f64,
    /// Jump went down since the last emitted command.
    jump_tapped: bool,
    /// Jump was part of the last emitted command.
    jump_was_pressed: bool,
}

impl InputSequencer {
    /// Emit at most `send_rate_hz` commands per second.
    pub fn new(send_rate_hz: u32) -> Self {
        Self {
            next_sequence: 1,
            send_interval_ms: 1000 / u64::from(send_rate_hz.max(1)),
            last_emit: None,
            pressed: BTreeMap::new(),
            camera_rotation: 0.0,
            jump_tapped: false,
            jump_was_pressed: false,
        }
    }

    /// Key went down. Repeats while held are ignored.
    pub fn press(&mut self, action: Action, now: Millis) {
        if self.pressed.contains_key(&action) {
            return;
        }
        self.pressed.insert(action, now);
        if action == Action::Jump {
            self.jump_tapped = true;
        }
    }

    /// Key went up.
    pub fn release(&mut self, action: Action) {
        self.pressed.remove(&action);
    }

    /// Release everything (focus lost, reconnect).
    pub fn release_all(&mut self) {
        self.pressed.clear();
        self.jump_tapped = false;
    }

    /// Check if a key is currently down.
    pub fn is_pressed(&self, action: Action) -> bool {
        self.pressed.contains_key(&action)
    }

    /// Rotate the camera by whole steps (positive turns left).
    pub fn rotate(&mut self, steps: i32) {
        let yaw = self.camera_rotation + f64::from(steps) * ROTATION_STEP;
        // Wrap into [-PI, PI)
        self.camera_rotation = (yaw + PI).rem_euclid(TAU) - PI;
    }

    /// Current camera yaw.
    pub fn camera_rotation(&self) -> f64 {
        self.camera_rotation
    }

    /// Whether the last emitted command carried jump.
    pub fn jump_was_pressed(&self) -> bool {
        self.jump_was_pressed
    }

    /// Sequence the next command will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Intent of the keys held right now, for per-frame prediction.
    pub fn live_intent(&self) -> MoveIntent {
        MoveIntent {
            forward: self.is_pressed(Action::Forward),
            backward: self.is_pressed(Action::Backward),
            left: self.is_pressed(Action::Left),
            right: self.is_pressed(Action::Right),
            jump: self.is_pressed(Action::Jump) || self.jump_tapped,
            sprint: self.is_pressed(Action::Sprint),
            crouch: self.is_pressed(Action::Crouch),
            camera_rotation: self.camera_rotation,
        }
    }

    /// Emit a command if the send interval has elapsed.
    pub fn poll(&mut self, now: Millis) -> Option<InputCommand> {
        match self.last_emit {
            Some(last) if now.saturating_sub(last) < self.send_interval_ms => None,
            _ => Some(self.emit(now)),
        }
    }

    /// Emit a command now, regardless of rate.
    ///
    /// A jump tapped and released between two commands is still carried by
    /// the next one, so short taps are never lost.
    pub fn emit(&mut self, now: Millis) -> InputCommand {
        let mut held_keys: BTreeMap<Action, KeyHold> = self
            .pressed
            .iter()
            .map(|(action, pressed_at)| {
                let hold = KeyHold {
                    pressed_at: *pressed_at,
                    duration: now.saturating_sub(*pressed_at) as f64,
                };
                (*action, hold)
            })
            .collect();

        if self.jump_tapped && !held_keys.contains_key(&Action::Jump) {
            held_keys.insert(Action::Jump, KeyHold { pressed_at: now, duration: 0.0 });
        }
        self.jump_was_pressed = held_keys.contains_key(&Action::Jump);
        self.jump_tapped = false;

        let command = InputCommand {
            sequence: self.next_sequence,
            timestamp: now,
            held_keys,
            camera_rotation: self.camera_rotation,
        };
        self.next_sequence += 1;
        self.last_emit = Some(now);
        command
    }

    /// Start a fresh stream (new server-side player).
    pub fn reset(&mut self) {
        self.next_sequence = 1;
        self.last_emit = None;
        self.release_all();
        self.jump_was_pressed = false;
    }
}
