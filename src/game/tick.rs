//! Authoritative Simulation
//!
//! The world owned by the tick task. Every mutation of player state goes
//! through here:
//!
//! - sequenced input commands, applied once each in ascending order
//! - the legacy direct-position path, corrected by the ground/gravity rules
//! - chat bubbles and their expiry
//!
//! Nothing in this module performs I/O, so it runs identically in tests and
//! behind the network layer.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error};

use crate::core::clock::Millis;
use crate::core::physics::{step, MoveIntent, MovementState, PhysicsConfig};
use crate::core::vec3::Vec3;
use crate::game::input::{InputCommand, SimulationError};
use crate::game::state::{PlayerId, PlayerState};

/// Client-reported height above ground that counts as a jump on the legacy path.
pub const LEGACY_JUMP_THRESHOLD: f64 = 0.01;

/// Authoritative acknowledgement of the newest command applied for a player.
#[derive(Clone, Debug, PartialEq)]
pub struct InputAck {
    /// Player the ack belongs to.
    pub player_id: PlayerId,
    /// Sequence of the last applied command.
    pub sequence: u64,
    /// Client timestamp of that command (echoed).
    pub timestamp: Millis,
    /// Authoritative position after applying it.
    pub position: Vec3,
    /// Authoritative velocity after applying it.
    pub velocity: Vec3,
    /// Grounded after applying it.
    pub is_grounded: bool,
}

/// Result of one tick.
#[derive(Debug, Default)]
pub struct TickResult {
    /// One ack per player that advanced this tick.
    pub acks: Vec<InputAck>,
    /// Commands applied across all players.
    pub applied: usize,
    /// Commands dropped as stale or duplicate.
    pub stale: usize,
    /// Commands addressed to players no longer in the world.
    pub orphaned: usize,
    /// Players whose processing panicked. Their state was left untouched.
    pub failed: Vec<PlayerId>,
}

/// Per-player simulation record.
#[derive(Clone, Debug)]
pub struct PlayerSim {
    /// Broadcast view.
    pub state: PlayerState,
    /// Full kinematic state (horizontal velocity, jump latch).
    pub movement: MovementState,
}

/// Outcome of applying a batch to one player.
#[derive(Debug, Default, PartialEq)]
pub struct BatchOutcome {
    /// Ack for the newest applied command, if any was applied.
    pub ack: Option<InputAck>,
    /// Commands applied.
    pub applied: usize,
    /// Commands dropped as stale or duplicate.
    pub stale: usize,
}

/// Apply a batch of commands to one player's kinematic state.
///
/// Commands are applied in ascending sequence order; anything at or below
/// `last_processed` (including duplicates inside the batch) is dropped.
/// Returns the new movement state, the new last processed sequence and the
/// last applied command's timestamp.
pub fn apply_commands(
    config: &PhysicsConfig,
    movement: &MovementState,
    last_processed: u64,
    mut commands: Vec<InputCommand>,
) -> (MovementState, u64, Option<Millis>, usize, usize) {
    commands.sort_by_key(|c| c.sequence);

    let dt = config.fixed_dt();
    let mut state = *movement;
    let mut last = last_processed;
    let mut timestamp = None;
    let mut applied = 0;
    let mut stale = 0;

    for command in &commands {
        if command.sequence <= last {
            stale += 1;
            continue;
        }
        state = step(config, &state, &command.intent(), dt);
        last = command.sequence;
        timestamp = Some(command.timestamp);
        applied += 1;
    }

    (state, last, timestamp, applied, stale)
}

/// The authoritative world.
#[derive(Clone, Debug)]
pub struct World {
    config: PhysicsConfig,
    players: BTreeMap<PlayerId, PlayerSim>,
    spawn_point: Vec3,
    tick: u64,
    processed_inputs: u64,
    #[cfg(test)]
    faulted: Option<PlayerId>,
}

impl World {
    /// Create an empty world.
    pub fn new(config: PhysicsConfig) -> Self {
        Self {
            config,
            players: BTreeMap::new(),
            spawn_point: Vec3::new(0.0, config.ground_level, 0.0),
            tick: 0,
            processed_inputs: 0,
            #[cfg(test)]
            faulted: None,
        }
    }

    /// Shared physics constants.
    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    /// Ticks run so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Commands applied so far.
    pub fn processed_inputs(&self) -> u64 {
        self.processed_inputs
    }

    /// Active player count.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Look up a player.
    pub fn get(&self, id: &PlayerId) -> Option<&PlayerSim> {
        self.players.get(id)
    }

    /// Add a player at the spawn point.
    pub fn add_player(&mut self, id: PlayerId, name: String, color: String) -> PlayerState {
        let movement = MovementState::at(self.spawn_point, &self.config);
        let state = PlayerState::new(id, name, color, &movement);
        self.players.insert(id, PlayerSim { state: state.clone(), movement });
        debug!("Player {} spawned at {}", id.short(), self.spawn_point);
        state
    }

    /// Remove a player entirely.
    pub fn remove_player(&mut self, id: &PlayerId) -> Option<PlayerState> {
        self.players.remove(id).map(|sim| sim.state)
    }

    /// Apply queued commands for one player.
    pub fn apply_inputs(
        &mut self,
        id: &PlayerId,
        commands: Vec<InputCommand>,
    ) -> Result<BatchOutcome, SimulationError> {
        let config = self.config;
        let sim = self.players.get_mut(id).ok_or(SimulationError::UnknownPlayer)?;

        let (movement, last, timestamp, applied, stale) = apply_commands(
            &config,
            &sim.movement,
            sim.state.last_processed_sequence,
            commands,
        );

        sim.movement = movement;
        sim.state.sync_movement(&movement);
        sim.state.last_processed_sequence = last;
        self.processed_inputs += applied as u64;

        let ack = timestamp.map(|timestamp| InputAck {
            player_id: *id,
            sequence: last,
            timestamp,
            position: movement.position,
            velocity: movement.velocity(),
            is_grounded: movement.is_grounded,
        });

        Ok(BatchOutcome { ack, applied, stale })
    }

    /// Run one tick over every player's pending commands.
    ///
    /// A panic while processing one player is contained: that player's
    /// state is left as it was and the remaining players still advance.
    pub fn run_tick(&mut self, mut inputs: BTreeMap<PlayerId, Vec<InputCommand>>) -> TickResult {
        self.tick += 1;
        let mut result = TickResult::default();

        let ids: Vec<PlayerId> = self.players.keys().copied().collect();
        for id in ids {
            let commands = match inputs.remove(&id) {
                Some(commands) if !commands.is_empty() => commands,
                _ => continue,
            };

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.check_fault(&id);
                self.apply_inputs(&id, commands)
            }));
            match outcome {
                Ok(Ok(outcome)) => {
                    result.applied += outcome.applied;
                    result.stale += outcome.stale;
                    if let Some(ack) = outcome.ack {
                        result.acks.push(ack);
                    }
                }
                Ok(Err(e)) => {
                    debug!("Inputs for {} skipped: {}", id.short(), e);
                }
                Err(_) => {
                    error!("Simulation panicked for player {}, skipping", id.short());
                    result.failed.push(id);
                }
            }
        }

        result.orphaned = inputs.values().map(Vec::len).sum();
        result
    }

    /// Make every later tick panic while processing `id`.
    #[cfg(test)]
    pub(crate) fn fault_player(&mut self, id: PlayerId) {
        self.faulted = Some(id);
    }

    #[cfg(test)]
    fn check_fault(&self, id: &PlayerId) {
        if self.faulted == Some(*id) {
            panic!("injected fault for {}", id.short());
        }
    }

    #[cfg(not(test))]
    fn check_fault(&self, _id: &PlayerId) {}

    /// Apply a client-pushed position (legacy path).
    ///
    /// Horizontal position is taken from the client after validation; the
    /// height is never trusted and follows the same jump/gravity rules as
    /// the integrator. A reported height above the ground while standing
    /// counts as a jump.
    pub fn apply_legacy_move(&mut self, id: &PlayerId, position: Vec3) -> Result<&PlayerState, SimulationError> {
        if !position.is_finite() {
            return Err(SimulationError::NonFinite("position"));
        }
        let bound = self.config.world_bound;
        if position.x.abs() > bound || position.z.abs() > bound {
            return Err(SimulationError::OutOfRange("position"));
        }

        let config = self.config;
        let sim = self.players.get_mut(id).ok_or(SimulationError::UnknownPlayer)?;

        let wants_jump = sim.movement.is_grounded
            && position.y > config.ground_level + LEGACY_JUMP_THRESHOLD;

        let mut current = sim.movement;
        current.position.x = position.x;
        current.position.z = position.z;
        current.horizontal_velocity = Vec3::ZERO;
        current.jump_held = false;

        let intent = MoveIntent { jump: wants_jump, ..Default::default() };
        let mut next = step(&config, &current, &intent, config.fixed_dt());
        next.jump_held = false;

        sim.movement = next;
        sim.state.sync_movement(&next);
        Ok(&sim.state)
    }

    /// Set a player's chat bubble.
    pub fn set_chat(
        &mut self,
        id: &PlayerId,
        text: &str,
        now: Millis,
        lifetime_ms: u64,
        max_chars: usize,
    ) -> Result<(), SimulationError> {
        let sim = self.players.get_mut(id).ok_or(SimulationError::UnknownPlayer)?;
        sim.state.set_chat(text, now, lifetime_ms, max_chars);
        Ok(())
    }

    /// Clear expired chat bubbles. Returns how many were cleared.
    pub fn prune_chats(&mut self, now: Millis) -> usize {
        let mut cleared = 0;
        for sim in self.players.values_mut() {
            if sim.state.prune_chat(now) {
                cleared += 1;
            }
        }
        cleared
    }

    /// Copy of every active player's state, in id order.
    pub fn snapshot(&self) -> Vec<PlayerState> {
        self.players.values().map(|sim| sim.state.clone()).collect()
    }
}
