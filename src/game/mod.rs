//! Game Logic Module
//!
//! Authoritative simulation, free of I/O.
//!
//! ## Module Structure
//!
//! - `input`: Actions, sequenced input commands, bounded input queue
//! - `state`: Player identity and broadcast state
//! - `tick`: The world, command application, legacy moves, chat

pub mod input;
pub mod state;
pub mod tick;

// Re-export key types
pub use input::{Action, KeyHold, InputCommand, InputQueue, SimulationError};
pub use state::{PlayerId, PlayerState};
pub use tick::{World, TickResult, InputAck, PlayerSim};
