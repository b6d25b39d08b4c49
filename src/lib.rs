//! # AWorld Movement Sync
//!
//! Shared-space multiplayer movement: one authoritative server simulation,
//! predicted and reconciled local avatars, interpolated remote avatars.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        AWORLD                                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Shared primitives                       │
//! │  ├── vec3.rs       - 3D vector                               │
//! │  ├── physics.rs    - The movement integrator (both sides)    │
//! │  └── clock.rs      - Wall-clock milliseconds                 │
//! │                                                              │
//! │  game/             - Authoritative simulation (no I/O)       │
//! │  ├── input.rs      - Actions, input commands, input queue    │
//! │  ├── state.rs      - Player identity and broadcast state     │
//! │  └── tick.rs       - World, stale filtering, acks, chat      │
//! │                                                              │
//! │  network/          - Server I/O                              │
//! │  ├── protocol.rs   - Wire messages and validation            │
//! │  ├── session.rs    - Per-connection state machine            │
//! │  ├── broadcast.rs  - Snapshot and event fan-out              │
//! │  ├── server.rs     - WebSocket server and tick loop          │
//! │  └── http.rs       - Health, physics, wall display           │
//! │                                                              │
//! │  client/           - Client runtime                          │
//! │  ├── sequencer.rs  - Sequenced, rate-limited input           │
//! │  ├── predictor.rs  - Local prediction                        │
//! │  ├── reconcile.rs  - Correction and replay                   │
//! │  ├── interpolation.rs - Remote entity rendering              │
//! │  ├── transport.rs  - WebSocket client with reconnect         │
//! │  └── session.rs    - Client glue                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Guarantee
//!
//! Client and server run the same [`core::physics::step`] with the same
//! [`PhysicsConfig`]. Applying the same command sequence from the same
//! state yields bit-identical results on both sides, so a client that
//! replays its unacknowledged commands on top of every acknowledgement
//! converges on the server's position.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod client;

// Re-export commonly used types
pub use core::vec3::Vec3;
pub use core::physics::{PhysicsConfig, MoveIntent, MovementState};
pub use game::input::{Action, InputCommand};
pub use game::state::{PlayerId, PlayerState};
pub use game::tick::World;
pub use network::{ClientMessage, ServerMessage, GameServer, ServerConfig};
pub use client::{ClientConfig, ClientSession};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
