//! Core shared primitives.
//!
//! Everything here is used identically by the server simulator and the
//! client runtime. The integrator in particular is the one movement rule
//! both sides run.

pub mod vec3;
pub mod physics;
pub mod clock;

// Re-export core types
pub use vec3::Vec3;
pub use physics::{PhysicsConfig, PhysicsConfigError, MoveIntent, MovementState, step, simulate};
pub use clock::{Millis, now_millis};
