//! Movement Integrator
//!
//! The single movement step shared by the client predictor and the server
//! simulator. Both sides call [`step`] with the same [`PhysicsConfig`] and
//! the same fixed `dt`, so identical command streams produce identical
//! trajectories.
//!
//! ## Units
//!
//! Speeds and accelerations are expressed per *reference tick*
//! (`1 / tick_rate` seconds). `dt` is in seconds and is converted to a tick
//! fraction `s = dt * tick_rate`; the server and the recorded predictions
//! always use `s = 1`.
//!
//! ## Vertical motion
//!
//! Gravity is integrated exactly for a constant acceleration
//! (`y += vy*s - g*s²/2`), so a jump with velocity `v0` lands after
//! `2*v0/g` ticks.

use serde::{Serialize, Deserialize};

use crate::core::vec3::Vec3;

/// Shared physics constants.
///
/// Served to clients over HTTP so neither side hardcodes them.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhysicsConfig {
    /// Reference tick rate (Hz). Per-tick constants below refer to this rate.
    pub tick_rate: u32,
    /// Target horizontal speed (units/tick).
    pub move_speed: f64,
    /// Horizontal speed cap (units/tick).
    pub max_speed: f64,
    /// Blend factor towards the target velocity while input is held (0..=1 per tick).
    pub acceleration: f64,
    /// Blend factor towards rest when no movement input is held (0..=1 per tick).
    pub deceleration: f64,
    /// Speed multiplier while sprinting.
    pub sprint_multiplier: f64,
    /// Speed multiplier while crouching (wins over sprint).
    pub crouch_multiplier: f64,
    /// Gravity (units/tick²).
    pub gravity: f64,
    /// Initial vertical velocity of a jump (units/tick).
    pub jump_velocity: f64,
    /// Maximum downward speed (units/tick).
    pub terminal_velocity: f64,
    /// Height of the ground plane.
    pub ground_level: f64,
    /// Maximum |x| and |z| of any position.
    pub world_bound: f64,
    /// Heights within this distance above the ground count as landed.
    pub ground_epsilon: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            move_speed: 0.1,
            max_speed: 0.2,
            acceleration: 1.0,
            deceleration: 1.0,
            sprint_multiplier: 1.5,
            crouch_multiplier: 0.5,
            gravity: 0.02,
            jump_velocity: 0.25,
            terminal_velocity: 1.0,
            ground_level: 0.0,
            world_bound: 500.0,
            ground_epsilon: 1e-6,
        }
    }
}

impl PhysicsConfig {
    /// The fixed step used for authoritative and recorded simulation (seconds).
    #[inline]
    pub fn fixed_dt(&self) -> f64 {
        1.0 / self.tick_rate as f64
    }

    /// Number of ticks a jump spends in the air (`2*v0/g`).
    pub fn jump_flight_ticks(&self) -> f64 {
        2.0 * self.jump_velocity / self.gravity
    }

    /// Parse from JSON. Missing fields fall back to defaults.
    pub fn from_json_str(s: &str) -> Result<Self, PhysicsConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every constant is usable by the integrator.
    pub fn validate(&self) -> Result<(), PhysicsConfigError> {
        if self.tick_rate == 0 {
            return Err(PhysicsConfigError::Invalid("tickRate must be positive"));
        }
        let finite = [
            self.move_speed,
            self.max_speed,
            self.acceleration,
            self.deceleration,
            self.sprint_multiplier,
            self.crouch_multiplier,
            self.gravity,
            self.jump_velocity,
            self.terminal_velocity,
            self.ground_level,
            self.world_bound,
            self.ground_epsilon,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(PhysicsConfigError::Invalid("constants must be finite"));
        }
        if self.gravity <= 0.0 || self.terminal_velocity <= 0.0 {
            return Err(PhysicsConfigError::Invalid("gravity and terminalVelocity must be positive"));
        }
        if !(0.0..=1.0).contains(&self.acceleration) || !(0.0..=1.0).contains(&self.deceleration) {
            return Err(PhysicsConfigError::Invalid("acceleration and deceleration must be within 0..=1"));
        }
        if self.max_speed < self.move_speed || self.world_bound <= 0.0 {
            return Err(PhysicsConfigError::Invalid("maxSpeed below moveSpeed or non-positive worldBound"));
        }
        Ok(())
    }
}

/// Physics configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum PhysicsConfigError {
    /// JSON could not be parsed.
    #[error("Invalid physics JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A constant is out of range.
    #[error("Invalid physics constant: {0}")]
    Invalid(&'static str),
}

/// Per-step movement intent, derived from an input command.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MoveIntent {
    /// Move along camera forward.
    pub forward: bool,
    /// Move against camera forward.
    pub backward: bool,
    /// Strafe left.
    pub left: bool,
    /// Strafe right.
    pub right: bool,
    /// Jump key is down.
    pub jump: bool,
    /// Sprint modifier.
    pub sprint: bool,
    /// Crouch modifier.
    pub crouch: bool,
    /// Camera yaw (radians). 0 looks down -Z.
    pub camera_rotation: f64,
}

impl MoveIntent {
    /// Camera-relative unit direction of the held movement keys (ZERO when idle).
    pub fn wish_direction(&self) -> Vec3 {
        let f = self.forward as i8 - self.backward as i8;
        let r = self.right as i8 - self.left as i8;
        if f == 0 && r == 0 {
            return Vec3::ZERO;
        }

        let (sin, cos) = self.camera_rotation.sin_cos();
        let forward = Vec3::horizontal(-sin, -cos);
        let right = Vec3::horizontal(cos, -sin);

        (forward.scale(f as f64) + right.scale(r as f64)).normalize()
    }

    /// Magnitude of movement input in `[0, 1]`.
    pub fn magnitude(&self) -> f64 {
        if self.wish_direction() == Vec3::ZERO { 0.0 } else { 1.0 }
    }

    fn speed_multiplier(&self, config: &PhysicsConfig) -> f64 {
        if self.crouch {
            config.crouch_multiplier
        } else if self.sprint {
            config.sprint_multiplier
        } else {
            1.0
        }
    }
}

/// Kinematic state advanced by the integrator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementState {
    /// World position.
    pub position: Vec3,
    /// Horizontal velocity (y is always 0), units/tick.
    pub horizontal_velocity: Vec3,
    /// Vertical velocity, units/tick.
    pub vertical_velocity: f64,
    /// Standing on the ground.
    pub is_grounded: bool,
    /// Jump key was down on the previous step (rising-edge detection).
    pub jump_held: bool,
}

impl MovementState {
    /// Resting state at a spawn point. Grounded when the point is on the ground.
    pub fn at(position: Vec3, config: &PhysicsConfig) -> Self {
        Self {
            position,
            horizontal_velocity: Vec3::ZERO,
            vertical_velocity: 0.0,
            is_grounded: position.y <= config.ground_level + config.ground_epsilon,
            jump_held: false,
        }
    }

    /// Full velocity vector (horizontal + vertical).
    pub fn velocity(&self) -> Vec3 {
        Vec3::new(self.horizontal_velocity.x, self.vertical_velocity, self.horizontal_velocity.z)
    }
}

/// Advance one step.
///
/// Pure and deterministic: the same `(config, state, intent, dt)` always
/// yields the same result, bit for bit.
pub fn step(config: &PhysicsConfig, state: &MovementState, intent: &MoveIntent, dt: f64) -> MovementState {
    let s = dt * config.tick_rate as f64;
    let mut next = *state;

    // 1. Horizontal: blend towards the camera-relative target velocity
    let wish = intent.wish_direction();
    let (target, blend) = if wish == Vec3::ZERO {
        (Vec3::ZERO, config.deceleration)
    } else {
        let speed = config.move_speed * intent.speed_multiplier(config);
        (wish.scale(speed), config.acceleration)
    };
    let blend = (blend * s).min(1.0);
    let velocity = state.horizontal_velocity + (target - state.horizontal_velocity).scale(blend);
    next.horizontal_velocity = velocity.clamp_length(config.max_speed);

    let bound = config.world_bound;
    next.position.x = (state.position.x + next.horizontal_velocity.x * s).clamp(-bound, bound);
    next.position.z = (state.position.z + next.horizontal_velocity.z * s).clamp(-bound, bound);

    // 2. Jump on the rising edge only
    if intent.jump && !state.jump_held && state.is_grounded {
        next.vertical_velocity = config.jump_velocity;
        next.is_grounded = false;
    }
    next.jump_held = intent.jump;

    // 3. Gravity while airborne, landing clamps to the ground
    if next.is_grounded {
        next.vertical_velocity = 0.0;
        next.position.y = config.ground_level;
    } else {
        let vy0 = next.vertical_velocity;
        let vy1 = (vy0 - config.gravity * s).max(-config.terminal_velocity);
        next.position.y = state.position.y + (vy0 + vy1) * 0.5 * s;
        next.vertical_velocity = vy1;

        if next.position.y <= config.ground_level + config.ground_epsilon {
            next.position.y = config.ground_level;
            next.vertical_velocity = 0.0;
            next.is_grounded = true;
        }
    }

    next
}

/// Apply `step` once per intent at the fixed dt.
pub fn simulate<'a, I>(config: &PhysicsConfig, start: MovementState, intents: I) -> MovementState
where
    I: IntoIterator<Item = &'a MoveIntent>,
{
    let dt = config.fixed_dt();
    intents
        .into_iter()
        .fold(start, |state, intent| step(config, &state, intent, dt))
}
