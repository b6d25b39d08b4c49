//! Client Predictor
//!
//! Runs the shared integrator locally so the local avatar moves with zero
//! perceived latency.
//!
//! Two layers:
//!
//! - the *committed* state advances one fixed step per sent command, exactly
//!   as the server will; this is what gets recorded for reconciliation
//! - the *rendered* position is recomputed every frame as a partial-step
//!   lookahead from the committed state using the keys held right now, plus
//!   a decaying visual offset left behind by soft corrections

use crate::core::physics::{step, MoveIntent, MovementState, PhysicsConfig};
use crate::core::vec3::Vec3;

/// Visual offsets smaller than this are dropped.
const OFFSET_EPSILON: f64 = 1e-4;

/// Local-player predictor.
#[derive(Debug, Clone)]
pub struct ClientPredictor {
    config: PhysicsConfig,
    committed: MovementState,
    since_commit: f64,
    visual_offset: Vec3,
    correction_factor: f64,
    rendered: Vec3,
}

impl ClientPredictor {
    /// Start at rest at `position`.
    pub fn new(config: PhysicsConfig, position: Vec3) -> Self {
        let committed = MovementState::at(position, &config);
        Self {
            config,
            committed,
            since_commit: 0.0,
            visual_offset: Vec3::ZERO,
            correction_factor: 1.0,
            rendered: position,
        }
    }

    /// Shared physics constants.
    pub fn config(&self) -> &PhysicsConfig {
        &self.config
    }

    /// State after the last committed command.
    pub fn committed(&self) -> &MovementState {
        &self.committed
    }

    /// Position drawn on the last frame.
    pub fn rendered(&self) -> Vec3 {
        self.rendered
    }

    /// Remaining visual correction.
    pub fn visual_offset(&self) -> Vec3 {
        self.visual_offset
    }

    /// Restart from a server-provided spawn.
    pub fn reset(&mut self, state: MovementState) {
        self.committed = state;
        self.since_commit = 0.0;
        self.visual_offset = Vec3::ZERO;
        self.rendered = state.position;
    }

    /// Advance the committed state by one command at the fixed step.
    ///
    /// Returns the predicted state to record under the command's sequence.
    pub fn commit(&mut self, intent: &MoveIntent) -> MovementState {
        self.committed = step(&self.config, &self.committed, intent, self.config.fixed_dt());
        self.since_commit = 0.0;
        self.committed
    }

    /// Per-frame prediction. Returns the position to render.
    pub fn frame(&mut self, live: &MoveIntent, frame_dt: f64) -> Vec3 {
        let fixed = self.config.fixed_dt();
        self.since_commit = (self.since_commit + frame_dt.max(0.0)).min(fixed);

        let lookahead = if self.since_commit > 0.0 {
            step(&self.config, &self.committed, live, self.since_commit)
        } else {
            self.committed
        };

        if self.visual_offset != Vec3::ZERO {
            let keep = (1.0 - self.correction_factor).clamp(0.0, 1.0);
            self.visual_offset = self.visual_offset.scale(keep);
            if self.visual_offset.length_squared() < OFFSET_EPSILON * OFFSET_EPSILON {
                self.visual_offset = Vec3::ZERO;
            }
        }

        self.rendered = lookahead.position + self.visual_offset;
        self.rendered
    }

    /// Adopt a reconciled state without moving the avatar.
    ///
    /// The shift between the old and new committed positions joins the
    /// visual offset and bleeds out at `factor` per frame.
    pub fn rebase(&mut self, state: MovementState, factor: f64) {
        let shift = self.committed.position - state.position;
        self.committed = state;
        self.visual_offset = self.visual_offset + shift;
        if self.visual_offset.length_squared() < OFFSET_EPSILON * OFFSET_EPSILON {
            self.visual_offset = Vec3::ZERO;
        }
        self.correction_factor = factor.clamp(0.0, 1.0);
    }

    /// Adopt a reconciled state but keep drawing from where the avatar was,
    /// closing the gap by `factor` of the remaining offset per frame.
    pub fn rebase_smoothed(&mut self, state: MovementState, factor: f64) {
        let before = self.rendered;
        self.committed = state;
        self.visual_offset = before - state.position;
        self.correction_factor = factor.clamp(0.0, 1.0);
    }

    /// Adopt a reconciled state and jump the avatar there.
    pub fn snap(&mut self, state: MovementState) {
        self.committed = state;
        self.visual_offset = Vec3::ZERO;
        self.rendered = state.position;
    }
}
