//! Reconciliation
//!
//! Compares authoritative acknowledgements against the bounded history of
//! predictions, decides how visibly to correct, and replays every
//! unacknowledged command from the authoritative state so in-flight input
//! is never lost.
//!
//! ## Policy
//!
//! | error                              | correction                    |
//! |------------------------------------|-------------------------------|
//! | `<= threshold`                     | none, adopted silently        |
//! | `> threshold`, `err² <= snap²`     | soft blend towards the server |
//! | `err² > snap²` or no matching record | snap                        |
//!
//! `threshold = base_threshold * (1 + input magnitude)`.
//!
//! Whatever the correction, the replayed head always starts from the
//! authoritative state, so repeated acks converge on the server exactly.

use std::collections::VecDeque;
use serde::{Serialize, Deserialize};
use tracing::{debug, warn};

use crate::core::clock::{diff_millis, Millis};
use crate::core::physics::{step, MoveIntent, MovementState, PhysicsConfig};
use crate::core::vec3::Vec3;
use crate::network::protocol::PositionUpdate;

/// Reconciler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcilerConfig {
    /// Prediction records kept (~3s at 20Hz).
    pub history: usize,
    /// Error accepted without correction at zero input (units).
    pub base_threshold: f64,
    /// Squared error beyond which the avatar snaps (units²).
    pub snap_distance_sq: f64,
    /// Fraction of the visual offset closed per frame on soft corrections.
    pub correction_factor: f64,
    /// Correction factor once escalated.
    pub max_correction_factor: f64,
    /// Consecutive corrections before escalating.
    pub escalation_streak: u32,
    /// Timestamp window for matching an ack whose sequence was pruned (ms).
    pub timestamp_tolerance_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            history: 60,
            base_threshold: 0.1,
            snap_distance_sq: 4.0,
            correction_factor: 0.2,
            max_correction_factor: 0.6,
            escalation_streak: 3,
            timestamp_tolerance_ms: 100,
        }
    }
}

/// A committed prediction awaiting acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionRecord {
    /// Command sequence.
    pub sequence: u64,
    /// Command timestamp (client clock).
    pub timestamp: Millis,
    /// Intent the command carried.
    pub input: MoveIntent,
    /// State predicted after applying it.
    pub predicted: MovementState,
}

/// How the local avatar should be corrected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Within tolerance.
    None,
    /// Blend by this factor per frame.
    Soft {
        /// Fraction of the remaining offset closed per frame.
        factor: f64,
    },
    /// Hard-set.
    Snap,
}

/// Result of processing one acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// Acknowledged sequence.
    pub sequence: u64,
    /// Distance between prediction and authority, if a record matched.
    pub error: Option<f64>,
    /// Chosen correction.
    pub correction: Correction,
    /// Predicted head after replaying unacknowledged commands.
    pub state: MovementState,
    /// Commands replayed.
    pub replayed: usize,
    /// The correction streak reached the escalation point.
    pub escalated: bool,
}

/// Running reconciliation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStats {
    /// Acks within tolerance.
    pub accepted: u64,
    /// Soft corrections.
    pub soft: u64,
    /// Snaps.
    pub snaps: u64,
    /// Stale or duplicate acks ignored.
    pub ignored: u64,
    /// Acks that matched by timestamp after their record was pruned.
    pub timestamp_matches: u64,
    /// Sum of matched errors.
    pub total_error: f64,
    /// Largest matched error.
    pub max_error: f64,
}

impl ReconcileStats {
    /// Mean error over matched acks.
    pub fn mean_error(&self) -> f64 {
        let n = self.accepted + self.soft + self.snaps;
        if n == 0 { 0.0 } else { self.total_error / n as f64 }
    }
}

/// Client-side reconciler.
#[derive(Debug, Clone)]
pub struct Reconciler {
    config: ReconcilerConfig,
    records: VecDeque<PredictionRecord>,
    /// Sequence and jump input of the newest record no longer held.
    forgotten: Option<(u64, bool)>,
    last_acked: u64,
    streak: u32,
    stats: ReconcileStats,
}

impl Reconciler {
    /// Create with tuning.
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            records: VecDeque::with_capacity(config.history.max(1)),
            forgotten: None,
            config,
            last_acked: 0,
            streak: 0,
            stats: ReconcileStats::default(),
        }
    }

    /// Record a committed prediction. The oldest record falls off when full.
    pub fn record(&mut self, record: PredictionRecord) {
        if self.records.len() >= self.config.history.max(1) {
            if let Some(old) = self.records.pop_front() {
                self.forgotten = Some((old.sequence, old.input.jump));
            }
        }
        self.records.push_back(record);
    }

    /// Unacknowledged records, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.records.iter()
    }

    /// Number of unacknowledged records.
    pub fn pending_len(&self) -> usize {
        self.records.len()
    }

    /// Highest sequence acknowledged so far.
    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// Running counters.
    pub fn stats(&self) -> &ReconcileStats {
        &self.stats
    }

    /// Current correction streak.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    /// Forget everything (new server-side player).
    pub fn reset(&mut self) {
        self.records.clear();
        self.forgotten = None;
        self.last_acked = 0;
        self.streak = 0;
    }

    fn find(&self, ack: &PositionUpdate) -> Option<(PredictionRecord, bool)> {
        if let Some(record) = self.records.iter().find(|r| r.sequence == ack.sequence) {
            return Some((*record, false));
        }
        self.records
            .iter()
            .map(|r| (r, diff_millis(r.timestamp, ack.timestamp).unsigned_abs()))
            .filter(|(_, delta)| *delta <= self.config.timestamp_tolerance_ms)
            .min_by_key(|(_, delta)| *delta)
            .map(|(r, _)| (*r, true))
    }

    /// Jump latch the server held after applying the acked command.
    fn jump_latch(&self, ack: &PositionUpdate) -> bool {
        self.records
            .iter()
            .rev()
            .find(|r| r.sequence <= ack.sequence)
            .map(|r| r.input.jump)
            .or_else(|| self.forgotten.map(|(_, jump)| jump))
            .unwrap_or(false)
    }

    fn correction_factor(&self) -> f64 {
        if self.streak >= self.config.escalation_streak {
            self.config.max_correction_factor
        } else {
            self.config.correction_factor
        }
    }

    /// Process an authoritative acknowledgement.
    ///
    /// Returns `None` for acks at or below the last processed one, so the
    /// same ack applied twice moves nothing.
    pub fn reconcile(&mut self, physics: &PhysicsConfig, ack: &PositionUpdate) -> Option<Reconciliation> {
        if ack.sequence <= self.last_acked {
            self.stats.ignored += 1;
            return None;
        }

        let matched = self.find(ack);
        if matches!(matched, Some((_, true))) {
            self.stats.timestamp_matches += 1;
        }

        let authoritative = MovementState {
            position: ack.position,
            horizontal_velocity: Vec3::horizontal(ack.velocity.x, ack.velocity.z),
            vertical_velocity: ack.velocity.y,
            is_grounded: ack.is_grounded,
            jump_held: self.jump_latch(ack),
        };

        let error = matched.map(|(r, _)| r.predicted.position.distance(ack.position));
        let raw = match matched {
            Some((record, _)) => {
                let error_sq = record.predicted.position.distance_squared(ack.position);
                let threshold = self.config.base_threshold * (1.0 + record.input.magnitude());
                if error_sq > self.config.snap_distance_sq {
                    Correction::Snap
                } else if error_sq > threshold * threshold {
                    Correction::Soft { factor: 0.0 }
                } else {
                    Correction::None
                }
            }
            None => {
                warn!("No prediction for ack #{}, snapping", ack.sequence);
                Correction::Snap
            }
        };

        if raw == Correction::None {
            self.streak = 0;
        } else {
            self.streak += 1;
        }
        let escalated = self.streak >= self.config.escalation_streak;
        let correction = match raw {
            Correction::Soft { .. } => Correction::Soft { factor: self.correction_factor() },
            other => other,
        };

        // Replay everything newer than the ack on top of the authoritative state
        let dt = physics.fixed_dt();
        let mut state = authoritative;
        let mut replayed = 0;
        for record in self.records.iter_mut().filter(|r| r.sequence > ack.sequence) {
            state = step(physics, &state, &record.input, dt);
            record.predicted = state;
            replayed += 1;
        }
        if let Some(newest) = self.records.iter().rev().find(|r| r.sequence <= ack.sequence) {
            self.forgotten = Some((newest.sequence, newest.input.jump));
        }
        self.records.retain(|r| r.sequence > ack.sequence);
        self.last_acked = ack.sequence;

        match correction {
            Correction::None => self.stats.accepted += 1,
            Correction::Soft { .. } => self.stats.soft += 1,
            Correction::Snap => self.stats.snaps += 1,
        }
        if let Some(e) = error {
            self.stats.total_error += e;
            self.stats.max_error = self.stats.max_error.max(e);
        }

        debug!(
            "Ack #{}: error {:?}, {:?}, replayed {}",
            ack.sequence, error, correction, replayed
        );

        Some(Reconciliation {
            sequence: ack.sequence,
            error,
            correction,
            state,
            replayed,
            escalated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward() -> MoveIntent {
        MoveIntent { forward: true, ..Default::default() }
    }

    /// Client-side history of `n` forward commands from the origin.
    fn predicted_run(physics: &PhysicsConfig, reconciler: &mut Reconciler, n: u64) -> MovementState {
        let mut state = MovementState::at(Vec3::ZERO, physics);
        for sequence in 1..=n {
            state = step(physics, &state, &forward(), physics.fixed_dt());
            reconciler.record(PredictionRecord {
                sequence,
                timestamp: sequence * 50,
                input: forward(),
                predicted: state,
            });
        }
        state
    }

    fn ack_for(sequence: u64, state: &MovementState) -> PositionUpdate {
        PositionUpdate {
            sequence,
            timestamp: sequence * 50,
            position: state.position,
            velocity: state.velocity(),
            is_grounded: state.is_grounded,
        }
    }

    #[test]
    fn test_held_jump_survives_history_overflow() {
        let physics = PhysicsConfig::default();
        let mut reconciler = Reconciler::new(ReconcilerConfig { history: 2, ..Default::default() });
        let jump = MoveIntent { jump: true, ..Default::default() };
        let grounded = MovementState::at(Vec3::ZERO, &physics);
        for sequence in 1..=5 {
            reconciler.record(PredictionRecord { sequence, timestamp: sequence * 50, input: jump, predicted: grounded });
        }

        // #3 fell out of history; the server had jump held and is standing
        let ack = PositionUpdate {
            sequence: 3,
            timestamp: 0,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            is_grounded: true,
        };
        let result = reconciler.reconcile(&physics, &ack).unwrap();

        assert_eq!(result.replayed, 2);
        assert!(result.state.is_grounded);
        assert_eq!(result.state.vertical_velocity, 0.0);
    }

    #[test]
    fn test_matching_ack_is_accepted_and_pruned() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        let head = predicted_run(&physics, &mut r, 5);

        let acked = r.pending().find(|p| p.sequence == 2).unwrap().predicted;
        let result = r.reconcile(&physics, &ack_for(2, &acked)).unwrap();

        assert_eq!(result.correction, Correction::None);
        assert_eq!(result.error, Some(0.0));
        assert_eq!(result.replayed, 3);
        assert_eq!(result.state, head);
        assert_eq!(r.pending_len(), 3);
        assert_eq!(r.last_acked(), 2);
    }

    #[test]
    fn test_same_ack_twice_is_ignored() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 3);

        let mut moved = MovementState::at(Vec3::horizontal(0.5, 0.0), &physics);
        moved.horizontal_velocity = Vec3::horizontal(0.0, -0.1);
        let ack = ack_for(1, &moved);

        assert!(r.reconcile(&physics, &ack).is_some());
        let pending = r.pending_len();
        assert!(r.reconcile(&physics, &ack).is_none());
        assert_eq!(r.pending_len(), pending);
        assert_eq!(r.stats().ignored, 1);
    }

    #[test]
    fn test_soft_and_snap_thresholds() {
        let physics = PhysicsConfig::default();

        // 0.5 units off with input held: above 0.2, below snap
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 2);
        let mut off = r.pending().next().unwrap().predicted;
        off.position.x += 0.5;
        let result = r.reconcile(&physics, &ack_for(1, &off)).unwrap();
        assert_eq!(result.correction, Correction::Soft { factor: 0.2 });

        // 3 units off: 9 > 4 snaps
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 2);
        let mut off = r.pending().next().unwrap().predicted;
        off.position.x += 3.0;
        let result = r.reconcile(&physics, &ack_for(1, &off)).unwrap();
        assert_eq!(result.correction, Correction::Snap);

        // 0.15 units off with input held: within 0.1 * (1 + 1)
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 2);
        let mut off = r.pending().next().unwrap().predicted;
        off.position.x += 0.15;
        let result = r.reconcile(&physics, &ack_for(1, &off)).unwrap();
        assert_eq!(result.correction, Correction::None);
    }

    #[test]
    fn test_replay_starts_from_authority() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 4);

        // Server put us one unit to the side
        let mut server = r.pending().next().unwrap().predicted;
        server.position.x += 1.0;
        let result = r.reconcile(&physics, &ack_for(1, &server)).unwrap();

        let mut expected = server;
        for _ in 0..3 {
            expected = step(&physics, &expected, &forward(), physics.fixed_dt());
        }
        assert_eq!(result.state, expected);
        assert_eq!(r.pending().last().unwrap().predicted, expected);
    }

    #[test]
    fn test_timestamp_fallback_when_sequence_pruned() {
        let physics = PhysicsConfig::default();
        let config = ReconcilerConfig { history: 3, ..Default::default() };
        let mut r = Reconciler::new(config);
        predicted_run(&physics, &mut r, 6); // keeps 4, 5, 6

        // Ack #3 is gone; its timestamp (150) is 50ms from #4
        let state = r.pending().next().unwrap().predicted;
        let mut ack = ack_for(3, &state);
        ack.timestamp = 150;
        let result = r.reconcile(&physics, &ack).unwrap();

        assert!(result.error.is_some());
        assert_eq!(r.stats().timestamp_matches, 1);
    }

    #[test]
    fn test_unmatched_ack_snaps() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        let state = MovementState::at(Vec3::horizontal(9.0, 9.0), &physics);
        let result = r.reconcile(&physics, &ack_for(10, &state)).unwrap();

        assert_eq!(result.correction, Correction::Snap);
        assert_eq!(result.state, state);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_escalation_and_reset() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 10);

        let mut last = None;
        for sequence in 1..=3 {
            let mut off = r.pending().next().unwrap().predicted;
            off.position.x += 0.5;
            last = r.reconcile(&physics, &ack_for(sequence, &off));
        }
        let escalated = last.unwrap();
        assert!(escalated.escalated);
        assert_eq!(escalated.correction, Correction::Soft { factor: 0.6 });

        let clean = r.pending().next().unwrap().predicted;
        let result = r.reconcile(&physics, &ack_for(4, &clean)).unwrap();
        assert!(!result.escalated);
        assert_eq!(r.streak(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let physics = PhysicsConfig::default();
        let mut r = Reconciler::new(ReconcilerConfig::default());
        predicted_run(&physics, &mut r, 100);
        assert_eq!(r.pending_len(), 60);
        assert_eq!(r.pending().next().unwrap().sequence, 41);
    }
}
