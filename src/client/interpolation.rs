//! Remote Interpolation
//!
//! Remote entities are drawn slightly in the past, between two real
//! authoritative snapshots, never extrapolated. The delay follows observed
//! jitter and widens when reconciliation keeps failing.
//!
//! Also home to the two estimators that feed it: round-trip time/jitter
//! and the server clock offset.

use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

use crate::core::clock::Millis;
use crate::core::vec3::Vec3;
use crate::game::state::PlayerId;

/// Snapshots kept per remote entity.
pub const SNAPSHOT_CAPACITY: usize = 20;

/// Delay added per escalation (ms).
pub const ESCALATION_STEP_MS: f64 = 50.0;

/// An authoritative position on the server's time axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteSnapshot {
    /// Server timestamp.
    pub timestamp: Millis,
    /// Position at that time.
    pub position: Vec3,
}

/// Buffers and samples remote entities.
#[derive(Debug, Clone)]
pub struct RemoteInterpolator {
    buffers: BTreeMap<PlayerId, VecDeque<RemoteSnapshot>>,
    base_delay_ms: f64,
    max_delay_ms: f64,
    jitter_ms: f64,
    extra_ms: f64,
}

impl RemoteInterpolator {
    /// Create with a base and maximum interpolation delay.
    pub fn new(base_delay_ms: f64, max_delay_ms: f64) -> Self {
        let base = base_delay_ms.max(0.0);
        Self {
            buffers: BTreeMap::new(),
            base_delay_ms: base,
            max_delay_ms: max_delay_ms.max(base),
            jitter_ms: 0.0,
            extra_ms: 0.0,
        }
    }

    /// Current interpolation delay (ms).
    pub fn delay_ms(&self) -> f64 {
        (self.base_delay_ms + 2.0 * self.jitter_ms + self.extra_ms)
            .clamp(self.base_delay_ms, self.max_delay_ms)
    }

    /// Feed the latest jitter estimate.
    pub fn set_jitter(&mut self, jitter_ms: f64) {
        if jitter_ms.is_finite() {
            self.jitter_ms = jitter_ms.max(0.0);
        }
    }

    /// Widen the delay after repeated corrections.
    pub fn escalate(&mut self) {
        let before = self.delay_ms();
        self.extra_ms = (self.extra_ms + ESCALATION_STEP_MS).min(self.max_delay_ms);
        debug!("Interpolation delay {:.0}ms -> {:.0}ms", before, self.delay_ms());
    }

    /// Drop escalation once corrections stop.
    pub fn relax(&mut self) {
        self.extra_ms = 0.0;
    }

    /// Append a snapshot. Out-of-order or duplicate timestamps are ignored.
    pub fn push(&mut self, id: PlayerId, timestamp: Millis, position: Vec3) -> bool {
        let buffer = self.buffers.entry(id).or_default();
        if buffer.back().map_or(false, |last| timestamp <= last.timestamp) {
            return false;
        }
        if buffer.len() >= SNAPSHOT_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(RemoteSnapshot { timestamp, position });
        true
    }

    /// Forget an entity.
    pub fn remove(&mut self, id: &PlayerId) {
        self.buffers.remove(id);
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.extra_ms = 0.0;
    }

    /// Entities with buffered snapshots.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffered snapshots for an entity.
    pub fn snapshots(&self, id: &PlayerId) -> Option<&VecDeque<RemoteSnapshot>> {
        self.buffers.get(id)
    }

    /// Position of an entity at `render_time` (server ms).
    ///
    /// Before the first snapshot the first is used; past the last, the last
    /// is held.
    pub fn sample(&self, id: &PlayerId, render_time: f64) -> Option<Vec3> {
        let buffer = self.buffers.get(id)?;
        let first = buffer.front()?;
        if render_time <= first.timestamp as f64 {
            return Some(first.position);
        }

        for (older, newer) in buffer.iter().zip(buffer.iter().skip(1)) {
            let (t0, t1) = (older.timestamp as f64, newer.timestamp as f64);
            if render_time <= t1 {
                let t = (render_time - t0) / (t1 - t0);
                return Some(older.position.lerp(newer.position, t));
            }
        }

        buffer.back().map(|last| last.position)
    }

    /// Sample every entity at `server_now - delay`.
    pub fn sample_all(&self, server_now: f64) -> Vec<(PlayerId, Vec3)> {
        let render_time = server_now - self.delay_ms();
        self.buffers
            .keys()
            .filter_map(|id| self.sample(id, render_time).map(|pos| (*id, pos)))
            .collect()
    }
}

/// Smoothed round-trip time and jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttEstimator {
    rtt_ms: Option<f64>,
    jitter_ms: f64,
}

impl RttEstimator {
    const RTT_GAIN: f64 = 0.125;
    const JITTER_GAIN: f64 = 0.25;

    /// Fresh estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a round-trip sample (ms).
    pub fn observe(&mut self, sample_ms: f64) {
        if !sample_ms.is_finite() || sample_ms < 0.0 {
            return;
        }
        match self.rtt_ms {
            None => self.rtt_ms = Some(sample_ms),
            Some(rtt) => {
                self.jitter_ms += Self::JITTER_GAIN * ((rtt - sample_ms).abs() - self.jitter_ms);
                self.rtt_ms = Some(rtt + Self::RTT_GAIN * (sample_ms - rtt));
            }
        }
    }

    /// Smoothed RTT, once a sample exists.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_ms
    }

    /// Smoothed jitter.
    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ms
    }
}

/// Estimates the server clock from local time.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServerClock {
    offset_ms: Option<f64>,
}

impl ServerClock {
    const GAIN: f64 = 0.1;

    /// Unsynchronized clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a server timestamp received at `local_now`, assumed sent half
    /// a round trip earlier.
    pub fn observe(&mut self, server_time: Millis, local_now: Millis, rtt_ms: f64) {
        let sample = server_time as f64 + rtt_ms.max(0.0) / 2.0 - local_now as f64;
        self.offset_ms = Some(match self.offset_ms {
            None => sample,
            Some(offset) => offset + Self::GAIN * (sample - offset),
        });
    }

    /// Server minus local (ms).
    pub fn offset_ms(&self) -> Option<f64> {
        self.offset_ms
    }

    /// Estimated server time now. Falls back to local time before the
    /// first observation.
    pub fn server_now(&self, local_now: Millis) -> f64 {
        local_now as f64 + self.offset_ms.unwrap_or(0.0)
    }

    /// Forget the estimate.
    pub fn reset(&mut self) {
        self.offset_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midpoint_between_snapshots() {
        let id = PlayerId::generate();
        let mut interp = RemoteInterpolator::new(0.0, 0.0);
        interp.push(id, 0, Vec3::ZERO);
        interp.push(id, 100, Vec3::new(1.0, 0.0, 0.0));

        let pos = interp.sample(&id, 50.0).unwrap();
        assert_eq!(pos, Vec3::new(0.5, 0.0, 0.0));

        // Zero delay: sample_all renders at now
        assert_eq!(interp.sample_all(50.0), vec![(id, Vec3::new(0.5, 0.0, 0.0))]);
    }

    #[test]
    fn test_holds_edges_without_extrapolation() {
        let id = PlayerId::generate();
        let mut interp = RemoteInterpolator::new(100.0, 300.0);
        interp.push(id, 1_000, Vec3::new(1.0, 0.0, 0.0));
        interp.push(id, 1_050, Vec3::new(2.0, 0.0, 0.0));

        assert_eq!(interp.sample(&id, 900.0), Some(Vec3::new(1.0, 0.0, 0.0)));
        assert_eq!(interp.sample(&id, 5_000.0), Some(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(interp.sample(&PlayerId::generate(), 1_000.0), None);
    }

    #[test]
    fn test_out_of_order_snapshots_ignored() {
        let id = PlayerId::generate();
        let mut interp = RemoteInterpolator::new(100.0, 300.0);
        assert!(interp.push(id, 100, Vec3::ZERO));
        assert!(!interp.push(id, 100, Vec3::UP));
        assert!(!interp.push(id, 50, Vec3::UP));
        assert_eq!(interp.snapshots(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let id = PlayerId::generate();
        let mut interp = RemoteInterpolator::new(100.0, 300.0);
        for t in 0..50 {
            interp.push(id, t * 50, Vec3::ZERO);
        }
        let buffer = interp.snapshots(&id).unwrap();
        assert_eq!(buffer.len(), SNAPSHOT_CAPACITY);
        assert_eq!(buffer.front().unwrap().timestamp, 30 * 50);
    }

    #[test]
    fn test_delay_follows_jitter_and_escalation() {
        let mut interp = RemoteInterpolator::new(100.0, 250.0);
        assert_eq!(interp.delay_ms(), 100.0);

        interp.set_jitter(20.0);
        assert_eq!(interp.delay_ms(), 140.0);

        interp.escalate();
        assert_eq!(interp.delay_ms(), 190.0);
        interp.escalate();
        interp.escalate();
        assert_eq!(interp.delay_ms(), 250.0);

        interp.relax();
        assert_eq!(interp.delay_ms(), 140.0);
    }

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.rtt_ms(), None);

        rtt.observe(100.0);
        assert_eq!(rtt.rtt_ms(), Some(100.0));
        assert_eq!(rtt.jitter_ms(), 0.0);

        rtt.observe(140.0);
        assert_eq!(rtt.rtt_ms(), Some(105.0));
        assert_eq!(rtt.jitter_ms(), 10.0);

        rtt.observe(f64::NAN);
        assert_eq!(rtt.rtt_ms(), Some(105.0));
    }

    #[test]
    fn test_server_clock_offset() {
        let mut clock = ServerClock::new();
        assert_eq!(clock.server_now(1_000), 1_000.0);

        // Server is 500ms ahead, 40ms round trip
        clock.observe(10_480, 10_000, 40.0);
        assert_eq!(clock.offset_ms(), Some(500.0));
        assert_eq!(clock.server_now(11_000), 11_500.0);

        clock.reset();
        assert_eq!(clock.offset_ms(), None);
    }
}
