//! Client Session
//!
//! Glue between the transport and the client-side movement pipeline.
//! No I/O happens here: the caller feeds server messages, key events and
//! frame ticks in, and sends whatever messages come back out.
//!
//! ```text
//! keys -> InputSequencer -> ClientPredictor -> rendered local avatar
//!                  |               ^
//!                  v               | rebase / smooth / snap
//!             player_input     Reconciler <- server_position_update
//!
//! global_state_update -> RemoteInterpolator -> rendered remote avatars
//! ```

use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::client::interpolation::{RemoteInterpolator, RttEstimator, ServerClock};
use crate::client::predictor::ClientPredictor;
use crate::client::reconcile::{
    Correction, PredictionRecord, ReconcileStats, Reconciler, ReconcilerConfig, Reconciliation,
};
use crate::client::sequencer::InputSequencer;
use crate::client::transport::ReconnectPolicy;
use crate::core::clock::{diff_millis, Millis};
use crate::core::physics::{MovementState, PhysicsConfig};
use crate::core::vec3::Vec3;
use crate::game::input::Action;
use crate::game::state::{PlayerId, PlayerState};
use crate::network::protocol::{ClientMessage, InputPayload, JoinRequest, ServerMessage};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Display name sent on join.
    pub name: String,
    /// Color sent on join.
    pub color: String,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Input commands per second.
    pub send_rate_hz: u32,
    /// Base interpolation delay for remote entities (ms).
    pub interpolation_delay_ms: f64,
    /// Ceiling for the adaptive interpolation delay (ms).
    pub max_interpolation_delay_ms: f64,
    /// Reconciler tuning.
    pub reconciler: ReconcilerConfig,
    /// Physics constants; must match the server's.
    pub physics: PhysicsConfig,
    /// RTT ping interval.
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000".to_string(),
            name: "Player".to_string(),
            color: "#4a90d9".to_string(),
            reconnect: ReconnectPolicy::default(),
            send_rate_hz: 20,
            interpolation_delay_ms: 100.0,
            max_interpolation_delay_ms: 400.0,
            reconciler: ReconcilerConfig::default(),
            physics: PhysicsConfig::default(),
            ping_interval: Duration::from_secs(2),
        }
    }
}

/// Connection status as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Waiting for the socket or for `join_accepted`.
    Connecting,
    /// Joined as this player.
    Joined(PlayerId),
    /// Socket lost, transport retrying.
    Reconnecting,
    /// Transport gave up.
    Lost,
}

/// What the client knows about another player.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePlayer {
    /// Display name.
    pub name: String,
    /// Display color.
    pub color: String,
    /// Active chat bubble.
    pub chat_message: Option<String>,
}

impl From<&PlayerState> for RemotePlayer {
    fn from(player: &PlayerState) -> Self {
        Self {
            name: player.name.clone(),
            color: player.color.clone(),
            chat_message: player.chat_message.clone(),
        }
    }
}

/// Positions to draw this frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameView {
    /// Local avatar, once joined.
    pub local: Option<Vec3>,
    /// Remote avatars.
    pub remotes: Vec<(PlayerId, Vec3)>,
}

/// One client's synchronization state.
#[derive(Debug)]
pub struct ClientSession {
    config: ClientConfig,
    status: ConnectionStatus,
    sequencer: InputSequencer,
    predictor: ClientPredictor,
    reconciler: Reconciler,
    interpolator: RemoteInterpolator,
    rtt: RttEstimator,
    clock: ServerClock,
    remotes: BTreeMap<PlayerId, RemotePlayer>,
    player_count: usize,
    wall_display: Option<String>,
    last_join_error: Option<String>,
}

impl ClientSession {
    /// Fresh, unconnected session.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            sequencer: InputSequencer::new(config.send_rate_hz),
            predictor: ClientPredictor::new(config.physics, Vec3::ZERO),
            reconciler: Reconciler::new(config.reconciler),
            interpolator: RemoteInterpolator::new(
                config.interpolation_delay_ms,
                config.max_interpolation_delay_ms,
            ),
            rtt: RttEstimator::new(),
            clock: ServerClock::new(),
            remotes: BTreeMap::new(),
            player_count: 0,
            wall_display: None,
            last_join_error: None,
            config,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connection status.
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Our player id, once joined.
    pub fn local_id(&self) -> Option<PlayerId> {
        match self.status {
            ConnectionStatus::Joined(id) => Some(id),
            _ => None,
        }
    }

    /// Other players currently known.
    pub fn remotes(&self) -> &BTreeMap<PlayerId, RemotePlayer> {
        &self.remotes
    }

    /// Last reported player count.
    pub fn player_count(&self) -> usize {
        self.player_count
    }

    /// Shared display content.
    pub fn wall_display(&self) -> Option<&str> {
        self.wall_display.as_deref()
    }

    /// Why the last join was refused.
    pub fn last_join_error(&self) -> Option<&str> {
        self.last_join_error.as_deref()
    }

    /// Reconciliation counters.
    pub fn reconcile_stats(&self) -> &ReconcileStats {
        self.reconciler.stats()
    }

    /// Smoothed RTT (ms).
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt.rtt_ms()
    }

    /// Current remote interpolation delay (ms).
    pub fn interpolation_delay_ms(&self) -> f64 {
        self.interpolator.delay_ms()
    }

    /// Committed local prediction.
    pub fn predicted(&self) -> &MovementState {
        self.predictor.committed()
    }

    /// Commands awaiting acknowledgement.
    pub fn pending_inputs(&self) -> usize {
        self.reconciler.pending_len()
    }

    /// Key down.
    pub fn press(&mut self, action: Action, now: Millis) {
        self.sequencer.press(action, now);
    }

    /// Key up.
    pub fn release(&mut self, action: Action) {
        self.sequencer.release(action);
    }

    /// Turn the camera by whole steps.
    pub fn rotate(&mut self, steps: i32) {
        self.sequencer.rotate(steps);
    }

    /// The join request for this client.
    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::PlayerJoin(JoinRequest {
            name: self.config.name.clone(),
            color: self.config.color.clone(),
        })
    }

    /// An RTT ping stamped with local time.
    pub fn ping_message(&self, now: Millis) -> ClientMessage {
        ClientMessage::Ping { timestamp: now }
    }

    /// Socket (re)opened. The server sees a brand new connection, so all
    /// per-player state starts over. Returns the join request to send.
    pub fn on_connected(&mut self) -> ClientMessage {
        self.status = ConnectionStatus::Connecting;
        self.sequencer.reset();
        self.reconciler.reset();
        self.predictor.reset(MovementState::at(Vec3::ZERO, &self.config.physics));
        self.interpolator.clear();
        self.clock.reset();
        self.remotes.clear();
        self.join_message()
    }

    /// Socket lost.
    pub fn on_disconnected(&mut self) {
        self.status = ConnectionStatus::Reconnecting;
        self.sequencer.release_all();
    }

    /// Transport gave up.
    pub fn on_failed(&mut self) {
        self.status = ConnectionStatus::Lost;
        self.sequencer.release_all();
    }

    /// Apply a server message.
    ///
    /// Returns the reconciliation outcome when the message was an
    /// acknowledgement that moved the local prediction.
    pub fn handle(&mut self, message: ServerMessage, now: Millis) -> Option<Reconciliation> {
        match message {
            ServerMessage::JoinAccepted { player } => {
                info!("Joined as {} ({})", player.name, player.id.short());
                self.status = ConnectionStatus::Joined(player.id);
                self.last_join_error = None;
                self.remotes.remove(&player.id);
                self.interpolator.remove(&player.id);
                self.predictor.reset(MovementState {
                    position: player.position,
                    horizontal_velocity: Vec3::ZERO,
                    vertical_velocity: player.vertical_velocity,
                    is_grounded: player.is_grounded,
                    jump_held: false,
                });
            }
            ServerMessage::JoinError { error } => {
                warn!("Join refused: {}", error);
                self.last_join_error = Some(error);
            }
            ServerMessage::PlayerJoined { player } => {
                if Some(player.id) != self.local_id() {
                    debug!("{} joined", player.name);
                    self.remotes.insert(player.id, RemotePlayer::from(&player));
                }
            }
            ServerMessage::CurrentPlayers { players } => {
                let local = self.local_id();
                for player in players.iter().filter(|p| Some(p.id) != local) {
                    self.remotes.insert(player.id, RemotePlayer::from(player));
                }
            }
            ServerMessage::GlobalStateUpdate(update) => {
                self.clock.observe(update.server_time, now, self.rtt.rtt_ms().unwrap_or(0.0));
                let local = self.local_id();
                for player in update.players.iter().filter(|p| Some(p.id) != local) {
                    self.interpolator.push(player.id, update.server_time, player.position);
                    self.remotes.insert(player.id, RemotePlayer::from(player));
                }
                let present: Vec<PlayerId> = update.players.iter().map(|p| p.id).collect();
                let gone: Vec<PlayerId> = self
                    .remotes
                    .keys()
                    .filter(|id| !present.contains(id))
                    .copied()
                    .collect();
                for id in gone {
                    self.forget(&id);
                }
            }
            ServerMessage::ServerPositionUpdate(ack) => {
                if self.local_id().is_none() {
                    return None;
                }
                let result = self.reconciler.reconcile(&self.config.physics, &ack)?;
                match result.correction {
                    Correction::None => {
                        self.predictor.rebase(result.state, self.config.reconciler.correction_factor);
                        self.interpolator.relax();
                    }
                    Correction::Soft { factor } => self.predictor.rebase_smoothed(result.state, factor),
                    Correction::Snap => {
                        warn!("Snapping to server position (ack #{}, error {:?})", ack.sequence, result.error);
                        self.predictor.snap(result.state);
                    }
                }
                if result.escalated {
                    self.interpolator.escalate();
                }
                return Some(result);
            }
            ServerMessage::PlayerCountUpdate { count } => self.player_count = count,
            ServerMessage::PlayerDisconnected { id, name } => {
                debug!("{} left", name);
                self.forget(&id);
            }
            ServerMessage::WallDisplayUpdate { content } => self.wall_display = Some(content),
            ServerMessage::Ping { timestamp, server_time } => {
                let sample = diff_millis(now, timestamp);
                if sample >= 0 {
                    self.rtt.observe(sample as f64);
                    self.clock.observe(server_time, now, self.rtt.rtt_ms().unwrap_or(0.0));
                    self.interpolator.set_jitter(self.rtt.jitter_ms());
                }
            }
        }
        None
    }

    fn forget(&mut self, id: &PlayerId) {
        self.remotes.remove(id);
        self.interpolator.remove(id);
    }

    /// Emit the next input command if the send interval has elapsed.
    ///
    /// The command is predicted and recorded before it leaves, so the
    /// local avatar never waits for the server.
    pub fn tick_input(&mut self, now: Millis) -> Option<ClientMessage> {
        self.local_id()?;
        let command = self.sequencer.poll(now)?;
        let intent = command.intent();
        let predicted = self.predictor.commit(&intent);
        self.reconciler.record(PredictionRecord {
            sequence: command.sequence,
            timestamp: command.timestamp,
            input: intent,
            predicted,
        });
        Some(ClientMessage::PlayerInput(InputPayload::from(&command)))
    }

    /// Positions to render this frame.
    pub fn frame(&mut self, frame_dt: f64, now: Millis) -> FrameView {
        let local = self.local_id().map(|_| {
            let live = self.sequencer.live_intent();
            self.predictor.frame(&live, frame_dt)
        });
        FrameView {
            local,
            remotes: self.interpolator.sample_all(self.clock.server_now(now)),
        }
    }
}
