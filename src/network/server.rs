//! WebSocket Game Server
//!
//! Async WebSocket server for the shared world.
//!
//! ## Task layout
//!
//! - one accept loop
//! - one task per connection: decodes frames, forwards validated requests
//! - one writer task per connection: drains the outbound queue to the socket
//! - one tick task: sole owner of the world and the session table
//!
//! Connection tasks never touch player state. They send [`Inbound`] events
//! to the tick task, which applies them between ticks and fans results back
//! out through each connection's bounded outbound queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::core::clock::now_millis;
use crate::core::physics::{PhysicsConfig, PhysicsConfigError};
use crate::core::vec3::Vec3;
use crate::game::state::PlayerId;
use crate::game::tick::World;
use crate::network::broadcast::Broadcaster;
use crate::network::protocol::{
    ClientMessage, ClientRequest, PositionUpdate, ProtocolError, ProtocolLimits, ServerMessage,
};
use crate::network::session::{Connection, ConnectionId, SessionTable};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// HTTP bind address (health, physics, admin).
    pub http_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Broadcast a snapshot every N ticks.
    pub broadcast_interval_ticks: u64,
    /// Per-connection pending input capacity (drop-oldest).
    pub input_queue_capacity: usize,
    /// Per-connection outbound message capacity.
    pub outbound_queue_capacity: usize,
    /// Chat text limit (characters).
    pub chat_max_len: usize,
    /// Chat bubble lifetime.
    pub chat_lifetime: Duration,
    /// Display name limit (characters).
    pub max_name_len: usize,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Initial shared display content.
    pub wall_display: String,
    /// Shared physics constants. The tick rate comes from here.
    pub physics: PhysicsConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8001)),
            max_connections: 1000,
            broadcast_interval_ticks: 1,
            input_queue_capacity: 64,
            outbound_queue_capacity: 128,
            chat_max_len: 120,
            chat_lifetime: Duration::from_secs(15),
            max_name_len: 32,
            idle_timeout: Duration::from_secs(300),
            wall_display: "Welcome to AWorld!".to_string(),
            physics: PhysicsConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Simulation tick rate (Hz).
    pub fn tick_rate(&self) -> u32 {
        self.physics.tick_rate
    }

    /// Build from process environment.
    pub fn from_env() -> Result<Self, GameServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup.
    ///
    /// - `PORT`: WebSocket port on 0.0.0.0, HTTP on the next port
    /// - `AWORLD_BIND` / `AWORLD_HTTP_BIND`: full socket addresses
    /// - `AWORLD_PHYSICS_FILE`: JSON physics constants
    pub fn from_lookup<F>(lookup: F) -> Result<Self, GameServerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid PORT: {}", port)))?;
            config.bind_addr.set_port(port);
            config.http_addr.set_port(port.wrapping_add(1));
        }
        if let Some(addr) = lookup("AWORLD_BIND") {
            config.bind_addr = parse_addr("AWORLD_BIND", &addr)?;
            config.http_addr = SocketAddr::new(config.bind_addr.ip(), config.bind_addr.port().wrapping_add(1));
        }
        if let Some(addr) = lookup("AWORLD_HTTP_BIND") {
            config.http_addr = parse_addr("AWORLD_HTTP_BIND", &addr)?;
        }
        if let Some(path) = lookup("AWORLD_PHYSICS_FILE") {
            let text = std::fs::read_to_string(&path)?;
            config.physics = PhysicsConfig::from_json_str(&text)?;
        }

        Ok(config)
    }

    fn limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            max_name_len: self.max_name_len,
            ..Default::default()
        }
    }
}

fn parse_addr(key: &str, value: &str) -> Result<SocketAddr, GameServerError> {
    value
        .parse()
        .map_err(|_| GameServerError::Config(format!("invalid {}: {}", key, value)))
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Socket or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bad configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bad physics constants.
    #[error(transparent)]
    Physics(#[from] PhysicsConfigError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed or the stream ended.
    ClientClosed,
    /// No inbound traffic within the idle timeout.
    Idle,
    /// Read error.
    Error,
    /// Writer stopped (server dropped the connection or a write failed).
    WriterClosed,
    /// Outbound queue overflowed on a critical message.
    Backpressure,
    /// Simulation panicked for this connection's player.
    SimulationFault,
    /// Server shutting down.
    Shutdown,
}

/// Events flowing into the tick task.
#[derive(Debug)]
pub enum Inbound {
    /// A WebSocket handshake completed.
    Connected {
        /// Connection id.
        id: ConnectionId,
        /// Peer address.
        addr: SocketAddr,
        /// Outbound queue.
        sender: mpsc::Sender<ServerMessage>,
    },
    /// A validated request.
    Request {
        /// Connection id.
        id: ConnectionId,
        /// The request.
        request: ClientRequest,
    },
    /// The connection task ended.
    Closed {
        /// Connection id.
        id: ConnectionId,
        /// Why.
        reason: CloseReason,
    },
    /// Admin update of the shared display.
    SetWallDisplay {
        /// New content.
        content: String,
    },
}

/// Live counters published by the tick task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    /// Joined players.
    pub players: usize,
    /// Open connections.
    pub connections: usize,
    /// Input commands applied.
    pub processed_inputs: u64,
    /// Input commands dropped by queue overflow on live connections.
    pub dropped_inputs: u64,
    /// Ticks run.
    pub tick: u64,
    /// Snapshots broadcast.
    pub snapshots: u64,
}

/// Cloneable access to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    inbound: mpsc::Sender<Inbound>,
    stats: watch::Receiver<ServerStats>,
    shutdown: broadcast::Sender<()>,
    physics: PhysicsConfig,
    version: String,
}

impl ServerHandle {
    /// Latest published counters.
    pub fn stats(&self) -> ServerStats {
        self.stats.borrow().clone()
    }

    /// Shared physics constants.
    pub fn physics(&self) -> &PhysicsConfig {
        &self.physics
    }

    /// Server version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Replace the shared display content and broadcast it.
    pub async fn set_wall_display(&self, content: String) -> Result<(), GameServerError> {
        self.inbound
            .send(Inbound::SetWallDisplay { content })
            .await
            .map_err(|_| GameServerError::Internal("tick loop stopped".into()))
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,
    stats_tx: watch::Sender<ServerStats>,
    stats_rx: watch::Receiver<ServerStats>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_connections.max(64) * 4);
        let (stats_tx, stats_rx) = watch::channel(ServerStats::default());

        Self {
            config,
            inbound_tx,
            inbound_rx,
            stats_tx,
            stats_rx,
            shutdown_tx,
        }
    }

    /// Handle for HTTP, admin and shutdown.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            inbound: self.inbound_tx.clone(),
            stats: self.stats_rx.clone(),
            shutdown: self.shutdown_tx.clone(),
            physics: self.config.physics,
            version: self.config.version.clone(),
        }
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(self, listener: TcpListener) -> Result<(), GameServerError> {
        let GameServer { config, inbound_tx, inbound_rx, stats_tx, shutdown_tx, .. } = self;
        info!("Game server listening on {}", listener.local_addr()?);
        info!("Tick rate {} Hz, snapshot every {} tick(s)", config.tick_rate(), config.broadcast_interval_ticks);

        let tick_loop = TickLoop::new(config.clone(), stats_tx);
        let tick_handle = tokio::spawn(tick_loop.run(inbound_rx, shutdown_tx.subscribe()));

        let permits = Arc::new(Semaphore::new(config.max_connections));
        let settings = ConnectionSettings {
            limits: config.limits(),
            idle_timeout: config.idle_timeout,
            outbound_capacity: config.outbound_queue_capacity,
        };
        let mut next_id: ConnectionId = 1;
        let mut shutdown_rx = shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let permit = match permits.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!("Connection limit reached, rejecting {}", addr);
                                    continue;
                                }
                            };

                            let id = next_id;
                            next_id += 1;
                            debug!("New connection {} from {}", id, addr);

                            tokio::spawn(handle_connection(
                                stream,
                                addr,
                                id,
                                inbound_tx.clone(),
                                settings,
                                shutdown_tx.subscribe(),
                                permit,
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        tick_handle
            .await
            .map_err(|e| GameServerError::Internal(format!("tick loop failed: {}", e)))
    }
}

// =============================================================================
// CONNECTION TASK
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct ConnectionSettings {
    limits: ProtocolLimits,
    idle_timeout: Duration,
    outbound_capacity: usize,
}

/// Reply on a connection's own queue without going through the tick task.
fn reply(direct: &mpsc::WeakSender<ServerMessage>, msg: ServerMessage) {
    if let Some(tx) = direct.upgrade() {
        let _ = tx.try_send(msg);
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    inbound: mpsc::Sender<Inbound>,
    settings: ConnectionSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
    _permit: OwnedSemaphorePermit,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(settings.outbound_capacity);

    // The tick task holds the only strong sender; once it drops it the
    // writer drains and exits.
    let direct = msg_tx.downgrade();
    if inbound.send(Inbound::Connected { id, addr, sender: msg_tx }).await.is_err() {
        return;
    }

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize {}: {}", msg.event_name(), e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut deadline = Instant::now() + settings.idle_timeout;
    let reason = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        deadline = Instant::now() + settings.idle_timeout;
                        match ClientMessage::decode(&text, &settings.limits) {
                            Ok(ClientRequest::Ping(timestamp)) => {
                                reply(&direct, ServerMessage::Ping { timestamp, server_time: now_millis() });
                            }
                            Ok(request) => {
                                if inbound.send(Inbound::Request { id, request }).await.is_err() {
                                    break CloseReason::Shutdown;
                                }
                            }
                            Err(ProtocolError::InvalidJoin(error)) => {
                                warn!("Join refused for {}: {}", addr, error);
                                reply(&direct, ServerMessage::JoinError { error });
                            }
                            Err(e @ ProtocolError::Malformed(_)) => {
                                debug!("Ignoring frame from {}: {}", addr, e);
                            }
                            Err(e) => {
                                warn!("Rejected message from {}: {}", addr, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
                    Some(Ok(Message::Binary(_))) => {
                        deadline = Instant::now() + settings.idle_timeout;
                        debug!("Ignoring binary frame from {}", addr);
                    }
                    Some(Ok(_)) => {
                        deadline = Instant::now() + settings.idle_timeout;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error for {}: {}", addr, e);
                        break CloseReason::Error;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!("Closing idle connection {} from {}", id, addr);
                break CloseReason::Idle;
            }
            _ = &mut writer => break CloseReason::WriterClosed,
            _ = shutdown_rx.recv() => break CloseReason::Shutdown,
        }
    };

    writer.abort();
    let _ = inbound.send(Inbound::Closed { id, reason }).await;
}

// =============================================================================
// TICK TASK
// =============================================================================

/// Sole owner of the world and the session table.
struct TickLoop {
    config: ServerConfig,
    world: World,
    sessions: SessionTable,
    broadcaster: Broadcaster,
    wall_display: String,
    stats_tx: watch::Sender<ServerStats>,
}

impl TickLoop {
    fn new(config: ServerConfig, stats_tx: watch::Sender<ServerStats>) -> Self {
        Self {
            world: World::new(config.physics),
            sessions: SessionTable::new(),
            broadcaster: Broadcaster::new(config.broadcast_interval_ticks),
            wall_display: config.wall_display.clone(),
            stats_tx,
            config,
        }
    }

    async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: broadcast::Receiver<()>) {
        let tick_duration = Duration::from_secs_f64(self.config.physics.fixed_dt());
        let mut ticker = interval(tick_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                event = inbound.recv() => match event {
                    Some(event) => self.on_inbound(event),
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }

        info!("Tick loop stopped at tick {}", self.world.tick());
    }

    fn on_inbound(&mut self, event: Inbound) {
        match event {
            Inbound::Connected { id, addr, sender } => {
                self.sessions.insert(Connection::new(id, addr, sender, self.config.input_queue_capacity));
                info!("Connection {} opened from {}", id, addr);
            }
            Inbound::Request { id, request } => self.on_request(id, request),
            Inbound::Closed { id, reason } => self.disconnect(id, reason),
            Inbound::SetWallDisplay { content } => {
                info!("Wall display updated ({} chars)", content.chars().count());
                self.wall_display = content.clone();
                let msg = ServerMessage::WallDisplayUpdate { content };
                self.broadcaster.broadcast(&mut self.sessions, &msg, None);
            }
        }
        self.reap();
    }

    fn on_request(&mut self, id: ConnectionId, request: ClientRequest) {
        let player = match self.sessions.get_mut(id) {
            Some(connection) => connection.require_active(),
            None => return,
        };

        match request {
            ClientRequest::Join { name, color } => self.on_join(id, name, color),
            ClientRequest::Input(command) => {
                let Some(connection) = self.sessions.get_mut(id) else { return };
                match connection.enqueue_input(command) {
                    Ok(Some(evicted)) => debug!("Connection {} input queue full, dropped #{}", id, evicted.sequence),
                    Ok(None) => {}
                    Err(e) => debug!("Input from connection {} ignored: {}", id, e),
                }
            }
            ClientRequest::LegacyMove(position) => match player {
                Ok(player_id) => self.on_legacy_move(id, player_id, position),
                Err(e) => debug!("Move from connection {} ignored: {}", id, e),
            },
            ClientRequest::Chat(text) => match player {
                Ok(player_id) => {
                    let lifetime = self.config.chat_lifetime.as_millis() as u64;
                    if let Err(e) = self.world.set_chat(&player_id, &text, now_millis(), lifetime, self.config.chat_max_len) {
                        warn!("Chat from {} rejected: {}", player_id.short(), e);
                    }
                }
                Err(e) => debug!("Chat from connection {} ignored: {}", id, e),
            },
            ClientRequest::Ping(timestamp) => {
                let msg = ServerMessage::Ping { timestamp, server_time: now_millis() };
                self.broadcaster.send_to(&mut self.sessions, id, msg);
            }
        }
    }

    fn on_join(&mut self, id: ConnectionId, name: String, color: String) {
        let player_id = PlayerId::generate();
        if let Err(e) = self.sessions.join(id, player_id) {
            warn!("Join rejected for connection {}: {}", id, e);
            self.broadcaster.send_to(&mut self.sessions, id, ServerMessage::JoinError { error: e.to_string() });
            return;
        }

        let player = self.world.add_player(player_id, name, color);
        info!("Player {} ({}) joined on connection {}", player.name, player_id.short(), id);

        let players = self.world.snapshot();
        let count = self.world.player_count();

        self.broadcaster.send_to(&mut self.sessions, id, ServerMessage::JoinAccepted { player: player.clone() });
        self.broadcaster.send_to(&mut self.sessions, id, ServerMessage::CurrentPlayers { players });
        self.broadcaster.send_to(
            &mut self.sessions,
            id,
            ServerMessage::WallDisplayUpdate { content: self.wall_display.clone() },
        );
        self.broadcaster.broadcast(&mut self.sessions, &ServerMessage::PlayerJoined { player }, Some(id));
        self.broadcaster.broadcast(&mut self.sessions, &ServerMessage::PlayerCountUpdate { count }, None);
    }

    fn on_legacy_move(&mut self, id: ConnectionId, player_id: PlayerId, position: Vec3) {
        if let Some(connection) = self.sessions.get_mut(id) {
            if connection.note_legacy_move() {
                warn!(
                    "Connection {} ({}) uses legacy player_move; positions are client-supplied and only height-corrected",
                    id,
                    connection.addr
                );
            }
        }
        if let Err(e) = self.world.apply_legacy_move(&player_id, position) {
            warn!("Legacy move from {} rejected: {}", player_id.short(), e);
        }
    }

    fn on_tick(&mut self) {
        let inputs = self.sessions.drain_inputs();
        let result = self.world.run_tick(inputs);

        for ack in result.acks {
            let Some(conn_id) = self.sessions.connection_of(&ack.player_id) else { continue };
            let update = ServerMessage::ServerPositionUpdate(PositionUpdate {
                sequence: ack.sequence,
                timestamp: ack.timestamp,
                position: ack.position,
                velocity: ack.velocity,
                is_grounded: ack.is_grounded,
            });
            self.broadcaster.send_to(&mut self.sessions, conn_id, update);
        }

        for player_id in result.failed {
            if let Some(conn_id) = self.sessions.connection_of(&player_id) {
                self.disconnect(conn_id, CloseReason::SimulationFault);
            }
        }

        if self.broadcaster.is_due(self.world.tick()) {
            let now = now_millis();
            self.world.prune_chats(now);
            let players = self.world.snapshot();
            self.broadcaster.broadcast_snapshot(&mut self.sessions, players, now);
        }

        self.reap();
        self.publish_stats();
    }

    /// Tear down a connection and notify everyone else.
    fn disconnect(&mut self, id: ConnectionId, reason: CloseReason) {
        let Some((connection, player)) = self.sessions.remove(id) else { return };
        info!("Connection {} from {} closed ({:?}) after {:?}", id, connection.addr, reason, connection.age());

        let Some(player_id) = player else { return };
        let Some(state) = self.world.remove_player(&player_id) else { return };
        info!("Player {} ({}) left", state.name, player_id.short());

        let count = self.world.player_count();
        self.broadcaster.broadcast(
            &mut self.sessions,
            &ServerMessage::PlayerDisconnected { id: player_id, name: state.name },
            None,
        );
        self.broadcaster.broadcast(&mut self.sessions, &ServerMessage::PlayerCountUpdate { count }, None);
    }

    /// Remove every connection a failed write has doomed.
    fn reap(&mut self) {
        loop {
            let doomed = self.sessions.doomed();
            if doomed.is_empty() {
                break;
            }
            for id in doomed {
                self.disconnect(id, CloseReason::Backpressure);
            }
        }
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(ServerStats {
            players: self.world.player_count(),
            connections: self.sessions.len(),
            processed_inputs: self.world.processed_inputs(),
            dropped_inputs: self.sessions.dropped_inputs(),
            tick: self.world.tick(),
            snapshots: self.broadcaster.snapshots_sent(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::game::input::{Action, InputCommand, KeyHold};

    fn tick_loop() -> (TickLoop, watch::Receiver<ServerStats>) {
        let (stats_tx, stats_rx) = watch::channel(ServerStats::default());
        (TickLoop::new(ServerConfig::default(), stats_tx), stats_rx)
    }

    fn connect(tl: &mut TickLoop, id: ConnectionId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(32);
        tl.on_inbound(Inbound::Connected { id, addr: "127.0.0.1:5000".parse().unwrap(), sender: tx });
        rx
    }

    fn join(tl: &mut TickLoop, id: ConnectionId, name: &str) {
        tl.on_inbound(Inbound::Request {
            id,
            request: ClientRequest::Join { name: name.into(), color: "blue".into() },
        });
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn forward(sequence: u64) -> ClientRequest {
        let mut held_keys = BTreeMap::new();
        held_keys.insert(Action::Forward, KeyHold { pressed_at: 0, duration: 0.0 });
        ClientRequest::Input(InputCommand { sequence, timestamp: sequence, held_keys, camera_rotation: 0.0 })
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_rate(), 20);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.chat_max_len, 120);
    }

    #[test]
    fn test_config_from_lookup() {
        let config = ServerConfig::from_lookup(|key| match key {
            "PORT" => Some("9100".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.http_addr.port(), 9101);

        let config = ServerConfig::from_lookup(|key| match key {
            "AWORLD_BIND" => Some("127.0.0.1:7000".to_string()),
            "AWORLD_HTTP_BIND" => Some("127.0.0.1:7500".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.http_addr, "127.0.0.1:7500".parse().unwrap());

        assert!(ServerConfig::from_lookup(|key| (key == "PORT").then(|| "nope".to_string())).is_err());
    }

    #[test]
    fn test_join_sends_welcome_sequence() {
        let (mut tl, _stats) = tick_loop();
        let mut first = connect(&mut tl, 1);
        join(&mut tl, 1, "ann");

        let msgs = drain(&mut first);
        assert!(matches!(&msgs[0], ServerMessage::JoinAccepted { player } if player.name == "ann"));
        assert!(matches!(&msgs[1], ServerMessage::CurrentPlayers { players } if players.len() == 1));
        assert!(matches!(&msgs[2], ServerMessage::WallDisplayUpdate { content } if content == "Welcome to AWorld!"));
        assert!(matches!(&msgs[3], ServerMessage::PlayerCountUpdate { count: 1 }));

        let mut second = connect(&mut tl, 2);
        join(&mut tl, 2, "bob");
        let to_first = drain(&mut first);
        assert!(matches!(&to_first[0], ServerMessage::PlayerJoined { player } if player.name == "bob"));
        assert!(matches!(&to_first[1], ServerMessage::PlayerCountUpdate { count: 2 }));
        assert!(matches!(&drain(&mut second)[1], ServerMessage::CurrentPlayers { players } if players.len() == 2));
    }

    #[test]
    fn test_repeated_join_rejected() {
        let (mut tl, _stats) = tick_loop();
        let mut rx = connect(&mut tl, 1);
        join(&mut tl, 1, "ann");
        drain(&mut rx);

        join(&mut tl, 1, "ann again");
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], ServerMessage::JoinError { .. }));
        assert_eq!(tl.world.player_count(), 1);
    }

    #[test]
    fn test_inputs_before_join_are_ignored() {
        let (mut tl, _stats) = tick_loop();
        let mut rx = connect(&mut tl, 1);
        tl.on_inbound(Inbound::Request { id: 1, request: forward(1) });
        tl.on_tick();

        assert_eq!(tl.world.processed_inputs(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_tick_acks_and_broadcasts() {
        let (mut tl, stats) = tick_loop();
        let mut rx = connect(&mut tl, 1);
        join(&mut tl, 1, "ann");
        drain(&mut rx);

        tl.on_inbound(Inbound::Request { id: 1, request: forward(1) });
        tl.on_inbound(Inbound::Request { id: 1, request: forward(2) });
        tl.on_tick();

        let msgs = drain(&mut rx);
        match &msgs[0] {
            ServerMessage::ServerPositionUpdate(update) => {
                assert_eq!(update.sequence, 2);
                assert!((update.position.z + 0.2).abs() < 1e-12);
            }
            other => panic!("expected ack, got {:?}", other),
        }
        match &msgs[1] {
            ServerMessage::GlobalStateUpdate(update) => {
                assert_eq!(update.players.len(), 1);
                assert_eq!(update.players[0].last_processed_sequence, 2);
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        let stats = stats.borrow().clone();
        assert_eq!(stats.processed_inputs, 2);
        assert_eq!(stats.players, 1);
        assert_eq!(stats.tick, 1);
    }

    #[test]
    fn test_disconnect_notifies_others() {
        let (mut tl, _stats) = tick_loop();
        let mut a = connect(&mut tl, 1);
        let _b = connect(&mut tl, 2);
        join(&mut tl, 1, "ann");
        join(&mut tl, 2, "bob");
        drain(&mut a);

        tl.on_inbound(Inbound::Closed { id: 2, reason: CloseReason::ClientClosed });
        let msgs = drain(&mut a);
        assert!(matches!(&msgs[0], ServerMessage::PlayerDisconnected { name, .. } if name == "bob"));
        assert!(matches!(&msgs[1], ServerMessage::PlayerCountUpdate { count: 1 }));

        tl.on_tick();
        match drain(&mut a).last() {
            Some(ServerMessage::GlobalStateUpdate(update)) => assert_eq!(update.players.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_dropped_receiver_is_reaped() {
        let (mut tl, _stats) = tick_loop();
        let a = connect(&mut tl, 1);
        let mut b = connect(&mut tl, 2);
        join(&mut tl, 1, "ann");
        join(&mut tl, 2, "bob");
        drain(&mut b);
        drop(a);

        tl.on_tick();
        assert_eq!(tl.sessions.len(), 1);
        assert_eq!(tl.world.player_count(), 1);
        assert!(drain(&mut b).iter().any(|m| matches!(m, ServerMessage::PlayerDisconnected { name, .. } if name == "ann")));
    }

    #[test]
    fn test_wall_display_update_reaches_everyone() {
        let (mut tl, _stats) = tick_loop();
        let mut rx = connect(&mut tl, 1);
        tl.on_inbound(Inbound::SetWallDisplay { content: "hello".into() });
        assert!(matches!(&drain(&mut rx)[0], ServerMessage::WallDisplayUpdate { content } if content == "hello"));

        join(&mut tl, 1, "ann");
        assert!(drain(&mut rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::WallDisplayUpdate { content } if content == "hello")));
    }

    #[test]
    fn test_chat_is_truncated_in_snapshot() {
        let (mut tl, _stats) = tick_loop();
        let mut rx = connect(&mut tl, 1);
        join(&mut tl, 1, "ann");
        tl.on_inbound(Inbound::Request { id: 1, request: ClientRequest::Chat("x".repeat(500)) });
        drain(&mut rx);

        tl.on_tick();
        match drain(&mut rx).last() {
            Some(ServerMessage::GlobalStateUpdate(update)) => {
                assert_eq!(update.players[0].chat_message.as_deref().map(str::len), Some(120));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_simulation_fault_drops_only_that_player() {
        let (mut tl, stats) = tick_loop();
        let mut a = connect(&mut tl, 1);
        let mut b = connect(&mut tl, 2);
        join(&mut tl, 1, "ann");
        join(&mut tl, 2, "bob");
        drain(&mut a);
        let bob = match drain(&mut b).first() {
            Some(ServerMessage::JoinAccepted { player }) => player.id,
            other => panic!("expected join acceptance, got {:?}", other),
        };
        tl.world.fault_player(bob);

        tl.on_inbound(Inbound::Request { id: 1, request: forward(1) });
        tl.on_inbound(Inbound::Request { id: 2, request: forward(1) });
        tl.on_tick();

        let msgs = drain(&mut a);
        assert!(matches!(&msgs[0], ServerMessage::ServerPositionUpdate(update) if update.sequence == 1));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::PlayerDisconnected { id, .. } if *id == bob)));
        match msgs.last() {
            Some(ServerMessage::GlobalStateUpdate(update)) => {
                assert_eq!(update.players.len(), 1);
                assert_eq!(update.players[0].name, "ann");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }

        // The faulted connection's queue is closed once the tick drops it
        assert!(!drain(&mut b).iter().any(|m| matches!(m, ServerMessage::ServerPositionUpdate(_))));
        assert!(b.try_recv().is_err());
        assert_eq!(tl.sessions.len(), 1);
        assert_eq!(stats.borrow().players, 1);

        // Later ticks keep serving the surviving player
        tl.on_inbound(Inbound::Request { id: 1, request: forward(2) });
        tl.on_tick();
        assert!(matches!(&drain(&mut a)[0], ServerMessage::ServerPositionUpdate(update) if update.sequence == 2));
    }

    #[tokio::test]
    async fn test_silent_connection_closes_as_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let settings = ConnectionSettings {
            limits: ProtocolLimits::default(),
            idle_timeout: Duration::from_millis(200),
            outbound_capacity: 8,
        };
        let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
        let server_shutdown = shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            handle_connection(stream, peer, 7, inbound_tx, settings, server_shutdown, permit).await;
        });
        let (_client, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr)).await.unwrap();

        // Hold the outbound sender so the writer stays up
        let _sender = match inbound_rx.recv().await {
            Some(Inbound::Connected { id: 7, sender, .. }) => sender,
            other => panic!("expected connect, got {:?}", other),
        };
        let opened = Instant::now();

        let closed = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv()).await.unwrap();
        match closed {
            Some(Inbound::Closed { id: 7, reason }) => assert_eq!(reason, CloseReason::Idle),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(opened.elapsed() >= Duration::from_millis(150));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = GameServer::new(ServerConfig::default());
        let handle = server.handle();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let task = tokio::spawn(server.serve(listener));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
