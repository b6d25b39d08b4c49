//! Connection Sessions
//!
//! Per-connection state machine and the table of live connections. Both are
//! owned by the tick task; connection tasks only talk to them through
//! messages.
//!
//! ```text
//!   UNJOINED ──player_join──▶ ACTIVE ──close/error──▶ DISCONNECTED
//!       │                                                  ▲
//!       └──────────────────close/error─────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::game::input::{InputCommand, InputQueue};
use crate::game::state::PlayerId;
use crate::network::protocol::ServerMessage;

/// Server-local connection identifier.
pub type ConnectionId = u64;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Connected, no player yet.
    Unjoined,
    /// Joined as a player.
    Active {
        /// The player this connection controls.
        player_id: PlayerId,
    },
    /// Terminal.
    Disconnected,
}

/// Illegal state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// `player_join` on a connection that already joined.
    #[error("Already joined")]
    AlreadyJoined,

    /// Message requires a joined player.
    #[error("Not joined")]
    NotJoined,

    /// Connection is closed.
    #[error("Connection closed")]
    Disconnected,
}

/// Result of handing a message to a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued.
    Sent,
    /// Queue full, message was not critical and was dropped.
    Skipped,
    /// Queue full with a critical message; connection must be dropped.
    Overflowed,
    /// Writer is gone.
    Closed,
}

/// One live connection as seen by the tick task.
#[derive(Debug)]
pub struct Connection {
    /// Identifier.
    pub id: ConnectionId,
    /// Peer address.
    pub addr: SocketAddr,
    phase: ConnectionPhase,
    inputs: InputQueue,
    sender: mpsc::Sender<ServerMessage>,
    connected_at: Instant,
    legacy_warned: bool,
    doomed: bool,
}

impl Connection {
    /// New unjoined connection.
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        sender: mpsc::Sender<ServerMessage>,
        input_capacity: usize,
    ) -> Self {
        Self {
            id,
            addr,
            phase: ConnectionPhase::Unjoined,
            inputs: InputQueue::new(input_capacity),
            sender,
            connected_at: Instant::now(),
            legacy_warned: false,
            doomed: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    /// Player id if active.
    pub fn player_id(&self) -> Option<PlayerId> {
        match self.phase {
            ConnectionPhase::Active { player_id } => Some(player_id),
            _ => None,
        }
    }

    /// UNJOINED → ACTIVE.
    pub fn join(&mut self, player_id: PlayerId) -> Result<(), SessionError> {
        match self.phase {
            ConnectionPhase::Unjoined => {
                self.phase = ConnectionPhase::Active { player_id };
                Ok(())
            }
            ConnectionPhase::Active { .. } => Err(SessionError::AlreadyJoined),
            ConnectionPhase::Disconnected => Err(SessionError::Disconnected),
        }
    }

    /// Player id, or an error if the connection has not joined.
    pub fn require_active(&self) -> Result<PlayerId, SessionError> {
        match self.phase {
            ConnectionPhase::Active { player_id } => Ok(player_id),
            ConnectionPhase::Unjoined => Err(SessionError::NotJoined),
            ConnectionPhase::Disconnected => Err(SessionError::Disconnected),
        }
    }

    /// Any phase → DISCONNECTED. Returns the player to remove, if any.
    pub fn disconnect(&mut self) -> Option<PlayerId> {
        let player = self.player_id();
        self.phase = ConnectionPhase::Disconnected;
        self.doomed = true;
        player
    }

    /// Queue a command for the next tick (drop-oldest).
    pub fn enqueue_input(&mut self, command: InputCommand) -> Result<Option<InputCommand>, SessionError> {
        self.require_active()?;
        Ok(self.inputs.push(command))
    }

    /// Take queued commands.
    pub fn drain_inputs(&mut self) -> Vec<InputCommand> {
        self.inputs.drain()
    }

    /// Commands dropped by queue overflow.
    pub fn dropped_inputs(&self) -> u64 {
        self.inputs.dropped()
    }

    /// Returns true the first time a legacy move is seen on this connection.
    pub fn note_legacy_move(&mut self) -> bool {
        !std::mem::replace(&mut self.legacy_warned, true)
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Whether the connection should be torn down.
    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Push a message without blocking.
    ///
    /// A full queue skips non-critical messages. A full queue on a critical
    /// message, or a closed writer, dooms the connection.
    pub fn deliver(&mut self, msg: ServerMessage) -> Delivery {
        if self.doomed {
            return Delivery::Closed;
        }
        match self.sender.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(msg)) if !msg.is_critical() => {
                debug!("Connection {} backpressured, skipped {}", self.id, msg.event_name());
                Delivery::Skipped
            }
            Err(TrySendError::Full(_)) => {
                self.doomed = true;
                Delivery::Overflowed
            }
            Err(TrySendError::Closed(_)) => {
                self.doomed = true;
                Delivery::Closed
            }
        }
    }
}

/// Every live connection, plus a player → connection index.
#[derive(Debug, Default)]
pub struct SessionTable {
    connections: BTreeMap<ConnectionId, Connection>,
    by_player: BTreeMap<PlayerId, ConnectionId>,
}

impl SessionTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.id, connection);
    }

    /// Look up a connection.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Move a connection to ACTIVE and index its player.
    pub fn join(&mut self, id: ConnectionId, player_id: PlayerId) -> Result<(), SessionError> {
        let connection = self.connections.get_mut(&id).ok_or(SessionError::Disconnected)?;
        connection.join(player_id)?;
        self.by_player.insert(player_id, id);
        Ok(())
    }

    /// Remove a connection, marking it DISCONNECTED.
    pub fn remove(&mut self, id: ConnectionId) -> Option<(Connection, Option<PlayerId>)> {
        let mut connection = self.connections.remove(&id)?;
        let player = connection.disconnect();
        if let Some(player_id) = player {
            self.by_player.remove(&player_id);
        }
        Some((connection, player))
    }

    /// Connection controlling a player.
    pub fn connection_of(&self, player_id: &PlayerId) -> Option<ConnectionId> {
        self.by_player.get(player_id).copied()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of joined connections.
    pub fn active_count(&self) -> usize {
        self.by_player.len()
    }

    /// Mutable iteration over connections.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    /// Ids of connections that must be torn down.
    pub fn doomed(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_doomed())
            .map(|c| c.id)
            .collect()
    }

    /// Drain every active connection's queue, keyed by player.
    pub fn drain_inputs(&mut self) -> BTreeMap<PlayerId, Vec<InputCommand>> {
        let mut inputs = BTreeMap::new();
        for connection in self.connections.values_mut() {
            if let Some(player_id) = connection.player_id() {
                let commands = connection.drain_inputs();
                if !commands.is_empty() {
                    inputs.insert(player_id, commands);
                }
            }
        }
        inputs
    }

    /// Total commands dropped by input-queue overflow across live connections.
    pub fn dropped_inputs(&self) -> u64 {
        self.connections.values().map(Connection::dropped_inputs).sum()
    }
}
