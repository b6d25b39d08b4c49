//! Broadcast Fan-out
//!
//! Ships full-state snapshots on a fixed tick cadence, independent of how
//! often inputs arrive, and routes targeted messages. Every write is a
//! non-blocking `try_send`; a slow connection never stalls the tick.

use tracing::{debug, warn};

use crate::core::clock::Millis;
use crate::game::state::PlayerState;
use crate::network::protocol::{ServerMessage, StateUpdate};
use crate::network::session::{ConnectionId, Delivery, SessionTable};

/// Counters from one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Messages queued.
    pub sent: usize,
    /// Non-critical messages skipped due to backpressure.
    pub skipped: usize,
    /// Connections doomed by this fan-out.
    pub failed: usize,
}

impl FanOut {
    fn record(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Sent => self.sent += 1,
            Delivery::Skipped => self.skipped += 1,
            Delivery::Overflowed | Delivery::Closed => self.failed += 1,
        }
    }
}

/// Fixed-cadence broadcaster.
#[derive(Debug)]
pub struct Broadcaster {
    interval_ticks: u64,
    snapshots_sent: u64,
}

impl Broadcaster {
    /// Broadcast every `interval_ticks` ticks (zero is treated as one).
    pub fn new(interval_ticks: u64) -> Self {
        Self {
            interval_ticks: interval_ticks.max(1),
            snapshots_sent: 0,
        }
    }

    /// Whether a snapshot is due on this tick.
    pub fn is_due(&self, tick: u64) -> bool {
        tick % self.interval_ticks == 0
    }

    /// Snapshots broadcast so far.
    pub fn snapshots_sent(&self) -> u64 {
        self.snapshots_sent
    }

    /// Send a world snapshot to every joined connection.
    ///
    /// Unjoined connections are not sent snapshots; they receive the world
    /// via `current_players` on join.
    pub fn broadcast_snapshot(
        &mut self,
        sessions: &mut SessionTable,
        players: Vec<PlayerState>,
        server_time: Millis,
    ) -> FanOut {
        self.snapshots_sent += 1;
        let msg = ServerMessage::GlobalStateUpdate(StateUpdate { server_time, players });

        let mut report = FanOut::default();
        for connection in sessions.iter_mut().filter(|c| c.player_id().is_some()) {
            report.record(connection.deliver(msg.clone()));
        }
        if report.skipped > 0 {
            debug!("Snapshot skipped for {} slow connection(s)", report.skipped);
        }
        report
    }

    /// Send a message to every connection, optionally excluding one.
    pub fn broadcast(
        &self,
        sessions: &mut SessionTable,
        msg: &ServerMessage,
        except: Option<ConnectionId>,
    ) -> FanOut {
        let mut report = FanOut::default();
        for connection in sessions.iter_mut().filter(|c| Some(c.id) != except) {
            report.record(connection.deliver(msg.clone()));
        }
        report
    }

    /// Send a message to one connection.
    pub fn send_to(&self, sessions: &mut SessionTable, id: ConnectionId, msg: ServerMessage) -> Delivery {
        match sessions.get_mut(id) {
            Some(connection) => {
                let delivery = connection.deliver(msg);
                if matches!(delivery, Delivery::Overflowed) {
                    warn!("Connection {} outbound queue overflowed", id);
                }
                delivery
            }
            None => Delivery::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use crate::game::state::PlayerId;
    use crate::network::session::Connection;

    fn table_with(n: u64, capacity: usize) -> (SessionTable, Vec<mpsc::Receiver<ServerMessage>>) {
        let mut table = SessionTable::new();
        let mut receivers = Vec::new();
        for id in 0..n {
            let (tx, rx) = mpsc::channel(capacity);
            table.insert(Connection::new(id, "127.0.0.1:1".parse().unwrap(), tx, 8));
            table.join(id, PlayerId::generate()).unwrap();
            receivers.push(rx);
        }
        (table, receivers)
    }

    #[test]
    fn test_cadence() {
        let b = Broadcaster::new(3);
        assert!(b.is_due(3));
        assert!(!b.is_due(4));
        assert!(Broadcaster::new(0).is_due(7));
    }

    #[test]
    fn test_snapshot_reaches_joined_connections_only() {
        let (mut table, mut receivers) = table_with(2, 4);
        let (tx, mut unjoined_rx) = mpsc::channel(4);
        table.insert(Connection::new(99, "127.0.0.1:2".parse().unwrap(), tx, 8));

        let mut b = Broadcaster::new(1);
        let report = b.broadcast_snapshot(&mut table, vec![], 123);

        assert_eq!(report.sent, 2);
        for rx in receivers.iter_mut() {
            assert!(matches!(rx.try_recv(), Ok(ServerMessage::GlobalStateUpdate(s)) if s.server_time == 123));
        }
        assert!(unjoined_rx.try_recv().is_err());
        assert_eq!(b.snapshots_sent(), 1);
    }

    #[test]
    fn test_slow_connection_is_skipped_not_blocking() {
        let (mut table, _receivers) = table_with(2, 1);
        let mut b = Broadcaster::new(1);

        b.broadcast_snapshot(&mut table, vec![], 1);
        let report = b.broadcast_snapshot(&mut table, vec![], 2);

        assert_eq!(report.skipped, 2);
        assert!(table.doomed().is_empty());
    }

    #[test]
    fn test_broadcast_except() {
        let (mut table, mut receivers) = table_with(3, 4);
        let b = Broadcaster::new(1);
        let report = b.broadcast(&mut table, &ServerMessage::PlayerCountUpdate { count: 3 }, Some(1));

        assert_eq!(report.sent, 2);
        assert!(receivers[0].try_recv().is_ok());
        assert!(receivers[1].try_recv().is_err());
        assert!(receivers[2].try_recv().is_ok());
    }
}
