//! WebSocket client transport
//!
//! A background task owns the socket and reconnects with capped
//! exponential backoff. The caller talks to it through two channels:
//! JSON text out, [`TransportEvent`]s in. Frames are decoded exactly once
//! here into [`ServerMessage`].

use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::network::protocol::{ClientMessage, ServerMessage};

/// Outgoing frames buffered while the socket is busy.
const OUTGOING_CAPACITY: usize = 128;

/// Events buffered for the caller.
const EVENT_CAPACITY: usize = 256;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Gave up reconnecting.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Attempts made since the last successful connect.
        attempts: u32,
        /// Last failure seen.
        last_error: String,
    },

    /// The background task has stopped.
    #[error("Transport closed")]
    Closed,

    /// The outgoing queue is full.
    #[error("Outgoing queue full")]
    Backpressure,

    /// Message could not be serialized.
    #[error("Encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reconnect schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts after a failure before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift).min(self.max_delay)
    }
}

/// What the background task reports.
#[derive(Debug)]
pub enum TransportEvent {
    /// Socket open; anything queued before it was discarded.
    Connected,
    /// Decoded server message.
    Message(ServerMessage),
    /// Socket lost; a reconnect is scheduled.
    Disconnected,
    /// Reconnecting stopped for good.
    Failed(TransportError),
}

/// Handle to the background connection.
#[derive(Debug)]
pub struct Transport {
    outgoing: mpsc::Sender<String>,
    events: mpsc::Receiver<TransportEvent>,
    task: JoinHandle<()>,
}

impl Transport {
    /// Start connecting to `url` in the background.
    pub fn connect(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        let task = tokio::spawn(run(url.into(), policy, outgoing_rx, event_tx));
        Self { outgoing: outgoing_tx, events: event_rx, task }
    }

    /// Queue a message without waiting.
    pub fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        self.outgoing.try_send(json).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Backpressure,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Wait for the next event. `None` once the task has ended.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_event(&mut self) -> Option<TransportEvent> {
        self.events.try_recv().ok()
    }

    /// Stop the background task.
    pub fn close(self) {
        self.task.abort();
    }
}

async fn run(
    url: String,
    policy: ReconnectPolicy,
    mut outgoing: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut attempt = 0u32;

    loop {
        let last_error = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                attempt = 0;
                // Frames queued while down belong to the previous session
                while outgoing.try_recv().is_ok() {}

                info!("Connected to {}", url);
                if events.send(TransportEvent::Connected).await.is_err() {
                    return;
                }

                let (mut write, mut read) = ws_stream.split();
                let reason = loop {
                    tokio::select! {
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                                Ok(message) => {
                                    if events.send(TransportEvent::Message(message)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!("Failed to parse server message: {} - {}", e, text),
                            },
                            Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break e.to_string(),
                        },
                        json = outgoing.recv() => match json {
                            Some(json) => {
                                debug!("Sending: {}", json);
                                if let Err(e) = write.send(Message::Text(json)).await {
                                    break e.to_string();
                                }
                            }
                            None => {
                                // Handle dropped
                                let _ = write.close().await;
                                return;
                            }
                        },
                    }
                };

                warn!("Connection to {} lost: {}", url, reason);
                if events.send(TransportEvent::Disconnected).await.is_err() {
                    return;
                }
                reason
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", url, e);
                e.to_string()
            }
        };

        attempt += 1;
        if attempt > policy.max_attempts {
            let error = TransportError::RetriesExhausted { attempts: attempt - 1, last_error };
            let _ = events.send(TransportEvent::Failed(error)).await;
            return;
        }

        let delay = policy.delay(attempt);
        info!("Reconnecting in {:?} (attempt {}/{})", delay, attempt, policy.max_attempts);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(2), Duration::from_millis(500));
        assert_eq!(policy.delay(4), Duration::from_secs(2));
        assert_eq!(policy.delay(5), Duration::from_secs(4));
        assert_eq!(policy.delay(50), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_gives_up_when_nothing_listens() {
        // Bind then drop to get a port nobody is listening on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let policy = ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let mut transport = Transport::connect(format!("ws://127.0.0.1:{}", port), policy);

        match transport.next_event().await {
            Some(TransportEvent::Failed(TransportError::RetriesExhausted { attempts, last_error })) => {
                assert_eq!(attempts, 2);
                assert!(!last_error.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(transport.next_event().await.is_none());
        assert!(matches!(
            transport.send(&ClientMessage::Ping { timestamp: 0 }),
            Err(TransportError::Closed)
        ));
    }
}
