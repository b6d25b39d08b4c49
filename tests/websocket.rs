//! Full stack over real sockets: server on an ephemeral port, clients
//! through the reconnecting transport.

use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

use aworld::client::session::{ClientConfig, ClientSession, ConnectionStatus};
use aworld::client::transport::{ReconnectPolicy, Transport, TransportEvent};
use aworld::core::clock::now_millis;
use aworld::game::input::Action;
use aworld::network::protocol::{ClientMessage, JoinRequest};
use aworld::network::server::{GameServer, ServerConfig, ServerHandle};

async fn start_server() -> (String, ServerHandle) {
    let server = GameServer::new(ServerConfig::default());
    let handle = server.handle();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(server.serve(listener));
    (url, handle)
}

struct Client {
    transport: Transport,
    session: ClientSession,
}

impl Client {
    fn connect(url: &str, name: &str) -> Self {
        let config = ClientConfig {
            url: url.to_string(),
            name: name.to_string(),
            reconnect: ReconnectPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
            },
            ..Default::default()
        };
        Self {
            transport: Transport::connect(config.url.clone(), config.reconnect),
            session: ClientSession::new(config),
        }
    }

    /// Drive the client until `done` holds or the deadline passes.
    async fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&ClientSession) -> bool,
    {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if done(&self.session) {
                return true;
            }
            tokio::select! {
                event = self.transport.next_event() => match event {
                    Some(TransportEvent::Connected) => {
                        let join = self.session.on_connected();
                        self.transport.send(&join).unwrap();
                    }
                    Some(TransportEvent::Message(message)) => {
                        self.session.handle(message, now_millis());
                    }
                    Some(TransportEvent::Disconnected) => self.session.on_disconnected(),
                    Some(TransportEvent::Failed(_)) | None => {
                        self.session.on_failed();
                        return false;
                    }
                },
                _ = sleep(Duration::from_millis(10)) => {
                    let now = now_millis();
                    if let Some(input) = self.session.tick_input(now) {
                        self.transport.send(&input).unwrap();
                    }
                    self.session.frame(0.01, now);
                }
            }
        }
        done(&self.session)
    }
}

fn joined(session: &ClientSession) -> bool {
    matches!(session.status(), ConnectionStatus::Joined(_))
}

#[tokio::test]
async fn test_join_move_and_ack() {
    let (url, handle) = start_server().await;
    let mut client = Client::connect(&url, "walker");

    // The wall text follows the join acceptance as a separate frame
    let welcomed = client
        .run_until(Duration::from_secs(5), |s| joined(s) && s.wall_display().is_some())
        .await;
    assert!(welcomed);
    assert_eq!(client.session.wall_display(), Some("Welcome to AWorld!"));

    client.session.press(Action::Forward, now_millis());
    let moved = client
        .run_until(Duration::from_secs(5), |s| {
            s.reconcile_stats().accepted + s.reconcile_stats().soft + s.reconcile_stats().snaps >= 10
        })
        .await;
    assert!(moved);

    // Walking forward with no rotation heads down -z
    assert!(client.session.predicted().position.z < -0.5);
    assert_eq!(client.session.reconcile_stats().snaps, 0);

    let stats = handle.stats();
    assert_eq!(stats.players, 1);
    assert!(stats.processed_inputs >= 10);

    handle.shutdown();
}

#[tokio::test]
async fn test_remote_player_is_visible() {
    let (url, handle) = start_server().await;
    let mut alice = Client::connect(&url, "alice");
    let mut bob = Client::connect(&url, "bob");

    assert!(alice.run_until(Duration::from_secs(5), joined).await);
    assert!(bob.run_until(Duration::from_secs(5), joined).await);

    let alice_id = alice.session.local_id().unwrap();
    let seen = bob
        .run_until(Duration::from_secs(5), |s| s.remotes().contains_key(&alice_id))
        .await;
    assert!(seen);
    assert_eq!(bob.session.remotes()[&alice_id].name, "alice");

    let rendered = bob
        .run_until(Duration::from_secs(5), |s| s.player_count() == 2)
        .await;
    assert!(rendered);

    handle.shutdown();
}

#[tokio::test]
async fn test_invalid_join_keeps_connection_unjoined() {
    let (url, handle) = start_server().await;
    let mut client = Client::connect(&url, "placeholder");

    // Wait for the socket, then send a blank name by hand
    let connected = timeout(Duration::from_secs(5), client.transport.next_event()).await.unwrap();
    assert!(matches!(connected, Some(TransportEvent::Connected)));
    client
        .transport
        .send(&ClientMessage::PlayerJoin(JoinRequest { name: "  ".into(), color: "#fff".into() }))
        .unwrap();

    let refused = client
        .run_until(Duration::from_secs(5), |s| s.last_join_error().is_some())
        .await;
    assert!(refused);
    assert!(!joined(&client.session));

    // Same connection can still join properly
    client.transport.send(&client.session.join_message()).unwrap();
    assert!(client.run_until(Duration::from_secs(5), joined).await);

    handle.shutdown();
}

#[tokio::test]
async fn test_ping_measures_rtt() {
    let (url, handle) = start_server().await;
    let mut client = Client::connect(&url, "pinger");
    assert!(client.run_until(Duration::from_secs(5), joined).await);

    let ping = client.session.ping_message(now_millis());
    client.transport.send(&ping).unwrap();
    let measured = client
        .run_until(Duration::from_secs(5), |s| s.rtt_ms().is_some())
        .await;
    assert!(measured);

    handle.shutdown();
}
