//! Network Layer
//!
//! WebSocket server for real-time multiplayer communication plus the
//! out-of-band HTTP surface. All player state mutation happens in `game/`,
//! driven from the single tick task in `server`.

pub mod protocol;
pub mod session;
pub mod broadcast;
pub mod server;
pub mod http;

pub use protocol::{ClientMessage, ServerMessage, ClientRequest, ProtocolError, ProtocolLimits};
pub use session::{Connection, ConnectionId, ConnectionPhase, SessionError, SessionTable};
pub use broadcast::Broadcaster;
pub use server::{GameServer, GameServerError, ServerConfig, ServerHandle, ServerStats};
