//! Client Runtime
//!
//! Everything a headless or rendering client needs to stay in sync with
//! the server. Only `transport` touches the network.
//!
//! ## Module Structure
//!
//! - `sequencer`: Key state to rate-limited, sequenced input commands
//! - `predictor`: Local physics ahead of the server
//! - `reconcile`: Acknowledgement matching, correction policy, replay
//! - `interpolation`: Time-delayed remote entities, RTT and clock estimates
//! - `transport`: WebSocket task with reconnect
//! - `session`: Glue between all of the above

pub mod sequencer;
pub mod predictor;
pub mod reconcile;
pub mod interpolation;
pub mod transport;
pub mod session;

pub use sequencer::InputSequencer;
pub use predictor::ClientPredictor;
pub use reconcile::{Correction, ReconcileStats, Reconciler, ReconcilerConfig};
pub use interpolation::{RemoteInterpolator, RttEstimator, ServerClock};
pub use transport::{ReconnectPolicy, Transport, TransportError, TransportEvent};
pub use session::{ClientConfig, ClientSession, ConnectionStatus, FrameView};
