//! Network module for two-peer room sessions
//!
//! Handles the room transport, typed message bus, connection lifecycle and
//! reconnection, plus the websocket room relay.

mod bus;
mod error;
mod latency;
mod lifecycle;
mod listeners;
mod loopback;
mod relay;
mod transport;

pub use bus::{BusStats, Inbound, MessageBus};
pub use error::NetworkError;
pub use latency::{pong_for, LatencyTracker};
pub use lifecycle::{
    ConnectionLifecycle, ConnectionState, DisconnectCause, LifecycleConfig, PeerEvent, RoomSession,
};
pub(crate) use lifecycle::duration_ms;
pub use listeners::{ListenerId, ListenerRegistry};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use relay::{RelayServer, RelayTransport};
pub use transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};
