//! Transport abstraction over a peer-to-peer room
//!
//! Everything above this layer depends only on joining/leaving a room,
//! sending to one peer or to everyone, and the event stream.

use tokio::sync::broadcast;

use crate::protocol::{PeerId, RoomCode};

use super::error::NetworkError;

/// Capacity of each transport's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications raised by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A remote peer entered the room
    PeerJoined(PeerId),
    /// A remote peer left the room (intentionally or not)
    PeerLeft(PeerId),
    /// Raw payload from a remote peer
    Message { from: PeerId, payload: String },
    /// The room refused entry because it already holds two peers
    RoomFull(RoomCode),
}

/// A room-based peer transport
///
/// Operations are non-blocking: implementations queue outgoing data and
/// report incoming traffic through [`Transport::subscribe`].
pub trait Transport: Send + Sync + 'static {
    /// Stable ID of the local peer (kept across rejoins)
    fn local_peer_id(&self) -> PeerId;

    /// Enter the room identified by `room_code`
    fn join(&self, room_code: &RoomCode) -> Result<(), NetworkError>;

    /// Leave the current room, if any
    fn leave(&self);

    /// Send a payload to one peer
    fn send(&self, payload: &str, target: PeerId) -> Result<(), NetworkError>;

    /// Send a payload to every other peer in the room
    fn broadcast(&self, payload: &str) -> Result<(), NetworkError>;

    /// Subscribe to transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
