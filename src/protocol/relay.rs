//! Frames spoken between a room relay server and its clients
//!
//! Sync payloads travel opaquely inside `send`/`deliver` frames; the relay
//! never looks at them.

use serde::{Deserialize, Serialize};

use super::message::PeerId;
use super::room_code::RoomCode;

/// Maximum peers in one relay room
pub const MAX_PEERS_PER_ROOM: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    // Client -> Server
    Join {
        room_code: RoomCode,
        peer_id: PeerId,
    },
    Leave,
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        payload: String,
    },

    // Server -> Client
    Joined {
        room_code: RoomCode,
        peers: Vec<PeerId>,
    },
    PeerJoined {
        peer_id: PeerId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
    Deliver {
        from: PeerId,
        payload: String,
    },
    /// The requested room already holds two peers
    RoomFull {
        room_code: RoomCode,
    },
    Error {
        message: String,
    },
}
