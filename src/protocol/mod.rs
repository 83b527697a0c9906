//! Wire protocol definitions
//!
//! Defines the sync message union, room codes and the relay frame format.

mod message;
mod relay;
mod room_code;

pub use message::{
    check_envelope, decode, encode, DecodeError, EnemyState, PeerId, Role, SyncMessage,
};
pub use relay::{RelayFrame, MAX_PEERS_PER_ROOM};
pub use room_code::{
    RoomCode, RoomCodeError, DEFAULT_ROOM_CODE_LEN, MAX_ROOM_CODE_LEN, MIN_ROOM_CODE_LEN,
    ROOM_CODE_ALPHABET,
};
