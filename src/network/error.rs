//! Network error types

use thiserror::Error;

use crate::protocol::RoomCodeError;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Room is full")]
    RoomFull,

    #[error("Reconnection attempts exhausted")]
    ReconnectExhausted,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
