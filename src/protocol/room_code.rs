//! Room codes shared out-of-band to join a session
//!
//! Codes are drawn from an alphabet without visually ambiguous glyphs
//! (no `0/O`, `1/I`) and are case-insensitive.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Alphabet used for room codes
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Shortest accepted room code
pub const MIN_ROOM_CODE_LEN: usize = 4;

/// Longest accepted room code
pub const MAX_ROOM_CODE_LEN: usize = 8;

/// Length of generated room codes
pub const DEFAULT_ROOM_CODE_LEN: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomCodeError {
    #[error("Room code must be 4-8 characters, got {0}")]
    Length(usize),

    #[error("Room code contains invalid character {0:?}")]
    Character(char),
}

/// A normalized (uppercase) room code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random code of `len` characters (clamped to the accepted range)
    pub fn generate(len: usize) -> Self {
        let len = len.clamp(MIN_ROOM_CODE_LEN, MAX_ROOM_CODE_LEN);
        let mut rng = rand::thread_rng();
        let code = (0..len)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input, normalizing to uppercase
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let code = input.trim().to_ascii_uppercase();
        let len = code.chars().count();
        if !(MIN_ROOM_CODE_LEN..=MAX_ROOM_CODE_LEN).contains(&len) {
            return Err(RoomCodeError::Length(len));
        }
        if let Some(bad) = code
            .chars()
            .find(|c| !c.is_ascii() || !ROOM_CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(RoomCodeError::Character(bad));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = RoomCodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}
