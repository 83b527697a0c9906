//! Sync message definitions for the tandem wire protocol
//!
//! Every payload on the room channel is a flat JSON object with a mandatory
//! string `type` field selecting the variant. Variant names are kebab-case,
//! payload fields camelCase:
//!
//! ```text
//! {"type":"hit","enemyId":"enemy_7","damage":12.0,"critical":false}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a peer inside a room
pub type PeerId = Uuid;

/// Which side of the session a peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Holds the canonical world state
    Host,
    /// Mirrors the host's world state
    Guest,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// One entry of an `enemy-update` batch
///
/// Only `id` and `hp` are mandatory; a bare `{id, hp: 0}` reports a death
/// without any other state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnemyState {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    pub hp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_hp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub texture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_state: Option<String>,
}

/// Closed set of messages exchanged between host and guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// Avatar position (either direction)
    Position {
        x: f64,
        y: f64,
        #[serde(default)]
        vx: f64,
        #[serde(default)]
        vy: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anim: Option<String>,
        #[serde(default)]
        flip_x: bool,
    },
    /// Guest swung a weapon (visual only)
    Attack {
        x: f64,
        y: f64,
        angle: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weapon: Option<String>,
    },
    /// Guest claims to have hit an enemy
    Hit {
        enemy_id: String,
        damage: f64,
        #[serde(default)]
        critical: bool,
    },
    /// Floating damage number to display
    DamageNumber {
        x: f64,
        y: f64,
        damage: f64,
        #[serde(default)]
        critical: bool,
    },
    /// Batched snapshot of every live enemy
    EnemyUpdate { enemies: Vec<EnemyState> },
    /// An enemy died on the host
    EnemyDeath {
        enemy_id: String,
        killer: Role,
        enemy_type: String,
        x: f64,
        y: f64,
    },
    LootSpawn {
        loot_id: String,
        item: String,
        x: f64,
        y: f64,
    },
    LootTaken { loot_id: String, taker: Role },
    /// Serialized inventory blob
    InventorySnapshot { data: String },
    /// Host avatar stats
    HostState {
        hp: f64,
        max_hp: f64,
        level: u32,
        gold: u64,
    },
    /// Guest avatar stats
    GuestState { hp: f64, max_hp: f64, level: u32 },
    RoomClear { room_id: u32 },
    /// A room became safe; the guest teleports to `(x, y)`
    RoomActivated { room_id: u32, x: f64, y: f64 },
    PlayerDied { peer_id: PeerId },
    PlayerRevive {
        peer_id: PeerId,
        x: f64,
        y: f64,
        hp: f64,
    },
    SceneChange { scene: String },
    ComboUpdate { count: u32, killer: Role },
    Projectile {
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
        kind: String,
    },
    /// Transient visual/audio effect
    Effect { kind: String, x: f64, y: f64 },
    LevelUp { level: u32 },
    FloorChange { floor: u32, seed: u64 },
    Ping { sent_at_ms: u64 },
    Pong { sent_at_ms: u64 },
}

impl SyncMessage {
    /// Wire discriminant of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Position { .. } => "position",
            Self::Attack { .. } => "attack",
            Self::Hit { .. } => "hit",
            Self::DamageNumber { .. } => "damage-number",
            Self::EnemyUpdate { .. } => "enemy-update",
            Self::EnemyDeath { .. } => "enemy-death",
            Self::LootSpawn { .. } => "loot-spawn",
            Self::LootTaken { .. } => "loot-taken",
            Self::InventorySnapshot { .. } => "inventory-snapshot",
            Self::HostState { .. } => "host-state",
            Self::GuestState { .. } => "guest-state",
            Self::RoomClear { .. } => "room-clear",
            Self::RoomActivated { .. } => "room-activated",
            Self::PlayerDied { .. } => "player-died",
            Self::PlayerRevive { .. } => "player-revive",
            Self::SceneChange { .. } => "scene-change",
            Self::ComboUpdate { .. } => "combo-update",
            Self::Projectile { .. } => "projectile",
            Self::Effect { .. } => "effect",
            Self::LevelUp { .. } => "level-up",
            Self::FloorChange { .. } => "floor-change",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }
}

/// Errors produced while decoding a raw payload
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing or empty type field")]
    MissingType,

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid {kind} payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
}

/// Check the envelope shared by every message and return its `type`
pub fn check_envelope(value: &Value) -> Result<&str, DecodeError> {
    let obj = value.as_object().ok_or(DecodeError::NotAnObject)?;
    match obj.get("type") {
        Some(Value::String(kind)) if !kind.is_empty() => Ok(kind.as_str()),
        _ => Err(DecodeError::MissingType),
    }
}

/// Decode a raw payload into a typed message
pub fn decode(raw: &str) -> Result<SyncMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = check_envelope(&value)?.to_string();
    serde_json::from_value(value).map_err(|source| DecodeError::Payload { kind, source })
}

/// Encode a message for the wire
pub fn encode(msg: &SyncMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
