//! Interfaces to the game engine on each side of the session
//!
//! Rendering, physics, dungeon layout and inventory rules live outside this
//! crate. The controllers reach them only through these traits.

use std::time::Duration;

use serde_json::Value;

use crate::protocol::Role;

use super::registry::LocalRef;

/// Local avatar state as the engine reports it
///
/// Numbers may be non-finite when engine state is transiently corrupt;
/// controllers sanitize before anything reaches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AvatarState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub level: f64,
    pub gold: f64,
}

/// A live enemy in the host's world
#[derive(Debug, Clone, PartialEq)]
pub struct EnemySnapshot {
    pub local_ref: LocalRef,
    pub enemy_type: String,
    pub x: f64,
    pub y: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub texture: String,
    pub ai_state: String,
}

/// Result of applying damage to a host enemy
#[derive(Debug, Clone, PartialEq)]
pub struct DamageOutcome {
    pub x: f64,
    pub y: f64,
    pub hp_remaining: f64,
    pub killed: bool,
    pub enemy_type: String,
}

/// Something for the render/audio layer to show
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DamageNumber {
        x: f64,
        y: f64,
        damage: f64,
        critical: bool,
    },
    Attack {
        x: f64,
        y: f64,
        angle: f64,
        weapon: Option<String>,
    },
    Projectile {
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
        kind: String,
    },
    EnemyDeath {
        enemy_type: String,
        killer: Role,
        x: f64,
        y: f64,
    },
    Combo {
        count: u32,
        killer: Role,
    },
    LootSpawned {
        loot_id: String,
        item: String,
        x: f64,
        y: f64,
    },
    LootRemoved {
        loot_id: String,
        taker: Role,
    },
    LevelUp {
        level: u32,
    },
    FloorChange {
        floor: u32,
        seed: u64,
    },
    /// Any other named one-shot effect
    Transient {
        kind: String,
        x: f64,
        y: f64,
    },
}

/// Overlay shown over the guest's game view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlay {
    None,
    /// Non-blocking "reconnecting" banner
    Reconnecting,
    /// Blocking "connection lost" message
    ConnectionLost,
}

/// What the guest should draw for an interpolated proxy this frame
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyView<'a> {
    pub x: f64,
    pub y: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub texture: Option<&'a str>,
    pub anim: Option<&'a str>,
    pub flip_x: bool,
}

/// Host-side engine hooks
pub trait HostWorld: Send {
    /// The host's own avatar
    fn avatar(&self) -> AvatarState;

    /// Every enemy currently alive
    fn live_enemies(&self) -> Vec<EnemySnapshot>;

    /// Apply damage to an enemy; `None` if it no longer exists
    fn apply_damage(&mut self, enemy: LocalRef, damage: f64) -> Option<DamageOutcome>;

    /// Move the host's copy of the guest avatar
    fn move_guest_avatar(&mut self, x: f64, y: f64, vx: f64, vy: f64);

    fn spawn_effect(&mut self, effect: Effect);

    /// Guest came or went
    fn guest_presence_changed(&mut self, present: bool) {
        let _ = present;
    }

    fn update_guest_stats(&mut self, hp: f64, max_hp: f64, level: u32) {
        let _ = (hp, max_hp, level);
    }

    fn set_guest_inventory(&mut self, inventory: Value) {
        let _ = inventory;
    }
}

/// Guest-side engine hooks
pub trait GuestWorld: Send {
    /// The guest's own avatar
    fn avatar(&self) -> AvatarState;

    /// Put the guest avatar at `(x, y)` with zero velocity
    fn teleport_avatar(&mut self, x: f64, y: f64);

    /// Room containing a point, if any
    fn room_at(&self, x: f64, y: f64) -> Option<u32>;

    fn render_host(&mut self, view: &ProxyView<'_>);

    fn render_enemy(&mut self, enemy_id: &str, view: &ProxyView<'_>);

    /// Fade an enemy proxy out and then forget it
    fn fade_out_enemy(&mut self, enemy_id: &str, fade: Duration);

    fn spawn_effect(&mut self, effect: Effect);

    /// Toggle spectate mode (avatar faded, controls disabled)
    fn set_spectating(&mut self, spectating: bool);

    fn follow_camera(&mut self, x: f64, y: f64);

    fn set_overlay(&mut self, overlay: Overlay);

    fn return_to_menu(&mut self);

    /// Restore the avatar after a revive, with `hp` hit points
    fn revive(&mut self, hp: f64) {
        let _ = hp;
    }

    fn change_scene(&mut self, scene: &str);

    fn update_host_stats(&mut self, hp: f64, max_hp: f64, level: u32, gold: u64) {
        let _ = (hp, max_hp, level, gold);
    }

    fn apply_inventory(&mut self, inventory: Value) {
        let _ = inventory;
    }
}
