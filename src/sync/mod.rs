//! Host authority and guest mirror
//!
//! The host validates guest input and broadcasts canonical state; the guest
//! smooths that state for display and stays tethered to unlocked rooms.

mod authority;
mod combo;
mod mirror;
mod registry;
mod validation;
mod world;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::duration_ms;

pub use authority::{AuthorityController, AuthorityStats};
pub use combo::ComboWindow;
pub use mirror::{EnemyProxy, GuestTether, HostProxy, MirrorController};
pub use registry::{EntityIdRegistry, LocalRef};
pub use validation::{MessageValidator, RateLimiter, ValidationLimits, ValidationResult};
pub use world::{
    AvatarState, DamageOutcome, Effect, EnemySnapshot, GuestWorld, HostWorld, Overlay, ProxyView,
};

/// Scenes a host may direct the guest into
pub const DEFAULT_SCENES: &[&str] = &["town", "dungeon", "boss", "victory", "game-over"];

/// Timing and presentation tunables for both controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enemy batch and host position cadence (default: 50ms)
    #[serde(with = "duration_ms")]
    pub enemy_broadcast_interval: Duration,
    /// Host stats cadence (default: 1000ms)
    #[serde(with = "duration_ms")]
    pub host_state_interval: Duration,
    /// Guest position upload cadence (default: 50ms)
    #[serde(with = "duration_ms")]
    pub guest_position_interval: Duration,
    /// Combo window after each kill (default: 2500ms)
    #[serde(with = "duration_ms")]
    pub combo_window: Duration,
    /// Fraction of the remaining gap closed per second of interpolation
    pub interpolation_rate: f64,
    /// Jumps larger than this snap instead of interpolating
    pub snap_distance: f64,
    /// Enemy proxies not refreshed within this are dropped (default: 3s)
    #[serde(with = "duration_ms")]
    pub enemy_stale_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub enemy_fade: Duration,
    /// Delay between a lost session and the return to menu (default: 3s)
    #[serde(with = "duration_ms")]
    pub disconnect_grace: Duration,
    pub scene_allow_list: Vec<String>,
}

impl SyncConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        let min_interval = Duration::from_millis(1);
        Self {
            enemy_broadcast_interval: self.enemy_broadcast_interval.max(min_interval),
            host_state_interval: self.host_state_interval.max(min_interval),
            guest_position_interval: self.guest_position_interval.max(min_interval),
            interpolation_rate: if self.interpolation_rate > 0.0 {
                self.interpolation_rate
            } else {
                12.0
            },
            snap_distance: self.snap_distance.max(0.0),
            ..self
        }
    }

    pub fn scene_allowed(&self, scene: &str) -> bool {
        self.scene_allow_list.iter().any(|s| s == scene)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enemy_broadcast_interval: Duration::from_millis(50),
            host_state_interval: Duration::from_millis(1000),
            guest_position_interval: Duration::from_millis(50),
            combo_window: Duration::from_millis(2500),
            interpolation_rate: 12.0,
            snap_distance: 400.0,
            enemy_stale_timeout: Duration::from_secs(3),
            enemy_fade: Duration::from_millis(300),
            disconnect_grace: Duration::from_secs(3),
            scene_allow_list: DEFAULT_SCENES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Replace a non-finite number with `fallback`
pub(crate) fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.enemy_broadcast_interval, Duration::from_millis(50));
        assert_eq!(config.host_state_interval, Duration::from_millis(1000));
        assert_eq!(config.combo_window, Duration::from_millis(2500));
        assert!(config.scene_allowed("dungeon"));
        assert!(!config.scene_allowed("admin-panel"));
    }

    #[test]
    fn test_sync_config_validated() {
        let config = SyncConfig {
            enemy_broadcast_interval: Duration::ZERO,
            interpolation_rate: -3.0,
            ..Default::default()
        }
        .validated();
        assert_eq!(config.enemy_broadcast_interval, Duration::from_millis(1));
        assert_eq!(config.interpolation_rate, 12.0);
    }

    #[test]
    fn test_finite_or() {
        assert_eq!(finite_or(3.0, 1.0), 3.0);
        assert_eq!(finite_or(f64::NAN, 1.0), 1.0);
        assert_eq!(finite_or(f64::INFINITY, 0.0), 0.0);
    }
}
