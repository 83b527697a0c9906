//! Inbound message checks and per-peer rate limiting
//!
//! Every check returns a [`ValidationResult`] instead of failing, so callers
//! can log the reason and carry on.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{check_envelope, RoomCode};

/// Outcome of a validation check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Reason text for logging
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("valid")
    }
}

/// Bounds enforced on guest input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationLimits {
    /// Largest damage a single hit may claim (inclusive)
    pub max_damage_per_hit: f64,
    pub world_min_x: f64,
    pub world_min_y: f64,
    pub world_max_x: f64,
    pub world_max_y: f64,
    /// Largest per-axis jump between consecutive positions (inclusive)
    pub max_position_delta: f64,
    /// Messages accepted per peer per second
    pub max_messages_per_second: u32,
}

impl ValidationLimits {
    /// Validate and normalize the limits
    pub fn validated(self) -> Self {
        let world_max_x = self.world_max_x.max(self.world_min_x);
        let world_max_y = self.world_max_y.max(self.world_min_y);
        Self {
            max_damage_per_hit: self.max_damage_per_hit.max(0.0),
            world_max_x,
            world_max_y,
            max_position_delta: self.max_position_delta.max(0.0),
            max_messages_per_second: self.max_messages_per_second.max(1),
            ..self
        }
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_damage_per_hit: 9999.0,
            world_min_x: 0.0,
            world_min_y: 0.0,
            world_max_x: 10_000.0,
            world_max_y: 10_000.0,
            max_position_delta: 500.0,
            max_messages_per_second: 100,
        }
    }
}

/// Stateless structural and semantic checks
#[derive(Debug, Clone, Default)]
pub struct MessageValidator {
    limits: ValidationLimits,
}

impl MessageValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self {
            limits: limits.validated(),
        }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Payload is an object with a non-empty string `type`
    pub fn validate_structure(&self, raw: &Value) -> ValidationResult {
        match check_envelope(raw) {
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::reject(e.to_string()),
        }
    }

    pub fn validate_room_code(&self, code: &str) -> ValidationResult {
        match RoomCode::parse(code) {
            Ok(_) => ValidationResult::ok(),
            Err(e) => ValidationResult::reject(e.to_string()),
        }
    }

    pub fn validate_damage(&self, damage: f64) -> ValidationResult {
        if !damage.is_finite() {
            return ValidationResult::reject(format!("damage {} is not a number", damage));
        }
        if !(0.0..=self.limits.max_damage_per_hit).contains(&damage) {
            return ValidationResult::reject(format!(
                "damage {} outside 0..={}",
                damage, self.limits.max_damage_per_hit
            ));
        }
        ValidationResult::ok()
    }

    pub fn validate_position(&self, x: f64, y: f64) -> ValidationResult {
        if !x.is_finite() || !y.is_finite() {
            return ValidationResult::reject(format!("position ({}, {}) is not a number", x, y));
        }
        let limits = &self.limits;
        if !(limits.world_min_x..=limits.world_max_x).contains(&x)
            || !(limits.world_min_y..=limits.world_max_y).contains(&y)
        {
            return ValidationResult::reject(format!("position ({}, {}) outside world", x, y));
        }
        ValidationResult::ok()
    }

    /// Per-axis jump from the last accepted position
    pub fn validate_position_delta(&self, previous: (f64, f64), next: (f64, f64)) -> ValidationResult {
        let dx = (next.0 - previous.0).abs();
        let dy = (next.1 - previous.1).abs();
        let max = self.limits.max_position_delta;
        if dx > max || dy > max {
            return ValidationResult::reject(format!(
                "position jumped ({:.1}, {:.1}) > {}",
                dx, dy, max
            ));
        }
        ValidationResult::ok()
    }

    /// Enemy ID must be part of the authority's live set
    pub fn validate_enemy_id<F>(&self, enemy_id: &str, is_live: F) -> ValidationResult
    where
        F: Fn(&str) -> bool,
    {
        if enemy_id.is_empty() {
            return ValidationResult::reject("empty enemy id");
        }
        if !is_live(enemy_id) {
            return ValidationResult::reject(format!("unknown enemy {}", enemy_id));
        }
        ValidationResult::ok()
    }
}

/// Fixed-window message counter for one remote peer
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_per_window: u32,
    window: Duration,
    count: u32,
    window_start: Option<Instant>,
}

impl RateLimiter {
    /// Limiter allowing `max_per_second` messages per one-second window
    pub fn new(max_per_second: u32) -> Self {
        Self::with_window(max_per_second, Duration::from_secs(1))
    }

    pub fn with_window(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            count: 0,
            window_start: None,
        }
    }

    /// Count one message arriving at `now`
    pub fn check(&mut self, now: Instant) -> ValidationResult {
        let expired = match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= self.window,
            None => true,
        };
        if expired {
            self.count = 0;
            self.window_start = Some(now);
        }

        self.count = self.count.saturating_add(1);
        if self.count > self.max_per_window {
            return ValidationResult::reject(format!(
                "rate limit {} per {:?} exceeded",
                self.max_per_window, self.window
            ));
        }
        ValidationResult::ok()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = None;
    }
}
