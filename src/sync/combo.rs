//! Shared kill-combo window

use std::time::Duration;

use crate::protocol::Role;

/// Consecutive kills counted together while the window is open
#[derive(Debug, Clone)]
pub struct ComboWindow {
    window: Duration,
    count: u32,
    remaining: Duration,
    last_killer: Option<Role>,
}

impl ComboWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            count: 0,
            remaining: Duration::ZERO,
            last_killer: None,
        }
    }

    /// Count a kill; returns the combo count once it is worth showing (>= 2)
    pub fn register_kill(&mut self, killer: Role) -> Option<u32> {
        if self.remaining.is_zero() {
            self.count = 0;
        }
        self.count += 1;
        self.remaining = self.window;
        self.last_killer = Some(killer);

        (self.count >= 2).then_some(self.count)
    }

    /// Advance time; the count drops to zero when the window runs out
    pub fn tick(&mut self, dt: Duration) {
        self.remaining = self.remaining.saturating_sub(dt);
        if self.remaining.is_zero() {
            self.count = 0;
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn last_killer(&self) -> Option<Role> {
        self.last_killer
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.remaining = Duration::ZERO;
        self.last_killer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combo_counts_within_window() {
        let mut combo = ComboWindow::new(Duration::from_millis(2500));
        assert_eq!(combo.register_kill(Role::Host), None);
        combo.tick(Duration::from_millis(1000));
        assert_eq!(combo.register_kill(Role::Guest), Some(2));
        combo.tick(Duration::from_millis(2400));
        assert_eq!(combo.register_kill(Role::Host), Some(3));
        assert_eq!(combo.last_killer(), Some(Role::Host));
    }

    #[test]
    fn test_combo_expires() {
        let mut combo = ComboWindow::new(Duration::from_millis(2500));
        combo.register_kill(Role::Host);
        combo.register_kill(Role::Host);
        assert_eq!(combo.count(), 2);

        combo.tick(Duration::from_millis(2500));
        assert_eq!(combo.count(), 0);
        assert_eq!(combo.register_kill(Role::Host), None);
        assert_eq!(combo.count(), 1);
    }
}
