/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Sliding-window restart limiting with exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Limits for restarting a subscription.
///
/// ```toml
/// [supervisor.restart_limiter]
/// max_restarts = 5
/// window_secs = 60
/// initial_backoff_ms = 100
/// max_backoff_ms = 30000
/// backoff_multiplier = 2.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartLimiterConfig {
    /// When `false`, restarts are unlimited and immediate.
    pub enabled: bool,
    /// Restarts allowed inside one window.
    pub max_restarts: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Delay before the first restart in a streak.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive restarts.
    pub backoff_multiplier: f64,
}

impl Default for RestartLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 5,
            window_secs: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RestartLimiterConfig {
    /// No limit and no backoff.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            max_restarts: 0,
            window_secs: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 0.0,
        }
    }

    /// The sliding window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Backoff before restart number `streak + 1` of a consecutive streak.
    #[must_use]
    pub fn backoff_for(&self, streak: u32) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let raw = self.initial_backoff_ms as f64
            * self
                .backoff_multiplier
                .powi(i32::try_from(streak).unwrap_or(i32::MAX));
        #[allow(
            clippy::cast_sign_loss,
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss
        )]
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0) as u64;
        Duration::from_millis(capped)
    }
}

/// The window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartLimitExceeded {
    /// Restarts already inside the window.
    pub attempts: usize,
    /// Configured limit.
    pub max_restarts: u32,
    /// Configured window.
    pub window_secs: u64,
}

/// Snapshot of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStats {
    /// Restarts inside the current window.
    pub restarts_in_window: usize,
    /// Restarts since the streak was last reset.
    pub consecutive_restarts: u32,
}

/// Tracks restarts of one subscription.
#[derive(Debug)]
pub struct RestartLimiter {
    config: RestartLimiterConfig,
    restarts: Vec<Instant>,
    streak: u32,
}

impl RestartLimiter {
    /// Creates a limiter with no history.
    #[must_use]
    pub const fn new(config: RestartLimiterConfig) -> Self {
        Self {
            config,
            restarts: Vec::new(),
            streak: 0,
        }
    }

    /// The limiter's configuration.
    #[must_use]
    pub const fn config(&self) -> &RestartLimiterConfig {
        &self.config
    }

    /// Checks whether another restart fits in the window.
    pub fn check(&mut self) -> Result<(), RestartLimitExceeded> {
        if !self.config.enabled {
            return Ok(());
        }
        let window = self.config.window();
        let now = Instant::now();
        self.restarts.retain(|&at| now.duration_since(at) < window);

        if self.restarts.len() >= self.config.max_restarts as usize {
            return Err(RestartLimitExceeded {
                attempts: self.restarts.len(),
                max_restarts: self.config.max_restarts,
                window_secs: self.config.window_secs,
            });
        }
        Ok(())
    }

    /// Records a restart and returns the delay to wait before it.
    pub fn record(&mut self) -> Duration {
        self.restarts.push(Instant::now());
        let backoff = self.config.backoff_for(self.streak);
        self.streak = self.streak.saturating_add(1);
        backoff
    }

    /// Ends the current streak; the next backoff starts from the initial delay.
    pub fn reset_streak(&mut self) {
        self.streak = 0;
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RestartStats {
        RestartStats {
            restarts_in_window: self.restarts.len(),
            consecutive_restarts: self.streak,
        }
    }
}

impl Default for RestartLimiter {
    fn default() -> Self {
        Self::new(RestartLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_restarts: u32) -> RestartLimiterConfig {
        RestartLimiterConfig {
            enabled: true,
            max_restarts,
            window_secs: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_fills_then_rejects() {
        let mut limiter = RestartLimiter::new(config(3));
        for _ in 0..3 {
            assert!(limiter.check().is_ok());
            limiter.record();
        }
        let err = limiter.check().unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.max_restarts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let mut limiter = RestartLimiter::new(config(1));
        limiter.record();
        assert!(limiter.check().is_err());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.stats().restarts_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_up_to_the_cap() {
        let mut limiter = RestartLimiter::new(config(10));
        let delays: Vec<_> = (0..5).map(|_| limiter.record().as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);

        limiter.reset_streak();
        assert_eq!(limiter.record(), Duration::from_millis(100));
    }

    #[test]
    fn disabled_limiter_never_waits_or_refuses() {
        let config = RestartLimiterConfig::disabled();
        assert_eq!(config.backoff_for(7), Duration::ZERO);
        let mut limiter = RestartLimiter::new(config);
        assert!(limiter.check().is_ok());
    }
}
