//! Exponential backoff for reconnecting to the locked server.

use std::time::Duration;

use rand::Rng;

use crate::config::RelayConfig;

pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// How hard to try before giving up on the locked server.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor (0.0-1.0) for randomizing delays across windows
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: MAX_RETRY_DELAY_MS,
            jitter_factor: 0.2,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            base_delay_ms: config.reconnect_base_delay_ms,
            ..Self::default()
        }
    }
}

/// Exponential backoff state of one reconnect episode.
#[derive(Debug, Clone, Copy)]
pub struct BackoffState {
    policy: ReconnectPolicy,
    attempts: u32,
    delay_ms: u64,
}

impl BackoffState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            delay_ms: policy.base_delay_ms,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Advance to the next attempt, updating the delay for the subsequent attempt.
    ///
    /// Returns the delay to wait *before* performing this attempt.
    pub fn next_delay_and_advance(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }

        let current_delay = self.delay_ms;
        self.attempts += 1;
        self.delay_ms = ((self.delay_ms as f64) * BACKOFF_MULTIPLIER)
            .min(self.policy.max_delay_ms as f64) as u64;
        Some(Duration::from_millis(self.with_jitter(current_delay)))
    }

    fn with_jitter(&self, delay_ms: u64) -> u64 {
        let jitter_range = (delay_ms as f64 * self.policy.jitter_factor) as i64;
        if jitter_range > 0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (delay_ms as i64 + jitter).max(0) as u64
        } else {
            delay_ms
        }
    }
}
