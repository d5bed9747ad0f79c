//! Reconnect backoff: exponential growth, capped, with symmetric jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Exponential backoff state for the reconnect loop.
///
/// Unlike request retries there is no attempt limit: the connection manager
/// keeps trying until it is stopped.
#[derive(Debug, Clone)]
pub struct BackoffState {
    config: BackoffConfig,
    attempts: u32,
    delay_ms: u64,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        let delay_ms = config.base_ms;
        Self {
            config,
            attempts: 0,
            delay_ms,
        }
    }

    /// Back to the base delay after a successful authentication.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay_ms = self.config.base_ms;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Un-jittered delay for the next attempt.
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Advance to the next attempt and return how long to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay_ms;
        self.attempts = self.attempts.saturating_add(1);
        self.delay_ms = ((self.delay_ms as f64) * self.config.factor)
            .min(self.config.max_ms as f64) as u64;

        Duration::from_millis(self.jittered(current))
    }

    fn jittered(&self, delay_ms: u64) -> u64 {
        let jitter_range = (delay_ms as f64 * self.config.jitter) as i64;
        if jitter_range > 0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (delay_ms as i64 + jitter).max(0) as u64
        } else {
            delay_ms
        }
    }
}
