//! Exponential backoff between automatic drain cycles.
//!
//! The coordinator itself never waits between mutations; a failed replay
//! just bumps the retry counter. Backoff only decides how soon the
//! scheduler may start another periodic cycle after one that recorded
//! failures.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failing cycles before periodic draining pauses until an
    /// explicit trigger.
    pub max_retries: u32,
    /// Delay after the first failing cycle.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(8)
    }
}

/// Backoff state across drain cycles.
#[derive(Debug, Default)]
pub struct Backoff {
    failed_cycles: u32,
    not_before: Option<Instant>,
}

impl Backoff {
    /// Record a cycle that left failures behind.
    pub fn record_failure(&mut self, config: &RetryConfig) {
        self.failed_cycles = self.failed_cycles.saturating_add(1);
        if self.is_exhausted(config) {
            warn!(
                "{} consecutive drain cycles failed; waiting for an explicit trigger",
                self.failed_cycles
            );
            self.not_before = None;
            return;
        }

        let delay = config.delay_for_attempt(self.failed_cycles - 1);
        debug!("Next automatic drain in {:?}", delay);
        self.not_before = Some(Instant::now() + delay);
    }

    /// Record a clean cycle.
    pub fn reset(&mut self) {
        self.failed_cycles = 0;
        self.not_before = None;
    }

    /// Whether an automatic (periodic) cycle may start now.
    pub fn allows_automatic(&self, config: &RetryConfig) -> bool {
        if self.is_exhausted(config) {
            return false;
        }
        match self.not_before {
            Some(at) => Instant::now() >= at,
            None => true,
        }
    }

    pub fn failed_cycles(&self) -> u32 {
        self.failed_cycles
    }

    fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.failed_cycles > config.max_retries
    }
}
