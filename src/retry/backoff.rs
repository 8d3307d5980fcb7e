use rand::Rng;
use std::time::Duration;
use tracing::trace;

use super::RetryConfig;

/// Delay schedule between attempts
pub trait Backoff: Send + Sync {
    /// Delay to wait after the given (1-based) failed attempt
    fn next_delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff, capped, with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Backoff with no random spread, for callers that need exact delays
    pub fn without_jitter(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            jitter_factor: 0.0,
            ..Self::new(initial_delay, max_delay)
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::builder()
            .initial_delay(config.initial_backoff)
            .max_delay(config.max_backoff)
            .jitter_factor(config.jitter_factor)
            .build()
    }

    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        // First retry waits the base delay.
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let max_ms = self.max_delay.as_millis() as f64;
        let base_ms = (self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent)).min(max_ms);

        let spread = base_ms * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let delay_ms = (base_ms + jitter).clamp(0.0, max_ms);

        trace!(
            attempt = attempt,
            base_delay_ms = base_ms,
            jitter_ms = jitter,
            delay_ms = delay_ms,
            "Calculated backoff delay"
        );

        Duration::from_millis(delay_ms as u64)
    }
}

#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Constant delay between attempts
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}
