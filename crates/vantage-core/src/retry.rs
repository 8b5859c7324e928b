//! Exponential-backoff waiter for reconnect and retry loops.
//!
//! Every retry loop in the engine paces itself through a [`Waiter`]: the
//! stream consumer between subscription attempts, and the notify tasks
//! between failed query rounds. The waiter tracks consecutive failures and
//! computes a capped exponential delay with optional additive jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by [`RetryConfig::validate`].
#[derive(Debug, Error)]
pub enum RetryConfigError {
    /// `min_wait` exceeds `max_wait`.
    #[error("min_wait {min_wait:?} exceeds max_wait {max_wait:?}")]
    WaitBoundsInverted {
        /// Configured minimum wait.
        min_wait: Duration,
        /// Configured maximum wait.
        max_wait: Duration,
    },

    /// Jitter percentage is outside `0..=100`.
    #[error("jitter_percent {0} outside 0..=100")]
    JitterOutOfRange(u32),
}

/// Configuration for a [`Waiter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of failures tolerated before backoff grows past `min_wait`.
    pub min_failures: u32,
    /// Smallest delay ever returned.
    pub min_wait: Duration,
    /// Largest delay ever returned (before jitter; jitter saturates).
    pub max_wait: Duration,
    /// Base multiplied by `2^n` as failures accumulate.
    pub factor: Duration,
    /// Additive jitter as a percentage of the computed delay (0 = none).
    pub jitter_percent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_failures: 0,
            min_wait: Duration::ZERO,
            max_wait: Duration::from_secs(120),
            factor: Duration::from_secs(1),
            jitter_percent: 0,
        }
    }
}

impl RetryConfig {
    /// Checks the configuration for internally inconsistent values.
    ///
    /// # Errors
    ///
    /// Returns [`RetryConfigError`] if the wait bounds are inverted or the
    /// jitter percentage is not in `0..=100`.
    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.min_wait > self.max_wait {
            return Err(RetryConfigError::WaitBoundsInverted {
                min_wait: self.min_wait,
                max_wait: self.max_wait,
            });
        }
        if self.jitter_percent > 100 {
            return Err(RetryConfigError::JitterOutOfRange(self.jitter_percent));
        }
        Ok(())
    }
}

/// Tracks consecutive failures and computes the delay before the next retry.
///
/// One waiter per retry loop. Call [`Waiter::wait`] after each failure and
/// [`Waiter::reset`] after any success.
#[derive(Debug)]
pub struct Waiter {
    config: RetryConfig,
    failures: u32,
}

impl Waiter {
    /// Creates a waiter with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Returns the number of consecutive failures recorded so far.
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Zeroes the failure count without waiting.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Computes the delay for the current failure count without waiting.
    ///
    /// While `failures <= min_failures` the delay is `min_wait`. Beyond
    /// that it grows as `factor * 2^(failures - min_failures - 1)`, clamped
    /// to `[min_wait, max_wait]`, then perturbed upward by jitter. A shift
    /// of 31 or more short-circuits to `max_wait` so the exponent cannot
    /// overflow.
    #[must_use]
    pub fn delay(&self) -> Duration {
        let base = if self.failures <= self.config.min_failures {
            self.config.min_wait
        } else {
            let shift = self.failures - self.config.min_failures - 1;
            let raw = if shift >= 31 {
                self.config.max_wait
            } else {
                self.config
                    .factor
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.config.max_wait)
            };
            raw.max(self.config.min_wait).min(self.config.max_wait)
        };
        self.jittered(base)
    }

    /// Adds up to `jitter_percent` of `delay`, never subtracting and never
    /// overflowing: if the perturbed value would not fit in a `Duration`,
    /// the unjittered delay is returned unchanged.
    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_percent == 0 {
            return delay;
        }
        let Some(span) = (delay / 100).checked_mul(self.config.jitter_percent) else {
            return delay;
        };
        // Deterministic fraction in [0, 1): the golden-ratio hash of the
        // failure count, so repeated failures spread without an RNG.
        let fraction = (f64::from(self.failures) * 0.618_033_988_749_895).fract();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let parts = (fraction * 1024.0) as u32; // 0..=1023
        let Some(jitter) = (span / 1024).checked_mul(parts) else {
            return delay;
        };
        match delay.checked_add(jitter) {
            Some(d) => d,
            None => delay,
        }
    }

    /// Records a failure and suspends for the computed delay, or until the
    /// shutdown signal fires, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`WaitCancelled`] if `shutdown` fired before the delay
    /// elapsed.
    pub async fn wait(
        &mut self,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), WaitCancelled> {
        self.failures = self.failures.saturating_add(1);
        let delay = self.delay();
        tokio::select! {
            () = tokio::time::sleep(delay) => Ok(()),
            // Fires on shutdown=true or a dropped sender; both end the loop.
            _ = shutdown.wait_for(|stop| *stop) => Err(WaitCancelled),
        }
    }
}

/// The wait was interrupted by shutdown before the delay elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wait cancelled by shutdown")]
pub struct WaitCancelled;
