//! Reconnect pacing for consumer workers.
//!
//! A worker that loses its broker connection waits `delay(attempt)` before
//! the next subscribe, where `attempt` counts consecutive failures since the
//! last successful subscribe (starting at 1).
//!
//! ```text
//! attempt:   1    2    3    4     5     6 ...
//! base:      1s   2s   4s   8s    16s   30s (capped)
//! actual:    base ± jitter
//! ```

use rand::Rng;
use std::time::Duration;

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default ceiling for the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter as a fraction of the computed delay.
pub const DEFAULT_JITTER: f64 = 0.2;

/// Retry delay policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on the delay, before jitter.
    pub max: Duration,
    /// Fraction (0.0 to 1.0) of the delay randomly added or removed.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl Backoff {
    /// Doubling delay from `base` up to `max`, with default jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: DEFAULT_JITTER,
        }
    }

    /// The same delay for every attempt, no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    /// Delay for `attempt` before jitter is applied.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay to wait before retry number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }
}
