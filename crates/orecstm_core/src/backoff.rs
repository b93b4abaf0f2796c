//! Backoff between attempts after a conflict.

use rand::Rng;
use std::thread;
use std::time::Duration;

/// Delays shorter than this are spent yielding instead of sleeping.
const SLEEP_THRESHOLD: Duration = Duration::from_micros(50);

/// How long the executor waits before re-running a conflicting transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BackoffPolicy {
    /// Re-run immediately.
    None,
    /// Wait a random time below a bound that doubles with every attempt.
    Exponential {
        /// Bound for the first attempt.
        min_delay: Duration,
        /// Upper limit of the bound.
        max_delay: Duration,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            min_delay: Duration::from_nanos(100),
            max_delay: Duration::from_millis(1),
        }
    }
}

impl BackoffPolicy {
    /// Returns the upper bound of the delay before attempt `attempt + 1`.
    #[must_use]
    pub fn bound(&self, attempt: u32) -> Duration {
        match *self {
            Self::None => Duration::ZERO,
            Self::Exponential {
                min_delay,
                max_delay,
            } => {
                let shift = attempt.saturating_sub(1).min(30);
                min_delay
                    .checked_mul(1 << shift)
                    .map_or(max_delay, |bound| bound.min(max_delay))
            }
        }
    }

    /// Returns a random delay up to [`bound`](Self::bound).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let bound = self.bound(attempt);
        if bound.is_zero() {
            return bound;
        }
        let nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }

    /// Waits before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) {
        let delay = self.delay(attempt);
        if delay.is_zero() {
            return;
        }
        if delay < SLEEP_THRESHOLD {
            thread::yield_now();
        } else {
            thread::sleep(delay);
        }
    }
}
