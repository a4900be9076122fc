// Retry policy: attempt budget, exponential backoff with fuzz, per-try
// timeout. A pure value type shared by manifest, segment, and license
// requests.

use std::time::Duration;

use rand::RngExt;

/// Retry behavior for one class of requests.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryParameters {
    /// Total attempts, including the first (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
    /// Fraction of random fuzz applied to each delay, in `[0, 1]`. A fuzz
    /// of 0.5 yields delays in `[0.5d, 1.5d)`.
    pub fuzz_factor: f64,
    /// Per-attempt timeout; `None` disables the timeout.
    pub timeout: Option<Duration>,
}

impl Default for RetryParameters {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            backoff_factor: 2.0,
            fuzz_factor: 0.5,
            timeout: None,
        }
    }
}

impl RetryParameters {
    /// A policy that never retries, used by one-shot probes.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Computes the fuzzed delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_factor.powi(retry as i32);
        let fuzz = if self.fuzz_factor > 0.0 {
            // Uniform in [-fuzz, +fuzz).
            let unit = rand::rng().random_range(-1.0f64..1.0);
            unit * self.fuzz_factor.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Duration::from_secs_f64((base * (1.0 + fuzz)).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_by_backoff_factor() {
        let params = RetryParameters {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            fuzz_factor: 0.0,
            timeout: None,
        };
        assert_eq!(params.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(params.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(params.delay_for_retry(2), Duration::from_millis(400));
    }

    #[test]
    fn fuzz_stays_within_band() {
        let params = RetryParameters {
            max_attempts: 2,
            base_delay: Duration::from_millis(1000),
            backoff_factor: 1.0,
            fuzz_factor: 0.5,
            timeout: None,
        };
        for _ in 0..64 {
            let delay = params.delay_for_retry(0);
            assert!(delay >= Duration::from_millis(500), "{delay:?}");
            assert!(delay < Duration::from_millis(1500), "{delay:?}");
        }
    }
}
