//! Backoff policy: how long a channel waits before retrying a failing item.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry delay for items that failed recently.
///
/// Not exponential: the delay grows linearly with the number of failure lines
/// in the item's log. Below `SLOW_THRESHOLD` entries each line costs `step`,
/// from there on each line costs `slow_step`.
///
/// Example with the defaults (200ms / 1s):
/// - 1 log line: 200ms
/// - 2 log lines: 400ms
/// - 3 log lines: 3s
/// - 5 log lines: 5s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub step_ms: u64,
    pub slow_step_ms: u64,
}

impl Backoff {
    pub const SLOW_THRESHOLD: usize = 3;

    /// Delay for an item carrying `log_len` failure lines, without jitter.
    pub fn base_delay(&self, log_len: usize) -> Duration {
        let per_entry = if log_len < Self::SLOW_THRESHOLD {
            self.step_ms
        } else {
            self.slow_step_ms
        };
        Duration::from_millis(per_entry.saturating_mul(log_len as u64))
    }

    /// Delay with up to 10% of `step` added as random jitter, so that
    /// channels retrying the same key do not wake in lockstep.
    pub fn delay(&self, log_len: usize) -> Duration {
        let base = self.base_delay(log_len);
        if base.is_zero() {
            return base;
        }
        let jitter_cap = self.step_ms / 10;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            step_ms: 200,
            slow_step_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(1, 200)]
    #[case(2, 400)]
    #[case(3, 3000)]
    #[case(5, 5000)]
    #[case(20, 20000)]
    fn default_schedule(#[case] log_len: usize, #[case] expected_ms: u64) {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay(log_len), Duration::from_millis(expected_ms));
    }

    #[test]
    fn jitter_stays_within_a_tenth_of_step() {
        let backoff = Backoff::default();
        for _ in 0..50 {
            let d = backoff.delay(2);
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(420));
        }
    }

    #[test]
    fn empty_log_never_waits() {
        assert_eq!(Backoff::default().delay(0), Duration::ZERO);
    }
}
