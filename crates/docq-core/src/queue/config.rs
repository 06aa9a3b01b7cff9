//! Queue configuration.
//!
//! Every option is clamped into its supported range by [`QueueConfig::normalized`];
//! out-of-range values are corrected rather than rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Backoff;
use crate::error::ConfigError;

/// Prefix of the environment variables read by [`QueueConfig::from_env`].
pub const ENV_PREFIX: &str = "DOCQ_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Dispatcher sleep when nothing is leasable. [100, 3000] ms.
    pub selector_delay_ms: u64,

    /// Failure-log capacity and repush threshold. [1, 20].
    pub log_size: usize,

    /// Items that failed less than this long ago are retried after a
    /// backoff. [1, 30] s.
    pub maximum_wait_to_retry_s: u64,

    /// Leases held by another code version are reclaimed after this long. [60, 1800] s.
    pub old_version_timeout_s: u64,

    /// Extra time on top of `old_version_timeout_s` after which any lease is
    /// reclaimed. [60, 3600] s.
    pub cur_version_timeout_s: u64,

    /// Worker pool size. [1, 100].
    pub channel_count: usize,

    /// Run stale-lease reclamation every this many dispatcher iterations.
    pub reclaim_every: u32,

    /// Retention of the consumed collection.
    pub history_ttl_s: u64,

    /// Wait before the dispatcher takes its first lease.
    pub startup_delay_ms: u64,

    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            selector_delay_ms: 500,
            log_size: 5,
            maximum_wait_to_retry_s: 3,
            old_version_timeout_s: 10 * 60,
            cur_version_timeout_s: 20 * 60,
            channel_count: 50,
            reclaim_every: 500,
            history_ttl_s: 7 * 24 * 60 * 60,
            startup_delay_ms: 1000,
            backoff: Backoff::default(),
        }
    }
}

impl QueueConfig {
    /// Copy with every option clamped into its supported range.
    pub fn normalized(&self) -> Self {
        Self {
            selector_delay_ms: self.selector_delay_ms.clamp(100, 3000),
            log_size: self.log_size.clamp(1, 20),
            maximum_wait_to_retry_s: self.maximum_wait_to_retry_s.clamp(1, 30),
            old_version_timeout_s: self.old_version_timeout_s.clamp(60, 1800),
            cur_version_timeout_s: self.cur_version_timeout_s.clamp(60, 3600),
            channel_count: self.channel_count.clamp(1, 100),
            reclaim_every: self.reclaim_every.max(1),
            history_ttl_s: self.history_ttl_s.max(1),
            startup_delay_ms: self.startup_delay_ms,
            backoff: self.backoff.clone(),
        }
    }

    /// Defaults overridden by `DOCQ_*` environment variables, normalized.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |option: &str| {
            let var = format!("{ENV_PREFIX}{}", option.to_ascii_uppercase());
            lookup(&var).map(|value| (var, value))
        };

        if let Some(v) = read("selector_delay_ms") {
            config.selector_delay_ms = parse(v)?;
        }
        if let Some(v) = read("log_size") {
            config.log_size = parse(v)?;
        }
        if let Some(v) = read("maximum_wait_to_retry_s") {
            config.maximum_wait_to_retry_s = parse(v)?;
        }
        if let Some(v) = read("old_version_timeout_s") {
            config.old_version_timeout_s = parse(v)?;
        }
        if let Some(v) = read("cur_version_timeout_s") {
            config.cur_version_timeout_s = parse(v)?;
        }
        if let Some(v) = read("channel_count") {
            config.channel_count = parse(v)?;
        }
        if let Some(v) = read("reclaim_every") {
            config.reclaim_every = parse(v)?;
        }
        if let Some(v) = read("history_ttl_s") {
            config.history_ttl_s = parse(v)?;
        }
        if let Some(v) = read("startup_delay_ms") {
            config.startup_delay_ms = parse(v)?;
        }
        if let Some(v) = read("backoff_step_ms") {
            config.backoff.step_ms = parse(v)?;
        }
        if let Some(v) = read("backoff_slow_step_ms") {
            config.backoff.slow_step_ms = parse(v)?;
        }

        Ok(config.normalized())
    }

    pub fn selector_delay(&self) -> Duration {
        Duration::from_millis(self.selector_delay_ms)
    }

    pub fn maximum_wait_to_retry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.maximum_wait_to_retry_s as i64)
    }

    pub fn old_version_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.old_version_timeout_s as i64)
    }

    pub fn cur_version_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cur_version_timeout_s as i64)
    }

    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_s)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

fn parse<T: std::str::FromStr>((var, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_already_normal() {
        let config = QueueConfig::default();
        assert_eq!(config.normalized(), config);
        assert_eq!(config.selector_delay_ms, 500);
        assert_eq!(config.log_size, 5);
        assert_eq!(config.maximum_wait_to_retry_s, 3);
        assert_eq!(config.old_version_timeout_s, 600);
        assert_eq!(config.cur_version_timeout_s, 1200);
        assert_eq!(config.channel_count, 50);
    }

    #[rstest]
    #[case(0, 100)]
    #[case(99, 100)]
    #[case(250, 250)]
    #[case(3001, 3000)]
    fn selector_delay_is_clamped(#[case] input: u64, #[case] expected: u64) {
        let config = QueueConfig {
            selector_delay_ms: input,
            ..QueueConfig::default()
        };
        assert_eq!(config.normalized().selector_delay_ms, expected);
    }

    #[test]
    fn every_option_is_clamped_at_both_ends() {
        let low = QueueConfig {
            selector_delay_ms: 0,
            log_size: 0,
            maximum_wait_to_retry_s: 0,
            old_version_timeout_s: 0,
            cur_version_timeout_s: 0,
            channel_count: 0,
            reclaim_every: 0,
            history_ttl_s: 0,
            ..QueueConfig::default()
        }
        .normalized();
        assert_eq!(
            (
                low.selector_delay_ms,
                low.log_size,
                low.maximum_wait_to_retry_s,
                low.old_version_timeout_s,
                low.cur_version_timeout_s,
                low.channel_count,
                low.reclaim_every,
            ),
            (100, 1, 1, 60, 60, 1, 1)
        );

        let high = QueueConfig {
            selector_delay_ms: 10_000,
            log_size: 500,
            maximum_wait_to_retry_s: 500,
            old_version_timeout_s: 100_000,
            cur_version_timeout_s: 100_000,
            channel_count: 1000,
            ..QueueConfig::default()
        }
        .normalized();
        assert_eq!(
            (
                high.selector_delay_ms,
                high.log_size,
                high.maximum_wait_to_retry_s,
                high.old_version_timeout_s,
                high.cur_version_timeout_s,
                high.channel_count,
            ),
            (3000, 20, 30, 1800, 3600, 100)
        );
    }

    #[test]
    fn env_overrides_and_clamps() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DOCQ_CHANNEL_COUNT", "8"),
            ("DOCQ_LOG_SIZE", "99"),
            ("DOCQ_BACKOFF_STEP_MS", " 5 "),
        ]);
        let config = QueueConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.channel_count, 8);
        assert_eq!(config.log_size, 20);
        assert_eq!(config.backoff.step_ms, 5);
        assert_eq!(config.selector_delay_ms, 500);
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let err = QueueConfig::from_lookup(|k| {
            (k == "DOCQ_SELECTOR_DELAY_MS").then(|| "fast".to_string())
        })
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: "DOCQ_SELECTOR_DELAY_MS".into(),
                value: "fast".into()
            }
        );
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: QueueConfig =
            serde_json::from_str(r#"{ "channel_count": 4, "backoff": { "step_ms": 1 } }"#).unwrap();
        assert_eq!(config.channel_count, 4);
        assert_eq!(config.backoff.step_ms, 1);
        assert_eq!(config.backoff.slow_step_ms, 1000);
        assert_eq!(config.log_size, 5);
    }
}
