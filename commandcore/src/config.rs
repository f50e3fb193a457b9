//! Retry configuration with type-safe validation.
//!
//! Every tunable is a `nutype` newtype, so an out-of-range value is rejected
//! when the configuration is built or deserialized rather than at runtime.

use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Number of synchronous attempts before a failed operation is deferred.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 10),
    default = 2,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct InlineAttempts(u32);

/// Interval between two passes of the deferred retry scheduler, in milliseconds.
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 600_000),
    default = 1_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct RetryIntervalMs(u64);

impl RetryIntervalMs {
    /// Convert to Duration for use with `tokio::time::interval`.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Maximum number of deferred actions the scheduler holds at once.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    default = 10_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Default,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct PendingCapacity(usize);

/// What happens to pending deferred actions when the scheduler stops.
///
/// Deferred actions live in memory only. Whichever mode is chosen, actions
/// still pending when the process dies are lost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Give every pending action one final attempt, then abandon the rest.
    #[default]
    Drain,
    /// Abandon pending actions without another attempt.
    Abandon,
}

/// Configuration for [`RetryService`](crate::retry::RetryService) and
/// [`CommandRetryService`](crate::command_retry::CommandRetryService).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Inline attempts before deferring (2 unless configured).
    pub inline_attempts: InlineAttempts,
    /// Scheduler tick interval.
    pub retry_interval_ms: RetryIntervalMs,
    /// Bound on the scheduler's pending set.
    pub pending_capacity: PendingCapacity,
    /// Mode used by `RetryService::stop` and when the service is dropped.
    pub shutdown_mode: ShutdownMode,
}

impl RetryConfig {
    /// Parses a configuration from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Sets the number of inline attempts.
    #[must_use]
    pub const fn with_inline_attempts(mut self, inline_attempts: InlineAttempts) -> Self {
        self.inline_attempts = inline_attempts;
        self
    }

    /// Sets the scheduler interval.
    #[must_use]
    pub const fn with_retry_interval(mut self, retry_interval_ms: RetryIntervalMs) -> Self {
        self.retry_interval_ms = retry_interval_ms;
        self
    }

    /// Sets the pending capacity.
    #[must_use]
    pub const fn with_pending_capacity(mut self, pending_capacity: PendingCapacity) -> Self {
        self.pending_capacity = pending_capacity;
        self
    }

    /// Sets the shutdown mode.
    #[must_use]
    pub const fn with_shutdown_mode(mut self, shutdown_mode: ShutdownMode) -> Self {
        self.shutdown_mode = shutdown_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn inline_attempts_validates_range(n in 0u32..=20) {
            prop_assert_eq!(InlineAttempts::try_new(n).is_ok(), (1..=10).contains(&n));
        }

        #[test]
        fn retry_interval_converts_to_duration(ms in 10u64..=600_000) {
            let interval = RetryIntervalMs::try_new(ms).unwrap();
            prop_assert_eq!(interval.as_duration(), Duration::from_millis(ms));
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = RetryConfig::default();
        assert_eq!(config.inline_attempts.into_inner(), 2);
        assert_eq!(config.retry_interval_ms.into_inner(), 1_000);
        assert_eq!(config.pending_capacity.into_inner(), 10_000);
        assert_eq!(config.shutdown_mode, ShutdownMode::Drain);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config =
            RetryConfig::from_json_str(r#"{"retry_interval_ms": 50, "shutdown_mode": "abandon"}"#)
                .unwrap();
        assert_eq!(config.retry_interval_ms.into_inner(), 50);
        assert_eq!(config.shutdown_mode, ShutdownMode::Abandon);
        assert_eq!(config.inline_attempts, InlineAttempts::default());
    }

    #[test]
    fn invalid_json_values_are_rejected() {
        assert!(RetryConfig::from_json_str(r#"{"inline_attempts": 0}"#).is_err());
        assert!(RetryConfig::from_json_str(r#"{"retry_interval_ms": 1}"#).is_err());
    }

    #[test]
    fn builder_overrides_fields() {
        let config = RetryConfig::default()
            .with_inline_attempts(InlineAttempts::try_new(4).unwrap())
            .with_pending_capacity(PendingCapacity::try_new(8).unwrap())
            .with_retry_interval(RetryIntervalMs::try_new(25).unwrap())
            .with_shutdown_mode(ShutdownMode::Abandon);
        assert_eq!(config.inline_attempts.into_inner(), 4);
        assert_eq!(config.pending_capacity.into_inner(), 8);
        assert_eq!(config.retry_interval_ms.into_inner(), 25);
        assert_eq!(config.shutdown_mode, ShutdownMode::Abandon);
    }
}
