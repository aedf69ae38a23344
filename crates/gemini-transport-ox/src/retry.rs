//! Retry policy: when to re-attempt a failed call and how long to wait.
//!
//! Backoff is deterministic exponential growth capped at `max_delay`, with no
//! jitter. Rate-limit responses use the server's `retry_after` hint instead,
//! still bounded by the same cap.

use std::{collections::HashSet, time::Duration};

use bon::bon;
use thiserror::Error;

use crate::error::{ErrorCategory, ErrorKind};

/// Status codes retried by the default policy.
pub const DEFAULT_RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Returned when a policy is built with inconsistent settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,

    #[error("backoff_multiplier must be finite and at least 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("max_delay ({max_delay:?}) must not be shorter than initial_delay ({initial_delay:?})")]
    MaxDelayBelowInitial {
        initial_delay: Duration,
        max_delay: Duration,
    },
}

/// Immutable retry configuration shared by every call of a client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    max_delay: Duration,
    retryable_kinds: HashSet<ErrorCategory>,
    retryable_status_codes: HashSet<u16>,
}

fn default_retryable_kinds() -> HashSet<ErrorCategory> {
    HashSet::from([
        ErrorCategory::Network,
        ErrorCategory::RateLimit,
        ErrorCategory::Timeout,
    ])
}

fn default_retryable_status_codes() -> HashSet<u16> {
    DEFAULT_RETRYABLE_STATUS_CODES.into_iter().collect()
}

#[bon]
impl RetryPolicy {
    /// Builds a validated policy. Unset fields take the default preset's values.
    ///
    /// ```
    /// use std::time::Duration;
    /// use gemini_transport_ox::RetryPolicy;
    ///
    /// let policy = RetryPolicy::builder()
    ///     .max_attempts(4)
    ///     .initial_delay(Duration::from_millis(250))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(policy.max_attempts(), 4);
    /// ```
    #[builder]
    pub fn new(
        #[builder(default = 3)] max_attempts: u32,
        #[builder(default = Duration::from_secs(1))] initial_delay: Duration,
        #[builder(default = 2.0)] backoff_multiplier: f64,
        #[builder(default = Duration::from_secs(30))] max_delay: Duration,
        #[builder(default = default_retryable_kinds(), into)] retryable_kinds: HashSet<
            ErrorCategory,
        >,
        #[builder(default = default_retryable_status_codes(), into)]
        retryable_status_codes: HashSet<u16>,
    ) -> Result<Self, RetryPolicyError> {
        let policy = Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            max_delay,
            retryable_kinds,
            retryable_status_codes,
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 1 s initial delay, doubling, capped at 30 s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable_kinds: default_retryable_kinds(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt; every failure is surfaced immediately.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            retryable_kinds: HashSet::new(),
            retryable_status_codes: HashSet::new(),
        }
    }

    /// 5 attempts, 500 ms initial delay, ×1.5, capped at 10 s.
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 1.5,
            max_delay: Duration::from_secs(10),
            ..Self::default()
        }
    }

    /// 2 attempts, 2 s initial delay, ×3, capped at 60 s. Rate limits are not retried.
    #[must_use]
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            retryable_kinds: HashSet::from([ErrorCategory::Network, ErrorCategory::Timeout]),
            ..Self::default()
        }
    }

    /// Checks the invariants every policy must hold.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        // Multipliers below 1 would make delays shrink between attempts.
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RetryPolicyError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.max_delay < self.initial_delay {
            return Err(RetryPolicyError::MaxDelayBelowInitial {
                initial_delay: self.initial_delay,
                max_delay: self.max_delay,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    #[must_use]
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    #[must_use]
    pub fn retryable_kinds(&self) -> &HashSet<ErrorCategory> {
        &self.retryable_kinds
    }

    #[must_use]
    pub fn retryable_status_codes(&self) -> &HashSet<u16> {
        &self.retryable_status_codes
    }

    /// Whether a call that just failed with `kind` on attempt `attempt`
    /// (1-based) should be attempted again.
    #[must_use]
    pub fn should_retry(&self, kind: &ErrorKind, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        match kind {
            ErrorKind::Auth { .. } | ErrorKind::Validation { .. } | ErrorKind::Quota { .. } => {
                false
            }
            ErrorKind::Network {
                status_code: Some(code),
                ..
            }
            | ErrorKind::Server {
                status_code: code, ..
            } => self.retryable_status_codes.contains(code),
            ErrorKind::Network {
                status_code: None, ..
            }
            | ErrorKind::RateLimit { .. }
            | ErrorKind::Timeout { .. } => self.retryable_kinds.contains(&kind.category()),
        }
    }

    /// Exponential backoff after attempt `attempt` failed:
    /// `initial_delay × multiplier^(attempt − 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let seconds = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        Duration::try_from_secs_f64(seconds)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Honors the server's `retry_after` hint without exceeding `max_delay`.
    #[must_use]
    pub fn rate_limit_delay(&self, retry_after: Duration) -> Duration {
        retry_after.min(self.max_delay)
    }

    /// The wait before retrying after `kind` ended attempt `attempt`.
    #[must_use]
    pub fn delay_after(&self, kind: &ErrorKind, attempt: u32) -> Duration {
        match kind {
            ErrorKind::RateLimit { retry_after, .. } => self.rate_limit_delay(*retry_after),
            _ => self.delay_for(attempt),
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_capped(
            attempts in 1u32..20,
            initial_ms in 0u64..5_000,
            extra_ms in 0u64..60_000,
            multiplier in 1.0f64..4.0,
        ) {
            let policy = RetryPolicy::builder()
                .max_attempts(attempts)
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(initial_ms + extra_ms))
                .backoff_multiplier(multiplier)
                .build()
                .unwrap();

            for n in 0..=attempts + 2 {
                let current = policy.delay_for(n);
                prop_assert!(current <= policy.max_delay());
                prop_assert!(current <= policy.delay_for(n + 1));
            }
        }

        #[test]
        fn rate_limit_delay_never_exceeds_cap(
            retry_after_ms in 0u64..1_000_000,
            max_ms in 0u64..100_000,
        ) {
            let policy = RetryPolicy::builder()
                .initial_delay(Duration::ZERO)
                .max_delay(Duration::from_millis(max_ms))
                .build()
                .unwrap();
            let retry_after = Duration::from_millis(retry_after_ms);
            let delay = policy.rate_limit_delay(retry_after);

            if retry_after <= policy.max_delay() {
                prop_assert_eq!(delay, retry_after);
            } else {
                prop_assert_eq!(delay, policy.max_delay());
            }
        }
    }
}
