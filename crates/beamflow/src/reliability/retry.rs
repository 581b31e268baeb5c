//! Retry policy (spec.md §4.5)
//!
//! A policy is a pure, stateless description of backoff and retryability;
//! attempt counters live in the actor's own state, never here.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error_class::ErrorClass;

/// `{max_attempts, base_delay, max_delay, exponent, jitter_fraction,
/// retryable_predicate}` from spec.md §4.5.
///
/// The retryable predicate is not a closure (policies must stay
/// serializable per spec.md §6) — instead `recoverable_is_retryable`
/// covers the one class spec.md §4.5 calls out as caller-configurable;
/// every other class's retryability is fixed by [`ErrorClass::is_auto_retryable`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    pub exponent: f64,

    /// Fraction in `[0, 1]`; delay is jittered by `± jitter_fraction`.
    pub jitter_fraction: f64,

    /// Whether `recoverable`-classed errors should be auto-retried.
    /// Defaults to `false` per spec.md §4.5 ("default predicate returns
    /// true for `transient`... and false for `terminal`/`permanent`;
    /// `recoverable` is caller-configurable").
    #[serde(default)]
    pub recoverable_is_retryable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conservative()
    }
}

impl RetryPolicy {
    /// A moderate, general-purpose policy.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            exponent: 2.0,
            jitter_fraction: 0.1,
            recoverable_is_retryable: false,
        }
    }

    /// More attempts, longer ceiling — for steps calling flaky external
    /// services (e.g. transactional email delivery).
    pub fn email() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            exponent: 2.0,
            jitter_fraction: 0.2,
            recoverable_is_retryable: false,
        }
    }

    /// Fast, bounded retries for latency-sensitive steps.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            exponent: 1.5,
            jitter_fraction: 0.1,
            recoverable_is_retryable: false,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponent: 1.0,
            jitter_fraction: 0.0,
            recoverable_is_retryable: false,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_recoverable_retryable(mut self, retryable: bool) -> Self {
        self.recoverable_is_retryable = retryable;
        self
    }

    /// Delay formula (spec.md §4.5):
    /// `min(max_delay, base_delay * exponent^(attempt-1)) * (1 ± jitter)`.
    ///
    /// `attempt` is 1-based and refers to the attempt that just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.base_delay.as_secs_f64() * self.exponent.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_fraction > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter_fraction;
            (capped + rng.gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether an error of this class should be auto-retried under this
    /// policy.
    pub fn is_retryable(&self, class: ErrorClass) -> bool {
        match class {
            ErrorClass::Recoverable => self.recoverable_is_retryable,
            other => other.is_auto_retryable(),
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
