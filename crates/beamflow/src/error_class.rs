//! Error classification (spec.md §4.6)
//!
//! Every error a step, a timeout, or the storage layer can produce is
//! tagged into exactly one of five classes. Classification drives both the
//! retry decider (§4.3) and dead-letter routing (§4.7).

use serde::{Deserialize, Serialize};

/// The five error classes. Classification is total: every `StepError`
/// reason maps to exactly one class (spec.md §8 "Classification
/// completeness").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Unrecoverable state. Never retried, archived immediately.
    Terminal,
    /// Domain decisions. No auto-retry; manual force-retry allowed.
    Permanent,
    /// Input-data issues. Manual retry after upstream correction.
    Recoverable,
    /// Auto-retried with backoff.
    Transient,
    /// Unclassified. Treated as transient for bounded attempts, then DLQ.
    Unknown,
}

impl ErrorClass {
    /// Whether the retry decider should schedule an automatic retry for
    /// this class, independent of remaining attempt count.
    pub fn is_auto_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Unknown)
    }

    /// Whether a DLQ entry of this class may be retried by an operator.
    pub fn is_force_retryable(self) -> bool {
        !matches!(self, ErrorClass::Terminal)
    }

    /// Classify a bare reason string against the fixed lookup table in
    /// spec.md §4.6. Anything not in the table is `Unknown`.
    pub fn classify(reason: &str) -> ErrorClass {
        match reason {
            "data_corrupted" | "workflow_cancelled" => ErrorClass::Terminal,
            "fraud_detected" | "unauthorized" => ErrorClass::Permanent,
            "missing_email" | "invalid_input" => ErrorClass::Recoverable,
            "timeout" | "step_timeout" | "service_unavailable" | "connection_refused"
            | "rate_limited" => ErrorClass::Transient,
            _ => ErrorClass::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Terminal => "terminal",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Recoverable => "recoverable",
            ErrorClass::Transient => "transient",
            ErrorClass::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}
