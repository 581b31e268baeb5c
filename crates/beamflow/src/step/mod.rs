//! Step contract (spec.md §4.2)
//!
//! A step is the polymorphic unit of work the workflow graph drives. It is
//! registered by string id in a [`StepRegistry`] so graph definitions stay
//! serializable (spec.md §9's "register implementations by string id").

mod context;
mod registry;

pub use context::{CancellationHandle, StepContext};
pub use registry::StepRegistry;

use async_trait::async_trait;
use serde_json::Value;

use crate::error_class::ErrorClass;
use crate::reliability::RetryPolicy;

/// A step-returned error, carrying enough to classify and to compensate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct StepError {
    /// A short machine-matchable reason atom, e.g. `"timeout"`.
    pub reason: String,
    /// Optional human-readable detail.
    pub detail: Option<String>,
}

impl StepError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Classify this error via the fixed reason table (spec.md §4.6).
    pub fn classify(&self) -> ErrorClass {
        ErrorClass::classify(&self.reason)
    }
}

/// Metadata describing how a step's compensation should be invoked.
#[derive(Debug, Clone)]
pub struct CompensationMetadata {
    pub timeout: std::time::Duration,
    pub retryable: bool,
    /// A critical compensation failure always produces a DLQ entry even if
    /// the rest of the compensation walk succeeds (spec.md §4.3, §7).
    pub critical: bool,
}

impl Default for CompensationMetadata {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            retryable: false,
            critical: false,
        }
    }
}

/// The step capability set: `{validate, execute, [compensate,
/// compensation_metadata]}` (spec.md §4.2).
///
/// `execute` MUST be pure with respect to its inputs given the same
/// `idempotency_key` — the key is injected into `state` under
/// `"idempotency_key"` before invocation, and implementations that call
/// external services are expected to use it for their own deduplication.
#[async_trait]
pub trait Step: Send + Sync {
    /// The registry id this step is addressed by.
    fn id(&self) -> &str;

    /// Cheap pre-check before `execute`.
    async fn validate(&self, state: &Value) -> Result<(), StepError> {
        let _ = state;
        Ok(())
    }

    /// Perform the unit of work, returning the new workflow state.
    async fn execute(&self, state: Value) -> Result<Value, StepError>;

    /// Reverse the effects of a prior successful `execute`, given the
    /// state captured at that time. Steps with no side effects to undo
    /// simply don't override this (default no-op).
    async fn compensate(&self, _context: &Value) -> Result<(), StepError> {
        Ok(())
    }

    /// Compensation behavior: timeout, retryability, criticality. Only
    /// meaningful for steps that override `compensate` — the default no-op
    /// compensation never observes its own timeout.
    fn compensation_metadata(&self) -> CompensationMetadata {
        CompensationMetadata::default()
    }

    /// Named retry policy this step is bound to (spec.md §4.2). `None`
    /// falls back to the engine's default policy.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Per-step override of the actor's default step timeout (spec.md §7:
    /// "bounded by a per-step timeout (policy default or step-declared)").
    /// `None` falls back to `ActorConfig::step_timeout`.
    fn execute_timeout(&self) -> Option<std::time::Duration> {
        None
    }

    /// Whether this step's side effects genuinely tolerate being re-run
    /// after a crash mid-execution (ledger key observed `pending`).
    ///
    /// spec.md §9's open question treats this as a step-level contract
    /// enforced by validation at registration — a step answering `false`
    /// here is refused by `StepRegistry::register` unconditionally, since
    /// the actor cannot tell a crash before `execute` from one after it
    /// succeeded but before its ledger entry was marked `completed`. See
    /// DESIGN.md.
    fn tolerates_reexecution(&self) -> bool {
        true
    }
}
