//! Per-attempt execution context handed alongside step invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Context describing the current attempt. Steps don't receive this
/// directly (the `Step` trait is kept minimal and serializable-state-only
/// per spec.md §4.2); it's used by the actor to decide cancellation and to
/// build the injected `idempotency_key`.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workflow_id: String,
    pub step_id: String,
    pub attempt: u32,
    cancelled: Arc<AtomicBool>,
}

impl StepContext {
    pub fn new(workflow_id: impl Into<String>, step_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            attempt,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The idempotency key this attempt is gated under: `wfid:step:attempt`.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.workflow_id, self.step_id, self.attempt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }
}

/// A handle the supervisor can use to request cancellation of an
/// in-flight step without reentering the actor (spec.md §5: "steps MUST
/// NOT call back into the supervisor or registry reentrantly" — this
/// handle is one-directional, actor → step).
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    /// A standalone handle not derived from a [`StepContext`], for a
    /// caller (the supervisor) that wants to request cancellation of a
    /// workflow it hasn't yet handed to an actor.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}
