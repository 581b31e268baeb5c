//! Step registry: maps string ids to registered [`Step`] implementations.

use std::collections::HashMap;
use std::sync::Arc;

use super::Step;

/// Errors raised registering or resolving steps.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StepRegistryError {
    #[error("step id already registered: {0}")]
    DuplicateId(String),

    #[error("unknown step id: {0}")]
    UnknownId(String),

    #[error(
        "step {0} does not tolerate re-execution; the actor cannot distinguish \
         a crash before completion from one after it, so such a step can never \
         be registered safely"
    )]
    UnsafeReexecutionContract(String),
}

/// Registry of step implementations, keyed by the id graphs reference.
///
/// Registration enforces the step-level idempotency contract from
/// spec.md §9's first open question: any step answering
/// `tolerates_reexecution() == false` is rejected at registration time,
/// unconditionally. A crash between a step's `execute` succeeding and its
/// ledger entry being marked `completed` is indistinguishable, from the
/// actor's side, from a crash before `execute` ran at all — on resume the
/// actor re-invokes the step either way. Whether the step also declares a
/// `compensate` is irrelevant to this risk, so registration does not
/// condition on it.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, step: Arc<dyn Step>) -> Result<(), StepRegistryError> {
        let id = step.id().to_string();
        if self.steps.contains_key(&id) {
            return Err(StepRegistryError::DuplicateId(id));
        }
        if !step.tolerates_reexecution() {
            // A step that cannot tolerate re-execution has no safe way to
            // recover from a crash mid-attempt (the ledger key would be
            // `pending` and the actor would have to re-run it). Such a
            // step must not be registered at all under today's contract.
            return Err(StepRegistryError::UnsafeReexecutionContract(id));
        }
        self.steps.insert(id, step);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Step>, StepRegistryError> {
        self.steps
            .get(id)
            .cloned()
            .ok_or_else(|| StepRegistryError::UnknownId(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
