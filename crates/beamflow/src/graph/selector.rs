//! Branch selectors: the predicate a `branch` node consults to pick an
//! outgoing edge (spec.md §4.1).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Evaluates workflow state to a label string matched against a branch
/// node's outgoing edges. Kept as narrow as [`crate::step::Step`]:
/// synchronous and side-effect free, since branch evaluation happens
/// inline during graph traversal rather than as a scheduled unit of work.
pub trait BranchSelector: Send + Sync {
    fn id(&self) -> &str;
    fn select(&self, state: &Value) -> String;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectorRegistryError {
    #[error("selector id already registered: {0}")]
    DuplicateId(String),

    #[error("unknown selector id: {0}")]
    UnknownId(String),
}

/// Registry of [`BranchSelector`] implementations, keyed by the id graphs
/// reference (mirrors [`crate::step::StepRegistry`]).
#[derive(Default)]
pub struct SelectorRegistry {
    selectors: HashMap<String, Arc<dyn BranchSelector>>,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, selector: Arc<dyn BranchSelector>) -> Result<(), SelectorRegistryError> {
        let id = selector.id().to_string();
        if self.selectors.contains_key(&id) {
            return Err(SelectorRegistryError::DuplicateId(id));
        }
        self.selectors.insert(id, selector);
        Ok(())
    }

    /// Evaluate the selector registered under `selector_ref`. Used as the
    /// closure argument to [`super::Graph::next`].
    pub fn evaluate(&self, selector_ref: &str, state: &Value) -> String {
        match self.selectors.get(selector_ref) {
            Some(selector) => selector.select(state),
            // An unresolvable selector ref falls back to the branch's
            // `default` edge the same way an unmatched label does.
            None => "default".to_string(),
        }
    }
}
