//! In-memory [`WorkflowStore`] implementation.
//!
//! Grounded in the teacher's `InMemoryWorkflowEventStore`: a single
//! `parking_lot::RwLock`-guarded map per table, optimistic concurrency
//! enforced by comparing the caller's expected sequence against the
//! stored one before applying a write.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use super::{Event, StoreError, Workflow, WorkflowStatus, WorkflowStore};

#[derive(Default)]
struct State {
    workflows: HashMap<String, Workflow>,
    events: HashMap<String, Vec<Event>>,
}

/// Thread-safe in-memory storage backend. The reference collaborator
/// behind `WorkflowStore`; a production deployment would swap this for a
/// transactional backend without changing the actor.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_workflow(
        &self,
        id: String,
        definition_id: String,
        start_node_id: String,
        total_steps: u32,
        initial_state: Value,
    ) -> Result<Workflow, StoreError> {
        let mut state = self.state.write();
        if state.workflows.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let now = Utc::now();
        let workflow = Workflow {
            id: id.clone(),
            definition_id,
            status: WorkflowStatus::Pending,
            state: initial_state,
            current_node_id: start_node_id,
            total_steps,
            started_at: None,
            completed_at: None,
            error: None,
            inserted_at: now,
            updated_at: now,
            sequence: 0,
        };
        state.workflows.insert(id.clone(), workflow.clone());
        state.events.insert(id, Vec::new());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError> {
        self.state
            .read()
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn commit(
        &self,
        expected_sequence: i64,
        mut workflow: Workflow,
        events: Vec<Event>,
    ) -> Result<Workflow, StoreError> {
        let mut state = self.state.write();
        let current = state
            .workflows
            .get(&workflow.id)
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow.id.clone()))?;

        if current.sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                workflow_id: workflow.id.clone(),
                expected: expected_sequence,
                actual: current.sequence,
            });
        }

        workflow.sequence = current.sequence + 1;
        workflow.updated_at = Utc::now();
        state
            .events
            .entry(workflow.id.clone())
            .or_default()
            .extend(events);
        state.workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    async fn load_events(&self, workflow_id: &str) -> Result<Vec<Event>, StoreError> {
        self.state
            .read()
            .events
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn count_by_status(&self, status: WorkflowStatus) -> usize {
        self.state
            .read()
            .workflows
            .values()
            .filter(|w| w.status == status)
            .count()
    }
}
