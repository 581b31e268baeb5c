//! Storage contract (spec.md §6): transactional writes over four logical
//! tables — `Workflow`, `Event`, `Idempotency`, `DeadLetterEntry`.
//!
//! `Idempotency` and `DeadLetterEntry` are specified in their own modules
//! ([`crate::idempotency`], [`crate::dlq`]); this module covers `Workflow`
//! and `Event`, plus the [`WorkflowStore`] trait the actor drives.

mod memory;

pub use memory::InMemoryWorkflowStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow lifecycle status (spec.md §3: `pending → running →
/// {completed | failed | compensating}`; `compensating → {failed |
/// completed}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
}

impl WorkflowStatus {
    /// Whether a transition from `self` to `next` is legal under
    /// spec.md §3's status invariant.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Compensating)
                | (Compensating, Failed)
                | (Compensating, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// The `Workflow` row (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub state: Value,
    pub current_node_id: String,
    pub total_steps: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency sequence; bumped on every persisted mutation,
    /// mirroring the teacher's `expected_sequence` pattern.
    pub sequence: i64,
}

/// The eleven event types carried by the `Event` table (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    StepStarted,
    StepCompleted,
    StepFailed,
    BranchTaken,
    CompensationStarted,
    CompensationCompleted,
    CompensationFailed,
    RetryScheduled,
    DlqEnqueued,
}

/// An append-only `Event` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: uuid::Uuid,
    pub workflow_id: String,
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(workflow_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            id: uuid::Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("workflow already exists: {0}")]
    AlreadyExists(String),

    #[error("concurrency conflict on {workflow_id}: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict {
        workflow_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("invalid status transition for {workflow_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },
}

/// Storage contract for the `Workflow` and `Event` tables. Begin/commit/
/// abort are modeled as a single atomic `append_events_and_update`
/// call rather than an explicit transaction handle, since every actor
/// mutation touches exactly one `Workflow` row plus its appended events
/// (spec.md §5: "only one actor ever writes a given row").
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn create_workflow(
        &self,
        id: String,
        definition_id: String,
        start_node_id: String,
        total_steps: u32,
        initial_state: Value,
    ) -> Result<Workflow, StoreError>;

    async fn get_workflow(&self, id: &str) -> Result<Workflow, StoreError>;

    /// Atomically append `events` and persist the new workflow fields,
    /// rejecting the write if `expected_sequence` is stale (optimistic
    /// concurrency, spec.md §5).
    async fn commit(
        &self,
        expected_sequence: i64,
        workflow: Workflow,
        events: Vec<Event>,
    ) -> Result<Workflow, StoreError>;

    async fn load_events(&self, workflow_id: &str) -> Result<Vec<Event>, StoreError>;

    async fn count_by_status(&self, status: WorkflowStatus) -> usize;
}
