//! # BEAMFlow
//!
//! A fault-tolerant workflow orchestration engine: durable, event-sourced
//! workflows driven by a single-writer actor per instance, with saga-style
//! compensation, a dead letter queue, and an opt-in chaos monkey for
//! exercising failure paths in non-production environments.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every mutation is persisted as an
//!   appended event alongside the `Workflow` row, enabling replay and
//!   crash recovery
//! - **Idempotent step execution**: a ledger keyed `workflow:step:attempt`
//!   prevents duplicate side effects across retries and restarts
//! - **Saga compensation**: a failed step unwinds every completed step in
//!   reverse order before the workflow is marked failed
//! - **Dead letter queue**: classified, sanitized failure records with
//!   exponential retry scheduling for transient errors
//! - **Chaos engineering**: an opt-in fault injector that refuses to run
//!   in the `prod` environment
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                            │
//! │  (idempotent start_workflow entry, crash-restart policy)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowActor                           │
//! │  (drives one workflow's graph traversal and compensation)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowStore                           │
//! │  (Workflow + Event tables; Idempotency and DLQ alongside)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use beamflow::prelude::*;
//! use std::sync::Arc;
//!
//! let steps = Arc::new(StepRegistry::new());
//! let selectors = Arc::new(SelectorRegistry::new());
//! let store = InMemoryWorkflowStore::new();
//!
//! let supervisor = Supervisor::new(
//!     store,
//!     InMemoryIdempotencyStore::new(),
//!     InMemoryDlqStore::new(),
//!     Arc::new(EventBus::new()),
//!     steps,
//!     selectors,
//!     SupervisorConfig::new(100, 3),
//!     ActorConfig::default(),
//! );
//! ```

pub mod actor;
pub mod chaos;
pub mod config;
pub mod dlq;
pub mod error_class;
pub mod event_bus;
pub mod graph;
pub mod idempotency;
pub mod reliability;
pub mod step;
pub mod storage;
pub mod supervisor;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::actor::{ActorConfig, ActorError, WorkflowActor};
    pub use crate::chaos::{ChaosMonkey, FaultKind};
    pub use crate::config::{BeamflowConfig, ChaosConfig, ChaosProfile, Environment, SupervisorConfig};
    pub use crate::dlq::{DeadLetterEntry, DlqEntryType, DlqStatus, DlqStore, InMemoryDlqStore};
    pub use crate::error_class::ErrorClass;
    pub use crate::event_bus::EventBus;
    pub use crate::graph::{BranchSelector, EdgeLabel, Graph, GraphBuilder, GraphError, SelectorRegistry};
    pub use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore, LedgerStatus};
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{CancellationHandle, Step, StepContext, StepError, StepRegistry};
    pub use crate::storage::{InMemoryWorkflowStore, Workflow, WorkflowStatus, WorkflowStore};
    pub use crate::supervisor::{Supervisor, SupervisorError};
}

pub use actor::{ActorConfig, ActorError, WorkflowActor};
pub use chaos::{ChaosMonkey, FaultKind};
pub use config::BeamflowConfig;
pub use dlq::{DeadLetterEntry, DlqStore};
pub use error_class::ErrorClass;
pub use event_bus::EventBus;
pub use graph::{Graph, GraphBuilder};
pub use idempotency::IdempotencyStore;
pub use reliability::RetryPolicy;
pub use step::{Step, StepRegistry};
pub use storage::{Workflow, WorkflowStatus, WorkflowStore};
pub use supervisor::{Supervisor, SupervisorError};
