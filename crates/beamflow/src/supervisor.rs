//! Supervisor (spec.md §4.4, §6)
//!
//! Owns the idempotent `start_workflow` entry point and the restart
//! policy: a crashed actor is restarted in place up to
//! `restart_max_restarts` times inside `restart_window`, after which the
//! workflow is escalated to the DLQ as a `critical_failure` rather than
//! retried forever. Also owns the rest of spec.md §6's external
//! operations (`register_definition`, `stop_workflow`, `get_state`) and
//! the DLQ retry sweep (spec.md §4.7).
//!
//! Grounded in the teacher's `WorkerPool`/`ExecutorConfig` pairing: a
//! single long-lived supervisor instance coordinates many workflow runs
//! against one shared store and step registry.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::actor::{ActorConfig, ActorError, WorkflowActor};
use crate::chaos::{ChaosMonkey, FaultKind};
use crate::config::SupervisorConfig;
use crate::dlq::{build_entry, DeadLetterEntry, DlqEntryType, DlqStore};
use crate::error_class::ErrorClass;
use crate::event_bus::EventBus;
use crate::graph::{Graph, SelectorRegistry};
use crate::idempotency::IdempotencyStore;
use crate::step::{CancellationHandle, StepRegistry};
use crate::storage::{Workflow, WorkflowStatus, WorkflowStore};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Dlq(#[from] crate::dlq::DlqError),

    #[error(
        "workflow {workflow_id} exhausted {restarts} restarts within the configured window \
         and was escalated to the dead letter queue"
    )]
    RestartsExhausted { workflow_id: String, restarts: u32 },

    #[error("at capacity: {max_concurrent_workflows} workflows are already active")]
    AtCapacity { max_concurrent_workflows: u32 },

    #[error("no definition registered under id: {0}")]
    UnknownDefinition(String),
}

/// Coordinates `start_workflow` entry and the crash-restart loop around
/// [`WorkflowActor`]. Holds per-workflow restart counters and
/// cancellation handles, and the `definition_id -> Graph` registry
/// `register_definition` populates (spec.md §6).
///
/// The "bounded worker pool" spec.md §5/§9 describes is realized as a
/// counting [`Semaphore`] rather than an internally-owned task registry:
/// each call to `start_workflow` is itself the unit a caller spawns as
/// its own task, and the permit bounds how many run concurrently.
pub struct Supervisor {
    store: Arc<dyn WorkflowStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    dlq: Arc<dyn DlqStore>,
    bus: Arc<EventBus>,
    steps: Arc<StepRegistry>,
    selectors: Arc<SelectorRegistry>,
    chaos: Option<Arc<ChaosMonkey>>,
    config: SupervisorConfig,
    actor_config: ActorConfig,
    definitions: DashMap<String, Arc<Graph>>,
    restarts: DashMap<String, VecDeque<Instant>>,
    cancellations: DashMap<String, CancellationHandle>,
    permits: Arc<Semaphore>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        dlq: Arc<dyn DlqStore>,
        bus: Arc<EventBus>,
        steps: Arc<StepRegistry>,
        selectors: Arc<SelectorRegistry>,
        config: SupervisorConfig,
        actor_config: ActorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_workflows as usize));
        Self {
            store,
            idempotency,
            dlq,
            bus,
            steps,
            selectors,
            chaos: None,
            config,
            actor_config,
            definitions: DashMap::new(),
            restarts: DashMap::new(),
            cancellations: DashMap::new(),
            permits,
        }
    }

    pub fn with_chaos(mut self, chaos: Arc<ChaosMonkey>) -> Self {
        self.chaos = Some(chaos);
        self
    }

    /// Register a graph under `definition_id`, resolvable by later
    /// `start_workflow` and DLQ-sweep calls (spec.md §6:
    /// `register_definition(id, graph, step_registry)` — this engine binds
    /// one step registry to the whole supervisor at construction rather
    /// than per definition, since `StepRegistry` is already shared state).
    pub fn register_definition(&self, definition_id: impl Into<String>, graph: Graph) {
        self.definitions.insert(definition_id.into(), Arc::new(graph));
    }

    fn resolve_definition(&self, definition_id: &str) -> Result<Arc<Graph>, SupervisorError> {
        self.definitions
            .get(definition_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| SupervisorError::UnknownDefinition(definition_id.to_string()))
    }

    /// Idempotent entry point: creates `workflow_id` if absent, then
    /// drives it to completion under the restart policy. Calling this
    /// again for a workflow id that already exists resumes it rather
    /// than erroring, so retried client requests are safe. `definition_id`
    /// must already be registered via [`Supervisor::register_definition`].
    ///
    /// Rejects immediately with `AtCapacity` once `max_concurrent_workflows`
    /// calls are already in flight, rather than queuing (spec.md §5:
    /// "`start_workflow` above the cap queues or fails with `:at_capacity`
    /// per configuration" — this engine's configuration always fails fast).
    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        definition_id: &str,
        start_node_id: &str,
        total_steps: u32,
        initial_state: Value,
    ) -> Result<Workflow, SupervisorError> {
        let graph = self.resolve_definition(definition_id)?;

        let _permit = self.permits.clone().try_acquire_owned().map_err(|_| {
            SupervisorError::AtCapacity {
                max_concurrent_workflows: self.config.max_concurrent_workflows,
            }
        })?;

        match self
            .store
            .create_workflow(
                workflow_id.to_string(),
                definition_id.to_string(),
                start_node_id.to_string(),
                total_steps,
                initial_state,
            )
            .await
        {
            Ok(_) | Err(crate::storage::StoreError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.run_with_restarts(workflow_id, &graph).await
    }

    /// Thin read-only wrapper over the stored `Workflow` row (spec.md §6:
    /// `get_state(workflow_id) -> {:ok, snapshot}`).
    pub async fn get_state(&self, workflow_id: &str) -> Result<Workflow, SupervisorError> {
        Ok(self.store.get_workflow(workflow_id).await?)
    }

    /// Request cooperative cancellation of a running workflow (spec.md
    /// §4.3 "Cancellation": the actor checks this at each loop iteration
    /// and stops without compensating, having already persisted progress
    /// through its last committed event). A no-op if `workflow_id` isn't
    /// currently being driven by this supervisor.
    pub fn stop_workflow(&self, workflow_id: &str) {
        if let Some(handle) = self.cancellations.get(workflow_id) {
            handle.cancel();
        }
    }

    /// Scan the DLQ for `pending` entries whose `next_retry_at` has
    /// elapsed and restart each at its last known node (spec.md §4.7: "A
    /// periodic sweeper scans `status=pending` with `next_retry_at <= now`
    /// and asks the supervisor to restart the workflow at its last known
    /// node"). `now` is caller-supplied rather than read internally so a
    /// caller can drive this on a timer at `DlqSweepConfig::sweep_interval`
    /// without this type depending on wall-clock time itself.
    pub async fn run_sweep_once(&self, now: DateTime<Utc>) -> Vec<Result<Workflow, SupervisorError>> {
        let due = self.dlq.list_due_for_retry(now).await;
        let mut results = Vec::with_capacity(due.len());
        for entry in due {
            results.push(self.retry_dlq_entry(entry).await);
        }
        results
    }

    async fn retry_dlq_entry(&self, entry: DeadLetterEntry) -> Result<Workflow, SupervisorError> {
        let graph = self.resolve_definition(&entry.workflow_definition_id)?;
        self.dlq.force_retry(entry.id).await?;

        let mut workflow = self.store.get_workflow(&entry.workflow_id).await?;
        if workflow.status == WorkflowStatus::Failed {
            workflow.status = WorkflowStatus::Running;
            workflow.error = None;
            workflow = self.store.commit(workflow.sequence, workflow, vec![]).await?;
        }

        self.run_with_restarts(&entry.workflow_id, &graph).await
    }

    async fn run_with_restarts(&self, workflow_id: &str, graph: &Graph) -> Result<Workflow, SupervisorError> {
        let handle = CancellationHandle::new();
        self.cancellations.insert(workflow_id.to_string(), handle.clone());
        if let Some(chaos) = &self.chaos {
            chaos.register_live(workflow_id);
        }

        let result = self.drive_to_terminal(workflow_id, graph, &handle).await;

        self.cancellations.remove(workflow_id);
        if let Some(chaos) = &self.chaos {
            chaos.unregister_live(workflow_id);
        }
        result
    }

    async fn drive_to_terminal(
        &self,
        workflow_id: &str,
        graph: &Graph,
        handle: &CancellationHandle,
    ) -> Result<Workflow, SupervisorError> {
        loop {
            let crashed = self.chaos.as_ref().is_some_and(|c| {
                c.take_targeted_crash(workflow_id) || c.should_fail(FaultKind::Crash)
            });

            let outcome = if crashed {
                None
            } else {
                let mut actor = WorkflowActor::new(
                    self.store.clone(),
                    self.idempotency.clone(),
                    self.dlq.clone(),
                    self.bus.clone(),
                    self.steps.clone(),
                    self.selectors.clone(),
                    self.actor_config.clone(),
                );
                if let Some(chaos) = &self.chaos {
                    actor = actor.with_chaos(chaos.clone());
                }
                Some(actor.run(workflow_id, graph, Some(handle.clone())).await)
            };

            match outcome {
                Some(Ok(workflow)) => return Ok(workflow),
                Some(Err(ActorError::AlreadyTerminal(_))) => {
                    return Ok(self.store.get_workflow(workflow_id).await?);
                }
                Some(Err(ActorError::Cancelled(_))) => {
                    return Ok(self.store.get_workflow(workflow_id).await?);
                }
                Some(Err(err)) => {
                    warn!(%workflow_id, error = %err, "actor crashed, evaluating restart");
                }
                None => {
                    warn!(%workflow_id, "chaos monkey killed the actor before it ran");
                }
            }

            if self.record_restart_and_is_exhausted(workflow_id) {
                return Err(self.escalate(workflow_id).await?);
            }
        }
    }

    fn record_restart_and_is_exhausted(&self, workflow_id: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.restarts.entry(workflow_id.to_string()).or_default();
        entry.push_back(now);
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > self.config.restart_window {
                entry.pop_front();
            } else {
                break;
            }
        }
        entry.len() as u32 > self.config.restart_max_restarts
    }

    /// A restart-exhausted workflow is force-escalated: a `critical_failure`
    /// DLQ entry is enqueued regardless of the underlying error's class,
    /// since repeated actor crashes are an infrastructure concern rather
    /// than a retryable business error (spec.md §4.4, §9).
    async fn escalate(&self, workflow_id: &str) -> Result<SupervisorError, crate::dlq::DlqError> {
        let restarts = self
            .restarts
            .get(workflow_id)
            .map(|q| q.len() as u32)
            .unwrap_or(self.config.restart_max_restarts + 1);

        let workflow = self.store.get_workflow(workflow_id).await.ok();
        let definition_id = workflow
            .as_ref()
            .map(|w| w.definition_id.clone())
            .unwrap_or_default();
        let state = workflow.map(|w| w.state).unwrap_or(Value::Null);

        let entry = build_entry(
            DlqEntryType::CriticalFailure,
            workflow_id.to_string(),
            definition_id,
            None,
            format!("actor restarts exhausted ({restarts} within {:?})", self.config.restart_window),
            ErrorClass::Terminal,
            state,
            Value::Null,
        );
        self.dlq.enqueue(entry).await?;
        error!(%workflow_id, restarts, "workflow escalated to dead letter queue after restart exhaustion");

        Ok(SupervisorError::RestartsExhausted {
            workflow_id: workflow_id.to_string(),
            restarts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::{DlqStatus, InMemoryDlqStore};
    use crate::graph::GraphBuilder;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::reliability::RetryPolicy;
    use crate::step::{Step, StepError};
    use crate::storage::InMemoryWorkflowStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl Step for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        async fn execute(&self, state: Value) -> Result<Value, StepError> {
            Ok(state)
        }
    }

    fn simple_graph() -> Graph {
        GraphBuilder::new()
            .start("start")
            .step("s1", "echo")
            .end("end")
            .edge("start", "s1")
            .edge("s1", "end")
            .build()
            .unwrap()
    }

    fn supervisor(config: SupervisorConfig) -> (Supervisor, Arc<InMemoryDlqStore>) {
        let mut steps = StepRegistry::new();
        steps.register(Arc::new(Echo)).unwrap();
        let dlq = InMemoryDlqStore::new();
        let supervisor = Supervisor::new(
            InMemoryWorkflowStore::new(),
            InMemoryIdempotencyStore::new(),
            dlq.clone(),
            Arc::new(EventBus::new()),
            Arc::new(steps),
            Arc::new(SelectorRegistry::new()),
            config,
            ActorConfig::default(),
        );
        (supervisor, dlq)
    }

    #[tokio::test]
    async fn start_workflow_runs_to_completion() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 3));
        supervisor.register_definition("def-1", simple_graph());
        let workflow = supervisor
            .start_workflow("wf-1", "def-1", "start", 1, Value::Null)
            .await
            .unwrap();
        assert_eq!(workflow.status, crate::storage::WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn start_workflow_is_idempotent_on_repeat_call() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 3));
        supervisor.register_definition("def-1", simple_graph());
        let first = supervisor
            .start_workflow("wf-2", "def-1", "start", 1, Value::Null)
            .await
            .unwrap();
        let second = supervisor
            .start_workflow("wf-2", "def-1", "start", 1, Value::Null)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, crate::storage::WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn start_workflow_rejects_when_at_capacity() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(0, 3));
        supervisor.register_definition("def-1", simple_graph());
        let err = supervisor
            .start_workflow("wf-capacity", "def-1", "start", 1, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AtCapacity { max_concurrent_workflows: 0 }));
    }

    #[tokio::test]
    async fn start_workflow_rejects_an_unregistered_definition() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 3));
        let err = supervisor
            .start_workflow("wf-unreg", "no-such-def", "start", 1, Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownDefinition(id) if id == "no-such-def"));
    }

    #[tokio::test]
    async fn register_definition_then_get_state_reflects_completion() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 3));
        supervisor.register_definition("def-1", simple_graph());
        supervisor
            .start_workflow("wf-state", "def-1", "start", 1, Value::Null)
            .await
            .unwrap();

        let fetched = supervisor.get_state("wf-state").await.unwrap();
        assert_eq!(fetched.id, "wf-state");
        assert_eq!(fetched.status, crate::storage::WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn stop_workflow_cancels_a_run_in_progress() {
        struct Stalls;

        #[async_trait]
        impl Step for Stalls {
            fn id(&self) -> &str {
                "stalls"
            }

            async fn execute(&self, state: Value) -> Result<Value, StepError> {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(state)
            }
        }

        let mut steps = StepRegistry::new();
        steps.register(Arc::new(Stalls)).unwrap();
        let dlq = InMemoryDlqStore::new();
        let supervisor = Arc::new(Supervisor::new(
            InMemoryWorkflowStore::new(),
            InMemoryIdempotencyStore::new(),
            dlq,
            Arc::new(EventBus::new()),
            Arc::new(steps),
            Arc::new(SelectorRegistry::new()),
            SupervisorConfig::new(10, 3),
            ActorConfig::default(),
        ));
        let graph = GraphBuilder::new()
            .start("start")
            .step("s1", "stalls")
            .end("end")
            .edge("start", "s1")
            .edge("s1", "end")
            .build()
            .unwrap();
        supervisor.register_definition("def-stall", graph);

        let spawned = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .start_workflow("wf-stop", "def-stall", "start", 1, Value::Null)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.stop_workflow("wf-stop");

        let result = spawned.await.unwrap().unwrap();
        assert!(!result.status.is_terminal());
    }

    #[test]
    fn restart_counter_trips_after_configured_threshold() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 2));
        assert!(!supervisor.record_restart_and_is_exhausted("wf-x"));
        assert!(!supervisor.record_restart_and_is_exhausted("wf-x"));
        assert!(supervisor.record_restart_and_is_exhausted("wf-x"));
    }

    #[test]
    fn restart_counter_is_scoped_per_workflow() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 0));
        assert!(supervisor.record_restart_and_is_exhausted("wf-a"));
        assert!(supervisor.record_restart_and_is_exhausted("wf-b"));
    }

    #[tokio::test]
    async fn escalation_enqueues_a_critical_dlq_entry() {
        let (supervisor, dlq) = supervisor(SupervisorConfig::new(10, 0));
        supervisor
            .store
            .create_workflow("wf-3".into(), "def-1".into(), "start".into(), 1, Value::Null)
            .await
            .unwrap();
        supervisor.record_restart_and_is_exhausted("wf-3");
        supervisor.record_restart_and_is_exhausted("wf-3");

        let result = supervisor.escalate("wf-3").await.unwrap();
        assert!(matches!(result, SupervisorError::RestartsExhausted { .. }));

        let entries = dlq.list_by_status(DlqStatus::Archived).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, crate::dlq::DlqEntryType::CriticalFailure);
    }

    #[tokio::test]
    async fn run_sweep_once_restarts_a_due_dlq_entry() {
        struct AlwaysRateLimited;

        #[async_trait]
        impl Step for AlwaysRateLimited {
            fn id(&self) -> &str {
                "flaky_forever"
            }

            async fn execute(&self, _state: Value) -> Result<Value, StepError> {
                Err(StepError::new("rate_limited"))
            }
        }

        let mut steps = StepRegistry::new();
        steps.register(Arc::new(AlwaysRateLimited)).unwrap();
        let dlq = InMemoryDlqStore::new();
        let supervisor = Supervisor::new(
            InMemoryWorkflowStore::new(),
            InMemoryIdempotencyStore::new(),
            dlq.clone(),
            Arc::new(EventBus::new()),
            Arc::new(steps),
            Arc::new(SelectorRegistry::new()),
            SupervisorConfig::new(10, 3),
            ActorConfig::default().with_default_retry_policy(RetryPolicy::no_retry()),
        );
        let graph = GraphBuilder::new()
            .start("start")
            .step("s1", "flaky_forever")
            .end("end")
            .edge("start", "s1")
            .edge("s1", "end")
            .build()
            .unwrap();
        supervisor.register_definition("def-sweep", graph);

        let first = supervisor
            .start_workflow("wf-sweep", "def-sweep", "start", 1, Value::Null)
            .await
            .unwrap();
        assert_eq!(first.status, crate::storage::WorkflowStatus::Failed);
        assert_eq!(dlq.list_by_status(DlqStatus::Pending).await.len(), 1);

        // The DLQ entry's `next_retry_at` is scheduled at least 5 minutes
        // out; simulate the sweeper running once that has elapsed.
        let due_now = Utc::now() + chrono::Duration::minutes(10);
        let results = supervisor.run_sweep_once(due_now).await;

        assert_eq!(results.len(), 1);
        let second = results.into_iter().next().unwrap().unwrap();
        assert_eq!(second.status, crate::storage::WorkflowStatus::Failed);

        assert_eq!(dlq.list_by_status(DlqStatus::Retrying).await.len(), 1);
        assert_eq!(dlq.list_by_status(DlqStatus::Pending).await.len(), 1);
    }

    #[tokio::test]
    async fn run_sweep_once_is_a_no_op_with_nothing_due() {
        let (supervisor, _dlq) = supervisor(SupervisorConfig::new(10, 3));
        let results = supervisor.run_sweep_once(Utc::now()).await;
        assert!(results.is_empty());
    }
}
