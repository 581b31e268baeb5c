//! Workflow actor (spec.md §4.3)
//!
//! Drives a single workflow instance, one node at a time: steps, branches
//! and joins are resolved against the workflow's [`Graph`], step attempts
//! are gated through the idempotency ledger, and a failed step triggers
//! reverse-order compensation of every step that already completed.
//!
//! Grounded in the teacher's `WorkflowExecutor`: replay-from-events on
//! entry, one actor per workflow id, `ExecutorConfig`-style builder for
//! tunables.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::chaos::{ChaosMonkey, FaultKind};
use crate::dlq::{build_entry, DlqEntryType, DlqStore};
use crate::error_class::ErrorClass;
use crate::event_bus::{workflow_topic, EventBus};
use crate::graph::{Graph, Next, SelectorRegistry};
use crate::idempotency::{IdempotencyStore, LedgerStatus};
use crate::reliability::RetryPolicy;
use crate::step::{CancellationHandle, StepContext, StepRegistry};
use crate::storage::{Event, EventType, Workflow, WorkflowStatus, WorkflowStore};

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Ledger(#[from] crate::idempotency::LedgerError),

    #[error(transparent)]
    Dlq(#[from] crate::dlq::DlqError),

    #[error(transparent)]
    Graph(#[from] crate::graph::GraphError),

    #[error("unknown step id: {0}")]
    UnknownStep(String),

    #[error("workflow {0} was cancelled")]
    Cancelled(String),

    #[error("workflow {0} is already terminal")]
    AlreadyTerminal(String),
}

/// Tunables for [`WorkflowActor::run`], mirroring the teacher's
/// `ExecutorConfig` builder shape.
#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub default_retry_policy: RetryPolicy,
    pub step_timeout: Duration,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            default_retry_policy: RetryPolicy::conservative(),
            step_timeout: Duration::from_secs(30),
        }
    }
}

impl ActorConfig {
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }
}

/// A step that completed and must be compensated, in traversal order.
struct CompletedStep {
    node_id: String,
    step_ref: String,
    /// The state snapshot passed as compensation context — the input the
    /// step acted on, per spec.md §4.2.
    context: Value,
}

enum StepOutcome {
    Completed(Value),
    Failed { class: ErrorClass, reason: String },
}

/// Drives one workflow instance against its [`Graph`].
///
/// Exactly one actor instance should run a given workflow id at a time
/// (spec.md §5: "only one actor ever writes a given row"); the supervisor
/// is responsible for that exclusivity, not this type.
pub struct WorkflowActor {
    store: Arc<dyn WorkflowStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    dlq: Arc<dyn DlqStore>,
    bus: Arc<EventBus>,
    steps: Arc<StepRegistry>,
    selectors: Arc<SelectorRegistry>,
    chaos: Option<Arc<ChaosMonkey>>,
    config: ActorConfig,
}

impl WorkflowActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        dlq: Arc<dyn DlqStore>,
        bus: Arc<EventBus>,
        steps: Arc<StepRegistry>,
        selectors: Arc<SelectorRegistry>,
        config: ActorConfig,
    ) -> Self {
        Self {
            store,
            idempotency,
            dlq,
            bus,
            steps,
            selectors,
            chaos: None,
            config,
        }
    }

    pub fn with_chaos(mut self, chaos: Arc<ChaosMonkey>) -> Self {
        self.chaos = Some(chaos);
        self
    }

    /// Run `workflow_id` against `graph` to completion, failure, or
    /// cancellation. Safe to call again on a crashed-and-restarted
    /// workflow: the idempotency ledger and replayed events make
    /// re-entry a resume, not a re-run from scratch.
    #[instrument(skip(self, graph, cancellation), fields(workflow_id = %workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        graph: &Graph,
        cancellation: Option<CancellationHandle>,
    ) -> Result<Workflow, ActorError> {
        let mut workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status.is_terminal() {
            return Err(ActorError::AlreadyTerminal(workflow_id.to_string()));
        }

        let mut completed = self.replay_completed_steps(workflow_id, graph).await?;

        if workflow.status == WorkflowStatus::Pending {
            workflow = self
                .transition(
                    workflow,
                    WorkflowStatus::Running,
                    Event::new(workflow_id, EventType::WorkflowStarted, Value::Null),
                )
                .await?;
        }

        loop {
            if let Some(handle) = &cancellation {
                if handle.is_cancelled() {
                    return Err(ActorError::Cancelled(workflow_id.to_string()));
                }
            }

            let node_id = workflow.current_node_id.clone();
            let next = graph.next(&node_id, &workflow.state, |selector_ref, state| {
                self.selectors.evaluate(selector_ref, state)
            })?;

            match next {
                Next::Terminal => {
                    workflow = self
                        .transition(
                            workflow,
                            WorkflowStatus::Completed,
                            Event::new(workflow_id, EventType::WorkflowCompleted, Value::Null),
                        )
                        .await?;
                    self.publish(workflow_id, "completed", Value::Null);
                    return Ok(workflow);
                }
                Next::Join { next_id } => {
                    workflow.current_node_id = next_id;
                    workflow = self.store.commit(workflow.sequence, workflow, vec![]).await?;
                }
                Next::Branch {
                    evaluated_label,
                    next_id,
                } => {
                    let event = Event::new(
                        workflow_id,
                        EventType::BranchTaken,
                        serde_json::json!({
                            "node_id": node_id,
                            "label": evaluated_label,
                            "next_id": next_id,
                        }),
                    );
                    workflow.current_node_id = next_id;
                    workflow = self.store.commit(workflow.sequence, workflow, vec![event]).await?;
                }
                Next::Step { step_ref, next_id } => {
                    let (outcome, updated_workflow) = self.run_step(workflow, &node_id, &step_ref).await?;
                    workflow = updated_workflow;

                    match outcome {
                        StepOutcome::Completed(new_state) => {
                            let context = workflow.state.clone();
                            let event = Event::new(
                                workflow_id,
                                EventType::StepCompleted,
                                serde_json::json!({
                                    "node_id": node_id,
                                    "step_ref": step_ref,
                                    "context": context,
                                }),
                            );
                            completed.push(CompletedStep {
                                node_id: node_id.clone(),
                                step_ref: step_ref.clone(),
                                context,
                            });
                            workflow.state = new_state;
                            workflow.current_node_id = next_id;
                            workflow = self.store.commit(workflow.sequence, workflow, vec![event]).await?;
                        }
                        StepOutcome::Failed { class, reason } => {
                            return self
                                .fail_workflow(workflow, &node_id, &step_ref, class, reason, completed)
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Rebuild the compensation stack from persisted `StepCompleted`
    /// events, so a restarted actor compensates correctly even if it
    /// crashed before this call.
    async fn replay_completed_steps(
        &self,
        workflow_id: &str,
        graph: &Graph,
    ) -> Result<Vec<CompletedStep>, ActorError> {
        let events = self.store.load_events(workflow_id).await?;
        let mut completed = Vec::new();
        for event in events {
            if event.event_type != EventType::StepCompleted {
                continue;
            }
            let node_id = event
                .data
                .get("node_id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let step_ref = event
                .data
                .get("step_ref")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let context = event.data.get("context").cloned().unwrap_or(Value::Null);
            if graph.node_exists(&node_id) {
                completed.push(CompletedStep {
                    node_id,
                    step_ref,
                    context,
                });
            }
        }
        Ok(completed)
    }

    /// Execute one graph step, including its internal retry loop. Returns
    /// once the step either completes or exhausts its retry policy, along
    /// with the workflow advanced past every event persisted along the way
    /// (`step_failed` per failed attempt, `retry_scheduled` before each
    /// backoff sleep).
    async fn run_step(
        &self,
        mut workflow: Workflow,
        node_id: &str,
        step_ref: &str,
    ) -> Result<(StepOutcome, Workflow), ActorError> {
        let workflow_id = workflow.id.clone();
        let state = workflow.state.clone();
        let step = self
            .steps
            .get(step_ref)
            .map_err(|_| ActorError::UnknownStep(step_ref.to_string()))?;
        let policy = step
            .retry_policy()
            .unwrap_or_else(|| self.config.default_retry_policy.clone());

        // A restarted actor starts counting attempts from 1 again, but the
        // ledger never regresses a `failed` entry back to `pending`. Skip
        // past attempts this workflow already concluded as failed before
        // crashing, so resume lands on the attempt it was actually on.
        let mut attempt: u32 = 1;
        loop {
            let probe_key = StepContext::new(&workflow_id, node_id, attempt).idempotency_key();
            match self.idempotency.get(&probe_key).await {
                Some(entry) if entry.status == LedgerStatus::Failed => attempt += 1,
                _ => break,
            }
        }

        loop {
            let ctx = StepContext::new(&workflow_id, node_id, attempt);
            let key = ctx.idempotency_key();

            if let Some(entry) = self.idempotency.get(&key).await {
                if entry.status == LedgerStatus::Completed {
                    return Ok((StepOutcome::Completed(entry.result.unwrap_or(state)), workflow));
                }
                // A `pending` entry here means the actor crashed mid-attempt;
                // `mark_pending` is idempotent for an existing `pending` row.
            }
            self.idempotency.mark_pending(&key).await?;

            let mut input = state.clone();
            if let Value::Object(ref mut map) = input {
                map.insert("idempotency_key".into(), Value::String(key.clone()));
            }

            workflow = self
                .append(
                    workflow,
                    Event::new(
                        &workflow_id,
                        EventType::StepStarted,
                        serde_json::json!({"node_id": node_id, "step_ref": step_ref, "attempt": attempt}),
                    ),
                )
                .await?;
            self.bus.publish(
                &workflow_topic(&workflow_id),
                serde_json::json!({"event": "step_started", "node_id": node_id, "attempt": attempt}),
            );

            let outcome = match step.validate(&input).await {
                Err(err) => Err(err),
                Ok(()) => {
                    if let Some(chaos) = &self.chaos {
                        if chaos.should_fail(FaultKind::Error) {
                            Err(crate::step::StepError::new("chaos_injected_error"))
                        } else if chaos.should_fail(FaultKind::Timeout) {
                            Err(crate::step::StepError::new("timeout"))
                        } else {
                            self.run_with_timeout(step.execute_timeout(), step.execute(input)).await
                        }
                    } else {
                        self.run_with_timeout(step.execute_timeout(), step.execute(input)).await
                    }
                }
            };

            match outcome {
                Ok(new_state) => {
                    self.idempotency.mark_completed(&key, new_state.clone()).await?;
                    return Ok((StepOutcome::Completed(new_state), workflow));
                }
                Err(err) => {
                    self.idempotency.mark_failed(&key, err.reason.clone()).await?;
                    let class = err.classify();
                    warn!(step = step_ref, %attempt, reason = %err.reason, %class, "step failed");

                    let failed_event = Event::new(
                        &workflow_id,
                        EventType::StepFailed,
                        serde_json::json!({
                            "node_id": node_id,
                            "step_ref": step_ref,
                            "attempt": attempt,
                            "reason": err.reason,
                            "error_class": class,
                        }),
                    );
                    workflow = self.append(workflow, failed_event).await?;

                    if policy.is_retryable(class) && policy.has_attempts_remaining(attempt) {
                        let delay = policy.delay_for_attempt(attempt);
                        let retry_event = Event::new(
                            &workflow_id,
                            EventType::RetryScheduled,
                            serde_json::json!({
                                "node_id": node_id,
                                "step_ref": step_ref,
                                "next_attempt": attempt + 1,
                                "delay_ms": delay.as_millis(),
                            }),
                        );
                        workflow = self.append(workflow, retry_event).await?;

                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok((
                        StepOutcome::Failed {
                            class,
                            reason: err.reason,
                        },
                        workflow,
                    ));
                }
            }
        }
    }

    /// Compensate every completed step in reverse order, then mark the
    /// workflow failed and enqueue a DLQ entry (spec.md §4.3, §4.7).
    async fn fail_workflow(
        &self,
        mut workflow: Workflow,
        failed_node: &str,
        failed_step: &str,
        class: ErrorClass,
        reason: String,
        completed: Vec<CompletedStep>,
    ) -> Result<Workflow, ActorError> {
        let workflow_id = workflow.id.clone();
        // The final failed attempt's `step_failed` event was already
        // persisted by `run_step`; this transition only needs to record
        // the status change itself.
        workflow = self
            .transition(
                workflow,
                WorkflowStatus::Compensating,
                Event::new(
                    &workflow_id,
                    EventType::CompensationStarted,
                    serde_json::json!({"node_id": failed_node, "step_ref": failed_step}),
                ),
            )
            .await?;

        let mut critical_compensation_failure = false;

        for completed_step in completed.into_iter().rev() {
            let Ok(step) = self.steps.get(&completed_step.step_ref) else {
                continue;
            };
            workflow = self
                .append(
                    workflow,
                    Event::new(
                        &workflow_id,
                        EventType::CompensationStarted,
                        serde_json::json!({"node_id": completed_step.node_id}),
                    ),
                )
                .await?;

            let forced_failure = self
                .chaos
                .as_ref()
                .is_some_and(|c| c.should_fail(FaultKind::CompensationFail));

            let metadata = step.compensation_metadata();
            let result = if forced_failure {
                Err(crate::step::StepError::new("chaos_injected_compensation_failure"))
            } else {
                match tokio::time::timeout(metadata.timeout, step.compensate(&completed_step.context)).await {
                    Ok(result) => result,
                    Err(_) => Err(crate::step::StepError::new("step_timeout")),
                }
            };

            match result {
                Ok(()) => {
                    workflow = self
                        .append(
                            workflow,
                            Event::new(
                                &workflow_id,
                                EventType::CompensationCompleted,
                                serde_json::json!({"node_id": completed_step.node_id}),
                            ),
                        )
                        .await?;
                }
                Err(err) => {
                    if metadata.critical {
                        critical_compensation_failure = true;
                    }
                    workflow = self
                        .append(
                            workflow,
                            Event::new(
                                &workflow_id,
                                EventType::CompensationFailed,
                                serde_json::json!({
                                    "node_id": completed_step.node_id,
                                    "reason": err.reason,
                                    "critical": metadata.critical,
                                }),
                            ),
                        )
                        .await?;
                }
            }
        }

        workflow.error = Some(reason.clone());
        workflow = self
            .transition(
                workflow,
                WorkflowStatus::Failed,
                Event::new(&workflow_id, EventType::WorkflowFailed, serde_json::json!({"reason": reason})),
            )
            .await?;

        let entry_type = if critical_compensation_failure {
            DlqEntryType::CompensationFailed
        } else {
            DlqEntryType::WorkflowFailed
        };
        let entry = build_entry(
            entry_type,
            workflow_id.clone(),
            workflow.definition_id.clone(),
            Some(failed_step.to_string()),
            workflow.error.clone().unwrap_or_default(),
            class,
            workflow.state.clone(),
            Value::Null,
        );
        self.dlq.enqueue(entry).await?;
        workflow = self
            .append(
                workflow,
                Event::new(&workflow_id, EventType::DlqEnqueued, Value::Null),
            )
            .await?;

        self.publish(&workflow_id, "failed", serde_json::json!({"reason": workflow.error}));
        info!(workflow_id = %workflow_id, "workflow failed and compensation complete");
        Ok(workflow)
    }

    async fn transition(
        &self,
        mut workflow: Workflow,
        status: WorkflowStatus,
        event: Event,
    ) -> Result<Workflow, ActorError> {
        if !workflow.status.can_transition_to(status) {
            return Err(crate::storage::StoreError::InvalidTransition {
                workflow_id: workflow.id.clone(),
                from: workflow.status,
                to: status,
            }
            .into());
        }
        workflow.status = status;
        Ok(self.store.commit(workflow.sequence, workflow, vec![event]).await?)
    }

    async fn append(&self, workflow: Workflow, event: Event) -> Result<Workflow, ActorError> {
        Ok(self.store.commit(workflow.sequence, workflow, vec![event]).await?)
    }

    /// Bound a step's `execute` by `config.step_timeout` (spec.md §7: "Each
    /// step execution is bounded by a per-step timeout... on timeout the
    /// error is `:step_timeout`, classified transient unless overridden").
    async fn run_with_timeout(
        &self,
        step_timeout: Option<Duration>,
        fut: impl std::future::Future<Output = Result<Value, crate::step::StepError>>,
    ) -> Result<Value, crate::step::StepError> {
        let timeout = step_timeout.unwrap_or(self.config.step_timeout);
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(crate::step::StepError::new("step_timeout")),
        }
    }

    fn publish(&self, workflow_id: &str, kind: &str, data: Value) {
        self.bus.publish(
            &workflow_topic(workflow_id),
            serde_json::json!({"event": kind, "data": data}),
        );
    }
}
