//! End-to-end scenarios run against the in-memory reference store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beamflow::prelude::*;
use serde_json::{json, Value};

struct MarkDone(&'static str);

#[async_trait]
impl Step for MarkDone {
    fn id(&self) -> &str {
        self.0
    }

    async fn execute(&self, state: Value) -> Result<Value, StepError> {
        let mut state = state;
        if let Value::Object(ref mut map) = state {
            map.insert(self.0.to_string(), json!("done"));
        }
        Ok(state)
    }
}

struct LevelSelector;

impl BranchSelector for LevelSelector {
    fn id(&self) -> &str {
        "level"
    }

    fn select(&self, state: &Value) -> String {
        state.get("level").and_then(|v| v.as_str()).unwrap_or("").to_string()
    }
}

fn in_memory_harness() -> (Arc<InMemoryWorkflowStore>, Arc<InMemoryIdempotencyStore>, Arc<InMemoryDlqStore>, Arc<EventBus>) {
    (
        InMemoryWorkflowStore::new(),
        InMemoryIdempotencyStore::new(),
        InMemoryDlqStore::new(),
        Arc::new(EventBus::new()),
    )
}

/// Scenario 1: happy path, linear pipeline `[S1, S2, S3]`.
#[tokio::test]
async fn happy_path_linear_pipeline() {
    let (store, idempotency, dlq, bus) = in_memory_harness();
    let mut steps = StepRegistry::new();
    steps.register(Arc::new(MarkDone("1"))).unwrap();
    steps.register(Arc::new(MarkDone("2"))).unwrap();
    steps.register(Arc::new(MarkDone("3"))).unwrap();

    let actor = WorkflowActor::new(
        store.clone(),
        idempotency,
        dlq.clone(),
        bus,
        Arc::new(steps),
        Arc::new(SelectorRegistry::new()),
        ActorConfig::default(),
    );

    let graph = GraphBuilder::new()
        .start("start")
        .step("s1", "1")
        .step("s2", "2")
        .step("s3", "3")
        .end("end")
        .edge("start", "s1")
        .edge("s1", "s2")
        .edge("s2", "s3")
        .edge("s3", "end")
        .build()
        .unwrap();

    store
        .create_workflow("wf-1".into(), "linear".into(), "start".into(), 3, json!({}))
        .await
        .unwrap();

    let result = actor.run("wf-1", &graph, None).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.state, json!({"1": "done", "2": "done", "3": "done"}));

    let events = store.load_events("wf-1").await.unwrap();
    let step_completed_count = events
        .iter()
        .filter(|e| e.event_type == beamflow::storage::EventType::StepCompleted)
        .count();
    assert_eq!(step_completed_count, 3);
    assert!(dlq.list_by_status(DlqStatus::Pending).await.is_empty());
    assert!(dlq.list_by_status(DlqStatus::Archived).await.is_empty());
}

/// Scenario 2: branch with default fallback for an unmatched selector value.
#[tokio::test]
async fn branch_falls_back_to_default_edge() {
    let (store, idempotency, dlq, bus) = in_memory_harness();
    let mut steps = StepRegistry::new();
    steps.register(Arc::new(MarkDone("low"))).unwrap();
    steps.register(Arc::new(MarkDone("high"))).unwrap();
    steps.register(Arc::new(MarkDone("medium"))).unwrap();

    let mut selectors = SelectorRegistry::new();
    selectors.register(Arc::new(LevelSelector)).unwrap();

    let actor = WorkflowActor::new(
        store.clone(),
        idempotency,
        dlq,
        bus,
        Arc::new(steps),
        Arc::new(selectors),
        ActorConfig::default(),
    );

    let graph = GraphBuilder::new()
        .start("start")
        .branch("b", "level")
        .step("low", "low")
        .step("high", "high")
        .step("medium", "medium")
        .join("j")
        .end("end")
        .edge("start", "b")
        .branch_edge("b", "low", EdgeLabel::value("low"))
        .branch_edge("b", "high", EdgeLabel::value("high"))
        .branch_edge("b", "medium", EdgeLabel::Default)
        .edge("low", "j")
        .edge("high", "j")
        .edge("medium", "j")
        .edge("j", "end")
        .build()
        .unwrap();

    store
        .create_workflow("wf-2".into(), "branching".into(), "start".into(), 1, json!({"level": "medium"}))
        .await
        .unwrap();

    let result = actor.run("wf-2", &graph, None).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.state.get("low"), None);
    assert_eq!(result.state.get("high"), None);
    assert_eq!(result.state.get("medium").unwrap(), "done");

    let events = store.load_events("wf-2").await.unwrap();
    let branch_event = events
        .iter()
        .find(|e| e.event_type == beamflow::storage::EventType::BranchTaken)
        .unwrap();
    assert_eq!(branch_event.data["label"], "default");
}

/// Scenario 3: a transient failure on attempt 1 recovers on attempt 2.
#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    struct FailOnce {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Step for FailOnce {
        fn id(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, state: Value) -> Result<Value, StepError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt == 1 {
                Err(StepError::new("timeout"))
            } else {
                Ok(state)
            }
        }

        fn retry_policy(&self) -> Option<RetryPolicy> {
            Some(
                RetryPolicy::conservative()
                    .with_max_attempts(3)
                    .with_base_delay(Duration::from_millis(10)),
            )
        }
    }

    let (store, idempotency, dlq, bus) = in_memory_harness();
    let mut steps = StepRegistry::new();
    steps
        .register(Arc::new(FailOnce {
            attempts: AtomicU32::new(0),
        }))
        .unwrap();

    let actor = WorkflowActor::new(
        store.clone(),
        idempotency,
        dlq,
        bus,
        Arc::new(steps),
        Arc::new(SelectorRegistry::new()),
        ActorConfig::default(),
    );

    let graph = GraphBuilder::new()
        .start("start")
        .step("s1", "flaky")
        .end("end")
        .edge("start", "s1")
        .edge("s1", "end")
        .build()
        .unwrap();

    store
        .create_workflow("wf-3".into(), "flaky-def".into(), "start".into(), 1, json!({}))
        .await
        .unwrap();

    let result = actor.run("wf-3", &graph, None).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);

    let events = store.load_events("wf-3").await.unwrap();
    let retry_scheduled = events
        .iter()
        .filter(|e| e.event_type == beamflow::storage::EventType::RetryScheduled)
        .count();
    let step_failed = events
        .iter()
        .filter(|e| e.event_type == beamflow::storage::EventType::StepFailed)
        .count();
    let step_completed = events
        .iter()
        .filter(|e| e.event_type == beamflow::storage::EventType::StepCompleted)
        .count();
    assert_eq!(retry_scheduled, 1);
    assert_eq!(step_failed, 1);
    assert_eq!(step_completed, 1);
}

/// Scenario 4: a saga-style failure compensates completed steps in
/// reverse order and lands in the dead letter queue.
#[tokio::test]
async fn saga_compensation_unwinds_in_reverse_order() {
    struct Compensating {
        id: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Step for Compensating {
        fn id(&self) -> &str {
            self.id
        }

        async fn execute(&self, state: Value) -> Result<Value, StepError> {
            Ok(state)
        }

        async fn compensate(&self, _context: &Value) -> Result<(), StepError> {
            self.log.lock().push(self.id);
            Ok(())
        }
    }

    struct FraudCheck;

    #[async_trait]
    impl Step for FraudCheck {
        fn id(&self) -> &str {
            "fraud_check"
        }

        async fn execute(&self, _state: Value) -> Result<Value, StepError> {
            Err(StepError::new("fraud_detected"))
        }
    }

    let (store, idempotency, dlq, bus) = in_memory_harness();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut steps = StepRegistry::new();
    steps
        .register(Arc::new(Compensating {
            id: "a",
            log: log.clone(),
        }))
        .unwrap();
    steps
        .register(Arc::new(Compensating {
            id: "b",
            log: log.clone(),
        }))
        .unwrap();
    steps.register(Arc::new(FraudCheck)).unwrap();

    let actor = WorkflowActor::new(
        store.clone(),
        idempotency,
        dlq.clone(),
        bus,
        Arc::new(steps),
        Arc::new(SelectorRegistry::new()),
        ActorConfig::default().with_default_retry_policy(RetryPolicy::no_retry()),
    );

    let graph = GraphBuilder::new()
        .start("start")
        .step("a", "a")
        .step("b", "b")
        .step("c", "fraud_check")
        .end("end")
        .edge("start", "a")
        .edge("a", "b")
        .edge("b", "c")
        .edge("c", "end")
        .build()
        .unwrap();

    store
        .create_workflow("wf-4".into(), "saga-def".into(), "start".into(), 3, json!({}))
        .await
        .unwrap();

    let result = actor.run("wf-4", &graph, None).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(log.lock().as_slice(), &["b", "a"]);

    let events = store.load_events("wf-4").await.unwrap();
    let compensation_completed = events
        .iter()
        .filter(|e| e.event_type == beamflow::storage::EventType::CompensationCompleted)
        .count();
    assert_eq!(compensation_completed, 2);

    let dlq_entries = dlq.list_by_status(DlqStatus::Pending).await;
    assert_eq!(dlq_entries.len(), 1);
    let entry = &dlq_entries[0];
    assert_eq!(entry.error_class, ErrorClass::Permanent);
    assert!(!entry.auto_retryable());
    assert!(entry.force_retryable());
}

/// Scenario 5: crash-resume. The ledger is seeded `pending` for an
/// in-flight attempt the way a crash mid-`execute` would leave it; the
/// actor observes the pending entry on restart and re-invokes the step
/// under the same idempotency key rather than skipping or duplicating it.
#[tokio::test]
async fn crash_mid_step_resumes_under_the_same_idempotency_key() {
    struct RecordingStep {
        seen_keys: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Step for RecordingStep {
        fn id(&self) -> &str {
            "s2"
        }

        async fn execute(&self, state: Value) -> Result<Value, StepError> {
            let key = state
                .get("idempotency_key")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            self.seen_keys.lock().push(key);
            Ok(state)
        }
    }

    let (store, idempotency, dlq, bus) = in_memory_harness();
    let seen_keys = Arc::new(parking_lot::Mutex::new(Vec::new()));

    // Seed the ledger as if attempt 1 crashed mid-flight: `pending`, never
    // completed.
    let expected_key = "wf-5:s2:1".to_string();
    idempotency.mark_pending(&expected_key).await.unwrap();

    let mut steps = StepRegistry::new();
    steps
        .register(Arc::new(RecordingStep {
            seen_keys: seen_keys.clone(),
        }))
        .unwrap();

    let actor = WorkflowActor::new(
        store.clone(),
        idempotency,
        dlq,
        bus,
        Arc::new(steps),
        Arc::new(SelectorRegistry::new()),
        ActorConfig::default(),
    );

    let graph = GraphBuilder::new()
        .start("start")
        .step("s2", "s2")
        .end("end")
        .edge("start", "s2")
        .edge("s2", "end")
        .build()
        .unwrap();

    // current_node_id is already s2, as if the workflow had advanced there
    // before the crash.
    store
        .create_workflow("wf-5".into(), "resume-def".into(), "s2".into(), 1, json!({}))
        .await
        .unwrap();
    let mut workflow = store.get_workflow("wf-5").await.unwrap();
    workflow.status = WorkflowStatus::Running;
    store.commit(0, workflow, vec![]).await.unwrap();

    let result = actor.run("wf-5", &graph, None).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(seen_keys.lock().as_slice(), &[expected_key]);
}

/// Scenario 6: chaos idempotency. Across many runs under an aggressive
/// chaos profile, every workflow that reaches `completed` must show each
/// step's ledger entry completed at most once, with no duplicate
/// `step_completed` events for the same attempt.
#[tokio::test]
async fn chaos_never_duplicates_a_completed_attempt() {
    let mut steps = StepRegistry::new();
    steps.register(Arc::new(MarkDone("x"))).unwrap();
    let steps = Arc::new(steps);

    let graph = GraphBuilder::new()
        .start("start")
        .step("s1", "x")
        .end("end")
        .edge("start", "s1")
        .edge("s1", "end")
        .build()
        .unwrap();

    for i in 0..15 {
        let store = InMemoryWorkflowStore::new();
        let idempotency = InMemoryIdempotencyStore::new();
        let dlq = InMemoryDlqStore::new();
        let bus = Arc::new(EventBus::new());
        let chaos = Arc::new(ChaosMonkey::new(Environment::Dev, bus.clone()));
        chaos
            .start(ChaosConfig::default().with_mode(true).with_profile(ChaosProfile::Aggressive))
            .unwrap();

        let supervisor = Supervisor::new(
            store.clone(),
            idempotency,
            dlq.clone(),
            bus,
            steps.clone(),
            Arc::new(SelectorRegistry::new()),
            SupervisorConfig::new(20, 8),
            ActorConfig::default().with_default_retry_policy(
                RetryPolicy::conservative()
                    .with_max_attempts(3)
                    .with_base_delay(Duration::from_millis(1)),
            ),
        )
        .with_chaos(chaos);
        supervisor.register_definition("chaos-def", graph.clone());

        let workflow_id = format!("wf-chaos-{i}");
        let outcome = supervisor
            .start_workflow(&workflow_id, "chaos-def", "start", 1, json!({}))
            .await;

        if let Ok(workflow) = outcome {
            if workflow.status == WorkflowStatus::Completed {
                let events = store.load_events(&workflow_id).await.unwrap();
                let mut seen_attempts = std::collections::HashSet::new();
                for event in events.iter().filter(|e| e.event_type == beamflow::storage::EventType::StepCompleted) {
                    let node_id = event.data["node_id"].as_str().unwrap_or_default();
                    assert!(
                        seen_attempts.insert(node_id.to_string()),
                        "duplicate step_completed for node {node_id}"
                    );
                }
            }
        }
        // Err(_) covers restart-exhaustion escalation to the DLQ, which is
        // an accepted terminal outcome for this scenario too.
    }
}
