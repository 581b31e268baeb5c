//! Chaos Monkey (spec.md §4.9)
//!
//! A process-wide singleton with `disabled`/`enabled(profile)` state,
//! modeled as atomic cells with explicit set/clear semantics rather than
//! ambient globals (spec.md §9), owned by a single named `ChaosMonkey`
//! instance the supervisor holds and passes to actors.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;

use crate::config::{ChaosConfig, ChaosProfile, Environment};
use crate::event_bus::{EventBus, CHAOS_EVENTS_TOPIC};

/// Faults the actor consults the monkey about at step-entry (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Crash,
    Timeout,
    Error,
    Latency,
    CompensationFail,
}

/// Fault kinds a periodic [`ChaosMonkey::tick`] samples from. `CompensationFail`
/// is excluded: it is armed one-shot against the next compensation call
/// (`arm_compensation_fail`/`should_fail`), not targeted at a live workflow.
const TICK_KINDS: [FaultKind; 4] = [FaultKind::Crash, FaultKind::Timeout, FaultKind::Error, FaultKind::Latency];

impl FaultKind {
    fn probability(self, config: &ChaosConfig) -> f64 {
        use ChaosProfile::*;
        use FaultKind::*;
        match (config.chaos_profile, self) {
            (Gentle, Crash) => 0.001,
            (Gentle, _) => 0.01,
            (Moderate, Crash) => 0.01,
            (Moderate, _) => 0.05,
            (Aggressive, Crash) => 0.05,
            (Aggressive, _) => 0.2,
            // Custom profiles carry one flat probability for every fault
            // kind rather than a per-kind table (spec.md §4.9).
            (Custom, _) => config.kill_probability,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    #[error("chaos monkey refuses to start in the prod environment")]
    ProdRefused,
}

/// Process-wide fault-injection service.
pub struct ChaosMonkey {
    enabled: AtomicBool,
    profile: parking_lot::RwLock<ChaosConfig>,
    environment: Environment,
    /// One-shot flag: the next compensation invocation after this is set
    /// fails, then the flag clears itself (spec.md §4.3).
    compensation_fail_once: AtomicBool,
    recoveries: AtomicU64,
    bus: Arc<EventBus>,
    /// Workflow ids currently being driven by a supervisor, populated via
    /// `register_live`/`unregister_live`. `tick`'s targeting draws from
    /// this set (spec.md §4.9: "target a random live workflow from the
    /// registry").
    live_workflows: DashMap<String, ()>,
    /// Workflow ids a `tick` has selected for a crash fault, consumed
    /// one-shot by the supervisor's restart loop via `take_targeted_crash`.
    pending_crash_targets: DashMap<String, ()>,
}

impl ChaosMonkey {
    pub fn new(environment: Environment, bus: Arc<EventBus>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            profile: parking_lot::RwLock::new(ChaosConfig::default()),
            environment,
            compensation_fail_once: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
            bus,
            live_workflows: DashMap::new(),
            pending_crash_targets: DashMap::new(),
        }
    }

    /// Enable chaos with `config`. Refuses outside non-prod environments.
    pub fn start(&self, config: ChaosConfig) -> Result<(), ChaosError> {
        if self.environment == Environment::Prod {
            return Err(ChaosError::ProdRefused);
        }
        *self.profile.write() = config;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// The synchronous query steps and the actor use. Always `false`,
    /// with no state contention, when chaos is disabled (spec.md §4.9).
    pub fn should_fail(&self, fault: FaultKind) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if fault == FaultKind::CompensationFail {
            // One-shot: consuming it clears it.
            return self.compensation_fail_once.swap(false, Ordering::SeqCst);
        }
        let config = self.profile.read().clone();
        let probability = fault.probability(&config);
        rand::thread_rng().gen_bool(probability.clamp(0.0, 1.0))
    }

    /// Arm the one-shot compensation-fail flag; consulted next time a
    /// compensation runs.
    pub fn arm_compensation_fail(&self) {
        self.compensation_fail_once.store(true, Ordering::SeqCst);
    }

    /// Track `workflow_id` as live for `tick`'s targeting. Called by the
    /// supervisor when it starts driving a workflow.
    pub fn register_live(&self, workflow_id: &str) {
        self.live_workflows.insert(workflow_id.to_string(), ());
    }

    /// Stop tracking `workflow_id`, called once the supervisor is done
    /// driving it (completed, failed, or cancelled).
    pub fn unregister_live(&self, workflow_id: &str) {
        self.live_workflows.remove(workflow_id);
        self.pending_crash_targets.remove(workflow_id);
    }

    /// One shot of the periodic fault-injection loop (spec.md §4.9: "on
    /// each interval, select a bounded-random sample of fault types, each
    /// subject to its probability, and target a random live workflow from
    /// the registry"). A caller drives this on a timer at
    /// `ChaosConfig::chaos_interval`, the same caller-owned-task model
    /// `Supervisor::run_sweep_once` uses for the DLQ sweep. No-op while
    /// disabled or with no live workflows to target.
    pub fn tick(&self) {
        if !self.is_enabled() {
            return;
        }
        let config = self.profile.read().clone();
        let live: Vec<String> = self.live_workflows.iter().map(|entry| entry.key().clone()).collect();
        if live.is_empty() {
            return;
        }

        let mut rng = rand::thread_rng();
        let mut selected = 0u32;
        for kind in TICK_KINDS {
            if selected >= config.max_kills_per_interval {
                break;
            }
            let probability = kind.probability(&config);
            if !rng.gen_bool(probability.clamp(0.0, 1.0)) {
                continue;
            }
            let target = &live[rng.gen_range(0..live.len())];
            if kind == FaultKind::Crash {
                self.pending_crash_targets.insert(target.clone(), ());
            }
            self.bus.publish(
                CHAOS_EVENTS_TOPIC,
                serde_json::json!({
                    "workflow_id": target,
                    "kind": format!("{kind:?}"),
                    "event": "tick_fault_selected",
                }),
            );
            selected += 1;
        }
    }

    /// Consume a crash selected for `workflow_id` by a prior `tick`, if
    /// any. One-shot: a second call returns `false` until another tick
    /// re-selects it.
    pub fn take_targeted_crash(&self, workflow_id: &str) -> bool {
        self.pending_crash_targets.remove(workflow_id).is_some()
    }

    /// Called when the saga or actor recovers from an injected fault.
    /// Increments the recovery counter and emits a recovery event.
    pub fn record_recovery(&self, workflow_id: &str, kind: FaultKind) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            CHAOS_EVENTS_TOPIC,
            serde_json::json!({
                "workflow_id": workflow_id,
                "kind": format!("{kind:?}"),
                "event": "recovery",
            }),
        );
    }

    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}
