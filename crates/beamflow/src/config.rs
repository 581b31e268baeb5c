//! Configuration (spec.md §6)
//!
//! Three enumerated groups — chaos, supervisor/concurrency, DLQ sweeper —
//! each a builder-style struct, mirroring the teacher's
//! `RetryPolicy`/`WorkerPoolConfig` `with_x(mut self, ...) -> Self` idiom.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment environment. Chaos refuses to start when this is `Prod`
/// (spec.md §6: "Chaos MUST refuse to start in the `prod` environment.").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChaosProfile {
    Gentle,
    Moderate,
    Aggressive,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    pub chaos_mode: bool,
    pub chaos_profile: ChaosProfile,
    pub kill_probability: f64,
    #[serde(with = "crate::reliability::duration_millis")]
    pub chaos_interval: Duration,
    pub max_kills_per_interval: u32,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            chaos_mode: false,
            chaos_profile: ChaosProfile::Gentle,
            kill_probability: 0.01,
            chaos_interval: Duration::from_secs(30),
            max_kills_per_interval: 1,
        }
    }
}

impl ChaosConfig {
    pub fn with_mode(mut self, enabled: bool) -> Self {
        self.chaos_mode = enabled;
        self
    }

    pub fn with_profile(mut self, profile: ChaosProfile) -> Self {
        self.chaos_profile = profile;
        self
    }

    /// Per-fault probability for [`ChaosProfile::Custom`] (ignored by the
    /// three named profiles, which carry their own fixed table).
    pub fn with_kill_probability(mut self, probability: f64) -> Self {
        self.kill_probability = probability;
        self
    }

    pub fn with_chaos_interval(mut self, interval: Duration) -> Self {
        self.chaos_interval = interval;
        self
    }

    pub fn with_max_kills_per_interval(mut self, max: u32) -> Self {
        self.max_kills_per_interval = max;
        self
    }
}

/// Supervisor and concurrency settings.
///
/// `restart_max_restarts` has **no built-in default that silently masks
/// misconfiguration** — spec.md §9's third open question requires this
/// threshold be configurable and documented, so `SupervisorConfig::new`
/// requires it explicitly rather than `Default` guessing a number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    pub max_concurrent_workflows: u32,
    #[serde(with = "crate::reliability::duration_millis")]
    pub default_step_timeout: Duration,
    #[serde(with = "crate::reliability::duration_millis")]
    pub restart_window: Duration,
    pub restart_max_restarts: u32,
}

impl SupervisorConfig {
    /// `restart_max_restarts` is required: a crashed actor is restarted up
    /// to this many times inside `restart_window` before the workflow is
    /// escalated to the DLQ with `type=critical_failure` (spec.md §4.4).
    pub fn new(max_concurrent_workflows: u32, restart_max_restarts: u32) -> Self {
        Self {
            max_concurrent_workflows,
            default_step_timeout: Duration::from_secs(30),
            restart_window: Duration::from_secs(60),
            restart_max_restarts,
        }
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_restart_window(mut self, window: Duration) -> Self {
        self.restart_window = window;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqSweepConfig {
    #[serde(with = "crate::reliability::duration_millis")]
    pub sweep_interval: Duration,
    pub base_retry_minutes: f64,
    pub max_retry_minutes: f64,
}

impl Default for DlqSweepConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            base_retry_minutes: 5.0,
            max_retry_minutes: 720.0,
        }
    }
}

/// Aggregate engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamflowConfig {
    pub environment: Environment,
    pub chaos: ChaosConfig,
    pub supervisor: SupervisorConfig,
    pub dlq_sweep: DlqSweepConfig,
}

impl BeamflowConfig {
    pub fn new(environment: Environment, supervisor: SupervisorConfig) -> Self {
        Self {
            environment,
            chaos: ChaosConfig::default(),
            supervisor,
            dlq_sweep: DlqSweepConfig::default(),
        }
    }

    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }
}
