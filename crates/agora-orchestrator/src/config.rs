use crate::types::AllocationWeights;
use agora_core::{AgoraError, AgoraResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Startup configuration for the coordinator.
///
/// Only `weights` (and the policy threshold, which lives with the gate) may
/// change at runtime; everything else is read once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub weights: AllocationWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    /// Solicitation deadline `D`: how long proposals are collected.
    #[serde(default = "default_deadline_ms")]
    pub solicitation_deadline_ms: u64,
    /// Maximum number of requeues before a task fails permanently.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Period of the background allocation cycle.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_allocations: usize,
}

fn default_deadline_ms() -> u64 {
    2_000
}
fn default_retry_ceiling() -> u32 {
    3
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_concurrent() -> usize {
    16
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            solicitation_deadline_ms: default_deadline_ms(),
            retry_ceiling: default_retry_ceiling(),
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_allocations: default_max_concurrent(),
        }
    }
}

impl AllocationConfig {
    pub fn solicitation_deadline(&self) -> Duration {
        Duration::from_millis(self.solicitation_deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Expected period between agent heartbeats.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Consecutive missed heartbeats before an agent is Unreachable.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    /// Declared load at or above which an agent is Busy.
    #[serde(default = "default_busy_threshold")]
    pub busy_load_threshold: f64,
    /// Period of the background liveness sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_busy_threshold() -> f64 {
    0.8
}
fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            missed_heartbeats: default_missed_heartbeats(),
            busy_load_threshold: default_busy_threshold(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl LivenessConfig {
    /// Silence longer than this marks an agent Unreachable.
    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        let ms = self
            .heartbeat_interval_ms
            .saturating_mul(u64::from(self.missed_heartbeats));
        chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reflection_interval_ms")]
    pub interval_ms: u64,
    /// Size of the rolling window of (score, outcome) samples.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Samples required before weights are touched.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Largest change applied to any weight in one reflection.
    #[serde(default = "default_max_step")]
    pub max_step: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
}

fn default_true() -> bool {
    true
}
fn default_reflection_interval_ms() -> u64 {
    60_000
}
fn default_window() -> usize {
    100
}
fn default_min_samples() -> usize {
    10
}
fn default_learning_rate() -> f64 {
    0.05
}
fn default_max_step() -> f64 {
    0.05
}
fn default_min_weight() -> f64 {
    0.05
}
fn default_max_weight() -> f64 {
    0.9
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_reflection_interval_ms(),
            window: default_window(),
            min_samples: default_min_samples(),
            learning_rate: default_learning_rate(),
            max_step: default_max_step(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
        }
    }
}

impl ReflectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl OrchestratorConfig {
    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> AgoraResult<()> {
        let a = &self.allocation;
        if a.solicitation_deadline_ms == 0 {
            return Err(AgoraError::Config(
                "allocation.solicitation_deadline_ms must be > 0".to_string(),
            ));
        }
        if a.poll_interval_ms == 0 || a.max_concurrent_allocations == 0 {
            return Err(AgoraError::Config(
                "allocation.poll_interval_ms and max_concurrent_allocations must be > 0"
                    .to_string(),
            ));
        }

        let l = &self.liveness;
        if l.heartbeat_interval_ms == 0 || l.missed_heartbeats == 0 || l.sweep_interval_ms == 0 {
            return Err(AgoraError::Config(
                "liveness intervals and missed_heartbeats must be > 0".to_string(),
            ));
        }
        if !(l.busy_load_threshold > 0.0 && l.busy_load_threshold <= 1.0) {
            return Err(AgoraError::Config(format!(
                "liveness.busy_load_threshold must be in (0, 1], got {}",
                l.busy_load_threshold
            )));
        }

        let r = &self.reflection;
        if r.interval_ms == 0 || r.window == 0 {
            return Err(AgoraError::Config(
                "reflection.interval_ms and reflection.window must be > 0".to_string(),
            ));
        }
        let bounds_ok = r.min_weight.is_finite()
            && r.max_weight.is_finite()
            && r.min_weight >= 0.0
            && r.min_weight <= r.max_weight;
        if !bounds_ok {
            return Err(AgoraError::Config(format!(
                "reflection weight bounds invalid: [{}, {}]",
                r.min_weight, r.max_weight
            )));
        }
        if !(r.learning_rate.is_finite() && r.learning_rate >= 0.0)
            || !(r.max_step.is_finite() && r.max_step >= 0.0)
        {
            return Err(AgoraError::Config(
                "reflection.learning_rate and reflection.max_step must be finite and >= 0"
                    .to_string(),
            ));
        }

        self.weights.validate()
    }
}
