use agora_core::{AgentId, AgoraError, AgoraResult, GoalId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

/// Number of reported outcomes kept per agent for reliability figures.
pub const OUTCOME_HISTORY: usize = 10;

/// Lifecycle status of a task. The task queue is the only writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Soliciting,
    Assigned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses in which the task holds an agent.
    pub fn is_held(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Executing)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Soliciting => write!(f, "soliciting"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task ended up Failed (or was last sent back).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The agent reported that execution failed.
    AgentFailure { message: String },
    /// The post-result policy gate halted the reported result.
    PolicyHalt {
        decision_id: Uuid,
        score: f64,
        threshold: f64,
    },
    /// The retry ceiling was reached.
    RetryExhausted { retries: u32 },
    /// The assigned agent stopped sending heartbeats.
    AgentUnreachable { agent_id: AgentId },
    /// A reviewer declined to retry after a policy halt.
    ReviewRejected,
}

impl FailureReason {
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::AgentFailure { .. } => "agent_failure",
            FailureReason::PolicyHalt { .. } => "policy_halt",
            FailureReason::RetryExhausted { .. } => "retry_exhausted",
            FailureReason::AgentUnreachable { .. } => "agent_unreachable",
            FailureReason::ReviewRejected => "review_rejected",
        }
    }
}

/// One sub-task of a structured goal, as produced by the external decomposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>, priority: i32) -> Self {
        Self {
            description: description.into(),
            priority,
            required_capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// An already-decomposed goal handed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalRequest {
    pub description: String,
    pub tasks: Vec<TaskSpec>,
}

impl GoalRequest {
    pub fn new(description: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            description: description.into(),
            tasks,
        }
    }
}

/// A task in the orchestration queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub goal_id: GoalId,
    pub description: String,
    /// Higher is more urgent.
    pub priority: i32,
    pub required_capabilities: BTreeSet<String>,
    pub status: TaskStatus,
    pub assigned_to: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Enqueue order; breaks ties between equal creation times.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    /// Set when a post-result halt is waiting for an external review.
    #[serde(default)]
    pub review_pending: bool,
    /// Result payload accepted by the post-result gate.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(goal_id: GoalId, description: impl Into<String>, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal_id,
            description: description.into(),
            priority,
            required_capabilities: BTreeSet::new(),
            status: TaskStatus::Pending,
            assigned_to: None,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            sequence: 0,
            failure: None,
            review_pending: false,
            result: None,
        }
    }

    pub fn from_spec(goal_id: GoalId, spec: TaskSpec) -> Self {
        let mut task = Self::new(goal_id, spec.description, spec.priority);
        task.required_capabilities = spec.required_capabilities;
        task
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Liveness/availability of an agent as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Busy,
    Unreachable,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// What the coordinator knows about a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    /// Declared load in `[0, 1]`.
    pub load: f64,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentStatus,
    /// Most recent reported outcomes, oldest first.
    #[serde(default)]
    pub recent_outcomes: VecDeque<bool>,
}

impl AgentRecord {
    pub fn new<I, S>(id: AgentId, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            load: 0.0,
            last_heartbeat: Utc::now(),
            status: AgentStatus::Available,
            recent_outcomes: VecDeque::new(),
        }
    }

    /// Whether the agent advertises at least one of the required tags.
    /// An empty requirement set is satisfied by every agent.
    pub fn intersects(&self, required: &BTreeSet<String>) -> bool {
        required.is_empty() || required.iter().any(|t| self.capabilities.contains(t))
    }

    pub fn record_outcome(&mut self, success: bool) {
        if self.recent_outcomes.len() == OUTCOME_HISTORY {
            self.recent_outcomes.pop_front();
        }
        self.recent_outcomes.push_back(success);
    }

    /// Success rate over the recent outcome history.
    pub fn reliability(&self) -> Option<f64> {
        if self.recent_outcomes.is_empty() {
            return None;
        }
        let ok = self.recent_outcomes.iter().filter(|o| **o).count();
        Some(ok as f64 / self.recent_outcomes.len() as f64)
    }
}

/// An agent's bid for one task. Lives only for the solicitation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub confidence: f64,
    pub estimated_cost: f64,
    /// Policy dimension values the agent declares for this assignment.
    #[serde(default)]
    pub declared_dimensions: BTreeMap<String, f64>,
    pub submitted_at: DateTime<Utc>,
    /// Arrival order within the window.
    #[serde(default)]
    pub sequence: u64,
}

/// Weights the proposal evaluator applies to each scoring component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationWeights {
    #[serde(default = "default_capability_weight")]
    pub capability: f64,
    #[serde(default = "default_load_weight")]
    pub load: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence: f64,
}

fn default_capability_weight() -> f64 {
    0.5
}
fn default_load_weight() -> f64 {
    0.3
}
fn default_confidence_weight() -> f64 {
    0.2
}

impl Default for AllocationWeights {
    fn default() -> Self {
        Self {
            capability: default_capability_weight(),
            load: default_load_weight(),
            confidence: default_confidence_weight(),
        }
    }
}

impl AllocationWeights {
    pub fn new(capability: f64, load: f64, confidence: f64) -> Self {
        Self {
            capability,
            load,
            confidence,
        }
    }

    pub fn validate(&self) -> AgoraResult<()> {
        for (name, w) in [
            ("capability", self.capability),
            ("load", self.load),
            ("confidence", self.confidence),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(AgoraError::Config(format!(
                    "allocation weight '{name}' must be finite and non-negative, got {w}"
                )));
            }
        }
        Ok(())
    }

    /// Clamp every weight into `[min, max]`.
    pub fn clamped(self, min: f64, max: f64) -> Self {
        Self {
            capability: self.capability.clamp(min, max),
            load: self.load.clamp(min, max),
            confidence: self.confidence.clamp(min, max),
        }
    }
}

/// A status change recorded by the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub goal_id: GoalId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub agent_id: Option<AgentId>,
    pub retry_count: u32,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    /// True when the task will not move again without external action.
    /// Held-for-review failures are not final.
    #[serde(default)]
    pub is_final: bool,
    pub at: DateTime<Utc>,
}
