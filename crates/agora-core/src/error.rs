use crate::AgentId;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`AgoraError`].
pub type AgoraResult<T> = Result<T, AgoraError>;

/// Top-level error type for the orchestration core.
///
/// Several variants describe expected outcomes rather than faults:
/// [`AgoraError::Empty`], [`AgoraError::StaleSolicitation`] and
/// [`AgoraError::PolicyHalt`] are routine results of the allocation protocol
/// and are handled by the caller, never propagated as crashes.
#[derive(Error, Debug)]
pub enum AgoraError {
    /// A task with the same identity is already in the queue.
    #[error("Duplicate task: {0}")]
    DuplicateTask(Uuid),

    /// The task left the Soliciting state before a winner could be committed.
    #[error("Stale solicitation for task {0}")]
    StaleSolicitation(Uuid),

    /// No Pending task is available for solicitation.
    #[error("Task queue is empty")]
    Empty,

    /// The task exceeded its retry ceiling and is permanently Failed.
    #[error("Retries exhausted for task {task_id} after {retries} attempts")]
    RetryExhausted {
        /// Task that was moved to Failed.
        task_id: Uuid,
        /// Retry count at the moment the ceiling was hit.
        retries: u32,
    },

    /// A policy gate evaluation halted the decision.
    #[error("Policy halt on {subject}: score {score:.3} below threshold {threshold:.3}")]
    PolicyHalt {
        /// Identity of the gated decision (task or result).
        subject: String,
        /// Weighted score that was computed.
        score: f64,
        /// Threshold in force at evaluation time.
        threshold: f64,
    },

    /// The agent stopped sending heartbeats or could not be reached.
    #[error("Agent unreachable: {0}")]
    AgentUnreachable(AgentId),

    /// No task with the given identity exists.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// No goal with the given identity exists.
    #[error("Goal not found: {0}")]
    GoalNotFound(Uuid),

    /// No agent with the given identity is registered.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// Task whose transition was rejected.
        task_id: Uuid,
        /// Status the task was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// A report or acknowledgement came from an agent that does not hold the task.
    #[error("Task {task_id} is not assigned to agent {agent_id}")]
    NotAssigned {
        /// Task the report referred to.
        task_id: Uuid,
        /// Agent that sent the report.
        agent_id: AgentId,
    },

    /// The submitted goal could not be turned into tasks.
    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    /// An agent channel failed or replied with an unexpected message.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgoraError {
    /// Whether this error is an expected protocol outcome rather than a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            AgoraError::Empty | AgoraError::StaleSolicitation(_) | AgoraError::PolicyHalt { .. }
        )
    }
}
