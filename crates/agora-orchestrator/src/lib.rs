//! Task orchestration: queue, bid/consensus allocation and coordination.
//!
//! Goals arrive already decomposed into tasks. Each task is offered to the
//! capable, available agents; their proposals are scored, the winner passes
//! the pre-dispatch policy gate and is assigned exactly once. Reported results
//! pass the post-result gate before the task completes. Meta-reflection
//! retunes the allocation weights from observed outcomes within fixed bounds.
//!
//! # Main types
//!
//! - [`Coordinator`]: Entry point: goals, results, heartbeats, reviews and background loops.
//! - [`TaskQueue`]: Priority-ordered system of record for task lifecycle.
//! - [`Allocator`]: Per-task solicit / evaluate / commit protocol.
//! - [`AgentRegistry`]: Agent capabilities, load and liveness.
//! - [`MetaReflector`]: Bounded adjustment of [`AllocationWeights`].
//! - [`AgentChannel`]: Transport to an external agent.

/// Per-task bid/consensus protocol.
pub mod allocator;
/// Startup configuration.
pub mod config;
/// Coordinator and its background loops.
pub mod coordinator;
/// Proposal scoring.
pub mod evaluator;
/// Task-state update sinks.
pub mod events;
/// Coordinator/agent message protocol.
pub mod protocol;
/// Outcome tracking and weight adjustment.
pub mod reflection;
/// Agent registry and liveness.
pub mod registry;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, AgentRecord, Proposal, etc.).
pub mod types;

pub use allocator::{AllocationOutcome, AllocationPhase, Allocator, RequeueReason};
pub use config::{AllocationConfig, LivenessConfig, OrchestratorConfig, ReflectionConfig};
pub use coordinator::{
    Coordinator, CoordinatorHandle, CycleReport, Escalation, GoalSummary, LivenessReport,
    ResultDisposition, ResultReport, ReviewDecision, ReviewOutcome, SystemStatus,
};
pub use evaluator::{score, select_winner, ScoreBreakdown, ScoredProposal};
pub use events::{
    EventChain, MemorySink, TaskEvent, TaskEventSink, TracingSink, TransitionPublisher,
};
pub use protocol::{send_revoke, AgentChannel, AgentReply, CoordinatorMessage, ProposalBid};
pub use reflection::{
    Adjustment, MetaReflector, OutcomeSample, OutcomeTracker, ReflectionReport, SystemMetrics,
    WeightDimension,
};
pub use registry::{AgentRegistry, EligibleAgent};
pub use task_queue::{QueueStats, SharedQueue, TaskQueue};
pub use types::{
    AgentRecord, AgentStatus, AllocationWeights, FailureReason, GoalRequest, Proposal, Task,
    TaskSpec, TaskStatus, TaskTransition,
};
