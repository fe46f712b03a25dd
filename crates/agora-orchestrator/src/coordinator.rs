use crate::allocator::{AllocationOutcome, Allocator};
use crate::config::OrchestratorConfig;
use crate::events::{TaskEventSink, TracingSink, TransitionPublisher};
use crate::protocol::{send_revoke, AgentChannel};
use crate::reflection::{MetaReflector, OutcomeTracker, ReflectionReport};
use crate::registry::AgentRegistry;
use crate::task_queue::{QueueStats, SharedQueue, TaskQueue};
use crate::types::{
    AgentRecord, AgentStatus, AllocationWeights, FailureReason, GoalRequest, Task, TaskStatus,
};
use agora_core::{AgentId, AgoraError, AgoraResult, GoalId, TaskId};
use agora_governance::{AuditLog, DecisionSubject, PolicyGate, PolicyStage};
use chrono::{DateTime, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An agent's report on a task it was executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    /// `false` means the agent failed to execute the task.
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Realized values of the policy dimensions.
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// What happened to a reported result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum ResultDisposition {
    Accepted { decision_id: Uuid },
    /// Execution failure, sent back to the queue.
    Requeued { retry_count: u32 },
    /// Post-result halt; needs `resolve_review` before anything else happens.
    HeldForReview { decision_id: Uuid },
    /// The retry ceiling was reached; the task is Failed for good.
    Exhausted { retries: u32 },
}

/// An external reviewer's verdict on a task held after a post-result halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Retry,
    Reject,
}

/// What a review did to the held task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReviewOutcome {
    /// Back to Pending with the incremented retry count.
    Requeued { retry_count: u32 },
    /// Retry approved, but the ceiling was already reached; the task is Failed.
    Exhausted { retries: u32 },
    /// The task stays Failed and is closed.
    Rejected,
}

/// A failure surfaced to the goal submitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub task_id: TaskId,
    pub reason: FailureReason,
    /// True while `resolve_review` can still retry the task.
    pub review_required: bool,
}

/// Read-only view of one submitted goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSummary {
    pub goal_id: GoalId,
    pub description: String,
    pub submitted_at: DateTime<Utc>,
    /// Tasks of the goal in enqueue order.
    pub tasks: Vec<Task>,
    /// Failed tasks, excluding reviewer rejections.
    pub escalations: Vec<Escalation>,
    /// Every task is terminal and none waits for review.
    pub is_complete: bool,
}

#[derive(Debug, Clone)]
struct GoalRecord {
    description: String,
    submitted_at: DateTime<Utc>,
}

/// Counts of one allocation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started: usize,
    pub assigned: usize,
    pub requeued: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    pub stale: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &AllocationOutcome) {
        match outcome {
            AllocationOutcome::Assigned { .. } => self.assigned += 1,
            AllocationOutcome::Requeued { .. } => self.requeued += 1,
            AllocationOutcome::Exhausted { .. } => self.exhausted += 1,
            AllocationOutcome::Cancelled => self.cancelled += 1,
            AllocationOutcome::Stale => self.stale += 1,
        }
    }
}

/// Result of one liveness sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivenessReport {
    /// Agents marked Unreachable by this sweep.
    pub unreachable: Vec<AgentId>,
    /// Their tasks that went back to Pending.
    pub requeued: Vec<TaskId>,
    /// Their tasks that hit the retry ceiling instead.
    pub exhausted: Vec<TaskId>,
}

/// Coordinator-wide snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Registered agents ordered by id.
    pub agents: Vec<AgentRecord>,
    pub queue: QueueStats,
    /// Allocation weights currently in force.
    pub weights: AllocationWeights,
    pub policy_threshold: f64,
    /// Policy decisions recorded so far, halts included.
    pub decisions: usize,
    pub halts: usize,
    /// Goals submitted since startup.
    pub goals: usize,
    pub last_reflection: Option<ReflectionReport>,
}

/// The orchestration coordinator.
///
/// Owns the task queue, the agent registry and the allocation weights.
/// Goals come in through [`submit_goal`](Self::submit_goal); the allocation
/// cycle, liveness sweep and meta-reflection run either on demand or from
/// the background loops started by [`spawn`](Self::spawn).
pub struct Coordinator {
    config: OrchestratorConfig,
    queue: SharedQueue,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyGate>,
    audit: Arc<AuditLog>,
    weights: Arc<parking_lot::RwLock<AllocationWeights>>,
    tracker: Arc<OutcomeTracker>,
    reflector: MetaReflector,
    publisher: Arc<TransitionPublisher>,
    allocator: Arc<Allocator>,
    goals: parking_lot::RwLock<HashMap<GoalId, GoalRecord>>,
    last_reflection: parking_lot::RwLock<Option<ReflectionReport>>,
}

impl Coordinator {
    /// Build a coordinator. Decisions are recorded in the gate's audit log.
    pub fn new(config: OrchestratorConfig, policy: Arc<PolicyGate>) -> AgoraResult<Self> {
        config.validate()?;
        let audit = Arc::clone(policy.audit());
        let queue: SharedQueue = Arc::new(RwLock::new(TaskQueue::new(
            config.allocation.retry_ceiling,
        )));
        let registry = Arc::new(AgentRegistry::new(config.liveness.clone()));
        let weights = Arc::new(parking_lot::RwLock::new(config.weights));
        let tracker = Arc::new(OutcomeTracker::new(config.reflection.window));
        let publisher = Arc::new(TransitionPublisher::new(queue.clone(), audit.clone()));
        publisher.chain().add(Arc::new(TracingSink));

        let allocator = Arc::new(Allocator::new(
            queue.clone(),
            registry.clone(),
            policy.clone(),
            weights.clone(),
            tracker.clone(),
            publisher.clone(),
            config.allocation.solicitation_deadline(),
        ));

        Ok(Self {
            reflector: MetaReflector::new(config.reflection.clone()),
            config,
            queue,
            registry,
            policy,
            audit,
            weights,
            tracker,
            publisher,
            allocator,
            goals: parking_lot::RwLock::new(HashMap::new()),
            last_reflection: parking_lot::RwLock::new(None),
        })
    }

    /// Receive task transitions and escalations.
    pub fn add_sink(&self, sink: Arc<dyn TaskEventSink>) {
        self.publisher.chain().add(sink);
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &Arc<PolicyGate> {
        &self.policy
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub async fn register_agent(
        &self,
        id: AgentId,
        capabilities: BTreeSet<String>,
        channel: Arc<dyn AgentChannel>,
    ) -> bool {
        self.registry.register(id, capabilities, channel).await
    }

    /// Remove an agent and requeue whatever it was holding.
    pub async fn deregister_agent(&self, id: &AgentId) -> AgoraResult<Vec<TaskId>> {
        let channel = self.registry.channel(id).await;
        self.registry
            .deregister(id)
            .await
            .ok_or_else(|| AgoraError::AgentNotFound(id.clone()))?;
        let (requeued, _) = self
            .requeue_held_by(
                id,
                channel,
                FailureReason::AgentFailure {
                    message: "agent deregistered".to_string(),
                },
            )
            .await;
        self.publisher.flush().await;
        Ok(requeued)
    }

    /// Enqueue the tasks of an already-decomposed goal.
    pub async fn submit_goal(&self, goal: GoalRequest) -> AgoraResult<GoalId> {
        if goal.tasks.is_empty() {
            return Err(AgoraError::InvalidGoal("goal has no tasks".to_string()));
        }
        if goal.tasks.iter().any(|t| t.description.trim().is_empty()) {
            return Err(AgoraError::InvalidGoal(
                "every task needs a description".to_string(),
            ));
        }

        let goal_id = Uuid::new_v4();
        let task_count = goal.tasks.len();
        {
            let mut queue = self.queue.write().await;
            for spec in goal.tasks {
                queue.enqueue(Task::from_spec(goal_id, spec))?;
            }
        }
        self.goals.write().insert(
            goal_id,
            GoalRecord {
                description: goal.description.clone(),
                submitted_at: Utc::now(),
            },
        );
        info!(
            goal_id = %goal_id,
            goal = %goal.description,
            task_count,
            "Coordinator: goal accepted"
        );
        Ok(goal_id)
    }

    pub async fn task_status(&self, task_id: TaskId) -> AgoraResult<Task> {
        self.queue
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or(AgoraError::TaskNotFound(task_id))
    }

    pub async fn goal_status(&self, goal_id: GoalId) -> AgoraResult<GoalSummary> {
        let record = self
            .goals
            .read()
            .get(&goal_id)
            .cloned()
            .ok_or(AgoraError::GoalNotFound(goal_id))?;
        let tasks: Vec<Task> = self
            .queue
            .read()
            .await
            .tasks_for_goal(goal_id)
            .into_iter()
            .cloned()
            .collect();

        let escalations = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .filter_map(|t| {
                let reason = t.failure.clone()?;
                (reason != FailureReason::ReviewRejected).then(|| Escalation {
                    task_id: t.id,
                    reason,
                    review_required: t.review_pending,
                })
            })
            .collect();
        let is_complete = tasks
            .iter()
            .all(|t| t.status.is_terminal() && !t.review_pending);

        Ok(GoalSummary {
            goal_id,
            description: record.description,
            submitted_at: record.submitted_at,
            tasks,
            escalations,
            is_complete,
        })
    }

    pub async fn heartbeat(&self, agent_id: &AgentId, load: f64) -> AgoraResult<AgentStatus> {
        self.registry.heartbeat(agent_id, load).await
    }

    /// Handle an agent's report. Successful results pass the post-result gate
    /// before the task completes.
    pub async fn report_result(&self, report: ResultReport) -> AgoraResult<ResultDisposition> {
        let task_id = report.task_id;
        let agent_id = report.agent_id.clone();

        let disposition = {
            let mut queue = self.queue.write().await;
            let task = queue.get(task_id).ok_or(AgoraError::TaskNotFound(task_id))?;
            if !task.status.is_held() || task.assigned_to.as_ref() != Some(&agent_id) {
                return Err(AgoraError::NotAssigned { task_id, agent_id });
            }
            let retry_count = task.retry_count;

            if !report.success {
                let message = report
                    .message
                    .clone()
                    .unwrap_or_else(|| "execution failed".to_string());
                match queue.requeue(task_id, Some(FailureReason::AgentFailure { message })) {
                    Ok(retry_count) => ResultDisposition::Requeued { retry_count },
                    Err(AgoraError::RetryExhausted { retries, .. }) => {
                        ResultDisposition::Exhausted { retries }
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let decision = self.policy.evaluate_declared(
                    DecisionSubject::result(task_id, agent_id.clone()),
                    PolicyStage::PostResult,
                    &report.dimensions,
                );
                if decision.is_proceed() {
                    queue.complete(task_id, report.payload.clone())?;
                    ResultDisposition::Accepted {
                        decision_id: decision.id,
                    }
                } else if retry_count >= queue.retry_ceiling() {
                    queue.fail(
                        task_id,
                        FailureReason::RetryExhausted {
                            retries: retry_count,
                        },
                    )?;
                    ResultDisposition::Exhausted {
                        retries: retry_count,
                    }
                } else {
                    queue.hold_for_review(
                        task_id,
                        FailureReason::PolicyHalt {
                            decision_id: decision.id,
                            score: decision.score,
                            threshold: decision.threshold,
                        },
                    )?;
                    ResultDisposition::HeldForReview {
                        decision_id: decision.id,
                    }
                }
            }
        };

        let success = matches!(disposition, ResultDisposition::Accepted { .. });
        self.tracker.record_outcome(task_id, success);
        self.registry.record_outcome(&agent_id, success).await;
        info!(
            task_id = %task_id,
            agent_id = %agent_id,
            disposition = ?disposition,
            "Coordinator: result processed"
        );
        self.publisher.flush().await;
        Ok(disposition)
    }

    /// Cancel a task. Returns `false` if it was already terminal.
    ///
    /// A task held by an agent gets a best-effort `Revoke`.
    pub async fn cancel_task(&self, task_id: TaskId) -> AgoraResult<bool> {
        let (cancelled, holder) = {
            let mut queue = self.queue.write().await;
            let task = queue.get(task_id).ok_or(AgoraError::TaskNotFound(task_id))?;
            let holder = task
                .status
                .is_held()
                .then(|| task.assigned_to.clone())
                .flatten();
            (queue.cancel(task_id)?, holder)
        };
        if !cancelled {
            return Ok(false);
        }
        self.tracker.forget(task_id);
        info!(task_id = %task_id, "Coordinator: task cancelled");

        if let Some(agent_id) = holder {
            if let Some(channel) = self.registry.channel(&agent_id).await {
                send_revoke(
                    channel.as_ref(),
                    &agent_id,
                    task_id,
                    "cancelled",
                    self.config.allocation.solicitation_deadline(),
                )
                .await;
            }
        }
        self.publisher.flush().await;
        Ok(true)
    }

    /// Apply an external review to a task held after a post-result halt.
    pub async fn resolve_review(
        &self,
        task_id: TaskId,
        decision: ReviewDecision,
    ) -> AgoraResult<ReviewOutcome> {
        let result = {
            let mut queue = self.queue.write().await;
            match decision {
                ReviewDecision::Retry => match queue.requeue_after_review(task_id) {
                    Ok(retry_count) => Ok(ReviewOutcome::Requeued { retry_count }),
                    Err(AgoraError::RetryExhausted { retries, .. }) => {
                        Ok(ReviewOutcome::Exhausted { retries })
                    }
                    Err(e) => Err(e),
                },
                ReviewDecision::Reject => queue.reject_review(task_id).map(|()| ReviewOutcome::Rejected),
            }
        };
        if let Ok(outcome) = &result {
            info!(task_id = %task_id, decision = ?decision, outcome = ?outcome, "Coordinator: review resolved");
        }
        self.publisher.flush().await;
        result
    }

    /// Allocate up to `max_concurrent_allocations` Pending tasks concurrently.
    pub async fn run_allocation_cycle(&self) -> CycleReport {
        let batch: Vec<Task> = {
            let mut queue = self.queue.write().await;
            let mut batch = Vec::new();
            while batch.len() < self.config.allocation.max_concurrent_allocations {
                match queue.next_for_soliciting() {
                    Ok(task) => batch.push(task),
                    Err(_) => break,
                }
            }
            batch
        };

        let mut report = CycleReport {
            started: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        let mut runs = JoinSet::new();
        for task in batch {
            let allocator = Arc::clone(&self.allocator);
            runs.spawn(async move { allocator.run(task).await });
        }
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(outcome) => report.record(&outcome),
                Err(e) => warn!(error = %e, "allocation run panicked or was aborted"),
            }
        }
        debug!(report = ?report, "Coordinator: allocation cycle finished");
        report
    }

    pub async fn sweep_liveness(&self) -> LivenessReport {
        self.sweep_liveness_at(Utc::now()).await
    }

    /// Mark silent agents Unreachable and requeue their tasks.
    pub async fn sweep_liveness_at(&self, now: DateTime<Utc>) -> LivenessReport {
        let mut report = LivenessReport {
            unreachable: self.registry.sweep(now).await,
            ..LivenessReport::default()
        };
        for agent_id in &report.unreachable {
            let channel = self.registry.channel(agent_id).await;
            let (requeued, exhausted) = self
                .requeue_held_by(
                    agent_id,
                    channel,
                    FailureReason::AgentUnreachable {
                        agent_id: agent_id.clone(),
                    },
                )
                .await;
            report.requeued.extend(requeued);
            report.exhausted.extend(exhausted);
        }
        if !report.unreachable.is_empty() {
            self.publisher.flush().await;
        }
        report
    }

    /// Take every task away from `agent_id`, then revoke them on `channel`.
    async fn requeue_held_by(
        &self,
        agent_id: &AgentId,
        channel: Option<Arc<dyn AgentChannel>>,
        reason: FailureReason,
    ) -> (Vec<TaskId>, Vec<TaskId>) {
        let mut requeued = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut queue = self.queue.write().await;
            for task_id in queue.tasks_assigned_to(agent_id) {
                self.tracker.record_outcome(task_id, false);
                match queue.requeue(task_id, Some(reason.clone())) {
                    Ok(retry_count) => {
                        info!(task_id = %task_id, agent_id = %agent_id, retry_count, "Coordinator: task requeued from lost agent");
                        requeued.push(task_id);
                    }
                    Err(AgoraError::RetryExhausted { .. }) => exhausted.push(task_id),
                    Err(e) => warn!(task_id = %task_id, error = %e, "requeue from lost agent failed"),
                }
            }
        }

        if let Some(channel) = channel {
            let deadline = self.config.allocation.solicitation_deadline();
            let revokes: FuturesUnordered<_> = requeued
                .iter()
                .chain(exhausted.iter())
                .map(|task_id| {
                    send_revoke(channel.as_ref(), agent_id, *task_id, reason.label(), deadline)
                })
                .collect();
            let delivered = revokes
                .fold(0usize, |n, ok| async move { n + usize::from(ok) })
                .await;
            debug!(agent_id = %agent_id, delivered, "Coordinator: revokes sent to lost agent");
        }
        (requeued, exhausted)
    }

    pub fn weights(&self) -> AllocationWeights {
        *self.weights.read()
    }

    /// Recompute allocation weights from recent outcomes.
    pub async fn reflect(&self) -> ReflectionReport {
        let samples = self.tracker.samples();
        let adjustment = {
            let mut weights = self.weights.write();
            let adjustment = self.reflector.adjust(*weights, &samples);
            *weights = adjustment.after;
            adjustment
        };
        if adjustment.adjusted {
            info!(
                before = ?adjustment.before,
                after = ?adjustment.after,
                best_predictor = ?adjustment.best_predictor,
                "Coordinator: allocation weights adjusted"
            );
        }

        let agents = self.registry.snapshot().await;
        let stats = self.queue.read().await.stats();
        let report = ReflectionReport::build(adjustment, &samples, &agents, &stats);
        for bottleneck in &report.bottlenecks {
            warn!(bottleneck = %bottleneck, "Coordinator: bottleneck detected");
        }
        *self.last_reflection.write() = Some(report.clone());
        report
    }

    /// Apply operator-supplied weights and/or gate threshold at runtime.
    pub fn apply_reload(
        &self,
        weights: Option<AllocationWeights>,
        threshold: Option<f64>,
    ) -> AgoraResult<()> {
        if let Some(w) = weights {
            w.validate()?;
        }
        if let Some(t) = threshold {
            self.policy.set_threshold(t)?;
        }
        if let Some(w) = weights {
            *self.weights.write() = w;
            info!(weights = ?w, "Coordinator: allocation weights reloaded");
        }
        Ok(())
    }

    pub async fn export_audit(&self, path: &Path) -> AgoraResult<usize> {
        self.audit.export_jsonl(path).await
    }

    pub async fn system_status(&self) -> SystemStatus {
        let agents = self.registry.snapshot().await;
        let queue = self.queue.read().await.stats();
        SystemStatus {
            agents,
            queue,
            weights: self.weights(),
            policy_threshold: self.policy.threshold(),
            decisions: self.audit.decision_count(),
            halts: self.audit.halt_count(),
            goals: self.goals.read().len(),
            last_reflection: self.last_reflection.read().clone(),
        }
    }

    /// Start the allocation, liveness and reflection loops.
    pub fn spawn(self: Arc<Self>) -> CoordinatorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let coordinator = Arc::clone(&self);
        tasks.push(spawn_loop(
            self.config.allocation.poll_interval(),
            shutdown_rx.clone(),
            move || {
                let c = Arc::clone(&coordinator);
                async move {
                    c.run_allocation_cycle().await;
                }
            },
        ));

        let coordinator = Arc::clone(&self);
        tasks.push(spawn_loop(
            self.config.liveness.sweep_interval(),
            shutdown_rx.clone(),
            move || {
                let c = Arc::clone(&coordinator);
                async move {
                    c.sweep_liveness().await;
                }
            },
        ));

        if self.config.reflection.enabled {
            let coordinator = Arc::clone(&self);
            tasks.push(spawn_loop(
                self.config.reflection.interval(),
                shutdown_rx,
                move || {
                    let c = Arc::clone(&coordinator);
                    async move {
                        c.reflect().await;
                    }
                },
            ));
        }

        info!(loops = tasks.len(), "Coordinator: background loops started");
        CoordinatorHandle {
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

fn spawn_loop<F, Fut>(
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Handle to the background loops of a running coordinator.
pub struct CoordinatorHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Signal every loop to stop and wait for them.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator loop ended abnormally");
            }
        }
        info!("Coordinator: background loops stopped");
    }
}
