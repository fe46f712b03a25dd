use crate::evaluator::{select_winner, ScoreBreakdown};
use crate::events::TransitionPublisher;
use crate::protocol::{send_revoke, AgentReply, CoordinatorMessage};
use crate::reflection::OutcomeTracker;
use crate::registry::AgentRegistry;
use crate::task_queue::SharedQueue;
use crate::types::{AllocationWeights, FailureReason, Proposal, Task, TaskStatus};
use agora_core::{AgentId, AgoraError, AgoraResult, TaskId};
use agora_governance::{DecisionSubject, PolicyGate, PolicyStage};
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Protocol phase of one allocator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPhase {
    Idle,
    Soliciting,
    Evaluating,
    Committing,
    Done,
    Requeued,
}

impl std::fmt::Display for AllocationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AllocationPhase::Idle => "idle",
            AllocationPhase::Soliciting => "soliciting",
            AllocationPhase::Evaluating => "evaluating",
            AllocationPhase::Committing => "committing",
            AllocationPhase::Done => "done",
            AllocationPhase::Requeued => "requeued",
        };
        f.write_str(s)
    }
}

/// Why a run sent its task back to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequeueReason {
    NoEligibleAgents,
    NoProposals,
    AllExcluded,
    PolicyHalt { decision_id: Uuid },
    /// The winner did not acknowledge the assignment in time.
    DispatchFailed,
}

/// How one allocator run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AllocationOutcome {
    Assigned {
        agent_id: AgentId,
        score: f64,
        decision_id: Uuid,
    },
    Requeued {
        reason: RequeueReason,
        retry_count: u32,
    },
    /// The requeue hit the retry ceiling; the task is Failed.
    Exhausted { reason: RequeueReason, retries: u32 },
    Cancelled,
    /// Another transition won the race for this task.
    Stale,
}

impl AllocationOutcome {
    /// Terminal phase of the run that produced this outcome.
    pub fn phase(&self) -> AllocationPhase {
        match self {
            AllocationOutcome::Requeued { .. } => AllocationPhase::Requeued,
            _ => AllocationPhase::Done,
        }
    }
}

/// Runs the bid/consensus protocol for one task at a time.
///
/// Runs for different tasks may execute concurrently; the queue's
/// compare-and-transition API guarantees a task is assigned at most once.
pub struct Allocator {
    queue: SharedQueue,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyGate>,
    weights: Arc<parking_lot::RwLock<AllocationWeights>>,
    tracker: Arc<OutcomeTracker>,
    publisher: Arc<TransitionPublisher>,
    deadline: Duration,
}

impl Allocator {
    pub fn new(
        queue: SharedQueue,
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyGate>,
        weights: Arc<parking_lot::RwLock<AllocationWeights>>,
        tracker: Arc<OutcomeTracker>,
        publisher: Arc<TransitionPublisher>,
        deadline: Duration,
    ) -> Self {
        Self {
            queue,
            registry,
            policy,
            weights,
            tracker,
            publisher,
            deadline,
        }
    }

    /// Take the most urgent Pending task and allocate it.
    ///
    /// Returns `Empty` when nothing is pending.
    pub async fn allocate_next(&self) -> AgoraResult<(TaskId, AllocationOutcome)> {
        let task = self.queue.write().await.next_for_soliciting()?;
        let id = task.id;
        Ok((id, self.run(task).await))
    }

    /// Drive one task, already moved to Soliciting, through the protocol.
    pub async fn run(&self, task: Task) -> AllocationOutcome {
        let outcome = self.run_phases(&task).await;
        debug!(
            task_id = %task.id,
            phase = %outcome.phase(),
            outcome = ?outcome,
            "allocation finished"
        );
        self.publisher.flush().await;
        outcome
    }

    async fn run_phases(&self, task: &Task) -> AllocationOutcome {
        debug!(task_id = %task.id, phase = %AllocationPhase::Idle, "allocation started");

        let eligible = self.registry.eligible(&task.required_capabilities).await;
        if eligible.is_empty() {
            debug!(task_id = %task.id, "no eligible agents");
            return self.requeue(task.id, RequeueReason::NoEligibleAgents, None).await;
        }

        debug!(
            task_id = %task.id,
            phase = %AllocationPhase::Soliciting,
            agents = eligible.len(),
            "soliciting proposals"
        );
        let proposals = self.solicit(task, &eligible).await;

        if let Some(outcome) = self.interrupted(task.id).await {
            return outcome;
        }
        if proposals.is_empty() {
            return self.requeue(task.id, RequeueReason::NoProposals, None).await;
        }

        debug!(
            task_id = %task.id,
            phase = %AllocationPhase::Evaluating,
            proposals = proposals.len(),
            "evaluating proposals"
        );
        let mut records = Vec::with_capacity(proposals.len());
        for p in &proposals {
            records.push(self.registry.get(&p.agent_id).await);
        }
        let weights = *self.weights.read();
        let winner = select_winner(
            &task.required_capabilities,
            proposals.iter().zip(records.iter().map(Option::as_ref)),
            &weights,
        );
        let Some(winner) = winner else {
            return self.requeue(task.id, RequeueReason::AllExcluded, None).await;
        };

        if let Some(outcome) = self.interrupted(task.id).await {
            return outcome;
        }

        debug!(
            task_id = %task.id,
            phase = %AllocationPhase::Committing,
            agent_id = %winner.proposal.agent_id,
            score = winner.breakdown.total,
            "committing winner"
        );
        self.commit(task, &winner.proposal, winner.breakdown).await
    }

    /// Fan out solicitations and collect proposals until all replied or the
    /// deadline passed. Errors, declines and late replies are dropped.
    async fn solicit(
        &self,
        task: &Task,
        eligible: &[crate::registry::EligibleAgent],
    ) -> Vec<Proposal> {
        let deadline = Instant::now() + self.deadline;
        let deadline_at = Utc::now()
            + chrono::Duration::from_std(self.deadline).unwrap_or(chrono::Duration::zero());

        let mut pending: FuturesUnordered<_> = eligible
            .iter()
            .map(|agent| {
                let message = CoordinatorMessage::SolicitProposal {
                    task_id: task.id,
                    goal_id: task.goal_id,
                    description: task.description.clone(),
                    required_capabilities: task.required_capabilities.clone(),
                    priority: task.priority,
                    deadline: deadline_at,
                };
                let channel = Arc::clone(&agent.channel);
                let agent_id = agent.record.id.clone();
                async move {
                    let reply = channel.send(message).await;
                    (agent_id, reply, Utc::now())
                }
            })
            .collect();

        let mut proposals = Vec::new();
        let mut sequence = 0u64;
        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((agent_id, Ok(AgentReply::Proposal(bid)), submitted_at))) => {
                    proposals.push(Proposal {
                        task_id: task.id,
                        agent_id,
                        confidence: bid.confidence,
                        estimated_cost: bid.estimated_cost,
                        declared_dimensions: bid.declared_dimensions,
                        submitted_at,
                        sequence,
                    });
                    sequence += 1;
                }
                Ok(Some((agent_id, Ok(other), _))) => {
                    debug!(task_id = %task.id, agent_id = %agent_id, reply = ?other, "agent did not propose");
                }
                Ok(Some((agent_id, Err(e), _))) => {
                    debug!(task_id = %task.id, agent_id = %agent_id, error = %e, "solicitation failed");
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        task_id = %task.id,
                        outstanding = pending.len(),
                        "solicitation deadline elapsed"
                    );
                    break;
                }
            }
        }
        proposals
    }

    async fn commit(
        &self,
        task: &Task,
        proposal: &Proposal,
        breakdown: ScoreBreakdown,
    ) -> AllocationOutcome {
        let agent_id = proposal.agent_id.clone();
        // Observers see the task in Soliciting before any assignment exists.
        // A cancel issued from here on is caught by `try_assign`.
        self.publisher.flush().await;

        let decision = self.policy.evaluate_declared(
            DecisionSubject::assignment(task.id, agent_id.clone()),
            PolicyStage::PreDispatch,
            &proposal.declared_dimensions,
        );
        if !decision.is_proceed() {
            let reason = FailureReason::PolicyHalt {
                decision_id: decision.id,
                score: decision.score,
                threshold: decision.threshold,
            };
            return self
                .requeue(
                    task.id,
                    RequeueReason::PolicyHalt {
                        decision_id: decision.id,
                    },
                    Some(reason),
                )
                .await;
        }

        let assigned = self.queue.write().await.try_assign(task.id, &agent_id);
        if let Err(e) = assigned {
            debug!(task_id = %task.id, error = %e, "assignment lost the race");
            return self.interrupted(task.id).await.unwrap_or(AllocationOutcome::Stale);
        }
        self.tracker.record_assignment(task.id, breakdown);

        if let Err(e) = self.dispatch(task, &agent_id, decision.id).await {
            warn!(task_id = %task.id, agent_id = %agent_id, error = %e, "assignment not acknowledged");
            self.tracker.forget(task.id);
            let outcome = self
                .requeue(task.id, RequeueReason::DispatchFailed, None)
                .await;
            // The agent may have started anyway; the task is no longer its.
            if let Some(channel) = self.registry.channel(&agent_id).await {
                send_revoke(
                    channel.as_ref(),
                    &agent_id,
                    task.id,
                    "assignment not acknowledged",
                    self.deadline,
                )
                .await;
            }
            return outcome;
        }

        let executing = self.queue.write().await.mark_executing(task.id, &agent_id);
        if let Err(e) = executing {
            // Cancelled or requeued while the assignment was in flight.
            debug!(task_id = %task.id, error = %e, "task moved before acknowledgement");
            self.tracker.forget(task.id);
            return self.interrupted(task.id).await.unwrap_or(AllocationOutcome::Stale);
        }

        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            score = breakdown.total,
            "task assigned"
        );
        AllocationOutcome::Assigned {
            agent_id,
            score: breakdown.total,
            decision_id: decision.id,
        }
    }

    /// Send `Assign` and wait for the acknowledgement within the deadline.
    async fn dispatch(&self, task: &Task, agent_id: &AgentId, decision_id: Uuid) -> AgoraResult<()> {
        let channel = self
            .registry
            .channel(agent_id)
            .await
            .ok_or_else(|| AgoraError::AgentUnreachable(agent_id.clone()))?;
        let message = CoordinatorMessage::Assign {
            task_id: task.id,
            goal_id: task.goal_id,
            description: task.description.clone(),
            decision_id,
        };
        let deadline = Instant::now() + self.deadline;
        match timeout_at(deadline, channel.send(message)).await {
            Ok(Ok(AgentReply::Ack)) => Ok(()),
            Ok(Ok(other)) => Err(AgoraError::Agent(format!(
                "expected ack, got {other:?}"
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgoraError::AgentUnreachable(agent_id.clone())),
        }
    }

    /// Outcome for a task that left Soliciting behind this run's back.
    async fn interrupted(&self, task_id: TaskId) -> Option<AllocationOutcome> {
        let status = self.queue.read().await.status(task_id);
        match status {
            Some(TaskStatus::Soliciting) => None,
            Some(TaskStatus::Cancelled) => {
                info!(task_id = %task_id, "allocation stopped: task cancelled");
                Some(AllocationOutcome::Cancelled)
            }
            _ => Some(AllocationOutcome::Stale),
        }
    }

    async fn requeue(
        &self,
        task_id: TaskId,
        reason: RequeueReason,
        failure: Option<FailureReason>,
    ) -> AllocationOutcome {
        let result = self.queue.write().await.requeue(task_id, failure);
        match result {
            Ok(retry_count) => {
                debug!(
                    task_id = %task_id,
                    phase = %AllocationPhase::Requeued,
                    reason = ?reason,
                    retry_count,
                    "task requeued"
                );
                AllocationOutcome::Requeued {
                    reason,
                    retry_count,
                }
            }
            Err(AgoraError::RetryExhausted { retries, .. }) => {
                warn!(task_id = %task_id, retries, reason = ?reason, "retry ceiling reached");
                AllocationOutcome::Exhausted { reason, retries }
            }
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "requeue skipped");
                self.interrupted(task_id)
                    .await
                    .unwrap_or(AllocationOutcome::Stale)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::LivenessConfig;
    use crate::protocol::{AgentChannel, ProposalBid};
    use crate::task_queue::TaskQueue;
    use agora_governance::{AuditLog, PolicyConfig};
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use tokio::sync::RwLock;

    /// Proposes with a fixed confidence and safe dimensions, then acks.
    struct Bidder {
        confidence: f64,
        dimension_value: f64,
        ack: bool,
    }

    #[async_trait]
    impl AgentChannel for Bidder {
        async fn send(&self, message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            match message {
                CoordinatorMessage::SolicitProposal { .. } => {
                    let declared: BTreeMap<String, f64> =
                        ["harm", "fairness", "explainability", "autonomy"]
                            .iter()
                            .map(|d| (d.to_string(), self.dimension_value))
                            .collect();
                    Ok(AgentReply::Proposal(ProposalBid {
                        confidence: self.confidence,
                        estimated_cost: 1.0,
                        declared_dimensions: declared,
                    }))
                }
                CoordinatorMessage::Assign { .. } if self.ack => Ok(AgentReply::Ack),
                CoordinatorMessage::Assign { .. } => Ok(AgentReply::Decline { reason: None }),
                CoordinatorMessage::Revoke { .. } => Ok(AgentReply::Ack),
            }
        }
    }

    /// Never answers.
    struct Mute;

    #[async_trait]
    impl AgentChannel for Mute {
        async fn send(&self, _message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            futures_util::future::pending::<()>().await;
            Ok(AgentReply::Ack)
        }
    }

    struct Fixture {
        queue: SharedQueue,
        registry: Arc<AgentRegistry>,
        audit: Arc<AuditLog>,
        allocator: Allocator,
    }

    fn fixture() -> Fixture {
        let queue: SharedQueue = Arc::new(RwLock::new(TaskQueue::new(3)));
        let registry = Arc::new(AgentRegistry::new(LivenessConfig::default()));
        let audit = Arc::new(AuditLog::new());
        let policy = Arc::new(PolicyGate::new(PolicyConfig::default(), audit.clone()).unwrap());
        let publisher = Arc::new(TransitionPublisher::new(queue.clone(), audit.clone()));
        let allocator = Allocator::new(
            queue.clone(),
            registry.clone(),
            policy,
            Arc::new(parking_lot::RwLock::new(AllocationWeights::default())),
            Arc::new(OutcomeTracker::new(10)),
            publisher,
            Duration::from_millis(100),
        );
        Fixture {
            queue,
            registry,
            audit,
            allocator,
        }
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn enqueue(f: &Fixture, caps: &[&str]) -> TaskId {
        let task = Task::new(Uuid::new_v4(), "t", 1).with_capabilities(caps.iter().copied());
        f.queue.write().await.enqueue(task).unwrap()
    }

    fn bidder(confidence: f64) -> Arc<Bidder> {
        Arc::new(Bidder {
            confidence,
            dimension_value: 0.9,
            ack: true,
        })
    }

    #[tokio::test]
    async fn test_capability_filter_picks_matching_agent() {
        let f = fixture();
        f.registry
            .register(AgentId::new("agent1"), tags(&["vision", "nlp"]), bidder(0.5))
            .await;
        f.registry
            .register(AgentId::new("agent2"), tags(&["nlp"]), bidder(0.9))
            .await;
        f.registry
            .heartbeat(&AgentId::new("agent1"), 0.2)
            .await
            .unwrap();
        f.registry
            .heartbeat(&AgentId::new("agent2"), 0.1)
            .await
            .unwrap();
        let id = enqueue(&f, &["vision"]).await;

        let (ran, outcome) = f.allocator.allocate_next().await.unwrap();
        assert_eq!(ran, id);
        match outcome {
            AllocationOutcome::Assigned { agent_id, .. } => assert_eq!(agent_id.as_str(), "agent1"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        let task = f.queue.read().await.get(id).cloned().unwrap();
        assert_eq!(task.status, TaskStatus::Executing);
        assert_eq!(task.assigned_to, Some(AgentId::new("agent1")));
        assert_eq!(f.audit.decision_count(), 1);
    }

    #[tokio::test]
    async fn test_no_eligible_agents_requeues() {
        let f = fixture();
        let id = enqueue(&f, &["vision"]).await;
        let (_, outcome) = f.allocator.allocate_next().await.unwrap();
        assert_eq!(
            outcome,
            AllocationOutcome::Requeued {
                reason: RequeueReason::NoEligibleAgents,
                retry_count: 1
            }
        );
        assert_eq!(f.queue.read().await.status(id), Some(TaskStatus::Pending));
        assert_eq!(f.audit.decision_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_agents_requeue_after_deadline() {
        let f = fixture();
        f.registry
            .register(AgentId::new("mute"), BTreeSet::new(), Arc::new(Mute))
            .await;
        enqueue(&f, &[]).await;
        let (_, outcome) = f.allocator.allocate_next().await.unwrap();
        assert!(matches!(
            outcome,
            AllocationOutcome::Requeued {
                reason: RequeueReason::NoProposals,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_pre_dispatch_halt_requeues() {
        let f = fixture();
        f.registry
            .register(
                AgentId::new("risky"),
                BTreeSet::new(),
                Arc::new(Bidder {
                    confidence: 0.9,
                    dimension_value: 0.2,
                    ack: true,
                }),
            )
            .await;
        let id = enqueue(&f, &[]).await;
        let (_, outcome) = f.allocator.allocate_next().await.unwrap();
        assert!(matches!(
            outcome,
            AllocationOutcome::Requeued {
                reason: RequeueReason::PolicyHalt { .. },
                retry_count: 1
            }
        ));
        assert_eq!(f.audit.halt_count(), 1);
        let task = f.queue.read().await.get(id).cloned().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_to.is_none());
    }

    #[tokio::test]
    async fn test_missing_ack_requeues() {
        let f = fixture();
        f.registry
            .register(
                AgentId::new("flaky"),
                BTreeSet::new(),
                Arc::new(Bidder {
                    confidence: 0.9,
                    dimension_value: 0.9,
                    ack: false,
                }),
            )
            .await;
        let id = enqueue(&f, &[]).await;
        let (_, outcome) = f.allocator.allocate_next().await.unwrap();
        assert!(matches!(
            outcome,
            AllocationOutcome::Requeued {
                reason: RequeueReason::DispatchFailed,
                ..
            }
        ));
        let task = f.queue.read().await.get(id).cloned().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_to.is_none());
    }

    /// Bids safely but acknowledges assignments only after `ack_delay`.
    struct SlowAck {
        ack_delay: Duration,
        received: parking_lot::Mutex<Vec<CoordinatorMessage>>,
    }

    #[async_trait]
    impl AgentChannel for SlowAck {
        async fn send(&self, message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            self.received.lock().push(message.clone());
            match message {
                CoordinatorMessage::SolicitProposal { .. } => Ok(AgentReply::Proposal(ProposalBid {
                    confidence: 0.9,
                    estimated_cost: 1.0,
                    declared_dimensions: ["harm", "fairness", "explainability", "autonomy"]
                        .iter()
                        .map(|d| (d.to_string(), 0.9))
                        .collect(),
                })),
                CoordinatorMessage::Assign { .. } => {
                    tokio::time::sleep(self.ack_delay).await;
                    Ok(AgentReply::Ack)
                }
                CoordinatorMessage::Revoke { .. } => Ok(AgentReply::Ack),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_is_revoked() {
        let f = fixture();
        let agent = Arc::new(SlowAck {
            ack_delay: Duration::from_millis(500),
            received: parking_lot::Mutex::new(Vec::new()),
        });
        f.registry
            .register(AgentId::new("slow"), BTreeSet::new(), agent.clone())
            .await;
        let id = enqueue(&f, &[]).await;

        let (_, outcome) = f.allocator.allocate_next().await.unwrap();
        assert_eq!(
            outcome,
            AllocationOutcome::Requeued {
                reason: RequeueReason::DispatchFailed,
                retry_count: 1
            }
        );
        assert_eq!(f.queue.read().await.status(id), Some(TaskStatus::Pending));

        let received = agent.received.lock().clone();
        assert_eq!(received.len(), 3);
        assert!(matches!(received[1], CoordinatorMessage::Assign { task_id, .. } if task_id == id));
        match &received[2] {
            CoordinatorMessage::Revoke { task_id, reason } => {
                assert_eq!(*task_id, id);
                assert!(reason.contains("not acknowledged"));
            }
            other => panic!("expected revoke, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_during_solicitation() {
        let f = fixture();
        f.registry
            .register(AgentId::new("mute"), BTreeSet::new(), Arc::new(Mute))
            .await;
        let id = enqueue(&f, &[]).await;
        let task = f.queue.write().await.next_for_soliciting().unwrap();
        f.queue.write().await.cancel(id).unwrap();

        let outcome = f.allocator.run(task).await;
        assert_eq!(outcome, AllocationOutcome::Cancelled);
        assert_eq!(outcome.phase(), AllocationPhase::Done);
        assert_eq!(f.queue.read().await.status(id), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_allocate_next_on_empty_queue() {
        let f = fixture();
        assert!(matches!(
            f.allocator.allocate_next().await,
            Err(AgoraError::Empty)
        ));
    }
}
