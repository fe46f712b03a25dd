use crate::task_queue::SharedQueue;
use crate::types::{FailureReason, TaskStatus, TaskTransition};
use agora_core::{GoalId, TaskId};
use agora_governance::{AuditLog, TaskFinalized};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Task-state updates emitted to external storage or UI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    /// A task changed status.
    Transition(TaskTransition),
    /// A failure that needs the goal submitter's attention.
    Escalated {
        goal_id: GoalId,
        task_id: TaskId,
        reason: FailureReason,
        /// True when an external review can still retry the task.
        review_required: bool,
        at: DateTime<Utc>,
    },
}

/// Receiver of task events.
#[async_trait]
pub trait TaskEventSink: Send + Sync {
    async fn on_event(&self, event: &TaskEvent);
}

/// Composite sink that forwards every event to each sink in order.
pub struct EventChain {
    sinks: RwLock<Vec<Arc<dyn TaskEventSink>>>,
}

impl EventChain {
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, sink: Arc<dyn TaskEventSink>) {
        self.sinks.write().push(sink);
    }

    pub async fn emit(&self, event: TaskEvent) {
        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.on_event(&event).await;
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }
}

impl Default for EventChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Escalation implied by a transition, if any.
///
/// Failures surface to the goal submitter except a reviewer's own rejection.
fn escalation_for(t: &TaskTransition) -> Option<TaskEvent> {
    if t.to != TaskStatus::Failed {
        return None;
    }
    let reason = t.reason.clone()?;
    if reason == FailureReason::ReviewRejected {
        return None;
    }
    Some(TaskEvent::Escalated {
        goal_id: t.goal_id,
        task_id: t.task_id,
        reason,
        review_required: !t.is_final,
        at: t.at,
    })
}

/// Moves recorded queue transitions out to the audit log and the sinks.
///
/// Final transitions become `TaskFinalized` audit entries. Failures also
/// produce an escalation event.
pub struct TransitionPublisher {
    queue: SharedQueue,
    audit: Arc<AuditLog>,
    chain: EventChain,
}

impl TransitionPublisher {
    pub fn new(queue: SharedQueue, audit: Arc<AuditLog>) -> Self {
        Self {
            queue,
            audit,
            chain: EventChain::new(),
        }
    }

    pub fn chain(&self) -> &EventChain {
        &self.chain
    }

    /// Publish everything recorded since the last flush. Returns the number
    /// of transitions published.
    pub async fn flush(&self) -> usize {
        let transitions = self.queue.write().await.drain_transitions();
        let count = transitions.len();
        for t in transitions {
            if t.is_final {
                self.audit.record_finalized(TaskFinalized {
                    task_id: t.task_id,
                    goal_id: t.goal_id,
                    status: t.to.to_string(),
                    reason: t.reason.as_ref().map(|r| r.label().to_string()),
                    retry_count: t.retry_count,
                    assigned_to: t.agent_id.clone(),
                    finalized_at: t.at,
                });
            }
            let escalation = escalation_for(&t);
            self.chain.emit(TaskEvent::Transition(t)).await;
            if let Some(event) = escalation {
                self.chain.emit(event).await;
            }
        }
        count
    }
}

/// Logs every event through `tracing`.
pub struct TracingSink;

#[async_trait]
impl TaskEventSink for TracingSink {
    async fn on_event(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Transition(t) => debug!(
                task_id = %t.task_id,
                goal_id = %t.goal_id,
                from = %t.from,
                to = %t.to,
                is_final = t.is_final,
                "task event"
            ),
            TaskEvent::Escalated {
                goal_id,
                task_id,
                reason,
                review_required,
                ..
            } => warn!(
                task_id = %task_id,
                goal_id = %goal_id,
                reason = reason.label(),
                review_required,
                "task escalated to goal submitter"
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TaskEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    pub fn escalations(&self) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, TaskEvent::Escalated { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskEventSink for MemorySink {
    async fn on_event(&self, event: &TaskEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn transition() -> TaskEvent {
        TaskEvent::Transition(TaskTransition {
            task_id: Uuid::new_v4(),
            goal_id: Uuid::new_v4(),
            from: TaskStatus::Pending,
            to: TaskStatus::Soliciting,
            agent_id: None,
            retry_count: 0,
            reason: None,
            is_final: false,
            at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_chain_fans_out() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let chain = EventChain::new();
        chain.add(first.clone());
        chain.add(second.clone());
        chain.add(Arc::new(TracingSink));
        assert_eq!(chain.sink_count(), 3);

        chain.emit(transition()).await;
        chain
            .emit(TaskEvent::Escalated {
                goal_id: Uuid::new_v4(),
                task_id: Uuid::new_v4(),
                reason: FailureReason::RetryExhausted { retries: 3 },
                review_required: false,
                at: Utc::now(),
            })
            .await;

        assert_eq!(first.events().len(), 2);
        assert_eq!(second.escalations().len(), 1);
    }

    #[tokio::test]
    async fn test_publisher_audits_final_transitions() {
        use crate::task_queue::TaskQueue;
        use crate::types::Task;
        use agora_core::AgentId;

        let queue: SharedQueue = Arc::new(tokio::sync::RwLock::new(TaskQueue::new(0)));
        let audit = Arc::new(AuditLog::new());
        let publisher = TransitionPublisher::new(queue.clone(), audit.clone());
        let sink = Arc::new(MemorySink::new());
        publisher.chain().add(sink.clone());

        let held = Task::new(Uuid::new_v4(), "held", 1);
        let doomed = Task::new(Uuid::new_v4(), "doomed", 0);
        let (held_id, doomed_id) = (held.id, doomed.id);
        {
            let mut q = queue.write().await;
            q.enqueue(held).unwrap();
            q.enqueue(doomed).unwrap();
            q.next_for_soliciting().unwrap();
            q.try_assign(held_id, &AgentId::new("a")).unwrap();
            q.hold_for_review(
                held_id,
                FailureReason::PolicyHalt {
                    decision_id: Uuid::nil(),
                    score: 0.4,
                    threshold: 0.6,
                },
            )
            .unwrap();
            q.next_for_soliciting().unwrap();
            assert!(q.requeue(doomed_id, None).is_err());
        }

        let published = publisher.flush().await;
        assert_eq!(published, 5);
        assert_eq!(publisher.flush().await, 0);

        let finalized = audit.finalized();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].task_id, doomed_id);
        assert_eq!(finalized[0].reason.as_deref(), Some("retry_exhausted"));

        let escalations = sink.escalations();
        assert_eq!(escalations.len(), 2);
        let review_flags: Vec<bool> = escalations
            .iter()
            .filter_map(|e| match e {
                TaskEvent::Escalated {
                    review_required, ..
                } => Some(*review_required),
                TaskEvent::Transition(_) => None,
            })
            .collect();
        assert_eq!(review_flags, vec![true, false]);
        assert_eq!(sink.events().len(), 7);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(transition()).unwrap();
        assert_eq!(json["event"], "transition");
        assert_eq!(json["to"], "soliciting");
    }
}
