use crate::types::{FailureReason, Task, TaskStatus, TaskTransition};
use agora_core::{AgentId, AgoraError, AgoraResult, GoalId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// The queue as shared by the coordinator, allocator runs and publisher.
pub type SharedQueue = Arc<RwLock<TaskQueue>>;

/// Ordering key of the Pending index: highest priority first, then earliest
/// creation time, then enqueue order.
type PendingKey = (Reverse<i32>, DateTime<Utc>, u64, TaskId);

fn pending_key(task: &Task) -> PendingKey {
    (
        Reverse(task.priority),
        task.created_at,
        task.sequence,
        task.id,
    )
}

/// Per-status counts of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Every task ever enqueued.
    pub total: usize,
    pub pending: usize,
    pub soliciting: usize,
    pub assigned: usize,
    pub executing: usize,
    pub completed: usize,
    /// Failed tasks, including those held for review.
    pub failed: usize,
    pub cancelled: usize,
    /// Failed tasks still waiting for `resolve_review`.
    pub review_pending: usize,
}

/// Priority-ordered system of record for task lifecycle.
///
/// Every method is a compare-and-transition: it checks the current status and
/// either moves the task or returns an error without touching it. The queue
/// is not internally synchronized; the coordinator wraps it in a
/// `tokio::sync::RwLock` so each call runs under exclusive access.
pub struct TaskQueue {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeSet<PendingKey>,
    retry_ceiling: u32,
    next_sequence: u64,
    transitions: Vec<TaskTransition>,
}

/// Apply a status change and record it for the event stream.
fn set_status(
    transitions: &mut Vec<TaskTransition>,
    task: &mut Task,
    to: TaskStatus,
    is_final: bool,
) {
    let from = task.status;
    let now = Utc::now();
    task.status = to;
    task.updated_at = now;
    debug!(
        task_id = %task.id,
        from = %from,
        to = %to,
        retry_count = task.retry_count,
        "task transition"
    );
    transitions.push(TaskTransition {
        task_id: task.id,
        goal_id: task.goal_id,
        from,
        to,
        agent_id: task.assigned_to.clone(),
        retry_count: task.retry_count,
        reason: task.failure.clone(),
        is_final,
        at: now,
    });
}

fn invalid(task: &Task, to: &str) -> AgoraError {
    AgoraError::InvalidTransition {
        task_id: task.id,
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

impl TaskQueue {
    pub fn new(retry_ceiling: u32) -> Self {
        Self {
            tasks: HashMap::new(),
            pending: BTreeSet::new(),
            retry_ceiling,
            next_sequence: 0,
            transitions: Vec::new(),
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Accept a new task as Pending.
    pub fn enqueue(&mut self, mut task: Task) -> AgoraResult<TaskId> {
        if self.tasks.contains_key(&task.id) {
            return Err(AgoraError::DuplicateTask(task.id));
        }
        let id = task.id;
        task.status = TaskStatus::Pending;
        task.assigned_to = None;
        task.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.insert(pending_key(&task));
        debug!(task_id = %id, priority = task.priority, "task enqueued");
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Move the most urgent Pending task to Soliciting and return a copy.
    pub fn next_for_soliciting(&mut self) -> AgoraResult<Task> {
        loop {
            let key = self.pending.pop_first().ok_or(AgoraError::Empty)?;
            let id = key.3;
            // The index only holds Pending tasks; skip anything stale.
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            set_status(&mut self.transitions, task, TaskStatus::Soliciting, false);
            return Ok(task.clone());
        }
    }

    /// Soliciting -> Assigned, only if the task is still Soliciting.
    pub fn try_assign(&mut self, id: TaskId, agent: &AgentId) -> AgoraResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if task.status != TaskStatus::Soliciting {
            return Err(AgoraError::StaleSolicitation(id));
        }
        task.assigned_to = Some(agent.clone());
        task.failure = None;
        set_status(&mut self.transitions, task, TaskStatus::Assigned, false);
        Ok(())
    }

    /// Assigned -> Executing once the assigned agent acknowledges.
    pub fn mark_executing(&mut self, id: TaskId, agent: &AgentId) -> AgoraResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if task.status != TaskStatus::Assigned {
            return Err(invalid(task, "executing"));
        }
        if task.assigned_to.as_ref() != Some(agent) {
            return Err(AgoraError::NotAssigned {
                task_id: id,
                agent_id: agent.clone(),
            });
        }
        set_status(&mut self.transitions, task, TaskStatus::Executing, false);
        Ok(())
    }

    /// Assigned/Executing -> Completed or Failed.
    ///
    /// Returns `Ok(false)` without change when the task is already terminal.
    pub fn mark_terminal(&mut self, id: TaskId, status: TaskStatus) -> AgoraResult<bool> {
        match status {
            TaskStatus::Completed => self.finish(id, status, None, None),
            TaskStatus::Failed => self.finish(
                id,
                status,
                Some(FailureReason::AgentFailure {
                    message: "marked failed".to_string(),
                }),
                None,
            ),
            other => Err(AgoraError::InvalidTransition {
                task_id: id,
                from: "held".to_string(),
                to: other.to_string(),
            }),
        }
    }

    /// Complete a held task and keep the accepted result payload.
    pub fn complete(&mut self, id: TaskId, result: serde_json::Value) -> AgoraResult<bool> {
        self.finish(id, TaskStatus::Completed, None, Some(result))
    }

    /// Fail a held task permanently with the given reason.
    pub fn fail(&mut self, id: TaskId, reason: FailureReason) -> AgoraResult<bool> {
        self.finish(id, TaskStatus::Failed, Some(reason), None)
    }

    fn finish(
        &mut self,
        id: TaskId,
        status: TaskStatus,
        failure: Option<FailureReason>,
        result: Option<serde_json::Value>,
    ) -> AgoraResult<bool> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        if !task.status.is_held() {
            return Err(invalid(task, &status.to_string()));
        }
        task.failure = failure;
        task.result = result;
        set_status(&mut self.transitions, task, status, true);
        Ok(true)
    }

    /// Send a Soliciting/Assigned/Executing task back to Pending.
    ///
    /// Returns the new retry count. Once the ceiling is reached the task is
    /// failed permanently and `RetryExhausted` is returned instead.
    pub fn requeue(&mut self, id: TaskId, reason: Option<FailureReason>) -> AgoraResult<u32> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        let allowed = matches!(
            task.status,
            TaskStatus::Soliciting | TaskStatus::Assigned | TaskStatus::Executing
        );
        if !allowed {
            return Err(invalid(task, "pending"));
        }
        if let Some(reason) = reason {
            task.failure = Some(reason);
        }
        Self::retry_or_exhaust(
            &mut self.transitions,
            &mut self.pending,
            self.retry_ceiling,
            task,
        )
    }

    fn retry_or_exhaust(
        transitions: &mut Vec<TaskTransition>,
        pending: &mut BTreeSet<PendingKey>,
        ceiling: u32,
        task: &mut Task,
    ) -> AgoraResult<u32> {
        task.review_pending = false;
        if task.retry_count >= ceiling {
            task.failure = Some(FailureReason::RetryExhausted {
                retries: task.retry_count,
            });
            set_status(transitions, task, TaskStatus::Failed, true);
            return Err(AgoraError::RetryExhausted {
                task_id: task.id,
                retries: task.retry_count,
            });
        }
        task.retry_count += 1;
        task.assigned_to = None;
        set_status(transitions, task, TaskStatus::Pending, false);
        pending.insert(pending_key(task));
        Ok(task.retry_count)
    }

    /// Any non-terminal task -> Cancelled. `Ok(false)` if already terminal.
    pub fn cancel(&mut self, id: TaskId) -> AgoraResult<bool> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        if task.status == TaskStatus::Pending {
            self.pending.remove(&pending_key(task));
        }
        set_status(&mut self.transitions, task, TaskStatus::Cancelled, true);
        Ok(true)
    }

    /// Assigned/Executing -> Failed, waiting for an external review.
    pub fn hold_for_review(&mut self, id: TaskId, reason: FailureReason) -> AgoraResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if !task.status.is_held() {
            return Err(invalid(task, "failed"));
        }
        task.failure = Some(reason);
        task.review_pending = true;
        set_status(&mut self.transitions, task, TaskStatus::Failed, false);
        Ok(())
    }

    /// Authorized retry of a task held for review. Same ceiling as `requeue`.
    pub fn requeue_after_review(&mut self, id: TaskId) -> AgoraResult<u32> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if !(task.status == TaskStatus::Failed && task.review_pending) {
            return Err(invalid(task, "pending"));
        }
        Self::retry_or_exhaust(
            &mut self.transitions,
            &mut self.pending,
            self.retry_ceiling,
            task,
        )
    }

    /// Close a task held for review without retrying it.
    pub fn reject_review(&mut self, id: TaskId) -> AgoraResult<()> {
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(AgoraError::TaskNotFound(id))?;
        if !(task.status == TaskStatus::Failed && task.review_pending) {
            return Err(invalid(task, "failed"));
        }
        task.review_pending = false;
        task.failure = Some(FailureReason::ReviewRejected);
        set_status(&mut self.transitions, task, TaskStatus::Failed, true);
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.status)
    }

    pub fn is_cancelled(&self, id: TaskId) -> bool {
        self.status(id) == Some(TaskStatus::Cancelled)
    }

    /// All tasks, oldest first.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.created_at, t.sequence));
        tasks
    }

    pub fn tasks_for_goal(&self, goal_id: GoalId) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.goal_id == goal_id)
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    /// Tasks currently held (Assigned or Executing) by `agent`.
    pub fn tasks_assigned_to(&self, agent: &AgentId) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status.is_held() && t.assigned_to.as_ref() == Some(agent))
            .map(|t| t.id)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.tasks.len(),
            ..QueueStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Soliciting => stats.soliciting += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Executing => stats.executing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if task.review_pending {
                stats.review_pending += 1;
            }
        }
        stats
    }

    /// Take every transition recorded since the last drain, in order.
    pub fn drain_transitions(&mut self) -> Vec<TaskTransition> {
        std::mem::take(&mut self.transitions)
    }
}
