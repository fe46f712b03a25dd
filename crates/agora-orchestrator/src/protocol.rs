//! Messages exchanged between the coordinator and worker agents.
//!
//! Agents are external processes; the coordinator only sees them through an
//! [`AgentChannel`]. Every request gets exactly one [`AgentReply`] or an error.

use agora_core::{AgentId, AgoraResult, GoalId, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Messages sent by the coordinator to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Ask for a bid on a task before `deadline`.
    SolicitProposal {
        task_id: TaskId,
        goal_id: GoalId,
        description: String,
        required_capabilities: BTreeSet<String>,
        priority: i32,
        deadline: DateTime<Utc>,
    },
    /// The agent won the task and should start executing it.
    Assign {
        task_id: TaskId,
        goal_id: GoalId,
        description: String,
        /// Pre-dispatch decision that authorized the assignment.
        decision_id: Uuid,
    },
    /// Stop working on a task (cancelled or taken away).
    Revoke { task_id: TaskId, reason: String },
}

impl CoordinatorMessage {
    pub fn task_id(&self) -> TaskId {
        match self {
            CoordinatorMessage::SolicitProposal { task_id, .. }
            | CoordinatorMessage::Assign { task_id, .. }
            | CoordinatorMessage::Revoke { task_id, .. } => *task_id,
        }
    }
}

/// An agent's bid, as sent over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalBid {
    pub confidence: f64,
    #[serde(default)]
    pub estimated_cost: f64,
    /// Policy dimension values for the pre-dispatch gate.
    #[serde(default)]
    pub declared_dimensions: BTreeMap<String, f64>,
}

/// Replies an agent may give.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentReply {
    Proposal(ProposalBid),
    Decline {
        #[serde(default)]
        reason: Option<String>,
    },
    Ack,
}

/// Transport to one agent.
///
/// Implementations may be in-process (tests, the demo binary) or wrap a
/// network client. Errors and slow replies are treated as non-response.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    async fn send(&self, message: CoordinatorMessage) -> AgoraResult<AgentReply>;
}

/// Send a best-effort `Revoke` and wait at most `deadline` for the reply.
///
/// Returns `true` if the agent answered. Failures are logged, never raised.
pub async fn send_revoke(
    channel: &dyn AgentChannel,
    agent_id: &AgentId,
    task_id: TaskId,
    reason: &str,
    deadline: Duration,
) -> bool {
    let revoke = channel.send(CoordinatorMessage::Revoke {
        task_id,
        reason: reason.to_string(),
    });
    match tokio::time::timeout(deadline, revoke).await {
        Ok(Ok(_)) => {
            debug!(task_id = %task_id, agent_id = %agent_id, reason, "revoke delivered");
            true
        }
        Ok(Err(e)) => {
            warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "revoke rejected by agent channel");
            false
        }
        Err(_) => {
            warn!(task_id = %task_id, agent_id = %agent_id, "revoke not answered before deadline");
            false
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_message_is_tagged() {
        let msg = CoordinatorMessage::Revoke {
            task_id: Uuid::new_v4(),
            reason: "cancelled".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "revoke");
        assert_eq!(json["reason"], "cancelled");
    }

    #[test]
    fn test_reply_parses_minimal_proposal() {
        let reply: AgentReply =
            serde_json::from_str(r#"{"type": "proposal", "confidence": 0.7}"#).unwrap();
        match reply {
            AgentReply::Proposal(bid) => {
                assert!((bid.confidence - 0.7).abs() < f64::EPSILON);
                assert!(bid.declared_dimensions.is_empty());
            }
            other => panic!("unexpected reply: {other:?}"),
        }

        let reply: AgentReply = serde_json::from_str(r#"{"type": "decline"}"#).unwrap();
        assert!(matches!(reply, AgentReply::Decline { reason: None }));
    }

    struct Refusing;

    #[async_trait]
    impl AgentChannel for Refusing {
        async fn send(&self, _message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            Err(agora_core::AgoraError::Agent("connection reset".to_string()))
        }
    }

    struct Stalled;

    #[async_trait]
    impl AgentChannel for Stalled {
        async fn send(&self, _message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentReply::Ack)
        }
    }

    struct Acking;

    #[async_trait]
    impl AgentChannel for Acking {
        async fn send(&self, message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            assert!(matches!(message, CoordinatorMessage::Revoke { .. }));
            Ok(AgentReply::Ack)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_revoke_outcomes() {
        let agent = AgentId::new("a");
        let deadline = Duration::from_millis(100);
        let task = Uuid::new_v4();

        assert!(send_revoke(&Acking, &agent, task, "cancelled", deadline).await);
        assert!(!send_revoke(&Refusing, &agent, task, "cancelled", deadline).await);
        assert!(!send_revoke(&Stalled, &agent, task, "cancelled", deadline).await);
    }

    #[test]
    fn test_task_id_accessor() {
        let id = Uuid::new_v4();
        let msg = CoordinatorMessage::Assign {
            task_id: id,
            goal_id: Uuid::new_v4(),
            description: "x".to_string(),
            decision_id: Uuid::new_v4(),
        };
        assert_eq!(msg.task_id(), id);
    }
}
