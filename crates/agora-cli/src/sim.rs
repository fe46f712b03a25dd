//! In-process simulated agents for `agora run`.
//!
//! Each agent bids on tasks it can fully serve, "executes" an assignment by
//! sleeping for its configured work time and then reports a result back to
//! the runner through an mpsc channel.

use agora_core::{AgentId, AgoraResult, TaskId};
use agora_orchestrator::{
    AgentChannel, AgentReply, Coordinator, CoordinatorMessage, ProposalBid, ResultReport,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Profile of one simulated agent, as listed under `[[agents]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimAgentConfig {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Load reported on every heartbeat.
    #[serde(default = "default_load")]
    pub load: f64,
    #[serde(default = "default_work_ms")]
    pub work_ms: u64,
    /// Every n-th execution fails. Unset means the agent never fails.
    #[serde(default)]
    pub fail_every: Option<u32>,
    /// Policy dimension values declared with each bid.
    #[serde(default = "default_dimensions")]
    pub dimensions: BTreeMap<String, f64>,
    /// Dimension values reported with results. Defaults to `dimensions`.
    #[serde(default)]
    pub result_dimensions: Option<BTreeMap<String, f64>>,
}

fn default_confidence() -> f64 {
    0.8
}
fn default_load() -> f64 {
    0.2
}
fn default_work_ms() -> u64 {
    200
}
fn default_dimensions() -> BTreeMap<String, f64> {
    ["harm", "fairness", "explainability", "autonomy"]
        .into_iter()
        .map(|name| (name.to_string(), 0.9))
        .collect()
}

impl SimAgentConfig {
    pub fn capability_set(&self) -> BTreeSet<String> {
        self.capabilities.iter().cloned().collect()
    }

    fn fails_on(&self, execution: u32) -> bool {
        matches!(self.fail_every, Some(n) if n > 0 && execution % n == 0)
    }
}

/// A simulated worker behind an [`AgentChannel`].
pub struct SimulatedAgent {
    id: AgentId,
    profile: SimAgentConfig,
    executions: AtomicU32,
    revoked: Arc<Mutex<HashSet<TaskId>>>,
    results: mpsc::UnboundedSender<ResultReport>,
}

impl SimulatedAgent {
    pub fn new(profile: SimAgentConfig, results: mpsc::UnboundedSender<ResultReport>) -> Self {
        Self {
            id: AgentId::new(profile.id.clone()),
            profile,
            executions: AtomicU32::new(0),
            revoked: Arc::new(Mutex::new(HashSet::new())),
            results,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    fn bid(&self, required: &BTreeSet<String>) -> AgentReply {
        let capabilities = self.profile.capability_set();
        if !required.is_subset(&capabilities) {
            return AgentReply::Decline {
                reason: Some("missing capability".to_string()),
            };
        }
        AgentReply::Proposal(ProposalBid {
            confidence: self.profile.confidence,
            estimated_cost: self.profile.work_ms as f64,
            declared_dimensions: self.profile.dimensions.clone(),
        })
    }

    fn execute(&self, task_id: TaskId) {
        self.revoked.lock().remove(&task_id);
        let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        let success = !self.profile.fails_on(execution);

        let report = ResultReport {
            task_id,
            agent_id: self.id.clone(),
            success,
            payload: serde_json::json!({ "agent": self.id.as_str(), "execution": execution }),
            dimensions: self
                .profile
                .result_dimensions
                .clone()
                .unwrap_or_else(|| self.profile.dimensions.clone()),
            message: (!success).then(|| format!("simulated failure on execution {execution}")),
        };
        let work = Duration::from_millis(self.profile.work_ms);
        let revoked = Arc::clone(&self.revoked);
        let results = self.results.clone();
        let agent_id = self.id.clone();

        tokio::spawn(async move {
            tokio::time::sleep(work).await;
            if revoked.lock().remove(&task_id) {
                debug!(task_id = %task_id, agent_id = %agent_id, "Sim agent: work revoked, dropping result");
                return;
            }
            if results.send(report).is_err() {
                debug!(task_id = %task_id, "Sim agent: runner gone, dropping result");
            }
        });
    }
}

#[async_trait]
impl AgentChannel for SimulatedAgent {
    async fn send(&self, message: CoordinatorMessage) -> AgoraResult<AgentReply> {
        Ok(match message {
            CoordinatorMessage::SolicitProposal {
                required_capabilities,
                ..
            } => self.bid(&required_capabilities),
            CoordinatorMessage::Assign { task_id, .. } => {
                self.execute(task_id);
                AgentReply::Ack
            }
            CoordinatorMessage::Revoke { task_id, reason } => {
                debug!(task_id = %task_id, agent_id = %self.id, reason = %reason, "Sim agent: revoked");
                self.revoked.lock().insert(task_id);
                AgentReply::Ack
            }
        })
    }
}

/// Send a heartbeat with a fixed load every `period` until aborted.
pub fn spawn_heartbeats(
    coordinator: Arc<Coordinator>,
    id: AgentId,
    load: f64,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = coordinator.heartbeat(&id, load).await {
                warn!(agent_id = %id, error = %e, "Sim agent: heartbeat rejected");
            }
        }
    })
}
