use crate::config::LivenessConfig;
use crate::protocol::AgentChannel;
use crate::types::{AgentRecord, AgentStatus};
use agora_core::{AgentId, AgoraError, AgoraResult};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct RegisteredAgent {
    record: AgentRecord,
    channel: Arc<dyn AgentChannel>,
}

/// An agent that may be solicited for a task.
#[derive(Clone)]
pub struct EligibleAgent {
    pub record: AgentRecord,
    pub channel: Arc<dyn AgentChannel>,
}

/// Capability registry and liveness tracker for worker agents.
///
/// Records change only through registration, heartbeats, reported outcomes
/// and the liveness sweep.
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, RegisteredAgent>>,
    liveness: LivenessConfig,
}

impl AgentRegistry {
    pub fn new(liveness: LivenessConfig) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            liveness,
        }
    }

    /// Register an agent, or replace the capabilities and channel of a known
    /// one. Returns `true` for a new agent.
    pub async fn register(
        &self,
        id: AgentId,
        capabilities: BTreeSet<String>,
        channel: Arc<dyn AgentChannel>,
    ) -> bool {
        let mut agents = self.agents.write().await;
        let is_new = !agents.contains_key(&id);
        let mut record = match agents.remove(&id) {
            Some(existing) => existing.record,
            None => AgentRecord::new(id.clone(), Vec::<String>::new()),
        };
        record.capabilities = capabilities;
        record.last_heartbeat = Utc::now();
        record.status = self.status_for_load(record.load);
        info!(
            agent_id = %id,
            capabilities = ?record.capabilities,
            is_new,
            "agent registered"
        );
        agents.insert(id, RegisteredAgent { record, channel });
        is_new
    }

    /// Forget an agent. Returns its last record.
    pub async fn deregister(&self, id: &AgentId) -> Option<AgentRecord> {
        let removed = self.agents.write().await.remove(id).map(|a| a.record);
        if removed.is_some() {
            info!(agent_id = %id, "agent deregistered");
        }
        removed
    }

    /// Record a heartbeat observed now.
    pub async fn heartbeat(&self, id: &AgentId, load: f64) -> AgoraResult<AgentStatus> {
        self.heartbeat_at(id, load, Utc::now()).await
    }

    /// Record a heartbeat observed at `at`. Revives an Unreachable agent.
    pub async fn heartbeat_at(
        &self,
        id: &AgentId,
        load: f64,
        at: DateTime<Utc>,
    ) -> AgoraResult<AgentStatus> {
        if !load.is_finite() {
            return Err(AgoraError::Agent(format!(
                "agent {id} reported non-finite load"
            )));
        }
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| AgoraError::AgentNotFound(id.clone()))?;
        let record = &mut agent.record;
        if record.status == AgentStatus::Unreachable {
            info!(agent_id = %id, "agent reachable again");
        }
        record.load = load.clamp(0.0, 1.0);
        record.last_heartbeat = at;
        record.status = self.status_for_load(record.load);
        Ok(record.status)
    }

    fn status_for_load(&self, load: f64) -> AgentStatus {
        if load >= self.liveness.busy_load_threshold {
            AgentStatus::Busy
        } else {
            AgentStatus::Available
        }
    }

    /// Mark agents silent for longer than the heartbeat timeout as
    /// Unreachable. Returns the agents that changed on this sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<AgentId> {
        let timeout = self.liveness.heartbeat_timeout();
        let mut newly_unreachable = Vec::new();
        let mut agents = self.agents.write().await;
        for (id, agent) in agents.iter_mut() {
            let record = &mut agent.record;
            if record.status == AgentStatus::Unreachable {
                continue;
            }
            if now - record.last_heartbeat >= timeout {
                record.status = AgentStatus::Unreachable;
                warn!(
                    agent_id = %id,
                    last_heartbeat = %record.last_heartbeat,
                    "agent missed heartbeats, marking unreachable"
                );
                newly_unreachable.push(id.clone());
            }
        }
        newly_unreachable.sort();
        newly_unreachable
    }

    /// Available agents advertising at least one of `required`, ordered by id.
    pub async fn eligible(&self, required: &BTreeSet<String>) -> Vec<EligibleAgent> {
        let agents = self.agents.read().await;
        let mut eligible: Vec<EligibleAgent> = agents
            .values()
            .filter(|a| a.record.status == AgentStatus::Available && a.record.intersects(required))
            .map(|a| EligibleAgent {
                record: a.record.clone(),
                channel: Arc::clone(&a.channel),
            })
            .collect();
        eligible.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        eligible
    }

    /// Copy of one agent's record.
    pub async fn get(&self, id: &AgentId) -> Option<AgentRecord> {
        self.agents.read().await.get(id).map(|a| a.record.clone())
    }

    /// Transport to a registered agent.
    pub async fn channel(&self, id: &AgentId) -> Option<Arc<dyn AgentChannel>> {
        self.agents
            .read()
            .await
            .get(id)
            .map(|a| Arc::clone(&a.channel))
    }

    /// Add a reported outcome to the agent's reliability history.
    pub async fn record_outcome(&self, id: &AgentId, success: bool) {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.record.record_outcome(success);
        }
    }

    /// Copy of every record, ordered by id.
    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        let agents = self.agents.read().await;
        let mut records: Vec<AgentRecord> = agents.values().map(|a| a.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Number of registered agents.
    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{AgentReply, CoordinatorMessage};
    use async_trait::async_trait;
    use chrono::Duration;

    struct Silent;

    #[async_trait]
    impl AgentChannel for Silent {
        async fn send(&self, _message: CoordinatorMessage) -> AgoraResult<AgentReply> {
            Ok(AgentReply::Decline { reason: None })
        }
    }

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// Agents as `(id, "cap1,cap2")` pairs.
    async fn registry_with(agents: &[(&str, &str)]) -> AgentRegistry {
        let registry = AgentRegistry::new(LivenessConfig::default());
        for (id, caps) in agents {
            let caps: BTreeSet<String> = caps
                .split(',')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
            registry
                .register(AgentId::new(*id), caps, Arc::new(Silent))
                .await;
        }
        registry
    }

    #[tokio::test]
    async fn test_register_and_reregister() {
        let registry = registry_with(&[("a", "x")]).await;
        assert_eq!(registry.len().await, 1);
        let is_new = registry
            .register(AgentId::new("a"), tags(&["y"]), Arc::new(Silent))
            .await;
        assert!(!is_new);
        let record = registry.get(&AgentId::new("a")).await.unwrap();
        assert_eq!(record.capabilities, tags(&["y"]));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_eligibility_filters_status_and_tags() {
        let registry =
            registry_with(&[("a1", "vision,nlp"), ("a2", "nlp"), ("a3", "vision")])
                .await;
        registry
            .heartbeat(&AgentId::new("a3"), 0.95)
            .await
            .unwrap();

        let eligible = registry.eligible(&tags(&["vision"])).await;
        let ids: Vec<&str> = eligible.iter().map(|e| e.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a1"]);

        let any = registry.eligible(&BTreeSet::new()).await;
        assert_eq!(any.len(), 2);
    }

    #[tokio::test]
    async fn test_heartbeat_sets_busy_and_rejects_nan() {
        let registry = registry_with(&[("a", "")]).await;
        let id = AgentId::new("a");
        assert_eq!(
            registry.heartbeat(&id, 0.8).await.unwrap(),
            AgentStatus::Busy
        );
        assert_eq!(
            registry.heartbeat(&id, 0.2).await.unwrap(),
            AgentStatus::Available
        );
        assert!(registry.heartbeat(&id, f64::NAN).await.is_err());
        assert!(registry
            .heartbeat(&AgentId::new("nobody"), 0.1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_sweep_after_missed_heartbeats() {
        let registry = registry_with(&[("a", ""), ("b", "")]).await;
        let t0 = Utc::now();
        registry
            .heartbeat_at(&AgentId::new("a"), 0.1, t0)
            .await
            .unwrap();
        registry
            .heartbeat_at(&AgentId::new("b"), 0.1, t0 + Duration::seconds(25))
            .await
            .unwrap();

        assert!(registry.sweep(t0 + Duration::seconds(29)).await.is_empty());
        let gone = registry.sweep(t0 + Duration::seconds(31)).await;
        assert_eq!(gone, vec![AgentId::new("a")]);
        // Already unreachable agents are not reported twice.
        assert!(registry.sweep(t0 + Duration::seconds(32)).await.is_empty());

        let a = registry.get(&AgentId::new("a")).await.unwrap();
        assert_eq!(a.status, AgentStatus::Unreachable);
        assert!(registry.eligible(&BTreeSet::new()).await.len() == 1);

        let status = registry
            .heartbeat_at(&AgentId::new("a"), 0.1, t0 + Duration::seconds(40))
            .await
            .unwrap();
        assert_eq!(status, AgentStatus::Available);
    }

    #[tokio::test]
    async fn test_outcomes_and_deregister() {
        let registry = registry_with(&[("a", "")]).await;
        let id = AgentId::new("a");
        registry.record_outcome(&id, true).await;
        registry.record_outcome(&id, false).await;
        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.reliability(), Some(0.5));

        assert!(registry.deregister(&id).await.is_some());
        assert!(registry.deregister(&id).await.is_none());
        assert!(registry.is_empty().await);
        assert!(registry.channel(&id).await.is_none());
    }
}
