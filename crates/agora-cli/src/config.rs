//! `agora.toml` loading and validation.

use crate::sim::SimAgentConfig;
use agora_core::{AgoraError, AgoraResult};
use agora_governance::PolicyConfig;
use agora_orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Full runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgoraConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `[allocation]`, `[liveness]`, `[reflection]` and `[weights]`.
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub agents: Vec<SimAgentConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl AgoraConfig {
    pub async fn load(path: &Path) -> AgoraResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AgoraError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> AgoraResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AgoraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AgoraResult<()> {
        self.orchestrator.validate()?;
        self.policy.validate()?;

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(AgoraError::Config("agent id must not be empty".to_string()));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(AgoraError::Config(format!(
                    "agent '{}' is listed twice",
                    agent.id
                )));
            }
            if !(0.0..=1.0).contains(&agent.confidence) || !(0.0..=1.0).contains(&agent.load) {
                return Err(AgoraError::Config(format!(
                    "agent '{}' needs confidence and load in [0, 1]",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Audit sink directory under `data_dir`.
    pub fn audit_dir(&self) -> PathBuf {
        self.data_dir.join("audit")
    }
}
