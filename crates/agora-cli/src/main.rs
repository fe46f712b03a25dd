mod config;
mod config_watcher;
mod sim;

use agora_core::AgentId;
use agora_governance::{AuditLog, PolicyGate};
use agora_orchestrator::{Coordinator, GoalRequest, GoalSummary, SystemStatus};
use clap::{Parser, Subcommand};
use config::AgoraConfig;
use config_watcher::ConfigWatcher;
use serde::Serialize;
use sim::SimulatedAgent;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agora", about = "Agora: task orchestration with governed bid allocation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "agora.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a decomposed goal against the configured simulated agents
    Run {
        /// JSON file holding the goal and its tasks
        #[arg(short, long)]
        goal: PathBuf,
        /// Export the audit log as JSON Lines when the run ends
        #[arg(long)]
        audit_out: Option<PathBuf>,
        /// Hot-reload [weights] and policy.threshold while running
        #[arg(long)]
        watch: bool,
        /// Give up if the goal has not settled after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Validate the config file and print the effective configuration
    Check,
}

/// Printed to stdout at the end of `agora run`.
#[derive(Serialize)]
struct RunSummary {
    settled: bool,
    goal: GoalSummary,
    system: SystemStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = AgoraConfig::load(&cli.config).await?;

    match cli.command {
        Commands::Run {
            goal,
            audit_out,
            watch,
            timeout,
        } => {
            let watch_path = watch.then(|| cli.config.clone());
            run(
                config,
                &goal,
                audit_out,
                watch_path,
                Duration::from_secs(timeout),
            )
            .await?;
        }
        Commands::Check => {
            println!("{}", toml::to_string_pretty(&config)?);
            if config.agents.is_empty() {
                println!("# warning: no [[agents]] configured, `agora run` cannot allocate");
            }
            info!(path = %cli.config.display(), agents = config.agents.len(), "Configuration is valid");
        }
    }

    Ok(())
}

async fn run(
    config: AgoraConfig,
    goal_path: &Path,
    audit_out: Option<PathBuf>,
    watch_path: Option<PathBuf>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let goal_str = tokio::fs::read_to_string(goal_path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read goal file '{}': {e}", goal_path.display())
    })?;
    let goal: GoalRequest = serde_json::from_str(&goal_str)?;

    let audit = Arc::new(AuditLog::with_jsonl_sink(config.audit_dir()));
    let gate = Arc::new(PolicyGate::new(config.policy.clone(), audit)?);
    let coordinator = Arc::new(Coordinator::new(config.orchestrator.clone(), gate)?);

    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let heartbeat_period =
        Duration::from_millis(config.orchestrator.liveness.heartbeat_interval_ms);
    let mut heartbeats = Vec::new();
    for profile in &config.agents {
        let agent = Arc::new(SimulatedAgent::new(profile.clone(), results_tx.clone()));
        let id: AgentId = agent.id().clone();
        coordinator
            .register_agent(id.clone(), profile.capability_set(), agent)
            .await;
        heartbeats.push(sim::spawn_heartbeats(
            Arc::clone(&coordinator),
            id,
            profile.load,
            heartbeat_period,
        ));
    }
    drop(results_tx);
    info!(agents = config.agents.len(), "Simulated agents registered");

    let _watcher = match watch_path {
        Some(path) => {
            let c = Arc::clone(&coordinator);
            Some(ConfigWatcher::start(path, 500, move |reload| {
                if let Err(e) = reload.apply(&c) {
                    warn!(error = %e, "Rejected config reload");
                }
            })?)
        }
        None => None,
    };

    let goal_id = coordinator.submit_goal(goal).await?;
    let handle = Arc::clone(&coordinator).spawn();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut settle_check = tokio::time::interval(Duration::from_millis(200));
    let settled = loop {
        tokio::select! {
            Some(report) = results_rx.recv() => {
                let task_id = report.task_id;
                match coordinator.report_result(report).await {
                    Ok(disposition) => debug!(task_id = %task_id, disposition = ?disposition, "Result handled"),
                    Err(e) => warn!(task_id = %task_id, error = %e, "Result rejected"),
                }
            }
            _ = settle_check.tick() => {
                let summary = coordinator.goal_status(goal_id).await?;
                if summary.tasks.iter().all(|t| t.status.is_terminal()) {
                    break true;
                }
            }
            _ = &mut deadline => break false,
        }
    };

    handle.shutdown().await;
    for heartbeat in heartbeats {
        heartbeat.abort();
    }
    // No decisions are made past this point; drain the on-disk stream.
    coordinator.audit().close().await;
    coordinator.reflect().await;

    if let Some(path) = audit_out {
        let count = coordinator.export_audit(&path).await?;
        info!(path = %path.display(), entries = count, "Audit log exported");
    }

    let summary = RunSummary {
        settled,
        goal: coordinator.goal_status(goal_id).await?,
        system: coordinator.system_status().await,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !settled {
        anyhow::bail!("goal {goal_id} did not settle within {timeout:?}");
    }
    info!(goal_id = %goal_id, escalations = summary.goal.escalations.len(), "Goal settled");
    Ok(())
}
