//! Config hot-reload watcher.
//!
//! Watches an `agora.toml` file for modifications and invokes a callback
//! with the freshly parsed [`ReloadableConfig`] after a debounce window.
//! Only the allocation weights and the policy threshold are reloadable;
//! every other section is read once at startup.

use agora_core::{AgoraError, AgoraResult};
use agora_orchestrator::{AllocationWeights, Coordinator};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

/// Subset of the configuration that may change while the coordinator runs.
///
/// Unknown sections are ignored, so the full `agora.toml` parses as well as
/// a file holding only the sections an operator wants to tweak.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadableConfig {
    #[serde(default)]
    pub weights: Option<AllocationWeights>,
    #[serde(default)]
    pub policy: Option<ReloadablePolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadablePolicy {
    #[serde(default)]
    pub threshold: Option<f64>,
}

impl ReloadableConfig {
    pub fn threshold(&self) -> Option<f64> {
        self.policy.as_ref().and_then(|p| p.threshold)
    }

    /// Push the reloaded values into a running coordinator. Invalid values
    /// are rejected and leave the running configuration untouched.
    pub fn apply(&self, coordinator: &Coordinator) -> AgoraResult<()> {
        coordinator.apply_reload(self.weights, self.threshold())
    }
}

/// Watches a config file on disk and calls back on every (debounced) change.
///
/// Dropping the watcher releases the file-system watch, which in turn ends
/// the background thread.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread for each burst of writes that
    /// parses successfully. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> AgoraResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + Sync + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| AgoraError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| AgoraError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = std::time::Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Let the writer finish, then collapse the burst into one reload.
                std::thread::sleep(debounce);
                while rx.try_recv().is_ok() {}

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }

            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");

        Ok(Self { _watcher: watcher })
    }
}

/// Read and parse the reloadable sections of a TOML config file.
pub fn parse_config(path: &Path) -> AgoraResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AgoraError::Config(format!("Failed to read config '{}': {e}", path.display()))
    })?;
    toml::from_str(&content).map_err(|e| {
        AgoraError::Config(format!("Failed to parse config '{}': {e}", path.display()))
    })
}
