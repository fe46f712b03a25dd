use crate::policy::{PolicyDecision, PolicyOutcome};
use agora_core::{AgentId, AgoraResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Record of a task reaching a final state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinalized {
    pub task_id: Uuid,
    pub goal_id: Uuid,
    /// Final status, e.g. `completed`, `failed`, `cancelled`.
    pub status: String,
    pub reason: Option<String>,
    pub retry_count: u32,
    pub assigned_to: Option<AgentId>,
    pub finalized_at: DateTime<Utc>,
}

/// One line of the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    PolicyDecision(PolicyDecision),
    TaskFinalized(TaskFinalized),
}

/// Append-only audit log of policy decisions and final task transitions.
///
/// Entries are kept in memory for export and, when a sink is attached,
/// streamed to `audit.jsonl` by a background task. Call [`AuditLog::close`]
/// before the runtime shuts down so the writer drains. There is no API to
/// modify or remove an entry.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    sink: Mutex<Option<mpsc::UnboundedSender<AuditEntry>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// In-memory log without a disk sink.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            sink: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Log that also appends every entry to `<log_dir>/audit.jsonl`.
    ///
    /// Spawns the writer on the current tokio runtime.
    pub fn with_jsonl_sink(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        let writer = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "Audit sink: cannot create directory");
                return;
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(error = %e, file = %log_file.display(), "Audit sink: cannot open file");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let line = match serde_json::to_string(&entry) {
                    Ok(json) => format!("{json}\n"),
                    Err(e) => {
                        warn!(error = %e, "Audit sink: failed to serialize entry");
                        continue;
                    }
                };
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, file = %log_file.display(), "Audit sink: write failed");
                    continue;
                }
                if let Err(e) = file.flush().await {
                    warn!(error = %e, file = %log_file.display(), "Audit sink: flush failed");
                }
            }
            debug!("Audit sink closed");
        });

        Self {
            entries: RwLock::new(Vec::new()),
            sink: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    fn append(&self, entry: AuditEntry) {
        // Hold the write lock across the send so file order matches memory order.
        let mut entries = self.entries.write();
        if let Some(tx) = self.sink.lock().as_ref() {
            if tx.send(entry.clone()).is_err() {
                warn!("Audit sink: writer gone, entry kept in memory only");
            }
        }
        entries.push(entry);
    }

    /// Detach the disk sink and wait until every queued entry is written.
    ///
    /// Later entries are kept in memory only. Calling it again, or on a log
    /// without a sink, returns immediately.
    pub async fn close(&self) {
        {
            // Lock order matches `append`.
            let _entries = self.entries.write();
            self.sink.lock().take();
        }
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(error = %e, "Audit sink: writer task failed");
            }
        }
    }

    /// Whether entries are still streamed to disk.
    pub fn has_sink(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn record_decision(&self, decision: PolicyDecision) {
        self.append(AuditEntry::PolicyDecision(decision));
    }

    pub fn record_finalized(&self, record: TaskFinalized) {
        debug!(
            task_id = %record.task_id,
            status = %record.status,
            retry_count = record.retry_count,
            "audit: task finalized"
        );
        self.append(AuditEntry::TaskFinalized(record));
    }

    /// Snapshot of every entry in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    /// All policy decisions in append order.
    pub fn decisions(&self) -> Vec<PolicyDecision> {
        self.entries
            .read()
            .iter()
            .filter_map(|e| match e {
                AuditEntry::PolicyDecision(d) => Some(d.clone()),
                AuditEntry::TaskFinalized(_) => None,
            })
            .collect()
    }

    /// Decisions about a single task.
    pub fn decisions_for(&self, task_id: Uuid) -> Vec<PolicyDecision> {
        self.decisions()
            .into_iter()
            .filter(|d| d.subject.task_id == task_id)
            .collect()
    }

    /// Final-state records in append order.
    pub fn finalized(&self) -> Vec<TaskFinalized> {
        self.entries
            .read()
            .iter()
            .filter_map(|e| match e {
                AuditEntry::TaskFinalized(f) => Some(f.clone()),
                AuditEntry::PolicyDecision(_) => None,
            })
            .collect()
    }

    pub fn decision_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| matches!(e, AuditEntry::PolicyDecision(_)))
            .count()
    }

    pub fn halt_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| {
                matches!(e, AuditEntry::PolicyDecision(d) if d.outcome == PolicyOutcome::Halt)
            })
            .count()
    }

    /// Total number of entries of any kind.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Render the whole log as JSON Lines.
    pub fn to_jsonl(&self) -> AgoraResult<String> {
        Ok(self.render()?.0)
    }

    fn render(&self) -> AgoraResult<(String, usize)> {
        let entries = self.entries.read();
        let mut out = String::new();
        for entry in entries.iter() {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok((out, entries.len()))
    }

    /// Write a read-only export of the log to `path`. Returns the entry count.
    pub async fn export_jsonl(&self, path: &Path) -> AgoraResult<usize> {
        let (body, count) = self.render()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, body).await?;
        Ok(count)
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
