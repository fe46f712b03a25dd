//! Core types and error definitions for the Agora orchestration core.
//!
//! This crate provides the foundational types shared across all Agora crates:
//! the unified error enum and the identifiers used for goals, tasks and agents.
//!
//! # Main types
//!
//! - [`AgoraError`]: Unified error enum covering queue, allocation, policy and agent failures.
//! - [`AgoraResult`]: Convenience alias for `Result<T, AgoraError>`.
//! - [`AgentId`]: Identity of an external worker agent.
//! - [`TaskId`] / [`GoalId`]: UUID identities of tasks and goals.

/// Error taxonomy for the orchestration core.
pub mod error;

pub use error::{AgoraError, AgoraResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a task.
pub type TaskId = Uuid;

/// Identity of a submitted goal.
pub type GoalId = Uuid;

/// Identity of an external worker agent.
///
/// Agents name themselves (registration is done by an external registry
/// collaborator), so the identity is an opaque string rather than a UUID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an agent identity from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
