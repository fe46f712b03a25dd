//! Governance layer for the Agora orchestration core.
//!
//! Every assignment and every reported result passes through a synchronous
//! [`PolicyGate`] before it takes effect. Each evaluation yields an immutable
//! [`PolicyDecision`] that is appended to the [`AuditLog`], whether the outcome
//! was `Proceed` or `Halt`.
//!
//! # Main types
//!
//! - [`PolicyGate`]: Weighted-dimension scoring against a hot-reloadable threshold.
//! - [`PolicyDecision`]: Immutable record of one gate evaluation.
//! - [`AuditLog`]: Append-only trail of decisions and final task transitions.

/// Append-only audit log.
pub mod audit;
/// Policy gate scoring and decisions.
pub mod policy;

pub use audit::{AuditEntry, AuditLog, TaskFinalized};
pub use policy::{
    DecisionSubject, Dimension, DimensionContribution, PolicyConfig, PolicyDecision, PolicyGate,
    PolicyOutcome, PolicyStage, SubjectKind,
};
