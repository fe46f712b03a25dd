use crate::audit::AuditLog;
use agora_core::{AgentId, AgoraError, AgoraResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Point in a task lifecycle at which the gate is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStage {
    /// Before a winning assignment is dispatched to its agent.
    PreDispatch,
    /// Before an agent-reported result is accepted as final.
    PostResult,
}

impl fmt::Display for PolicyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyStage::PreDispatch => write!(f, "pre_dispatch"),
            PolicyStage::PostResult => write!(f, "post_result"),
        }
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyOutcome {
    Proceed,
    Halt,
}

/// What kind of decision is being gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    /// Assignment of a task to an agent.
    Assignment,
    /// Acceptance of an agent's reported result.
    Result,
}

/// Identity of the decision a gate evaluation is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionSubject {
    pub kind: SubjectKind,
    pub task_id: Uuid,
    pub agent_id: Option<AgentId>,
}

impl DecisionSubject {
    /// Subject for the pre-dispatch check of a candidate assignment.
    pub fn assignment(task_id: Uuid, agent_id: AgentId) -> Self {
        Self {
            kind: SubjectKind::Assignment,
            task_id,
            agent_id: Some(agent_id),
        }
    }

    /// Subject for the post-result check of a reported outcome.
    pub fn result(task_id: Uuid, agent_id: AgentId) -> Self {
        Self {
            kind: SubjectKind::Result,
            task_id,
            agent_id: Some(agent_id),
        }
    }
}

impl fmt::Display for DecisionSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SubjectKind::Assignment => "assignment",
            SubjectKind::Result => "result",
        };
        match &self.agent_id {
            Some(agent) => write!(f, "{kind}:{}@{agent}", self.task_id),
            None => write!(f, "{kind}:{}", self.task_id),
        }
    }
}

/// A single scoring dimension supplied to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    /// Declared value in `[0, 1]`; higher is safer.
    pub value: f64,
    pub weight: f64,
}

impl Dimension {
    pub fn new(value: f64, weight: f64) -> Self {
        Self { value, weight }
    }
}

/// A dimension as recorded in a decision: the inputs plus the weighted contribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionContribution {
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
}

/// Immutable record of one gate evaluation.
///
/// Decisions are handed out as clones; the audit log keeps the original and
/// exposes no way to change or remove it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub id: Uuid,
    pub subject: DecisionSubject,
    pub stage: PolicyStage,
    pub dimensions: BTreeMap<String, DimensionContribution>,
    pub score: f64,
    pub threshold: f64,
    pub outcome: PolicyOutcome,
    pub decided_at: DateTime<Utc>,
}

impl PolicyDecision {
    /// Whether the gate allowed the decision to take effect.
    pub fn is_proceed(&self) -> bool {
        self.outcome == PolicyOutcome::Proceed
    }

    /// Converts a halt into [`AgoraError::PolicyHalt`].
    pub fn ensure_proceed(&self) -> AgoraResult<()> {
        match self.outcome {
            PolicyOutcome::Proceed => Ok(()),
            PolicyOutcome::Halt => Err(AgoraError::PolicyHalt {
                subject: self.subject.to_string(),
                score: self.score,
                threshold: self.threshold,
            }),
        }
    }
}

/// Weighted sum of the given dimensions.
///
/// Values are clamped to `[0, 1]`. A non-finite input yields a non-finite
/// score, which [`outcome_for`] always treats as a halt.
pub fn score_dimensions(
    dimensions: &BTreeMap<String, Dimension>,
) -> (f64, BTreeMap<String, DimensionContribution>) {
    let mut score = 0.0;
    let mut contributions = BTreeMap::new();
    for (name, dim) in dimensions {
        let value = dim.value.clamp(0.0, 1.0);
        let contribution = value * dim.weight;
        score += contribution;
        contributions.insert(
            name.clone(),
            DimensionContribution {
                value,
                weight: dim.weight,
                contribution,
            },
        );
    }
    (score, contributions)
}

/// `Halt` when `score < threshold` (or either is NaN), else `Proceed`.
pub fn outcome_for(score: f64, threshold: f64) -> PolicyOutcome {
    if score.is_finite() && score >= threshold {
        PolicyOutcome::Proceed
    } else {
        PolicyOutcome::Halt
    }
}

/// Gate configuration: threshold plus the weight of every named dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_dimensions")]
    pub dimensions: BTreeMap<String, f64>,
}

fn default_threshold() -> f64 {
    0.6
}

fn default_dimensions() -> BTreeMap<String, f64> {
    ["harm", "fairness", "explainability", "autonomy"]
        .into_iter()
        .map(|name| (name.to_string(), 0.25))
        .collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            dimensions: default_dimensions(),
        }
    }
}

impl PolicyConfig {
    /// Reject configurations the gate cannot evaluate meaningfully.
    pub fn validate(&self) -> AgoraResult<()> {
        validate_threshold(self.threshold)?;
        if self.dimensions.is_empty() {
            return Err(AgoraError::Config(
                "policy.dimensions must name at least one dimension".to_string(),
            ));
        }
        for (name, weight) in &self.dimensions {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(AgoraError::Config(format!(
                    "policy dimension '{name}' has invalid weight {weight}"
                )));
            }
        }
        Ok(())
    }
}

fn validate_threshold(threshold: f64) -> AgoraResult<()> {
    if threshold.is_finite() {
        Ok(())
    } else {
        Err(AgoraError::Config(format!(
            "policy threshold must be finite, got {threshold}"
        )))
    }
}

/// Synchronous scoring checkpoint. Every evaluation is appended to the audit log.
pub struct PolicyGate {
    threshold: RwLock<f64>,
    weights: BTreeMap<String, f64>,
    audit: Arc<AuditLog>,
}

impl PolicyGate {
    pub fn new(config: PolicyConfig, audit: Arc<AuditLog>) -> AgoraResult<Self> {
        config.validate()?;
        Ok(Self {
            threshold: RwLock::new(config.threshold),
            weights: config.dimensions,
            audit,
        })
    }

    /// Threshold currently in force.
    pub fn threshold(&self) -> f64 {
        *self.threshold.read()
    }

    /// Hot-reload the threshold. Decisions already recorded keep theirs.
    pub fn set_threshold(&self, threshold: f64) -> AgoraResult<()> {
        validate_threshold(threshold)?;
        let mut current = self.threshold.write();
        info!(old = *current, new = threshold, "Policy threshold updated");
        *current = threshold;
        Ok(())
    }

    /// Configured dimension weights.
    pub fn dimension_weights(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Evaluate explicit `(value, weight)` dimensions against the current threshold.
    pub fn evaluate(
        &self,
        subject: DecisionSubject,
        stage: PolicyStage,
        dimensions: &BTreeMap<String, Dimension>,
    ) -> PolicyDecision {
        let threshold = self.threshold();
        self.evaluate_with_threshold(subject, stage, dimensions, threshold)
    }

    /// Evaluate agent-declared values using the configured dimension weights.
    ///
    /// Configured dimensions the agent did not declare count as 0; declared
    /// values for unknown dimensions are ignored.
    pub fn evaluate_declared(
        &self,
        subject: DecisionSubject,
        stage: PolicyStage,
        declared: &BTreeMap<String, f64>,
    ) -> PolicyDecision {
        let dimensions: BTreeMap<String, Dimension> = self
            .weights
            .iter()
            .map(|(name, weight)| {
                let value = declared.get(name).copied().unwrap_or(0.0);
                (name.clone(), Dimension::new(value, *weight))
            })
            .collect();
        self.evaluate(subject, stage, &dimensions)
    }

    /// Core evaluation. Always records the decision, whatever the outcome.
    pub fn evaluate_with_threshold(
        &self,
        subject: DecisionSubject,
        stage: PolicyStage,
        dimensions: &BTreeMap<String, Dimension>,
        threshold: f64,
    ) -> PolicyDecision {
        let (score, contributions) = score_dimensions(dimensions);
        let outcome = outcome_for(score, threshold);

        let decision = PolicyDecision {
            id: Uuid::new_v4(),
            subject,
            stage,
            dimensions: contributions,
            score,
            threshold,
            outcome,
            decided_at: Utc::now(),
        };

        match outcome {
            PolicyOutcome::Proceed => info!(
                subject = %decision.subject,
                stage = %stage,
                score = decision.score,
                threshold,
                "Policy gate: proceed"
            ),
            PolicyOutcome::Halt => warn!(
                subject = %decision.subject,
                stage = %stage,
                score = decision.score,
                threshold,
                "Policy gate: halt"
            ),
        }

        self.audit.record_decision(decision.clone());
        decision
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn gate(threshold: f64) -> PolicyGate {
        let config = PolicyConfig {
            threshold,
            ..PolicyConfig::default()
        };
        PolicyGate::new(config, Arc::new(AuditLog::new())).unwrap()
    }

    fn dims(pairs: &[(&str, f64, f64)]) -> BTreeMap<String, Dimension> {
        pairs
            .iter()
            .map(|(n, v, w)| (n.to_string(), Dimension::new(*v, *w)))
            .collect()
    }

    fn subject() -> DecisionSubject {
        DecisionSubject::assignment(Uuid::new_v4(), AgentId::new("a1"))
    }

    #[test]
    fn test_proceed_when_score_meets_threshold() {
        let gate = gate(0.6);
        let d = gate.evaluate(
            subject(),
            PolicyStage::PreDispatch,
            &dims(&[("harm", 0.9, 0.5), ("fairness", 0.9, 0.5)]),
        );
        assert_eq!(d.outcome, PolicyOutcome::Proceed);
        assert!((d.score - 0.9).abs() < 1e-9);
        assert_eq!(d.threshold, 0.6);
    }

    #[test]
    fn test_halt_below_threshold() {
        let gate = gate(0.6);
        let d = gate.evaluate(
            subject(),
            PolicyStage::PreDispatch,
            &dims(&[("harm", 0.2, 0.5), ("fairness", 0.9, 0.5)]),
        );
        assert_eq!(d.outcome, PolicyOutcome::Halt);
        assert!((d.score - 0.55).abs() < 1e-9);
        assert!(d.ensure_proceed().is_err());
    }

    #[test]
    fn test_score_equal_to_threshold_proceeds() {
        assert_eq!(outcome_for(0.6, 0.6), PolicyOutcome::Proceed);
    }

    #[test]
    fn test_nan_always_halts() {
        let gate = gate(0.0);
        let d = gate.evaluate(
            subject(),
            PolicyStage::PostResult,
            &dims(&[("harm", f64::NAN, 1.0)]),
        );
        assert_eq!(d.outcome, PolicyOutcome::Halt);
    }

    #[test]
    fn test_values_are_clamped() {
        let (score, contributions) = score_dimensions(&dims(&[("harm", 4.0, 0.5)]));
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(contributions["harm"].value, 1.0);
    }

    #[test]
    fn test_undeclared_dimension_counts_as_zero() {
        let gate = gate(0.5);
        let mut declared = BTreeMap::new();
        declared.insert("harm".to_string(), 1.0);
        declared.insert("fairness".to_string(), 1.0);
        declared.insert("unknown".to_string(), 1.0);
        let d = gate.evaluate_declared(subject(), PolicyStage::PreDispatch, &declared);
        assert!((d.score - 0.5).abs() < 1e-9);
        assert_eq!(d.dimensions.len(), 4);
        assert!(!d.dimensions.contains_key("unknown"));
    }

    #[test]
    fn test_every_evaluation_is_audited() {
        let gate = gate(0.6);
        for v in [0.1, 0.5, 0.9] {
            gate.evaluate(subject(), PolicyStage::PreDispatch, &dims(&[("harm", v, 1.0)]));
        }
        assert_eq!(gate.audit().decision_count(), 3);
    }

    #[test]
    fn test_threshold_hot_reload() {
        let gate = gate(0.6);
        gate.set_threshold(0.3).unwrap();
        assert_eq!(gate.threshold(), 0.3);
        assert!(gate.set_threshold(f64::INFINITY).is_err());
        assert_eq!(gate.threshold(), 0.3);
    }

    #[test]
    fn test_config_validation() {
        assert!(PolicyConfig::default().validate().is_ok());
        let mut bad = PolicyConfig::default();
        bad.dimensions.insert("harm".to_string(), -1.0);
        assert!(bad.validate().is_err());
        let empty = PolicyConfig {
            threshold: 0.5,
            dimensions: BTreeMap::new(),
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_subject_display() {
        let id = Uuid::new_v4();
        let s = DecisionSubject::result(id, AgentId::new("worker"));
        assert_eq!(s.to_string(), format!("result:{id}@worker"));
    }
}
