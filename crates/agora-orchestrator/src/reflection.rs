use crate::config::ReflectionConfig;
use crate::evaluator::ScoreBreakdown;
use crate::task_queue::QueueStats;
use crate::types::{AgentRecord, AllocationWeights};
use agora_core::{AgentId, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Load above which an agent is reported as a bottleneck.
const BOTTLENECK_LOAD: f64 = 0.9;
/// Pending backlog above which the queue is reported as a bottleneck.
const BOTTLENECK_PENDING: usize = 10;
const HIGH_AVERAGE_LOAD: f64 = 0.8;
const LOW_AVERAGE_LOAD: f64 = 0.3;
const LOW_COMPLETION_RATE: f64 = 0.7;

/// The score components of a winning proposal and how the task turned out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub components: ScoreBreakdown,
    pub success: bool,
}

#[derive(Default)]
struct TrackerState {
    assigned: HashMap<TaskId, ScoreBreakdown>,
    samples: VecDeque<OutcomeSample>,
}

/// Rolling window of `(winning score, outcome)` pairs fed by the allocator
/// and the result path.
pub struct OutcomeTracker {
    state: Mutex<TrackerState>,
    window: usize,
}

impl OutcomeTracker {
    pub fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            window: window.max(1),
        }
    }

    /// Remember the breakdown that won `task_id` until its outcome arrives.
    pub fn record_assignment(&self, task_id: TaskId, breakdown: ScoreBreakdown) {
        self.state.lock().assigned.insert(task_id, breakdown);
    }

    /// Close the pending assignment of `task_id`. Returns `false` if none.
    pub fn record_outcome(&self, task_id: TaskId, success: bool) -> bool {
        let mut state = self.state.lock();
        let Some(components) = state.assigned.remove(&task_id) else {
            return false;
        };
        if state.samples.len() == self.window {
            state.samples.pop_front();
        }
        state.samples.push_back(OutcomeSample {
            components,
            success,
        });
        true
    }

    /// Drop a pending assignment without producing a sample.
    pub fn forget(&self, task_id: TaskId) {
        self.state.lock().assigned.remove(&task_id);
    }

    pub fn samples(&self) -> Vec<OutcomeSample> {
        self.state.lock().samples.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().samples.is_empty()
    }
}

/// Which allocation weight a reflection favoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightDimension {
    Capability,
    Load,
    Confidence,
}

impl WeightDimension {
    const ALL: [WeightDimension; 3] = [
        WeightDimension::Capability,
        WeightDimension::Load,
        WeightDimension::Confidence,
    ];

    fn component(self, b: &ScoreBreakdown) -> f64 {
        match self {
            WeightDimension::Capability => b.capability_match,
            WeightDimension::Load => b.load_headroom,
            WeightDimension::Confidence => b.confidence,
        }
    }

    fn weight_mut(self, w: &mut AllocationWeights) -> &mut f64 {
        match self {
            WeightDimension::Capability => &mut w.capability,
            WeightDimension::Load => &mut w.load,
            WeightDimension::Confidence => &mut w.confidence,
        }
    }
}

/// Result of one weight adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub before: AllocationWeights,
    pub after: AllocationWeights,
    /// Component whose values best separated successes from failures.
    pub best_predictor: Option<WeightDimension>,
    /// Mean component value on successes minus on failures.
    pub gap: f64,
    pub adjusted: bool,
}

/// Bounded retuning of allocation weights from observed outcomes.
///
/// The component with the largest success/failure gap gains at most
/// `max_step`; the other two each give up half of that. Every weight ends
/// inside `[min_weight, max_weight]`. The capability filter and the policy
/// gate are outside its reach.
pub struct MetaReflector {
    config: ReflectionConfig,
}

impl MetaReflector {
    pub fn new(config: ReflectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    pub fn adjust(&self, current: AllocationWeights, samples: &[OutcomeSample]) -> Adjustment {
        let cfg = &self.config;
        let bounded = current.clamped(cfg.min_weight, cfg.max_weight);
        let unchanged = Adjustment {
            before: current,
            after: bounded,
            best_predictor: None,
            gap: 0.0,
            adjusted: false,
        };

        let successes: Vec<&ScoreBreakdown> = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| &s.components)
            .collect();
        let failures: Vec<&ScoreBreakdown> = samples
            .iter()
            .filter(|s| !s.success)
            .map(|s| &s.components)
            .collect();
        if samples.len() < cfg.min_samples || successes.is_empty() || failures.is_empty() {
            return unchanged;
        }

        let mut best: Option<(WeightDimension, f64)> = None;
        for dim in WeightDimension::ALL {
            let gap = mean(&successes, dim) - mean(&failures, dim);
            if !gap.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, g)| gap > g) {
                best = Some((dim, gap));
            }
        }
        let Some((dim, gap)) = best else {
            return unchanged;
        };
        if gap <= 0.0 {
            return Adjustment { gap, ..unchanged };
        }

        let step = (cfg.learning_rate * gap).min(cfg.max_step);
        let mut after = bounded;
        for other in WeightDimension::ALL {
            let w = other.weight_mut(&mut after);
            if other == dim {
                *w += step;
            } else {
                *w -= step / 2.0;
            }
        }
        let after = after.clamped(cfg.min_weight, cfg.max_weight);

        Adjustment {
            before: current,
            after,
            best_predictor: Some(dim),
            gap,
            adjusted: after != current,
        }
    }
}

fn mean(values: &[&ScoreBreakdown], dim: WeightDimension) -> f64 {
    let sum: f64 = values.iter().map(|b| dim.component(b)).sum();
    sum / values.len() as f64
}

/// Coordinator-wide figures captured with each reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub agent_count: usize,
    pub average_load: f64,
    /// Completed over finished (completed + failed) tasks.
    pub completion_rate: Option<f64>,
    pub pending_tasks: usize,
}

/// What one meta-reflection saw and did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionReport {
    pub reflected_at: DateTime<Utc>,
    pub samples_used: usize,
    pub success_rate: Option<f64>,
    pub adjustment: Adjustment,
    pub system: SystemMetrics,
    pub bottlenecks: Vec<String>,
    pub recommendations: Vec<String>,
    pub most_reliable_agent: Option<AgentId>,
}

impl ReflectionReport {
    pub fn build(
        adjustment: Adjustment,
        samples: &[OutcomeSample],
        agents: &[AgentRecord],
        stats: &QueueStats,
    ) -> Self {
        let success_rate = if samples.is_empty() {
            None
        } else {
            let ok = samples.iter().filter(|s| s.success).count();
            Some(ok as f64 / samples.len() as f64)
        };

        let average_load = if agents.is_empty() {
            0.0
        } else {
            agents.iter().map(|a| a.load).sum::<f64>() / agents.len() as f64
        };
        let finished = stats.completed + stats.failed;
        let completion_rate = (finished > 0).then(|| stats.completed as f64 / finished as f64);

        let mut bottlenecks: Vec<String> = agents
            .iter()
            .filter(|a| a.load > BOTTLENECK_LOAD)
            .map(|a| format!("agent {} overloaded (load {:.2})", a.id, a.load))
            .collect();
        if stats.pending > BOTTLENECK_PENDING {
            bottlenecks.push(format!("task backlog: {} pending", stats.pending));
        }

        let mut recommendations = Vec::new();
        if !agents.is_empty() && average_load > HIGH_AVERAGE_LOAD {
            recommendations.push("high average load: add agents".to_string());
        } else if !agents.is_empty() && average_load < LOW_AVERAGE_LOAD {
            recommendations.push("agents under-utilized".to_string());
        }
        if completion_rate.is_some_and(|r| r < LOW_COMPLETION_RATE) {
            recommendations.push("low completion rate: investigate allocation".to_string());
        }

        let most_reliable_agent = agents
            .iter()
            .filter_map(|a| a.reliability().map(|r| (a, r)))
            .max_by(|(a, ra), (b, rb)| ra.total_cmp(rb).then_with(|| b.id.cmp(&a.id)))
            .map(|(a, _)| a.id.clone());

        Self {
            reflected_at: Utc::now(),
            samples_used: samples.len(),
            success_rate,
            adjustment,
            system: SystemMetrics {
                agent_count: agents.len(),
                average_load,
                completion_rate,
                pending_tasks: stats.pending,
            },
            bottlenecks,
            recommendations,
            most_reliable_agent,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn breakdown(capability: f64, load: f64, confidence: f64) -> ScoreBreakdown {
        ScoreBreakdown {
            capability_match: capability,
            load_headroom: load,
            confidence,
            total: 0.0,
        }
    }

    fn config() -> ReflectionConfig {
        ReflectionConfig {
            min_samples: 4,
            learning_rate: 0.1,
            max_step: 0.05,
            ..ReflectionConfig::default()
        }
    }

    /// Successes had much more load headroom than failures.
    fn load_predicts_success() -> Vec<OutcomeSample> {
        let mut samples = Vec::new();
        for _ in 0..3 {
            samples.push(OutcomeSample {
                components: breakdown(1.0, 0.9, 0.5),
                success: true,
            });
            samples.push(OutcomeSample {
                components: breakdown(1.0, 0.1, 0.5),
                success: false,
            });
        }
        samples
    }

    #[test]
    fn test_tracker_window_is_bounded() {
        let tracker = OutcomeTracker::new(3);
        for i in 0..5 {
            let id = Uuid::new_v4();
            tracker.record_assignment(id, breakdown(1.0, 0.5, 0.5));
            assert!(tracker.record_outcome(id, i % 2 == 0));
        }
        assert_eq!(tracker.len(), 3);
        assert!(!tracker.record_outcome(Uuid::new_v4(), true));
    }

    #[test]
    fn test_forget_drops_pending() {
        let tracker = OutcomeTracker::new(3);
        let id = Uuid::new_v4();
        tracker.record_assignment(id, breakdown(1.0, 0.5, 0.5));
        tracker.forget(id);
        assert!(!tracker.record_outcome(id, true));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_adjust_favours_best_predictor() {
        let reflector = MetaReflector::new(config());
        let before = AllocationWeights::default();
        let adj = reflector.adjust(before, &load_predicts_success());

        assert!(adj.adjusted);
        assert_eq!(adj.best_predictor, Some(WeightDimension::Load));
        assert!((adj.gap - 0.8).abs() < 1e-9);
        // step = min(0.1 * 0.8, 0.05) = 0.05
        assert!((adj.after.load - 0.35).abs() < 1e-9);
        assert!((adj.after.capability - 0.475).abs() < 1e-9);
        assert!((adj.after.confidence - 0.175).abs() < 1e-9);
    }

    #[test]
    fn test_adjust_needs_enough_mixed_samples() {
        let reflector = MetaReflector::new(config());
        let before = AllocationWeights::default();

        let few = &load_predicts_success()[..2];
        assert!(!reflector.adjust(before, few).adjusted);

        let all_success: Vec<OutcomeSample> = (0..6)
            .map(|_| OutcomeSample {
                components: breakdown(1.0, 0.5, 0.5),
                success: true,
            })
            .collect();
        let adj = reflector.adjust(before, &all_success);
        assert!(!adj.adjusted);
        assert_eq!(adj.after, before);
    }

    #[test]
    fn test_no_signal_leaves_weights() {
        let reflector = MetaReflector::new(config());
        let samples: Vec<OutcomeSample> = (0..6)
            .map(|i| OutcomeSample {
                components: breakdown(1.0, 0.5, 0.5),
                success: i % 2 == 0,
            })
            .collect();
        let adj = reflector.adjust(AllocationWeights::default(), &samples);
        assert!(!adj.adjusted);
        assert_eq!(adj.after, AllocationWeights::default());
    }

    #[test]
    fn test_adjust_respects_bounds() {
        let reflector = MetaReflector::new(ReflectionConfig {
            min_samples: 1,
            learning_rate: 10.0,
            max_step: 1.0,
            min_weight: 0.1,
            max_weight: 0.4,
            ..ReflectionConfig::default()
        });
        let adj = reflector.adjust(AllocationWeights::default(), &load_predicts_success());
        for w in [adj.after.capability, adj.after.load, adj.after.confidence] {
            assert!((0.1..=0.4).contains(&w));
        }
    }

    fn agent(id: &str, load: f64, outcomes: &[bool]) -> AgentRecord {
        let mut a = AgentRecord::new(AgentId::new(id), Vec::<String>::new());
        a.load = load;
        for o in outcomes {
            a.record_outcome(*o);
        }
        a
    }

    #[test]
    fn test_report_flags_overload_and_backlog() {
        let agents = vec![
            agent("a", 0.95, &[true, true]),
            agent("b", 0.85, &[true, false]),
        ];
        let stats = QueueStats {
            pending: 12,
            completed: 1,
            failed: 3,
            ..QueueStats::default()
        };
        let adj = MetaReflector::new(config()).adjust(AllocationWeights::default(), &[]);
        let report = ReflectionReport::build(adj, &[], &agents, &stats);

        assert_eq!(report.system.agent_count, 2);
        assert!((report.system.average_load - 0.9).abs() < 1e-9);
        assert_eq!(report.system.completion_rate, Some(0.25));
        assert_eq!(report.bottlenecks.len(), 2);
        assert!(report.recommendations.iter().any(|r| r.contains("add agents")));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("investigate allocation")));
        assert_eq!(report.most_reliable_agent, Some(AgentId::new("a")));
        assert!(report.success_rate.is_none());
    }

    #[test]
    fn test_report_under_utilized() {
        let agents = vec![agent("a", 0.1, &[]), agent("b", 0.2, &[])];
        let adj = MetaReflector::new(config()).adjust(AllocationWeights::default(), &[]);
        let report = ReflectionReport::build(adj, &[], &agents, &QueueStats::default());
        assert!(report.bottlenecks.is_empty());
        assert_eq!(report.recommendations, vec!["agents under-utilized"]);
        assert!(report.most_reliable_agent.is_none());
        assert!(report.system.completion_rate.is_none());
    }
}
