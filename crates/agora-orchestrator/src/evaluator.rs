use crate::types::{AgentRecord, AgentStatus, AllocationWeights, Proposal};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Per-component view of a proposal's score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub capability_match: f64,
    /// `1 - load`.
    pub load_headroom: f64,
    pub confidence: f64,
    pub total: f64,
}

/// Score one proposal. `None` means the proposal is excluded.
///
/// Pure: the result depends only on the arguments. A proposal is excluded
/// when the agent lacks any required tag, is not Available, or reports a
/// confidence or load that is not a finite value in `[0, 1]`.
pub fn score(
    required: &BTreeSet<String>,
    proposal: &Proposal,
    agent: &AgentRecord,
    weights: &AllocationWeights,
) -> Option<ScoreBreakdown> {
    if agent.status != AgentStatus::Available || proposal.agent_id != agent.id {
        return None;
    }
    if !in_unit_range(proposal.confidence) || !in_unit_range(agent.load) {
        return None;
    }

    let capability_match = if required.is_empty() {
        1.0
    } else {
        let present = required
            .iter()
            .filter(|t| agent.capabilities.contains(*t))
            .count();
        if present < required.len() {
            return None;
        }
        present as f64 / required.len() as f64
    };
    let load_headroom = 1.0 - agent.load;

    let total = weights.capability * capability_match
        + weights.load * load_headroom
        + weights.confidence * proposal.confidence;
    if !total.is_finite() {
        return None;
    }

    Some(ScoreBreakdown {
        capability_match,
        load_headroom,
        confidence: proposal.confidence,
        total,
    })
}

fn in_unit_range(v: f64) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

/// A scored proposal.
#[derive(Debug, Clone)]
pub struct ScoredProposal {
    pub proposal: Proposal,
    pub breakdown: ScoreBreakdown,
}

/// Highest score first; ties go to the earliest submission, then arrival order.
fn rank(a: &ScoredProposal, b: &ScoredProposal) -> Ordering {
    b.breakdown
        .total
        .total_cmp(&a.breakdown.total)
        .then_with(|| a.proposal.submitted_at.cmp(&b.proposal.submitted_at))
        .then_with(|| a.proposal.sequence.cmp(&b.proposal.sequence))
}

/// Score every proposal against its agent record and pick the winner.
///
/// Proposals whose agent has no record are excluded. Returns `None` when
/// everything is excluded.
pub fn select_winner<'a, I>(
    required: &BTreeSet<String>,
    candidates: I,
    weights: &AllocationWeights,
) -> Option<ScoredProposal>
where
    I: IntoIterator<Item = (&'a Proposal, Option<&'a AgentRecord>)>,
{
    candidates
        .into_iter()
        .filter_map(|(proposal, agent)| {
            let breakdown = score(required, proposal, agent?, weights)?;
            Some(ScoredProposal {
                proposal: proposal.clone(),
                breakdown,
            })
        })
        .min_by(rank)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agora_core::AgentId;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn agent(id: &str, caps: &[&str], load: f64) -> AgentRecord {
        let mut record = AgentRecord::new(AgentId::new(id), caps.iter().copied());
        record.load = load;
        record
    }

    fn proposal(agent: &str, confidence: f64, sequence: u64) -> Proposal {
        Proposal {
            task_id: Uuid::nil(),
            agent_id: AgentId::new(agent),
            confidence,
            estimated_cost: 1.0,
            declared_dimensions: BTreeMap::new(),
            submitted_at: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_score_formula() {
        let w = AllocationWeights::default();
        let a = agent("a1", &["vision", "nlp"], 0.2);
        let p = proposal("a1", 0.5, 0);
        let s = score(&tags(&["vision"]), &p, &a, &w).unwrap();
        assert!((s.capability_match - 1.0).abs() < 1e-12);
        assert!((s.load_headroom - 0.8).abs() < 1e-12);
        // 0.5*1 + 0.3*0.8 + 0.2*0.5
        assert!((s.total - 0.84).abs() < 1e-12);
    }

    #[test]
    fn test_missing_capability_always_excludes() {
        let w = AllocationWeights::new(0.0, 1.0, 1.0);
        let a = agent("a2", &["nlp"], 0.0);
        let p = proposal("a2", 1.0, 0);
        assert!(score(&tags(&["vision"]), &p, &a, &w).is_none());
        assert!(score(&tags(&["vision", "nlp"]), &p, &a, &w).is_none());
    }

    #[test]
    fn test_empty_requirement_matches_everyone() {
        let w = AllocationWeights::default();
        let a = agent("a", &[], 0.5);
        let s = score(&BTreeSet::new(), &proposal("a", 0.5, 0), &a, &w).unwrap();
        assert!((s.capability_match - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_bad_inputs_are_excluded() {
        let w = AllocationWeights::default();
        let a = agent("a", &[], 0.1);
        assert!(score(&BTreeSet::new(), &proposal("a", f64::NAN, 0), &a, &w).is_none());
        assert!(score(&BTreeSet::new(), &proposal("a", 1.5, 0), &a, &w).is_none());

        let mut busy = agent("a", &[], 0.1);
        busy.status = AgentStatus::Busy;
        assert!(score(&BTreeSet::new(), &proposal("a", 0.5, 0), &busy, &w).is_none());

        let other = agent("b", &[], 0.1);
        assert!(score(&BTreeSet::new(), &proposal("a", 0.5, 0), &other, &w).is_none());
    }

    #[test]
    fn test_score_is_pure() {
        let w = AllocationWeights::default();
        let a = agent("a", &["x"], 0.3);
        let p = proposal("a", 0.9, 0);
        let first = score(&tags(&["x"]), &p, &a, &w);
        for _ in 0..10 {
            assert_eq!(score(&tags(&["x"]), &p, &a, &w), first);
        }
    }

    #[test]
    fn test_capability_excluded_agent_loses() {
        let w = AllocationWeights::default();
        let a1 = agent("agent1", &["vision", "nlp"], 0.2);
        let a2 = agent("agent2", &["nlp"], 0.1);
        let p1 = proposal("agent1", 0.5, 0);
        let p2 = proposal("agent2", 0.9, 1);

        let winner = select_winner(
            &tags(&["vision"]),
            [(&p1, Some(&a1)), (&p2, Some(&a2))],
            &w,
        )
        .unwrap();
        assert_eq!(winner.proposal.agent_id.as_str(), "agent1");
    }

    #[test]
    fn test_tie_breaks_on_submission_then_sequence() {
        let w = AllocationWeights::default();
        let a = agent("a", &[], 0.5);
        let b = agent("b", &[], 0.5);
        let mut pa = proposal("a", 0.5, 1);
        let mut pb = proposal("b", 0.5, 0);
        let t = Utc::now();
        pa.submitted_at = t;
        pb.submitted_at = t + Duration::milliseconds(5);

        let winner =
            select_winner(&BTreeSet::new(), [(&pa, Some(&a)), (&pb, Some(&b))], &w).unwrap();
        assert_eq!(winner.proposal.agent_id.as_str(), "a");

        pb.submitted_at = t;
        let winner =
            select_winner(&BTreeSet::new(), [(&pa, Some(&a)), (&pb, Some(&b))], &w).unwrap();
        assert_eq!(winner.proposal.agent_id.as_str(), "b");
    }

    #[test]
    fn test_all_excluded_yields_none() {
        let w = AllocationWeights::default();
        let p = proposal("ghost", 0.5, 0);
        assert!(select_winner(&BTreeSet::new(), [(&p, None)], &w).is_none());
    }
}
