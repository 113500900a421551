//! Conflict resolution across per-policy outcomes

use aegis_core::{DecisionOutcome, PolicyDecision};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Strategy applied when several policies each produce an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStrategy {
    /// Highest-priority outcome wins; ties broken by source order
    #[default]
    Priority,

    /// Any deny wins
    Strict,

    /// Any permit wins, provided no deny exists
    Permissive,

    /// Majority outcome; ties resolve to deny
    Consensus,
}

impl std::str::FromStr for ConflictStrategy {
    type Err = aegis_core::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "priority" => Ok(Self::Priority),
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            "consensus" => Ok(Self::Consensus),
            other => Err(aegis_core::Error::config(format!(
                "unknown conflict strategy: {}",
                other
            ))),
        }
    }
}

/// Resolve candidate decisions into one.
///
/// Candidates arrive ordered by descending policy priority (the selection
/// order), so under `Priority` the first one wins. The winner absorbs the
/// constraints and obligations of every candidate that shares its outcome,
/// deduplicated by descriptor key.
pub fn resolve(strategy: ConflictStrategy, mut candidates: Vec<PolicyDecision>) -> PolicyDecision {
    if candidates.is_empty() {
        return PolicyDecision::not_applicable();
    }
    if candidates.len() == 1 {
        return candidates.remove(0);
    }

    let denies = candidates
        .iter()
        .filter(|d| d.outcome != DecisionOutcome::Permit)
        .count();
    let permits = candidates.len() - denies;

    let winner_index = match strategy {
        ConflictStrategy::Priority => 0,
        ConflictStrategy::Strict => {
            if denies > 0 {
                first_with(&candidates, |d| d.outcome != DecisionOutcome::Permit)
            } else {
                0
            }
        }
        ConflictStrategy::Permissive => {
            let has_deny = candidates
                .iter()
                .any(|d| d.outcome == DecisionOutcome::Deny);
            if !has_deny && permits > 0 {
                first_with(&candidates, |d| d.outcome == DecisionOutcome::Permit)
            } else {
                first_with(&candidates, |d| d.outcome != DecisionOutcome::Permit)
            }
        }
        ConflictStrategy::Consensus => {
            if permits > denies {
                first_with(&candidates, |d| d.outcome == DecisionOutcome::Permit)
            } else {
                first_with(&candidates, |d| d.outcome != DecisionOutcome::Permit)
            }
        }
    };

    let mut winner = candidates.swap_remove(winner_index);

    // Union enforcement descriptors from every agreeing candidate.
    let mut seen: HashSet<String> = winner.constraints.iter().map(|c| c.dedup_key()).collect();
    let mut seen_obligations: HashSet<String> =
        winner.obligations.iter().map(|o| o.dedup_key()).collect();
    for other in candidates {
        if other.outcome != winner.outcome {
            continue;
        }
        for constraint in other.constraints {
            if seen.insert(constraint.dedup_key()) {
                winner.constraints.push(constraint);
            }
        }
        for obligation in other.obligations {
            if seen_obligations.insert(obligation.dedup_key()) {
                winner.obligations.push(obligation);
            }
        }
    }

    winner
}

fn first_with(candidates: &[PolicyDecision], pred: impl Fn(&PolicyDecision) -> bool) -> usize {
    candidates.iter().position(pred).unwrap_or(0)
}
