//! Merging agent outcomes into one run result.
//!
//! Aggregation is a pure function of the run context, the outcomes and a
//! history snapshot: the same inputs always serialize to the same bytes.

use super::history::HistorySnapshot;
use crate::error::InvariantViolation;
use crate::models::{
    AgentOutcome, AgentStatus, Category, Finding, FindingId, MergedFinding, RunContext,
    RunResult, RunStatus, Severity,
};
use std::collections::{BTreeMap, BTreeSet};

/// Evidence keys compared when looking for duplicates.
pub const DEFAULT_DEDUP_KEYS: &[&str] =
    &["source_ip_address", "user_id", "action_name", "service_name"];
pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.5;

/// When two findings count as the same observation.
#[derive(Debug, Clone, PartialEq)]
pub struct DedupPolicy {
    pub key_set: Vec<String>,
    /// Minimum similarity (inclusive) in `[0, 1]`.
    pub threshold: f64,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            key_set: DEFAULT_DEDUP_KEYS.iter().map(|k| k.to_string()).collect(),
            threshold: DEFAULT_DEDUP_THRESHOLD,
        }
    }
}

impl DedupPolicy {
    /// Fraction of key-set fields present in either finding that match.
    ///
    /// `None` when the categories differ or neither finding carries any
    /// key-set evidence.
    pub fn similarity(&self, a: &Finding, b: &Finding) -> Option<f64> {
        self.evidence_similarity(a.category, &a.evidence, b.category, &b.evidence)
    }

    pub(crate) fn is_duplicate_evidence(
        &self,
        a_category: Category,
        a: &BTreeMap<String, String>,
        b_category: Category,
        b: &BTreeMap<String, String>,
    ) -> bool {
        self.evidence_similarity(a_category, a, b_category, b)
            .map_or(false, |score| score >= self.threshold)
    }

    /// Whether the evidence carries any key-set field, so it can match at all.
    pub(crate) fn is_matchable(&self, evidence: &BTreeMap<String, String>) -> bool {
        self.key_set.iter().any(|key| {
            evidence
                .get(key)
                .map_or(false, |value| !value.trim().is_empty())
        })
    }

    fn evidence_similarity(
        &self,
        a_category: Category,
        a: &BTreeMap<String, String>,
        b_category: Category,
        b: &BTreeMap<String, String>,
    ) -> Option<f64> {
        if a_category != b_category {
            return None;
        }

        let mut present = 0usize;
        let mut matching = 0usize;
        for key in &self.key_set {
            let left = a.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
            let right = b.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());
            match (left, right) {
                (None, None) => continue,
                (Some(l), Some(r)) if l.eq_ignore_ascii_case(r) => {
                    present += 1;
                    matching += 1;
                }
                _ => present += 1,
            }
        }

        (present > 0).then(|| matching as f64 / present as f64)
    }
}

/// Merges outcomes, resolves duplicates, derives run-level fields.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    policy: DedupPolicy,
}

impl Aggregator {
    pub fn new(policy: DedupPolicy) -> Self {
        Self { policy }
    }

    pub fn aggregate(
        &self,
        context: &RunContext,
        outcomes: &[AgentOutcome],
        history: &HistorySnapshot,
    ) -> Result<RunResult, InvariantViolation> {
        if context.dataset_ref.is_none() {
            return Err(InvariantViolation::UnboundDataset);
        }
        validate_outcomes(outcomes)?;
        let run_status = RunStatus::from_outcomes(outcomes).ok_or(InvariantViolation::NoOutcomes)?;

        let (mut findings, superseded) = self.merge(outcomes);
        for merged in &mut findings {
            merged.recurring = history.seen(&merged.finding, &self.policy);
        }

        let threat_level = findings
            .iter()
            .map(|m| m.finding.severity)
            .max()
            .unwrap_or(Severity::Info);
        let recommendations = recommendations(threat_level, &findings, outcomes);

        Ok(RunResult {
            run_id: context.run_id.clone(),
            correlation_id: context.correlation_id.clone(),
            window_start: context.window_start,
            window_end: context.window_end,
            outcomes: outcomes.to_vec(),
            findings,
            superseded,
            run_status,
            threat_level,
            recommendations,
        })
    }

    /// Fold findings in registration order into active and superseded sets.
    fn merge(&self, outcomes: &[AgentOutcome]) -> (Vec<MergedFinding>, Vec<MergedFinding>) {
        let mut active: Vec<MergedFinding> = Vec::new();
        let mut superseded: Vec<MergedFinding> = Vec::new();

        let candidates = outcomes.iter().flat_map(|outcome| {
            outcome
                .findings
                .iter()
                .enumerate()
                .map(move |(index, finding)| MergedFinding {
                    id: FindingId::new(&outcome.agent_name, index),
                    source_agent: outcome.agent_name.clone(),
                    finding: finding.clone(),
                    deduplicated_from: Vec::new(),
                    superseded_by: None,
                    recurring: false,
                })
        });

        for mut candidate in candidates {
            // Best match: highest similarity, earliest on ties.
            let mut best: Option<(usize, f64)> = None;
            for (i, existing) in active.iter().enumerate() {
                let Some(score) = self.policy.similarity(&existing.finding, &candidate.finding)
                else {
                    continue;
                };
                if score >= self.policy.threshold && best.map_or(true, |(_, s)| score > s) {
                    best = Some((i, score));
                }
            }

            let Some((slot, _)) = best else {
                active.push(candidate);
                continue;
            };

            if candidate.finding.confidence > active[slot].finding.confidence {
                let winner_id = candidate.id.clone();
                let mut loser = std::mem::replace(&mut active[slot], candidate);

                for earlier in superseded
                    .iter_mut()
                    .filter(|s| s.superseded_by.as_ref() == Some(&loser.id))
                {
                    earlier.superseded_by = Some(winner_id.clone());
                }
                let mut folded = std::mem::take(&mut loser.deduplicated_from);
                folded.push(loser.id.clone());
                active[slot].deduplicated_from = folded;

                loser.superseded_by = Some(winner_id);
                superseded.push(loser);
            } else {
                candidate.superseded_by = Some(active[slot].id.clone());
                active[slot].deduplicated_from.push(candidate.id.clone());
                superseded.push(candidate);
            }
        }

        (active, superseded)
    }
}

fn validate_outcomes(outcomes: &[AgentOutcome]) -> Result<(), InvariantViolation> {
    if outcomes.is_empty() {
        return Err(InvariantViolation::NoOutcomes);
    }

    let mut seen = BTreeSet::new();
    for outcome in outcomes {
        if !seen.insert(outcome.agent_name.as_str()) {
            return Err(InvariantViolation::DuplicateAgent {
                agent: outcome.agent_name.clone(),
            });
        }

        let inconsistent = |detail: &str| InvariantViolation::InconsistentOutcome {
            agent: outcome.agent_name.clone(),
            detail: detail.to_string(),
        };
        match outcome.status {
            AgentStatus::Succeeded if outcome.error.is_some() => {
                return Err(inconsistent("succeeded with an error attached"));
            }
            AgentStatus::Succeeded => {}
            _ if outcome.error.is_none() => {
                return Err(inconsistent("unsuccessful without an error"));
            }
            _ if !outcome.findings.is_empty() => {
                return Err(inconsistent("unsuccessful but carries findings"));
            }
            _ => {}
        }
    }
    Ok(())
}

fn recommendations(
    threat_level: Severity,
    findings: &[MergedFinding],
    outcomes: &[AgentOutcome],
) -> Vec<String> {
    let mut recommendations = Vec::new();

    match threat_level {
        Severity::Critical | Severity::High => recommendations.push(
            "Immediate security review required - check for unauthorized access attempts"
                .to_string(),
        ),
        Severity::Medium => recommendations
            .push("Monitor user activities closely and review access permissions".to_string()),
        Severity::Low | Severity::Info => {}
    }

    let external_network = findings.iter().any(|m| {
        m.finding.category == Category::Network && m.finding.severity >= Severity::Medium
    });
    if external_network {
        recommendations.push(
            "Review network access patterns and consider restricting access to known IP ranges"
                .to_string(),
        );
    }

    let recurring = findings.iter().filter(|m| m.recurring).count();
    if recurring > 0 {
        recommendations.push(format!(
            "{} finding(s) also appeared in earlier runs - address the underlying cause",
            recurring
        ));
    }

    for outcome in outcomes.iter().filter(|o| !o.is_success()) {
        let reason = outcome
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        recommendations.push(format!(
            "Agent '{}' did not complete ({}): {} - its coverage is missing from this run",
            outcome.agent_name, outcome.status, reason
        ));
    }

    recommendations.extend([
        "Regular security audits recommended".to_string(),
        "Implement automated alerting for high-risk activities".to_string(),
    ]);
    recommendations
}
