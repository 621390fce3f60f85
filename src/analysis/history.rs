//! Cross-run finding history.
//!
//! Runs read an immutable [`HistorySnapshot`] before aggregating and append
//! their active findings afterwards. Appends never disturb snapshots that
//! are already handed out.

use super::aggregator::DedupPolicy;
use crate::models::{Category, Finding, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// What is remembered about an active finding from an earlier run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalFinding {
    pub run_id: String,
    pub category: Category,
    pub evidence: BTreeMap<String, String>,
}

/// Read-only view of the history at one point in time.
#[derive(Debug, Clone, Default)]
pub struct HistorySnapshot {
    entries: Arc<Vec<HistoricalFinding>>,
}

impl HistorySnapshot {
    #[cfg(test)]
    pub fn empty() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an earlier run reported a duplicate of `finding`.
    pub fn seen(&self, finding: &Finding, policy: &DedupPolicy) -> bool {
        self.entries.iter().any(|h| {
            policy.is_duplicate_evidence(
                finding.category,
                &finding.evidence,
                h.category,
                &h.evidence,
            )
        })
    }
}

/// Append-only store of findings from completed runs.
#[derive(Debug, Default)]
pub struct DedupHistory {
    entries: RwLock<Arc<Vec<HistoricalFinding>>>,
}

impl DedupHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        HistorySnapshot {
            entries: Arc::clone(&*entries),
        }
    }

    /// Record the active findings of an aggregated run.
    ///
    /// Findings already marked recurring, or duplicating an entry, are not
    /// stored again; neither are findings without any key-set evidence,
    /// which can never match. Returns the number of entries added.
    pub fn append(&self, result: &RunResult, policy: &DedupPolicy) -> usize {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut fresh: Vec<HistoricalFinding> = Vec::new();
        for merged in result.findings.iter().filter(|m| !m.recurring) {
            let finding = &merged.finding;
            if !policy.is_matchable(&finding.evidence) {
                continue;
            }
            let known = entries.iter().chain(fresh.iter()).any(|h| {
                policy.is_duplicate_evidence(
                    finding.category,
                    &finding.evidence,
                    h.category,
                    &h.evidence,
                )
            });
            if !known {
                fresh.push(HistoricalFinding {
                    run_id: result.run_id.clone(),
                    category: finding.category,
                    evidence: finding.evidence.clone(),
                });
            }
        }

        let added = fresh.len();
        if added > 0 {
            Arc::make_mut(&mut *entries).extend(fresh);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FindingId, MergedFinding, RunStatus, Severity};
    use chrono::Utc;

    fn result_with(findings: Vec<Finding>) -> RunResult {
        RunResult {
            run_id: "run-1".to_string(),
            correlation_id: "run-1".to_string(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            outcomes: Vec::new(),
            findings: findings
                .into_iter()
                .enumerate()
                .map(|(i, finding)| MergedFinding {
                    id: FindingId::new("security", i),
                    source_agent: "security".to_string(),
                    finding,
                    deduplicated_from: Vec::new(),
                    superseded_by: None,
                    recurring: false,
                })
                .collect(),
            superseded: Vec::new(),
            run_status: RunStatus::Complete,
            threat_level: Severity::Info,
            recommendations: Vec::new(),
        }
    }

    fn secret_read(user: &str) -> Finding {
        Finding::new(Category::Security, Severity::High, "secret read")
            .with_evidence("user_id", user)
            .with_evidence("action_name", "getSecret")
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_appends() {
        let history = DedupHistory::new();
        let before = history.snapshot();

        history.append(&result_with(vec![secret_read("a@corp.com")]), &DedupPolicy::default());
        let after = history.snapshot();

        assert!(before.is_empty());
        assert_eq!(after.len(), 1);

        let policy = DedupPolicy::default();
        assert!(after.seen(&secret_read("a@corp.com"), &policy));
        assert!(!before.seen(&secret_read("a@corp.com"), &policy));
    }

    #[test]
    fn test_seen_requires_same_category() {
        let history = DedupHistory::new();
        history.append(&result_with(vec![secret_read("a@corp.com")]), &DedupPolicy::default());

        let mut network = secret_read("a@corp.com");
        network.category = Category::Network;
        assert!(!history.snapshot().seen(&network, &DedupPolicy::default()));
    }

    #[test]
    fn test_append_skips_known_and_recurring_findings() {
        let history = DedupHistory::new();
        let policy = DedupPolicy::default();

        // Same observation twice in one run is stored once.
        let first = result_with(vec![secret_read("a@corp.com"), secret_read("A@corp.com ")]);
        assert_eq!(history.append(&first, &policy), 1);

        for _ in 0..10 {
            assert_eq!(history.append(&first, &policy), 0);
        }

        let mut network = secret_read("a@corp.com");
        network.category = Category::Network;
        let mut repeat = result_with(vec![network]);
        repeat.findings[0].recurring = true;
        assert_eq!(history.append(&repeat, &policy), 0);

        let bare = Finding::new(Category::Security, Severity::Low, "no evidence");
        assert_eq!(history.append(&result_with(vec![bare]), &policy), 0);

        assert_eq!(history.snapshot().len(), 1);
    }
}
