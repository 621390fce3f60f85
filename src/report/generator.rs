//! Markdown and JSON report generation.
//!
//! This module renders a finalized run and its evaluation into the
//! documents handed to people: a Markdown report and a JSON document.

use crate::models::{
    AgentOutcome, Category, EvaluationRecord, MergedFinding, RunResult, RunStatus, ScoreState,
    Severity,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// JSON shape of a delivered report.
#[derive(Debug, Serialize)]
pub struct ReportDocument<'a> {
    pub run: &'a RunResult,
    pub evaluation: &'a EvaluationRecord,
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(result: &RunResult, evaluation: &EvaluationRecord) -> String {
    let mut output = String::new();

    output.push_str("# Insight Agent Report\n\n");
    output.push_str(&generate_status_banner(result));
    output.push_str(&generate_metadata_section(result));
    output.push_str(&generate_summary_section(result));
    output.push_str(&generate_outcomes_section(&result.outcomes));
    output.push_str(&generate_findings_section(&result.findings));
    output.push_str(&generate_evaluation_section(evaluation));
    output.push_str(&generate_recommendations_section(&result.recommendations));
    output.push_str(&generate_footer());

    output
}

/// Generate a JSON report.
pub fn generate_json_report(
    result: &RunResult,
    evaluation: &EvaluationRecord,
) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&ReportDocument {
        run: result,
        evaluation,
    })
}

/// Warn readers up front when agents did not complete.
fn generate_status_banner(result: &RunResult) -> String {
    let failed: Vec<&AgentOutcome> = result.failed_outcomes().collect();
    match result.run_status {
        RunStatus::Complete => String::new(),
        RunStatus::PartialFailure => format!(
            "> ⚠️ **PARTIAL FAILURE:** {} of {} agents did not complete ({}). Findings below are incomplete.\n\n",
            failed.len(),
            result.outcomes.len(),
            agent_list(&failed)
        ),
        RunStatus::Failed => format!(
            "> ❌ **FAILED:** no agent completed ({}). This report contains no findings.\n\n",
            agent_list(&failed)
        ),
    }
}

fn agent_list(outcomes: &[&AgentOutcome]) -> String {
    outcomes
        .iter()
        .map(|o| format!("`{}`", o.agent_name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn generate_metadata_section(result: &RunResult) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Run ID:** `{}`\n", result.run_id));
    if result.correlation_id != result.run_id {
        section.push_str(&format!(
            "- **Correlation ID:** `{}`\n",
            result.correlation_id
        ));
    }
    section.push_str(&format!(
        "- **Window:** {} to {}\n",
        result.window_start.format("%Y-%m-%d %H:%M:%S UTC"),
        result.window_end.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Run Status:** {}\n", result.run_status));
    section.push_str(&format!(
        "- **Threat Level:** {} {}\n",
        result.threat_level.emoji(),
        result.threat_level
    ));
    section.push('\n');

    section
}

fn generate_summary_section(result: &RunResult) -> String {
    let mut section = String::new();
    section.push_str("## Summary\n\n");

    let mut by_severity: BTreeMap<Severity, usize> = BTreeMap::new();
    let mut by_category: BTreeMap<Category, usize> = BTreeMap::new();
    for merged in &result.findings {
        *by_severity.entry(merged.finding.severity).or_default() += 1;
        *by_category.entry(merged.finding.category).or_default() += 1;
    }
    let count = |severity: Severity| by_severity.get(&severity).copied().unwrap_or(0);

    section.push_str("### Finding Severity Breakdown\n\n");
    section.push_str(&format!(
        "| {} Critical | {} High | {} Medium | {} Low | {} Info | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::High.emoji(),
        Severity::Medium.emoji(),
        Severity::Low.emoji(),
        Severity::Info.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | {} | **{}** |\n\n",
        count(Severity::Critical),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low),
        count(Severity::Info),
        result.findings.len()
    ));

    if !by_category.is_empty() {
        section.push_str("### Findings by Category\n\n");
        section.push_str("| Category | Count |\n");
        section.push_str("|:---|:---:|\n");
        for (category, count) in &by_category {
            section.push_str(&format!("| {} | {} |\n", category, count));
        }
        section.push('\n');
    }

    if !result.superseded.is_empty() {
        section.push_str(&format!(
            "*{} duplicate finding(s) were merged into higher-confidence findings.*\n\n",
            result.superseded.len()
        ));
    }

    section
}

fn generate_outcomes_section(outcomes: &[AgentOutcome]) -> String {
    let mut section = String::new();

    section.push_str("## Agent Outcomes\n\n");
    section.push_str("| Agent | Status | Attempts | Duration | Findings | Error |\n");
    section.push_str("|:---|:---|:---:|:---:|:---:|:---|\n");

    for outcome in outcomes {
        let status = if outcome.is_success() {
            format!("✅ {}", outcome.status)
        } else {
            format!("❌ {}", outcome.status)
        };
        let error = outcome
            .error
            .as_ref()
            .map(|e| e.to_string().replace('|', "\\|"))
            .unwrap_or_default();
        section.push_str(&format!(
            "| {} | {} | {} | {:.1}s | {} | {} |\n",
            outcome.agent_name,
            status,
            outcome.attempt_count,
            outcome.duration.as_secs_f64(),
            outcome.findings.len(),
            error
        ));
    }
    section.push('\n');

    section
}

fn generate_findings_section(findings: &[MergedFinding]) -> String {
    let mut section = String::new();

    section.push_str("## Findings\n\n");

    if findings.is_empty() {
        section.push_str("No findings were reported for this window.\n\n");
        return section;
    }

    // Most severe first; ids keep the order stable.
    let mut sorted: Vec<&MergedFinding> = findings.iter().collect();
    sorted.sort_by(|a, b| {
        b.finding
            .severity
            .cmp(&a.finding.severity)
            .then_with(|| a.id.cmp(&b.id))
    });

    for merged in sorted {
        section.push_str(&generate_finding_block(merged));
    }

    section
}

fn severity_badge(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🔴 **CRITICAL**",
        Severity::High => "🟠 **HIGH**",
        Severity::Medium => "🟡 **MEDIUM**",
        Severity::Low => "🟢 **LOW**",
        Severity::Info => "🔵 **INFO**",
    }
}

fn generate_finding_block(merged: &MergedFinding) -> String {
    let mut block = String::new();
    let finding = &merged.finding;

    block.push_str(&format!(
        "### {} {} - {}\n\n",
        severity_badge(finding.severity),
        finding.category,
        finding.description
    ));

    block.push_str(&format!(
        "**Source:** `{}` | **Confidence:** {:.0}%",
        merged.id,
        finding.confidence * 100.0
    ));
    if merged.recurring {
        block.push_str(" | 🔁 **Recurring**");
    }
    block.push_str("\n\n");

    if !finding.evidence.is_empty() {
        block.push_str("| Evidence | Value |\n");
        block.push_str("|:---|:---|\n");
        for (key, value) in &finding.evidence {
            block.push_str(&format!("| {} | `{}` |\n", key, value.replace('|', "\\|")));
        }
        block.push('\n');
    }

    if !merged.deduplicated_from.is_empty() {
        let ids: Vec<String> = merged
            .deduplicated_from
            .iter()
            .map(|id| format!("`{}`", id))
            .collect();
        block.push_str(&format!("> Also reported as: {}\n\n", ids.join(", ")));
    }

    block.push_str("---\n\n");

    block
}

fn generate_evaluation_section(evaluation: &EvaluationRecord) -> String {
    let mut section = String::new();

    section.push_str("## Evaluation\n\n");

    match evaluation.state {
        ScoreState::Scored => {
            if let Some(score) = evaluation.aggregate_score {
                section.push_str(&format!("**Aggregate score:** {:.2}\n\n", score));
            }
        }
        ScoreState::Unscored { ref reason } => {
            section.push_str(&format!("**Unscored:** {}\n\n", reason));
        }
    }

    if !evaluation.agent_scores.is_empty() {
        section.push_str("| Agent | Score | Confidence | Latency | Completeness |\n");
        section.push_str("|:---|:---:|:---:|:---:|:---:|\n");
        for (agent, score) in &evaluation.agent_scores {
            section.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                agent,
                format_term(score.score),
                format_term(score.confidence_term),
                format_term(score.latency_term),
                format_term(score.completeness_term)
            ));
        }
        section.push('\n');
    }

    section
}

fn format_term(term: Option<f64>) -> String {
    term.map(|t| format!("{:.2}", t))
        .unwrap_or_else(|| "n/a".to_string())
}

fn generate_recommendations_section(recommendations: &[String]) -> String {
    if recommendations.is_empty() {
        return String::new();
    }

    let mut section = String::new();

    section.push_str("## Recommendations\n\n");
    for (i, rec) in recommendations.iter().enumerate() {
        section.push_str(&format!("{}. {}\n", i + 1, rec));
    }
    section.push('\n');

    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by insight-agent v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use crate::models::{Finding, FindingId};
    use chrono::Utc;
    use std::time::Duration;

    fn merged(agent: &str, index: usize, severity: Severity) -> MergedFinding {
        MergedFinding {
            id: FindingId::new(agent, index),
            source_agent: agent.to_string(),
            finding: Finding::new(Category::Security, severity, "Secret read from external IP")
                .with_evidence("source_ip_address", "203.0.113.1")
                .with_confidence(0.9),
            deduplicated_from: vec![FindingId::new("network", 0)],
            superseded_by: None,
            recurring: true,
        }
    }

    fn create_test_result(run_status: RunStatus) -> RunResult {
        RunResult {
            run_id: "7d0c7a1e-0000-4000-8000-000000000000".to_string(),
            correlation_id: "nightly".to_string(),
            window_start: Utc::now(),
            window_end: Utc::now(),
            outcomes: vec![
                AgentOutcome::timed_out(
                    "network",
                    Duration::from_secs(10),
                    Duration::from_secs(30),
                    3,
                ),
                AgentOutcome::succeeded(
                    "security",
                    vec![merged("security", 0, Severity::High).finding],
                    Duration::from_millis(1500),
                    1,
                ),
            ],
            findings: vec![merged("security", 0, Severity::High)],
            superseded: Vec::new(),
            run_status,
            threat_level: Severity::High,
            recommendations: vec!["Rotate exposed secrets".to_string()],
        }
    }

    #[test]
    fn test_generate_markdown_report() {
        let result = create_test_result(RunStatus::PartialFailure);
        let evaluation = EvaluationRecord::unscored(&result.run_id, "evaluation failed");
        let markdown = generate_markdown_report(&result, &evaluation);

        assert!(markdown.contains("# Insight Agent Report"));
        assert!(markdown.contains("PARTIAL FAILURE"));
        assert!(markdown.contains("`network`"));
        assert!(markdown.contains("## Agent Outcomes"));
        assert!(markdown.contains("Timed out"));
        assert!(markdown.contains("timed out after 10000 ms"));
        assert!(markdown.contains("HIGH"));
        assert!(markdown.contains("Recurring"));
        assert!(markdown.contains("Also reported as: `network#0`"));
        assert!(markdown.contains("**Unscored:** evaluation failed"));
        assert!(markdown.contains("1. Rotate exposed secrets"));
        assert!(markdown.contains("**Correlation ID:** `nightly`"));
    }

    #[test]
    fn test_complete_run_has_no_banner() {
        let result = create_test_result(RunStatus::Complete);
        assert!(generate_status_banner(&result).is_empty());
    }

    #[test]
    fn test_failed_banner_lists_agents() {
        let mut result = create_test_result(RunStatus::Failed);
        result.outcomes = vec![AgentOutcome::failed(
            "security",
            AgentError::fatal("401"),
            Duration::ZERO,
            1,
        )];
        let banner = generate_status_banner(&result);
        assert!(banner.contains("FAILED"));
        assert!(banner.contains("`security`"));
    }

    #[test]
    fn test_generate_json_report() {
        let result = create_test_result(RunStatus::PartialFailure);
        let evaluation = EvaluationRecord::unscored(&result.run_id, "no agent succeeded");
        let json = generate_json_report(&result, &evaluation).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["run"]["run_status"], "partial_failure");
        assert_eq!(value["evaluation"]["state"]["state"], "unscored");
        assert!(value["evaluation"]["aggregate_score"].is_null());
    }
}
