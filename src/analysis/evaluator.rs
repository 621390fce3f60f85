//! Run quality scoring.
//!
//! Each succeeded agent is scored from up to three terms (confidence,
//! latency, completeness). Terms that cannot be computed are left out and
//! the remaining weights renormalized; they are never counted as zero.

use crate::error::EvaluationError;
use crate::models::{AgentOutcome, AgentScore, EvaluationRecord, RunResult, ScoreState};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Weights and bounds used when scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPolicy {
    pub confidence_weight: f64,
    pub latency_weight: f64,
    pub completeness_weight: f64,
    /// Findings above this confidence count as confident.
    pub confidence_floor: f64,
    /// Durations at or beyond this score zero on latency.
    pub latency_ceiling: Duration,
    /// Per-agent weight in the aggregate; unlisted agents weigh 1.0.
    pub agent_weights: BTreeMap<String, f64>,
}

impl Default for EvaluationPolicy {
    fn default() -> Self {
        Self {
            confidence_weight: 0.4,
            latency_weight: 0.3,
            completeness_weight: 0.3,
            confidence_floor: 0.6,
            latency_ceiling: Duration::from_secs(120),
            agent_weights: BTreeMap::new(),
        }
    }
}

impl EvaluationPolicy {
    pub fn validate(&self) -> Result<(), EvaluationError> {
        let terms = [
            ("confidence", self.confidence_weight),
            ("latency", self.latency_weight),
            ("completeness", self.completeness_weight),
        ];
        if let Some((name, weight)) = terms
            .iter()
            .find(|(_, w)| !w.is_finite() || *w < 0.0)
        {
            return Err(EvaluationError::InvalidWeights {
                detail: format!("{} weight is {}", name, weight),
            });
        }
        if terms.iter().all(|(_, w)| *w == 0.0) {
            return Err(EvaluationError::InvalidWeights {
                detail: "all term weights are zero".to_string(),
            });
        }
        if let Some((agent, weight)) = self
            .agent_weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(EvaluationError::InvalidWeights {
                detail: format!("agent {} weight is {}", agent, weight),
            });
        }
        if self.latency_ceiling.is_zero() {
            return Err(EvaluationError::InvalidWeights {
                detail: "latency ceiling is zero".to_string(),
            });
        }
        Ok(())
    }

    fn agent_weight(&self, agent_name: &str) -> f64 {
        self.agent_weights.get(agent_name).copied().unwrap_or(1.0)
    }
}

/// What is known independently of the agents about the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroundTruth {
    pub window_has_activity: bool,
}

#[derive(Debug, Clone)]
pub struct Evaluator {
    policy: EvaluationPolicy,
}

impl Evaluator {
    pub fn new(policy: EvaluationPolicy) -> Result<Self, EvaluationError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn evaluate(
        &self,
        result: &RunResult,
        ground_truth: Option<GroundTruth>,
    ) -> Result<EvaluationRecord, EvaluationError> {
        let mut agent_scores = BTreeMap::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        for outcome in &result.outcomes {
            let score = if outcome.is_success() {
                self.score_agent(outcome, ground_truth)?
            } else {
                AgentScore::unscored()
            };

            if let Some(value) = score.score {
                let weight = self.policy.agent_weight(&outcome.agent_name);
                weighted_sum += weight * value;
                weight_total += weight;
            }
            agent_scores.insert(outcome.agent_name.clone(), score);
        }

        let succeeded = result.outcomes.iter().filter(|o| o.is_success()).count();
        let (aggregate_score, state) = if succeeded == 0 {
            (
                None,
                ScoreState::Unscored {
                    reason: "no agent succeeded".to_string(),
                },
            )
        } else if weight_total == 0.0 {
            (
                None,
                ScoreState::Unscored {
                    reason: "no succeeded agent carries any score weight".to_string(),
                },
            )
        } else {
            let aggregate = weighted_sum / weight_total;
            if !weighted_sum.is_finite() || !weight_total.is_finite() || !aggregate.is_finite() {
                return Err(EvaluationError::NonFinite {
                    subject: "the aggregate".to_string(),
                });
            }
            (Some(aggregate), ScoreState::Scored)
        };

        debug!(
            run_id = %result.run_id,
            "Evaluated {} agent(s), aggregate {:?}",
            agent_scores.len(),
            aggregate_score
        );

        Ok(EvaluationRecord {
            run_id: result.run_id.clone(),
            agent_scores,
            aggregate_score,
            state,
            generated_at: Utc::now(),
        })
    }

    fn score_agent(
        &self,
        outcome: &AgentOutcome,
        ground_truth: Option<GroundTruth>,
    ) -> Result<AgentScore, EvaluationError> {
        let policy = &self.policy;

        let confidence_term = (!outcome.findings.is_empty()).then(|| {
            let confident = outcome
                .findings
                .iter()
                .filter(|f| f.confidence > policy.confidence_floor)
                .count();
            confident as f64 / outcome.findings.len() as f64
        });

        let ratio = outcome.duration.as_secs_f64() / policy.latency_ceiling.as_secs_f64();
        let latency_term = Some(1.0 - ratio.min(1.0));

        let completeness_term = ground_truth
            .filter(|truth| truth.window_has_activity)
            .map(|_| if outcome.findings.is_empty() { 0.0 } else { 1.0 });

        let terms = [
            (confidence_term, policy.confidence_weight),
            (latency_term, policy.latency_weight),
            (completeness_term, policy.completeness_weight),
        ];
        let (sum, total) = terms
            .iter()
            .filter_map(|(term, weight)| term.map(|t| (t * weight, *weight)))
            .fold((0.0, 0.0), |(s, w), (ts, tw)| (s + ts, w + tw));

        // Every present term carries zero weight.
        if total == 0.0 {
            return Ok(AgentScore {
                score: None,
                confidence_term,
                latency_term,
                completeness_term,
            });
        }
        let score = sum / total;
        if !score.is_finite() {
            return Err(EvaluationError::NonFinite {
                subject: format!("agent {}", outcome.agent_name),
            });
        }

        Ok(AgentScore {
            score: Some(score),
            confidence_term,
            latency_term,
            completeness_term,
        })
    }
}
