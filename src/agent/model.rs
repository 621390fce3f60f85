//! Model-serving client used by the analysis agents.
//!
//! Talks to an OpenAI-compatible chat-completions endpoint and turns the
//! model's JSON-lines answer into [`Finding`]s. Transport failures are
//! classified so the scheduler can tell retryable errors from fatal ones.

use crate::error::AgentError;
use crate::models::{Category, Finding, Severity};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Configuration for the model client.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            model_name: "databricks-meta-llama-3-1-70b-instruct".to_string(),
            temperature: 0.0,
            max_tokens: 1000,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
}

/// Client for the model-serving endpoint.
#[derive(Debug, Clone)]
pub struct ModelClient {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl ModelClient {
    pub fn new(config: ModelConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Send one system + user prompt and return the completion text.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, AgentError> {
        let request = ChatRequest {
            model: &self.config.model_name,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(
            "Calling model {} at {} ({} prompt bytes)",
            self.config.model_name,
            self.config.endpoint,
            prompt.len()
        );

        let mut builder = self.http_client.post(&self.config.endpoint).json(&request);
        if let Some(ref token) = self.config.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                AgentError::fatal(format!(
                    "invalid model request for endpoint {}: {}",
                    self.config.endpoint, e
                ))
            } else if e.is_timeout() {
                AgentError::transient(format!(
                    "model request timed out after {}s",
                    self.config.timeout.as_secs()
                ))
            } else if e.is_connect() {
                AgentError::transient(format!(
                    "cannot connect to model endpoint {}",
                    self.config.endpoint
                ))
            } else {
                AgentError::transient(format!("failed to send model request: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AgentError::fatal(format!("model response is not JSON: {}", e)))?;

        extract_completion(&body)
            .ok_or_else(|| AgentError::fatal("model response has no completion text"))
    }
}

/// Rate limiting and server errors are retryable; other client errors are not.
pub fn classify_status(status: reqwest::StatusCode, body: &str) -> AgentError {
    let message = format!("model endpoint returned {}: {}", status, body);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AgentError::transient(message)
    } else {
        AgentError::fatal(message)
    }
}

/// Pull completion text out of the response shapes serving endpoints use.
pub fn extract_completion(body: &Value) -> Option<String> {
    if let Some(choices) = body.get("choices").and_then(Value::as_array) {
        let texts: Vec<&str> = choices
            .iter()
            .filter_map(|choice| {
                choice
                    .pointer("/message/content")
                    .and_then(Value::as_str)
                    .or_else(|| choice.get("text").and_then(Value::as_str))
            })
            .collect();
        return (!texts.is_empty()).then(|| texts.join("\n"));
    }

    if let Some(predictions) = body.get("predictions") {
        return Some(match predictions {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }

    body.get("content")
        .and_then(Value::as_str)
        .map(String::from)
}

/// Parse findings from a JSON-lines model answer.
///
/// Lines that are not JSON objects are ignored. Objects without a
/// description are dropped; a missing or unknown category falls back to
/// `default_category`.
pub fn parse_findings(response: &str, default_category: Category) -> Vec<Finding> {
    response
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter_map(|json| json_to_finding(&json, default_category))
        .collect()
}

fn json_to_finding(json: &Value, default_category: Category) -> Option<Finding> {
    let description = json["description"].as_str()?.trim();
    if description.is_empty() {
        return None;
    }

    let category = json["category"]
        .as_str()
        .and_then(Category::from_label)
        .unwrap_or(default_category);
    let severity = Severity::from_label(json["severity"].as_str().unwrap_or("medium"));
    let confidence = json["confidence"].as_f64().unwrap_or(0.5);

    let mut finding = Finding::new(category, severity, description).with_confidence(confidence);
    if let Some(evidence) = json["evidence"].as_object() {
        for (key, value) in evidence {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            finding = finding.with_evidence(key.clone(), value);
        }
    }
    Some(finding)
}

/// Output contract appended to every agent prompt.
pub const FINDINGS_FORMAT: &str = r#"For each finding, output one JSON object on its own line in exactly this format:
{"category": "network|security|operational", "severity": "info|low|medium|high|critical", "description": "What was observed and why it matters", "evidence": {"source_ip_address": "...", "user_id": "...", "action_name": "...", "service_name": "..."}, "confidence": 0.0-1.0}
Only output JSON lines, no other text. Output nothing if there are no findings."#;
