//! AI-assisted fixture disambiguation over an OpenAI-compatible chat API.
//!
//! The model receives the expected fixture and a numbered candidate list and
//! must answer in a two-line `KEY=VALUE` form:
//!
//! ```text
//! MATCH=<candidate id | NONE>
//! CONFIDENCE=<0.0..1.0>
//! ```

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::credentials::CredentialPool;
use super::fuzzy::{ExpectedFixture, FuzzyMatcher, MatchDecision, MatcherError};
use super::provider::Candidate;

const SYSTEM_PROMPT: &str = "You match sports fixtures. Given an expected fixture and a numbered \
list of candidate fixtures, reply with exactly two lines:\nMATCH=<candidate id or NONE>\n\
CONFIDENCE=<number between 0 and 1>\nAnswer NONE unless one candidate is clearly the same \
fixture (team names may be abbreviated, translated or carry club suffixes).";

pub struct AiMatcher {
    http: reqwest::Client,
    base_url: String,
    model: String,
    credentials: Arc<CredentialPool>,
    timeout: Duration,
}

impl AiMatcher {
    pub fn new(
        base_url: &str,
        model: &str,
        credentials: Arc<CredentialPool>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(AiMatcher {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            credentials,
            timeout,
        })
    }

    async fn chat_completion(&self, api_key: &str, user: &str) -> Result<String, CallError> {
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.0),
            max_tokens: Some(32),
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .header(reqwest::header::AUTHORIZATION, format!("Bearer {}", api_key))
            .json(&req)
            .send()
            .await
            .map_err(|e| CallError::Other(format!("matcher request: {}", e)))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 429 || status.as_u16() == 402 || is_quota_message(&body) {
            return Err(CallError::Quota(status.as_u16()));
        }
        if !status.is_success() {
            let snippet: String = body.chars().take(300).collect();
            return Err(CallError::Other(format!("matcher {}: {}", status.as_u16(), snippet)));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| CallError::Other(format!("matcher json parse: {}", e)))?;
        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl FuzzyMatcher for AiMatcher {
    async fn pick(
        &self,
        expected: &ExpectedFixture,
        candidates: &[Candidate],
    ) -> Result<MatchDecision, MatcherError> {
        if candidates.is_empty() {
            return Ok(MatchDecision::NoMatch);
        }
        let prompt = build_prompt(expected, candidates);

        // Try each key at most once per call
        for _ in 0..self.credentials.len() {
            let Some(credential) = self.credentials.acquire() else {
                break;
            };
            match self.chat_completion(&credential.key, &prompt).await {
                Ok(content) => {
                    debug!("AI matcher replied: {}", content.trim());
                    return Ok(parse_reply(&content, candidates));
                }
                Err(CallError::Quota(code)) => {
                    warn!("Matcher key #{} hit quota ({})", credential.index, code);
                    self.credentials.park(&credential);
                }
                Err(CallError::Other(msg)) => return Err(MatcherError::Failed(msg)),
            }
        }
        warn!(
            "No matcher key usable ({} of {} available)",
            self.credentials.available(),
            self.credentials.len()
        );
        Err(MatcherError::Exhausted)
    }

    fn name(&self) -> &str {
        "ai"
    }
}

enum CallError {
    Quota(u16),
    Other(String),
}

fn is_quota_message(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("insufficient_quota") || lower.contains("quota exceeded")
}

fn build_prompt(expected: &ExpectedFixture, candidates: &[Candidate]) -> String {
    let mut out = format!(
        "Expected: {} vs {} at {}\nCandidates:\n",
        expected.home_team,
        expected.away_team,
        expected.start_time.format("%Y-%m-%d %H:%M UTC")
    );
    for c in candidates {
        let when = c
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown time".to_string());
        out.push_str(&format!("- id={} {} vs {} at {}\n", c.id, c.home_team, c.away_team, when));
    }
    out
}

/// Parse the `MATCH=` / `CONFIDENCE=` reply.  Ids outside the candidate list
/// are treated as no match.
fn parse_reply(raw: &str, candidates: &[Candidate]) -> MatchDecision {
    let mut matched: Option<String> = None;
    let mut confidence: Option<f64> = None;

    for line in raw.lines() {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k.trim().to_ascii_uppercase().as_str() {
            "MATCH" => {
                let v = v.trim();
                if !v.eq_ignore_ascii_case("none") && !v.is_empty() {
                    matched = Some(v.to_string());
                }
            }
            "CONFIDENCE" => confidence = v.trim().parse::<f64>().ok(),
            _ => {}
        }
    }

    match matched {
        Some(id) if candidates.iter().any(|c| c.id == id) => MatchDecision::Matched {
            event_id: id,
            confidence: confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        },
        _ => MatchDecision::NoMatch,
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatResponseMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}
