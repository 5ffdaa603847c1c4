// =============================================================================
// Reasoning providers — JSON-object chat completion over HTTP
// =============================================================================
//
// Both providers honour the same contract: system + user message in, one
// JSON object out, token usage reported. Error mapping:
//   429            -> RateLimited (Retry-After honoured when present)
//   5xx / timeout  -> Unavailable
//   content filter -> ContentFiltered
//   other 4xx      -> InvalidParams
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            _ => None,
        }
    }

    /// Env var holding the platform-default key for this provider.
    pub fn platform_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provider's reply with its token accounting.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One configured provider endpoint + key + model.
pub struct ReasoningProvider {
    kind: ProviderKind,
    http: reqwest::Client,
    api_key: Zeroizing<String>,
    model: String,
}

impl ReasoningProvider {
    pub fn new(
        kind: ProviderKind,
        http: reqwest::Client,
        api_key: Zeroizing<String>,
        model: String,
    ) -> Self {
        Self {
            kind,
            http,
            api_key,
            model,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat-completion round trip demanding a JSON object.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, EngineError> {
        match self.kind {
            ProviderKind::OpenAi => self.complete_openai(system, user, timeout).await,
            ProviderKind::Anthropic => self.complete_anthropic(system, user, timeout).await,
        }
    }

    async fn complete_openai(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, EngineError> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.2
        });

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .timeout(timeout)
            .bearer_auth(self.api_key.as_str())
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let value = read_json_response(resp).await?;

        let choice = &value["choices"][0];
        if choice["finish_reason"].as_str() == Some("content_filter") {
            return Err(EngineError::ContentFiltered);
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                EngineError::MalformedResponse("completion carried no message content".into())
            })?
            .to_string();

        debug!(provider = "openai", model = %self.model, "completion received");
        Ok(ProviderReply {
            content,
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }

    async fn complete_anthropic(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, EngineError> {
        let body = json!({
            "model": self.model,
            "max_tokens": 2048,
            "system": system,
            "messages": [ { "role": "user", "content": user } ],
            "temperature": 0.2
        });

        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .timeout(timeout)
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let value = read_json_response(resp).await?;

        if value["stop_reason"].as_str() == Some("refusal") {
            return Err(EngineError::ContentFiltered);
        }

        let content = value["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                EngineError::MalformedResponse("message carried no text content".into())
            })?
            .to_string();

        debug!(provider = "anthropic", model = %self.model, "completion received");
        Ok(ProviderReply {
            content,
            prompt_tokens: value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            completion_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        })
    }
}

impl std::fmt::Debug for ReasoningProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningProvider")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

fn map_transport_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Unavailable(format!("provider request timed out: {e}"))
    } else {
        EngineError::Unavailable(format!("provider request failed: {e}"))
    }
}

async fn read_json_response(resp: reqwest::Response) -> Result<serde_json::Value, EngineError> {
    let status = resp.status();

    if status.as_u16() == 429 {
        let retry_after_secs = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok());
        return Err(EngineError::RateLimited { retry_after_secs });
    }
    if status.is_server_error() {
        return Err(EngineError::Unavailable(format!("provider returned {status}")));
    }
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(%status, body = %text.chars().take(300).collect::<String>(), "provider rejected request");
        return Err(EngineError::invalid(
            "request",
            format!("provider returned {status}"),
        ));
    }

    resp.json()
        .await
        .map_err(|e| EngineError::Unavailable(format!("provider response unreadable: {e}")))
}

// ---------------------------------------------------------------------------
// Cost estimation
// ---------------------------------------------------------------------------

/// USD per 1k prompt / completion tokens by model prefix. Unknown models
/// report zero cost rather than a fabricated one.
const MODEL_PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4o", 0.0025, 0.01),
    ("claude-opus", 0.015, 0.075),
    ("claude-sonnet", 0.003, 0.015),
    ("claude-haiku", 0.0008, 0.004),
];

pub fn estimate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    for (prefix, prompt_price, completion_price) in MODEL_PRICES {
        if model.starts_with(prefix) {
            return prompt_tokens as f64 / 1000.0 * prompt_price
                + completion_tokens as f64 / 1000.0 * completion_price;
        }
    }
    0.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_roundtrip() {
        assert_eq!(ProviderKind::parse("openai"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("Anthropic"), Some(ProviderKind::Anthropic));
        assert_eq!(ProviderKind::parse("mystery"), None);
        assert_eq!(ProviderKind::OpenAi.as_str(), "openai");
    }

    #[test]
    fn cost_estimation_matches_price_table() {
        // 1M prompt + 100k completion on gpt-4o: 2.5 + 1.0 = 3.5 USD.
        let cost = estimate_cost("gpt-4o", 1_000_000, 100_000);
        assert!((cost - 3.5).abs() < 1e-9);

        // The mini prefix must win over the bare gpt-4o prefix.
        let mini = estimate_cost("gpt-4o-mini", 1_000_000, 0);
        assert!((mini - 0.15).abs() < 1e-9);

        assert_eq!(estimate_cost("unknown-model", 1000, 1000), 0.0);
    }

    #[test]
    fn cost_is_zero_for_zero_tokens() {
        assert_eq!(estimate_cost("claude-sonnet-4-20250514", 0, 0), 0.0);
    }
}
