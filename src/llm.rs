//! Chat-completion provider client.
//!
//! Speaks an OpenAI-compatible `POST {url}/chat/completions` JSON API and is
//! used by the extractor, the answer synthesizer, and cluster summarization.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s (capped at `max_retries`, default 3)
//!
//! Exhausted retries surface as [`GraphLoomError::ProviderFailure`] so that
//! callers degrade instead of refusing (heuristic extraction, retrieval-only
//! answers).

use std::time::Duration;

use crate::config::LlmConfig;
use crate::error::{GraphLoomError, Result};

const DEFAULT_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Thin client over an OpenAI-compatible chat API.
pub struct LlmClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl LlmClient {
    /// Build a client when the config enables an LLM provider and an API
    /// key is resolvable; `None` otherwise (callers treat that as the
    /// unconfigured / degraded mode).
    pub fn from_config(config: &LlmConfig) -> Option<Self> {
        if !config.is_enabled() {
            return None;
        }
        let api_key = config.resolve_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .ok()?;
        Some(Self {
            client,
            url: config.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key,
            max_retries: config.max_retries,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one chat completion and return the assistant message content.
    pub async fn chat(
        &self,
        system: &str,
        user: &str,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if let Some(mt) = max_tokens {
            body["max_tokens"] = serde_json::json!(mt);
        }

        let endpoint = format!("{}/chat/completions", self.url.trim_end_matches('/'));
        let mut last_err: Option<GraphLoomError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| GraphLoomError::ProviderFailure(e.to_string()))?;
                        return parse_chat_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(GraphLoomError::Transient(format!(
                            "chat API error {}: {}",
                            status, text
                        )));
                        continue;
                    }
                    let text = response.text().await.unwrap_or_default();
                    return Err(GraphLoomError::ProviderFailure(format!(
                        "chat API error {}: {}",
                        status, text
                    )));
                }
                Err(e) => {
                    last_err = Some(GraphLoomError::Transient(e.to_string()));
                    continue;
                }
            }
        }

        // Retries exhausted: a transient condition becomes a provider failure.
        Err(match last_err {
            Some(GraphLoomError::Transient(msg)) => GraphLoomError::ProviderFailure(msg),
            Some(other) => other,
            None => GraphLoomError::ProviderFailure("chat completion failed".to_string()),
        })
    }
}

fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            GraphLoomError::ProviderFailure("invalid chat response: missing choices".to_string())
        })
}

/// Locate the first JSON array in a free-form model response. Models often
/// wrap output in prose or code fences despite instructions.
pub fn extract_json_array(response: &str) -> Option<&str> {
    let start = response.find('[')?;
    let end = response.rfind(']')?;
    if end > start {
        Some(&response[start..=end])
    } else {
        None
    }
}

/// Locate the first JSON object in a free-form model response.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end > start {
        Some(&response[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hello"}}]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "hello");
        assert!(parse_chat_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_extract_json_array() {
        let response = "Sure, here you go:\n```json\n[{\"a\": 1}]\n```\nDone.";
        assert_eq!(extract_json_array(response), Some("[{\"a\": 1}]"));
        assert_eq!(extract_json_array("no json here"), None);
    }

    #[test]
    fn test_extract_json_object() {
        let response = "prefix {\"label\": \"x\", \"summary\": \"y\"} suffix";
        assert_eq!(
            extract_json_object(response),
            Some("{\"label\": \"x\", \"summary\": \"y\"}")
        );
    }

    #[test]
    fn test_disabled_config_yields_no_client() {
        let config = LlmConfig::default();
        assert!(LlmClient::from_config(&config).is_none());
    }
}
