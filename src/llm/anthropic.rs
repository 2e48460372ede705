//! Anthropic Messages API summarizer.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::Summarizer;
use crate::agent::truncate_for_preview;
use crate::error::LlmError;

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 150;
/// Characters of input/output quoted in a prompt.
const PROMPT_PAYLOAD_CHARS: usize = 2000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SUMMARY_SYSTEM: &str = "You summarize the result of a single tool or agent call for a \
chat transcript. Reply with one short sentence, no markdown, no preamble.";

const ERROR_SYSTEM: &str = "You tell a chat user, in one or two friendly sentences, that their \
request failed and why. Never include stack traces, file paths or internal identifiers.";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Serialize)]
struct RequestMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Summarizer backed by a small Claude model.
pub struct AnthropicSummarizer {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicSummarizer {
    pub fn new(api_key: SecretString, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            model: model.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client,
        }
    }

    /// Point at a different API host (tests, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request<'a>(&'a self, system: &'a str, prompt: String) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
        }
    }

    async fn complete(&self, system: &str, prompt: String) -> Result<String, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_request(system, prompt);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, error = %error_text, "Anthropic API returned error status");
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: PROVIDER.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: PROVIDER.to_string(),
                    retry_after,
                },
                _ => LlmError::RequestFailed {
                    provider: PROVIDER.to_string(),
                    reason: format!("API error ({status}): {error_text}"),
                },
            });
        }

        let text = response.text().await.map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        parse_response(&text)
    }
}

/// Join the text blocks of a Messages API response.
fn parse_response(body: &str) -> Result<String, LlmError> {
    let response: MessagesResponse = serde_json::from_str(body)?;
    let text = response
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(LlmError::EmptySummary {
            provider: PROVIDER.to_string(),
        });
    }
    Ok(text)
}

fn summary_prompt(name: &str, input: &str, output: &str) -> String {
    format!(
        "Call: {name}\nInput: {}\nOutput: {}",
        truncate_for_preview(input, PROMPT_PAYLOAD_CHARS),
        truncate_for_preview(output, PROMPT_PAYLOAD_CHARS)
    )
}

#[async_trait]
impl Summarizer for AnthropicSummarizer {
    async fn summarize(&self, name: &str, input: &str, output: &str) -> Result<String, LlmError> {
        debug!(call = %name, model = %self.model, "Requesting summary");
        self.complete(SUMMARY_SYSTEM, summary_prompt(name, input, output))
            .await
    }

    async fn summarize_error(&self, error: &str) -> Result<String, LlmError> {
        let first = error.lines().next().unwrap_or("").trim();
        self.complete(
            ERROR_SYSTEM,
            format!("Error: {}", truncate_for_preview(first, PROMPT_PAYLOAD_CHARS)),
        )
        .await
    }
}
