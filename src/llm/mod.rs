//! Summarization for AI Delegate.
//!
//! Supports:
//! - **Anthropic**: short summaries from the Messages API over `reqwest`
//! - **Preview**: a local, offline fallback that truncates the output
//!
//! The renderers only ever see the [`Summarizer`] trait.

mod anthropic;
mod preview;

pub use anthropic::AnthropicSummarizer;
pub use preview::PreviewSummarizer;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LlmError;

/// Turns finished calls and job errors into short, user-facing text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// One-line summary of a finished call.
    async fn summarize(&self, name: &str, input: &str, output: &str) -> Result<String, LlmError>;

    /// A short apology explaining a job failure. Never includes stack
    /// traces.
    async fn summarize_error(&self, error: &str) -> Result<String, LlmError>;
}

/// Supported summarization backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerBackend {
    Anthropic,
    Preview,
}

/// Configuration for creating a summarizer.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub backend: SummarizerBackend,
    pub api_key: Option<secrecy::SecretString>,
    pub model: String,
}

/// Create a summarizer from configuration.
pub fn create_summarizer(config: &SummarizerConfig) -> Result<Arc<dyn Summarizer>, LlmError> {
    match config.backend {
        SummarizerBackend::Anthropic => {
            let api_key = config.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
                provider: "anthropic".to_string(),
            })?;
            tracing::info!("Using Anthropic summaries (model: {})", config.model);
            Ok(Arc::new(AnthropicSummarizer::new(api_key, &config.model)))
        }
        SummarizerBackend::Preview => {
            tracing::info!("Using local preview summaries");
            Ok(Arc::new(PreviewSummarizer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_backend_requires_a_key() {
        let config = SummarizerConfig {
            backend: SummarizerBackend::Anthropic,
            api_key: None,
            model: "claude-3-5-haiku-latest".to_string(),
        };
        assert!(matches!(
            create_summarizer(&config),
            Err(LlmError::AuthFailed { .. })
        ));
    }

    #[test]
    fn anthropic_backend_constructs_with_key() {
        let config = SummarizerConfig {
            backend: SummarizerBackend::Anthropic,
            api_key: Some(secrecy::SecretString::from("test-key")),
            model: "claude-3-5-haiku-latest".to_string(),
        };
        assert!(create_summarizer(&config).is_ok());
    }

    #[tokio::test]
    async fn preview_backend_needs_nothing() {
        let config = SummarizerConfig {
            backend: SummarizerBackend::Preview,
            api_key: None,
            model: String::new(),
        };
        let summarizer = create_summarizer(&config).unwrap();
        assert_eq!(summarizer.summarize("t", "", "ok").await.unwrap(), "ok");
    }
}
