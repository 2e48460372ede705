//! Offline summarizer that previews the output itself.

use async_trait::async_trait;

use super::Summarizer;
use crate::agent::truncate_for_preview;
use crate::error::LlmError;

/// Maximum characters in a preview summary.
const PREVIEW_CHARS: usize = 80;
/// Maximum characters of an error quoted back to the user.
const ERROR_CHARS: usize = 200;

/// Summarizes a call by truncating its output to one line.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewSummarizer;

#[async_trait]
impl Summarizer for PreviewSummarizer {
    async fn summarize(&self, name: &str, _input: &str, output: &str) -> Result<String, LlmError> {
        let preview = truncate_for_preview(output, PREVIEW_CHARS);
        if preview.is_empty() {
            Ok(format!("{name} finished"))
        } else {
            Ok(preview)
        }
    }

    async fn summarize_error(&self, error: &str) -> Result<String, LlmError> {
        let first = error.lines().next().unwrap_or("").trim();
        if first.is_empty() {
            return Ok("Sorry, I couldn't finish that.".to_string());
        }
        Ok(format!(
            "Sorry, I couldn't finish that: {}",
            truncate_for_preview(first, ERROR_CHARS)
        ))
    }
}
