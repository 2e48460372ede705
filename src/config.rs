//! Configuration, read from the environment.
//!
//! Every setting has a default; values that fail to parse fall back to the
//! default with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::agent::RuntimeConfig;
use crate::llm::{SummarizerBackend, SummarizerConfig};
use crate::render::ChatLimits;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_LOG_DIR: &str = "./logs";
pub const DEFAULT_SUMMARY_MODEL: &str = "claude-3-5-haiku-latest";

/// Telegram settings. Present only when a bot token is configured.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Usernames or numeric ids; `*` allows everyone.
    pub allowed_users: Vec<String>,
    pub limits: ChatLimits,
}

/// Everything the binary needs to wire itself up.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// HTTP/WS server port.
    pub port: u16,
    /// Render CLI jobs live on the terminal.
    pub console: bool,
    /// Where logs go while the console target owns the terminal.
    pub log_dir: PathBuf,
    pub summarizer: SummarizerConfig,
    pub telegram: Option<TelegramConfig>,
    pub runtime: RuntimeConfig,
}

impl RelayConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name
    /// to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let api_key = get("ANTHROPIC_API_KEY").map(SecretString::from);
        let summarizer = SummarizerConfig {
            backend: if api_key.is_some() {
                SummarizerBackend::Anthropic
            } else {
                SummarizerBackend::Preview
            },
            api_key,
            model: get("AI_DELEGATE_SUMMARY_MODEL").unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string()),
        };

        let telegram = get("TELEGRAM_BOT_TOKEN").map(|token| {
            let defaults = ChatLimits::default();
            TelegramConfig {
                bot_token: SecretString::from(token),
                allowed_users: get("TELEGRAM_ALLOWED_USERS")
                    .unwrap_or_else(|| "*".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                limits: ChatLimits {
                    max_len: parse_or(&get, "TELEGRAM_MAX_MESSAGE_LEN", defaults.max_len),
                    min_interval: Duration::from_millis(parse_or(
                        &get,
                        "TELEGRAM_MIN_SEND_INTERVAL_MS",
                        defaults.min_interval.as_millis() as u64,
                    )),
                },
            }
        });

        let runtime_defaults = RuntimeConfig::default();
        let runtime = RuntimeConfig {
            tool_timeout: Duration::from_secs(parse_or(
                &get,
                "AI_DELEGATE_TOOL_TIMEOUT_SECS",
                runtime_defaults.tool_timeout.as_secs(),
            )),
            max_depth: parse_or(&get, "AI_DELEGATE_MAX_DEPTH", runtime_defaults.max_depth),
        };

        Self {
            port: parse_or(&get, "AI_DELEGATE_PORT", DEFAULT_PORT),
            console: get("AI_DELEGATE_CONSOLE")
                .map(|v| parse_bool("AI_DELEGATE_CONSOLE", &v, true))
                .unwrap_or(true),
            log_dir: get("AI_DELEGATE_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            summarizer,
            telegram,
            runtime,
        }
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "Invalid configuration value; using default");
            default
        }),
    }
}

fn parse_bool(key: &str, raw: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(key, value = %raw, "Invalid boolean; using default");
            default
        }
    }
}
