//! Telegram channel: long-polls the Bot API for updates.
//!
//! Requests arrive through `getUpdates`. While a job runs, its execution
//! tree is mirrored into a thread of messages by a [`ChatRenderer`] driving
//! [`TelegramChat`]; final results and failures go out through
//! [`TelegramChannel::deliver_chunked`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::{Channel, IncomingMessage, MessageStream};
use crate::error::ChannelError;
use crate::markup::{Chunk, chunk_for_channel};
use crate::queue::Origin;
use crate::render::{ChatLimits, ChatRenderer, ChatTransport, MessageRef, Renderer};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
/// Long-poll timeout passed to `getUpdates`, in seconds.
const POLL_TIMEOUT_SECS: u64 = 30;
/// Pause after a failed poll.
const POLL_BACKOFF: Duration = Duration::from_secs(5);
/// Longest wait honoured from a 429 `retry_after`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Bot API client shared by the channel and its chat transports.
struct TelegramApi {
    bot_token: SecretString,
    base_url: String,
    client: reqwest::Client,
}

/// Outcome of a Bot API call that did not succeed.
#[derive(Debug)]
enum ApiFailure {
    /// Transport or decoding error.
    Http(String),
    /// The API answered `ok: false`.
    Rejected {
        status: u16,
        description: String,
        retry_after: Option<Duration>,
    },
}

impl ApiFailure {
    fn description(&self) -> &str {
        match self {
            Self::Http(reason) => reason,
            Self::Rejected { description, .. } => description,
        }
    }

    fn is_not_modified(&self) -> bool {
        self.description().contains("message is not modified")
    }
}

impl std::fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(reason) => write!(f, "{reason}"),
            Self::Rejected {
                status,
                description,
                ..
            } => write!(f, "{status}: {description}"),
        }
    }
}

impl TelegramApi {
    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.base_url,
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method, retrying once when rate limited.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        match self.call_once(method, body).await {
            Err(ApiFailure::Rejected {
                status: 429,
                retry_after,
                ..
            }) => {
                let wait = retry_after.unwrap_or(Duration::from_secs(1)).min(MAX_RETRY_AFTER);
                tracing::warn!(method, wait_secs = wait.as_secs(), "Telegram rate limited; retrying once");
                tokio::time::sleep(wait).await;
                self.call_once(method, body).await
            }
            other => other,
        }
    }

    async fn call_once(&self, method: &str, body: &Value) -> Result<Value, ApiFailure> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| ApiFailure::Http(e.to_string()))?;
        let status = resp.status().as_u16();
        let data: Value = resp
            .json()
            .await
            .map_err(|e| ApiFailure::Http(format!("invalid {method} response: {e}")))?;
        parse_api_response(status, data)
    }
}

/// Split a Bot API envelope into its result or a failure.
fn parse_api_response(status: u16, data: Value) -> Result<Value, ApiFailure> {
    if data.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(Value::Null));
    }
    Err(ApiFailure::Rejected {
        status: data
            .get("error_code")
            .and_then(Value::as_u64)
            .map(|c| c as u16)
            .unwrap_or(status),
        description: data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        retry_after: data
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64)
            .map(Duration::from_secs),
    })
}

/// One Telegram chat as a [`ChatTransport`].
pub struct TelegramChat {
    api: Arc<TelegramApi>,
    chat_id: String,
}

impl TelegramChat {
    /// Send or edit with MarkdownV2 first, falling back to the plain source
    /// text if Telegram rejects the markup.
    async fn call_with_fallback(
        &self,
        method: &str,
        mut body: Value,
        chunk: &Chunk,
    ) -> Result<Value, ApiFailure> {
        body["text"] = Value::String(chunk.markup.clone());
        body["parse_mode"] = Value::String("MarkdownV2".into());
        match self.api.call(method, &body).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_not_modified() => Ok(Value::Null),
            Err(e @ ApiFailure::Rejected { status: 429, .. }) => Err(e),
            Err(e) => {
                tracing::warn!(method, error = %e, "Telegram MarkdownV2 rejected; retrying as plain text");
                if let Some(fields) = body.as_object_mut() {
                    fields.remove("parse_mode");
                }
                body["text"] = Value::String(chunk.plain.clone());
                match self.api.call(method, &body).await {
                    Err(e) if e.is_not_modified() => Ok(Value::Null),
                    other => other,
                }
            }
        }
    }
}

#[async_trait]
impl ChatTransport for TelegramChat {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, chunk: &Chunk, reply_to: Option<MessageRef>) -> Result<MessageRef, ChannelError> {
        let mut body = serde_json::json!({ "chat_id": self.chat_id });
        if let Some(reply_to) = reply_to {
            body["reply_parameters"] = serde_json::json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        let result = self
            .call_with_fallback("sendMessage", body, chunk)
            .await
            .map_err(|e| send_error(&e))?;
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChannelError::SendFailed {
                name: "telegram".into(),
                reason: "sendMessage returned no message_id".into(),
            })
    }

    async fn edit(&self, message: MessageRef, chunk: &Chunk) -> Result<(), ChannelError> {
        let body = serde_json::json!({ "chat_id": self.chat_id, "message_id": message });
        self.call_with_fallback("editMessageText", body, chunk)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                ApiFailure::Rejected { status: 429, .. } => ChannelError::RateLimited {
                    name: "telegram".into(),
                },
                other => ChannelError::EditFailed {
                    name: "telegram".into(),
                    reason: other.to_string(),
                },
            })
    }

    async fn delete(&self, message: MessageRef) -> Result<(), ChannelError> {
        let body = serde_json::json!({ "chat_id": self.chat_id, "message_id": message });
        self.api
            .call("deleteMessage", &body)
            .await
            .map(|_| ())
            .map_err(|e| send_error(&e))
    }
}

fn send_error(e: &ApiFailure) -> ChannelError {
    match e {
        ApiFailure::Rejected { status: 429, .. } => ChannelError::RateLimited {
            name: "telegram".into(),
        },
        other => ChannelError::SendFailed {
            name: "telegram".into(),
            reason: other.to_string(),
        },
    }
}

/// Telegram channel: connects to the Bot API via long-polling.
pub struct TelegramChannel {
    api: Arc<TelegramApi>,
    allowed_users: Vec<String>,
    limits: ChatLimits,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString, allowed_users: Vec<String>, limits: ChatLimits) -> Self {
        Self {
            api: Arc::new(TelegramApi {
                bot_token,
                base_url: DEFAULT_API_BASE.to_string(),
                client: reqwest::Client::new(),
            }),
            allowed_users,
            limits,
        }
    }

    /// Point the client at another Bot API server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let api = TelegramApi {
            bot_token: self.api.bot_token.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: self.api.client.clone(),
        };
        self.api = Arc::new(api);
        self
    }

    /// Check if a username is in the allowed list.
    pub fn is_user_allowed(&self, username: &str) -> bool {
        self.allowed_users.iter().any(|u| u == "*" || u == username)
    }

    /// Check if any of the provided identities is allowed.
    pub fn is_any_user_allowed<'a, I>(&self, identities: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        identities.into_iter().any(|id| self.is_user_allowed(id))
    }

    fn chat(&self, chat_id: &str) -> TelegramChat {
        TelegramChat {
            api: Arc::clone(&self.api),
            chat_id: chat_id.to_string(),
        }
    }

    /// Send `text` as a chain of messages, each at most `max_len` long,
    /// each replying to the one before and spaced by the minimum send
    /// interval. Returns the sent message ids in order.
    pub async fn deliver_chunked(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<MessageRef>,
    ) -> Result<Vec<MessageRef>, ChannelError> {
        deliver_chunked(&self.chat(chat_id), text, reply_to, self.limits).await
    }
}

/// Chunked delivery over any transport.
pub(crate) async fn deliver_chunked(
    transport: &dyn ChatTransport,
    text: &str,
    reply_to: Option<MessageRef>,
    limits: ChatLimits,
) -> Result<Vec<MessageRef>, ChannelError> {
    let mut sent = Vec::new();
    for (i, chunk) in chunk_for_channel(text, limits.max_len).iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(limits.min_interval).await;
        }
        let reply = sent.last().copied().or(reply_to);
        sent.push(transport.send(chunk, reply).await?);
    }
    Ok(sent)
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let api = Arc::clone(&self.api);
        let allowed_users = self.allowed_users.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": POLL_TIMEOUT_SECS,
                    "allowed_updates": ["message"]
                });

                let results = match api.call_once("getUpdates", &body).await {
                    Ok(Value::Array(results)) => results,
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(POLL_BACKOFF).await;
                        continue;
                    }
                };

                for update in &results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update, &allowed_users) else {
                        continue;
                    };

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn respond(&self, origin: &Origin, text: &str) -> Result<(), ChannelError> {
        let chat_id = chat_id(origin)?;
        self.deliver_chunked(&chat_id, text, reply_target(origin))
            .await
            .map(|_| ())
    }

    fn renderer(&self, origin: &Origin) -> Option<Arc<dyn Renderer>> {
        let chat_id = chat_id(origin).ok()?;
        Some(Arc::new(ChatRenderer::new(
            Arc::new(self.chat(&chat_id)),
            reply_target(origin),
            self.limits,
        )))
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        self.api
            .call_once("getMe", &serde_json::json!({}))
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe failed: {e}"),
            })
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn chat_id(origin: &Origin) -> Result<String, ChannelError> {
    origin
        .metadata
        .get("chat_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ChannelError::SendFailed {
            name: "telegram".into(),
            reason: "No chat_id in message metadata".into(),
        })
}

/// The request message, which the first reply chunk points at.
fn reply_target(origin: &Origin) -> Option<MessageRef> {
    origin.metadata.get("message_id").and_then(Value::as_i64)
}

/// Turn one update into a request, if it is a text message from an
/// allowed user.
fn parse_update(update: &Value, allowed_users: &[String]) -> Option<IncomingMessage> {
    let message = update.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;

    let from = message.get("from");
    let username = from
        .and_then(|f| f.get("username"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let user_id = from
        .and_then(|f| f.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string());

    // Check allowlist against both username and numeric ID
    let mut identities = vec![username];
    if let Some(ref id) = user_id {
        identities.push(id.as_str());
    }
    if !check_user_allowed(allowed_users, identities.iter().copied()) {
        tracing::warn!(
            "Telegram: ignoring message from unauthorized user: \
             username={username}, user_id={}",
            user_id.as_deref().unwrap_or("unknown")
        );
        return None;
    }

    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .unwrap_or_default();
    let message_id = message.get("message_id").and_then(Value::as_i64);
    let first_name = from
        .and_then(|f| f.get("first_name"))
        .and_then(Value::as_str);

    let incoming = IncomingMessage::new("telegram", user_id.as_deref().unwrap_or(username), text)
        .with_metadata(serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "username": username,
        }))
        .with_user_name(first_name.unwrap_or(username));
    Some(incoming)
}

/// Check if any identity in the iterator matches the allowed users list.
fn check_user_allowed<'a>(
    allowed_users: &[String],
    identities: impl IntoIterator<Item = &'a str>,
) -> bool {
    let ids: Vec<&str> = identities.into_iter().collect();
    allowed_users
        .iter()
        .any(|u| u == "*" || ids.contains(&u.as_str()))
}
