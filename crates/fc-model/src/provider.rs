use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use fc_core::error::{ErrorKind, Kinded};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by chat providers and the rate-limited client.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Connection failure, DNS, TLS, reset.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status with a message.
    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// HTTP 429 from the provider.
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// The per-attempt deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The caller's abort signal fired.
    #[error("request cancelled")]
    Cancelled,

    /// All retry attempts were consumed.
    #[error("retries exhausted after {attempts} attempts (last status {last_status})")]
    Exhausted { attempts: u32, last_status: u16 },
}

impl Kinded for ModelError {
    fn kind(&self) -> ErrorKind {
        match self {
            ModelError::RateLimited { .. } => ErrorKind::RateLimited,
            ModelError::Http(_) => ErrorKind::TransientIo,
            ModelError::Api { status, .. } if *status == 502 || *status == 503 => {
                ErrorKind::TransientIo
            }
            ModelError::Api { .. } | ModelError::Parse(_) => ErrorKind::Tool,
            ModelError::Timeout | ModelError::Cancelled => ErrorKind::Timeout,
            ModelError::Exhausted { last_status, .. } => {
                if *last_status == 429 {
                    ErrorKind::RateLimited
                } else {
                    ErrorKind::TransientIo
                }
            }
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;

// ---------------------------------------------------------------------------
// Core data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for ChatRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Tool, content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
            system: None,
        }
    }
}

/// Final usage record yielded at the end of every stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// One element of a chat stream: a text fragment, then a terminal usage
/// record.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Fragment(String),
    Done(Usage),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

// ---------------------------------------------------------------------------
// ChatProvider trait
// ---------------------------------------------------------------------------

/// The narrow provider contract: streamed text fragments plus a final usage
/// record. Nothing vendor-specific leaks past this trait.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatStream>;
}

/// Drain a stream into `(full_text, usage)`. Convenience for callers that do
/// not need incremental output.
pub async fn collect_stream(mut stream: ChatStream) -> Result<(String, Usage)> {
    let mut text = String::new();
    let mut usage = Usage::default();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Fragment(fragment) => text.push_str(&fragment),
            StreamEvent::Done(u) => usage = u,
        }
    }
    Ok((text, usage))
}

// ---------------------------------------------------------------------------
// HttpChatProvider: OpenAI-compatible streaming endpoint
// ---------------------------------------------------------------------------

/// Provider for OpenAI-compatible `/v1/chat/completions` endpoints with SSE
/// streaming. System text goes inline in the messages array.
pub struct HttpChatProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_version: Option<String>,
}

impl HttpChatProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            api_version: None,
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    fn build_body(messages: &[ChatMessage], opts: &ChatOptions) -> serde_json::Value {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();
        if let Some(ref system) = opts.system {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": system,
            }));
        }
        for msg in messages {
            api_messages.push(serde_json::json!({
                "role": msg.role.to_string(),
                "content": msg.content,
            }));
        }
        serde_json::json!({
            "model": opts.model,
            "max_tokens": opts.max_tokens,
            "temperature": opts.temperature,
            "messages": api_messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        })
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl ChatProvider for HttpChatProvider {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatStream> {
        let body = Self::build_body(messages, opts);
        let mut url = format!("{}/v1/chat/completions", self.endpoint.trim_end_matches('/'));
        if let Some(ref version) = self.api_version {
            url = format!("{url}?api-version={version}");
        }

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ModelError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, message });
        }

        // Forward SSE lines into a channel so the returned stream owns no
        // borrow of the response.
        let (tx, rx) = flume::unbounded::<Result<StreamEvent>>();
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            let mut usage = Usage::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::Http(e.to_string())));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(StreamEvent::Done(usage)));
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(parsed) => {
                            if let Some(u) = parsed.usage {
                                usage = Usage {
                                    prompt_tokens: u.prompt_tokens,
                                    completion_tokens: u.completion_tokens,
                                };
                            }
                            for choice in parsed.choices {
                                if let Some(text) = choice.delta.content {
                                    if !text.is_empty() {
                                        let _ = tx.send(Ok(StreamEvent::Fragment(text)));
                                    }
                                }
                            }
                        }
                        Err(e) => debug!(error = %e, "skipping unparseable stream line"),
                    }
                }
            }
            // Stream ended without [DONE]; still emit the usage tail.
            let _ = tx.send(Ok(StreamEvent::Done(usage)));
        });

        Ok(Box::pin(rx.into_stream()))
    }
}

// ---------------------------------------------------------------------------
// MockChatProvider
// ---------------------------------------------------------------------------

/// A scripted outcome for one `chat` call on the mock provider.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Stream the text in word-sized fragments, then the usage record.
    Reply { content: String, usage: Usage },
    /// Fail with an HTTP status (429 honors `retry_after_secs`).
    Status { status: u16, retry_after_secs: Option<u64> },
    /// Fail with a timeout.
    Timeout,
}

/// Mock provider for tests: pops scripted outcomes per call and captures
/// every request for assertions.
#[derive(Clone)]
pub struct MockChatProvider {
    outcomes: Arc<Mutex<VecDeque<MockOutcome>>>,
    calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl MockChatProvider {
    pub fn new() -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_reply(self, content: impl Into<String>) -> Self {
        self.push(MockOutcome::Reply {
            content: content.into(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
            },
        });
        self
    }

    pub fn with_status(self, status: u16, retry_after_secs: Option<u64>) -> Self {
        self.push(MockOutcome::Status {
            status,
            retry_after_secs,
        });
        self
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.outcomes.lock().expect("mock lock poisoned").push_back(outcome);
    }

    /// Number of `chat` calls observed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock lock poisoned").len()
    }

    /// Captured messages per call.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat(&self, messages: &[ChatMessage], _opts: &ChatOptions) -> Result<ChatStream> {
        self.calls
            .lock()
            .expect("mock lock poisoned")
            .push(messages.to_vec());

        let outcome = self
            .outcomes
            .lock()
            .expect("mock lock poisoned")
            .pop_front()
            .unwrap_or(MockOutcome::Reply {
                content: "ok".to_string(),
                usage: Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                },
            });

        match outcome {
            MockOutcome::Reply { content, usage } => {
                let (tx, rx) = flume::unbounded::<Result<StreamEvent>>();
                for word in content.split_inclusive(' ') {
                    let _ = tx.send(Ok(StreamEvent::Fragment(word.to_string())));
                }
                let _ = tx.send(Ok(StreamEvent::Done(usage)));
                Ok(Box::pin(rx.into_stream()))
            }
            MockOutcome::Status {
                status: 429,
                retry_after_secs,
            } => Err(ModelError::RateLimited { retry_after_secs }),
            MockOutcome::Status { status, .. } => Err(ModelError::Api {
                status,
                message: "scripted failure".into(),
            }),
            MockOutcome::Timeout => Err(ModelError::Timeout),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_err<T>(result: std::result::Result<T, ModelError>) -> ModelError {
        match result {
            Ok(_) => panic!("expected error, got Ok"),
            Err(e) => e,
        }
    }

    #[tokio::test]
    async fn mock_streams_fragments_then_usage() {
        let provider = MockChatProvider::new().with_reply("hello streaming world");
        let stream = provider
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        let (text, usage) = collect_stream(stream).await.unwrap();
        assert_eq!(text, "hello streaming world");
        assert_eq!(usage.completion_tokens, 5);
    }

    #[tokio::test]
    async fn mock_scripted_429_carries_retry_after() {
        let provider = MockChatProvider::new().with_status(429, Some(2));
        let err = expect_err(
            provider
                .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
                .await,
        );
        match err {
            ModelError::RateLimited { retry_after_secs } => {
                assert_eq!(retry_after_secs, Some(2))
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn mock_captures_requests() {
        let provider = MockChatProvider::new();
        provider
            .chat(
                &[ChatMessage::system("sys"), ChatMessage::user("question")],
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][1].content, "question");
    }

    #[test]
    fn error_kinds_match_taxonomy() {
        assert_eq!(
            ModelError::RateLimited {
                retry_after_secs: None
            }
            .kind(),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ModelError::Api {
                status: 503,
                message: String::new()
            }
            .kind(),
            ErrorKind::TransientIo
        );
        assert_eq!(
            ModelError::Api {
                status: 400,
                message: String::new()
            }
            .kind(),
            ErrorKind::Tool
        );
        assert_eq!(ModelError::Timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn request_body_inlines_system_prompt() {
        let opts = ChatOptions {
            system: Some("be terse".into()),
            ..Default::default()
        };
        let body = HttpChatProvider::build_body(&[ChatMessage::user("q")], &opts);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be terse");
        assert_eq!(body["stream"], true);
    }
}
