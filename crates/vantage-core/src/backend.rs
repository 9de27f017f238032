//! Text-generation backends.
//!
//! The proposer and the critic tier talk to a `GenerationBackend`: model id
//! plus role-tagged messages in, generated text out. Every call made by the
//! loop goes through [`call_with_timeout`] so a hung backend only costs the
//! one call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::BackendError;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            temperature: None,
        }
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::system(content));
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Content of the most recent user message.
    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// A request/response text-completion service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError>;
}

/// Run one backend call under `timeout`. Dropping the future on expiry
/// cancels the call without touching sibling calls.
pub async fn call_with_timeout(
    backend: &dyn GenerationBackend,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<Completion, BackendError> {
    let model = request.model.clone();
    tokio::time::timeout(timeout, backend.complete(request))
        .await
        .map_err(|_| BackendError::Timeout {
            model,
            secs: timeout.as_secs(),
        })?
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiBackend {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    /// Configure from `OPENAI_API_KEY` and optional `OPENAI_BASE_URL`.
    pub fn from_env(timeout: Duration) -> Result<Self, BackendError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| BackendError::MissingCredentials("OPENAI_API_KEY is not set".into()))?;
        let base_url = std::env::var("OPENAI_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());
        Self::new(&base_url, api_key, timeout)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(temp) = request.temperature {
            payload["temperature"] = json!(temp);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body, 320),
            });
        }

        debug!(model = %request.model, bytes = body.len(), "completion received");
        parse_chat_response(&body)
    }
}

/// Decode a chat-completions response body.
pub(crate) fn parse_chat_response(body: &str) -> Result<Completion, BackendError> {
    let parsed: OpenAiResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::MalformedResponse("response has no choices".into()))?;

    let usage = parsed.usage.map(|u| TokenUsage {
        prompt_tokens: u.prompt_tokens.unwrap_or(0),
        completion_tokens: u.completion_tokens.unwrap_or(0),
    });

    Ok(Completion {
        text: extract_text(&choice.message.content),
        usage,
    })
}

/// Content is a string, or an array of `{type: "text", text}` parts.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Offline echo backend
// ---------------------------------------------------------------------------

/// Offline backend: answers `(Echo) <last user message>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

#[async_trait]
impl GenerationBackend for EchoBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        let prompt = request.last_user().unwrap_or_default();
        Ok(Completion::text(format!("(Echo) {prompt}")))
    }
}

// ---------------------------------------------------------------------------
// Token metering
// ---------------------------------------------------------------------------

/// Running total of tokens spent across every metered backend of a run.
#[derive(Debug, Default)]
pub struct UsageMeter {
    tokens: AtomicU64,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

/// Wraps a backend and charges each successful call to a [`UsageMeter`].
///
/// Uses the backend's reported usage when present, otherwise estimates four
/// characters per token over prompt and completion.
pub struct MeteredBackend {
    inner: Arc<dyn GenerationBackend>,
    meter: Arc<UsageMeter>,
}

impl MeteredBackend {
    pub fn new(inner: Arc<dyn GenerationBackend>, meter: Arc<UsageMeter>) -> Self {
        Self { inner, meter }
    }
}

#[async_trait]
impl GenerationBackend for MeteredBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, BackendError> {
        let prompt_chars = request.prompt_chars();
        let completion = self.inner.complete(request).await?;
        let tokens = match completion.usage {
            Some(usage) => usage.total(),
            None => estimate_tokens(prompt_chars + completion.text.chars().count()),
        };
        self.meter.add(tokens);
        Ok(completion)
    }
}

fn estimate_tokens(chars: usize) -> u64 {
    (chars as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedBackend;

    #[tokio::test]
    async fn echo_returns_last_user_message() {
        let request = CompletionRequest::new("any")
            .system("be terse")
            .user("first")
            .user("Create a function that adds two numbers");
        let out = EchoBackend.complete(request).await.unwrap();
        assert_eq!(out.text, "(Echo) Create a function that adds two numbers");
        assert!(out.usage.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_maps_to_backend_error() {
        let slow = ScriptedBackend::constant("late").with_delay(Duration::from_secs(30));
        let err = call_with_timeout(&slow, CompletionRequest::new("m"), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            BackendError::Timeout { model, secs } => {
                assert_eq!(model, "m");
                assert_eq!(secs, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_string_and_part_content() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}],
                       "usage":{"prompt_tokens":3,"completion_tokens":2}}"#;
        let c = parse_chat_response(body).unwrap();
        assert_eq!(c.text, "hello");
        assert_eq!(c.usage.map(|u| u.total()), Some(5));

        let body = r#"{"choices":[{"message":{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}]}"#;
        assert_eq!(parse_chat_response(body).unwrap().text, "ab");
    }

    #[test]
    fn empty_choices_is_malformed() {
        let err = parse_chat_response(r#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(err, BackendError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn metered_backend_prefers_reported_usage() {
        let meter = Arc::new(UsageMeter::new());
        let reported = ScriptedBackend::constant("ok").with_usage(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        });
        let metered = MeteredBackend::new(Arc::new(reported), meter.clone());
        metered.complete(CompletionRequest::new("m").user("hi")).await.unwrap();
        assert_eq!(meter.used(), 15);

        // 8 prompt chars + 8 completion chars => 4 tokens
        let estimated = MeteredBackend::new(Arc::new(ScriptedBackend::constant("12345678")), meter.clone());
        estimated
            .complete(CompletionRequest::new("m").user("abcdefgh"))
            .await
            .unwrap();
        assert_eq!(meter.used(), 19);
    }

    #[test]
    fn openai_endpoint_joins_base_url() {
        let backend =
            OpenAiBackend::new("http://localhost:8080/v1/", "key", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
