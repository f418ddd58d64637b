//! The completion capability and its OpenRouter implementation.
//!
//! [`CompletionBackend`] is the only seam between the prompt engine and the
//! network. Tests script it; production uses [`OpenRouterClient`].

use crate::Message;
use crate::error::CompletionError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Boxed future returned by [`CompletionBackend::complete`].
pub type CompletionFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Completion, CompletionError>> + Send + 'a>>;

/// One completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub temperature: f32,
    /// Response token cap; `None` leaves it to the provider.
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    pub json_mode: bool,
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportedUsage {
    pub tokens_sent: usize,
    pub tokens_received: usize,
}

/// Raw generated text plus whatever usage the provider reported.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Option<ReportedUsage>,
}

impl Completion {
    pub fn new(text: impl Into<String>, tokens_sent: usize, tokens_received: usize) -> Self {
        Self {
            text: text.into(),
            usage: Some(ReportedUsage {
                tokens_sent,
                tokens_received,
            }),
        }
    }

    pub fn without_usage(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }
}

/// Text-completion capability.
///
/// Uses a boxed future so the trait stays dyn-compatible and can be shared
/// as `Arc<dyn CompletionBackend>`.
pub trait CompletionBackend: Send + Sync {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFuture<'a>;
}

// ── OpenRouter ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize, Debug)]
struct ResponseFormat {
    #[serde(rename = "type")]
    fmt_type: &'static str,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// Async HTTP client for the OpenRouter chat completions API.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, CompletionError> {
        Self::with_headers(api_key, "https://github.com/throttle-rs", "throttle-rs")
    }

    /// Create a client with custom Referer and X-Title headers.
    pub fn with_headers(
        api_key: impl Into<String>,
        referer: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Self, CompletionError> {
        let client = reqwest::Client::builder()
            .user_agent("throttle-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CompletionError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            referer: referer.into(),
            title: title.into(),
        })
    }

    async fn chat(&self, request: CompletionRequest<'_>) -> Result<Completion, CompletionError> {
        let body = ChatRequest {
            model: request.model,
            messages: request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.json_mode.then_some(ResponseFormat {
                fmt_type: "json_object",
            }),
        };
        debug!(
            "LLM request: model={}, messages={}, max_tokens={:?}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(&body).map_or(0, |s| s.len())
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(&body)
            .send()
            .await
            .map_err(|e| CompletionError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| CompletionError::Transient(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(CompletionError::classify(format!(
                "OpenRouter API HTTP {status}: {text}"
            )));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text).map_err(|e| {
            CompletionError::Transient(format!("failed to parse response: {e}"))
        })?;
        if let Some(err) = parsed.error {
            return Err(CompletionError::classify(format!(
                "OpenRouter API error: {}",
                err.message
            )));
        }

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .ok_or_else(|| CompletionError::Transient("empty LLM response".into()))?;

        let usage = parsed.usage.and_then(|u| {
            Some(ReportedUsage {
                tokens_sent: u.prompt_tokens? as usize,
                tokens_received: u.completion_tokens? as usize,
            })
        });
        if let Some(u) = usage {
            debug!(
                "Token usage: sent={}, received={}",
                u.tokens_sent, u.tokens_received
            );
        }

        Ok(Completion {
            text: content,
            usage,
        })
    }
}

impl CompletionBackend for OpenRouterClient {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFuture<'a> {
        Box::pin(self.chat(request))
    }
}
