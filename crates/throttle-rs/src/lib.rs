//! Rate-limited, budget-aware prompt orchestration for LLM completion APIs.
//!
//! `throttle-rs` sits between application code and a chat-completion
//! provider. Every call is gated by per-model request and token reservoirs,
//! checked against the model's context window before anything is sent,
//! retried on transient failures, and validated against a JSON Schema, with
//! a one-shot repair pass through a cheap deterministic model when the
//! output does not conform. On top of that, [`DocumentSummarizer`] walks
//! documents too large for any context window one excerpt at a time,
//! carrying its running answer forward.
//!
//! # Getting started
//!
//! ```ignore
//! use throttle_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ModelRegistry::load("models.json")?);
//!     let backend = Arc::new(OpenRouterClient::new(std::env::var("OPENROUTER_KEY")?)?);
//!
//!     let prompt = Prompt::new(
//!         registry,
//!         backend,
//!         vec![
//!             MessageTemplate::system("Extract the people mentioned in the text."),
//!             MessageTemplate::user("{{text}}"),
//!         ],
//!         ResponseSchema::new(serde_json::json!({
//!             "type": "object",
//!             "properties": { "people": { "type": "array", "items": { "type": "string" } } },
//!             "required": ["people"]
//!         }))?,
//!         "openai/gpt-4o-mini",
//!     )?;
//!
//!     let result = prompt
//!         .call(&PromptInput::new().with_var("text", "Ada met Charles in 1833."))
//!         .await?;
//!     println!("{} ({})", result.response, result.usage().summary());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`model`] | [`ModelProfile`](model::ModelProfile), pricing, [`Tokenizer`](model::Tokenizer), [`ModelRegistry`](model::ModelRegistry) |
//! | [`api`] | [`AdmissionController`](api::AdmissionController), [`CompletionBackend`](api::CompletionBackend), retry, usage |
//! | [`prompt`] | [`Prompt`](prompt::Prompt) engine, templates, schemas, [`StructuredResponseParser`](prompt::StructuredResponseParser) |
//! | [`context`] | [`TextChunker`](context::TextChunker) and [`DocumentSummarizer`](context::DocumentSummarizer) |

pub mod api;
pub mod context;
pub mod error;
pub mod model;
pub mod prelude;
pub mod prompt;

pub use context::DocumentSummarizer;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Re-export schemars for downstream crates.
pub use schemars;

/// Default model for the CLI.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use throttle_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct Verdict {
///     label: String,
///     #[serde(default)]
///     confidence: Option<f64>,
/// }
///
/// let schema = json_schema_for::<Verdict>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"label".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A rendered message ready to send.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Format a message sequence the way it is measured for token budgeting.
pub fn format_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("[{}]: {}\n\n", msg.role, msg.content));
    }
    out
}
