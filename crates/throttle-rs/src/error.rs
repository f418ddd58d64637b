//! Error taxonomy.
//!
//! Each layer has its own error type so callers can tell a fatal budget
//! problem apart from something the retry loop may recover from:
//!
//! - [`CompletionError`]: transport failures, split into transient and fatal.
//! - [`SchemaError`]: schema compilation or validation failures.
//! - [`PromptError`]: everything a [`Prompt::call`](crate::prompt::Prompt::call)
//!   can surface.
//! - [`SummarizeError`]: document-level failures (per-excerpt failures are
//!   logged and skipped, never surfaced here).

use thiserror::Error;

/// Failure reported by a completion backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    /// Rate limits, 5xx responses, timeouts. Worth another attempt.
    #[error("transient completion failure: {0}")]
    Transient(String),
    /// Invalid request, auth failure. Retrying cannot help.
    #[error("fatal completion failure: {0}")]
    Fatal(String),
}

impl CompletionError {
    /// Classify a raw transport error message.
    ///
    /// Anything that is not recognisably permanent is treated as transient.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if crate::api::retry::is_permanent_error(&message)
            && !crate::api::retry::is_transient_error(&message)
        {
            Self::Fatal(message)
        } else {
            Self::Transient(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Schema compilation or validation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid response schema: {0}")]
    InvalidSchema(String),
    #[error("response does not match schema: {reason}")]
    Invalid { reason: String },
}

/// Errors surfaced by [`Prompt`](crate::prompt::Prompt).
#[derive(Debug, Clone, Error)]
pub enum PromptError {
    #[error("unknown model '{0}': not present in the model registry")]
    UnknownModel(String),

    #[error("failed to render {role} message: missing variable '{variable}'")]
    Render { role: String, variable: String },

    #[error("prompt needs {prompt_tokens} tokens but the model context is {max_tokens}")]
    BudgetExceeded {
        prompt_tokens: usize,
        max_tokens: usize,
    },

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("could not parse model output (repair pass also failed): {reason}")]
    Parse { reason: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl PromptError {
    /// Whether the prompt's retry loop should attempt the call again.
    ///
    /// Budget and render problems are deterministic; fatal transport errors
    /// will fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Completion(e) => e.is_transient(),
            Self::Parse { .. } => true,
            Self::UnknownModel(_)
            | Self::Render { .. }
            | Self::BudgetExceeded { .. }
            | Self::Schema(SchemaError::InvalidSchema(_)) => false,
            Self::Schema(SchemaError::Invalid { .. }) => true,
        }
    }
}

/// Chunker misconfiguration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("chunk size must be positive after applying the buffer fraction (got {0})")]
    EmptyChunk(usize),
    #[error("overlap ({overlap}) must be smaller than the effective chunk size ({chunk_size})")]
    InvalidOverlap { overlap: usize, chunk_size: usize },
}

/// Model configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read model config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model config: {0}")]
    Invalid(String),
}

/// Document-level summarization failure.
#[derive(Debug, Clone, Error)]
pub enum SummarizeError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(
        "no room for document excerpts: {remaining} tokens remain after the prompt and response reserve"
    )]
    NoRoomForExcerpt { remaining: i64 },
}
