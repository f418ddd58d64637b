//! Convenience re-exports for common `throttle-rs` types.
//!
//! ```ignore
//! use throttle_rs::prelude::*;
//! ```
//!
//! Covers building a registry, wiring a backend, calling prompts and
//! summarizing documents. Tokenizer internals, pricing tables and parser
//! plumbing stay in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{Message, MessageRole, json_schema_for};

// ── Models ──────────────────────────────────────────────────────────
pub use crate::model::{
    HeuristicTokenizer, ModelPricing, ModelProfile, ModelRegistry, TiktokenTokenizer, Tokenizer,
};

// ── Provider access ─────────────────────────────────────────────────
pub use crate::api::{
    AdmissionController, Completion, CompletionBackend, CompletionRequest, OpenRouterClient,
    RetryConfig, Usage,
};

// ── Prompts ─────────────────────────────────────────────────────────
pub use crate::prompt::{
    CallOptions, CallResult, MessageTemplate, Prompt, PromptInput, ResponseSchema,
};

// ── Documents ───────────────────────────────────────────────────────
pub use crate::context::{
    ChunkerConfig, DocumentSummarizer, DocumentSummary, FnProgress, ProgressObserver,
    ProgressSignal, SummarizationState, SummarizerConfig, TextChunker,
};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{CompletionError, PromptError, SummarizeError};
