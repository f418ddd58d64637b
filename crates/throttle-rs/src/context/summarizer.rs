//! Iterative summarization of documents larger than a context window.
//!
//! The document is split into excerpts sized to leave room for the prompt
//! scaffolding, the previous answer and the next answer. Excerpts are sent
//! strictly in order; every call after the first restates the running
//! response and asks the model to update or retain it. A failed excerpt is
//! logged and skipped. A [`ProgressObserver`] sees the running state after
//! every excerpt and may stop the walk early.

use super::chunker::{ChunkerConfig, Excerpt, TextChunker};
use crate::api::completion::CompletionBackend;
use crate::api::retry::RetryConfig;
use crate::api::usage::{Usage, generate_run_id};
use crate::error::{PromptError, SummarizeError};
use crate::model::ModelRegistry;
use crate::prompt::{CallResult, MessageTemplate, Prompt, PromptInput, ResponseSchema};
use chrono::{DateTime, Local};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Tokens reserved for each model response.
pub const DEFAULT_RESPONSE_TOKEN_LENGTH: usize = 1024;

/// Fraction of the derived excerpt budget actually used.
pub const DEFAULT_CHUNK_BUFFER: f64 = 0.95;

const DEFAULT_INSTRUCTIONS: &str = "\
Summarize the document. Capture the main argument, the key facts and any \
conclusions. Preserve names, numbers and dates verbatim.";

const SYSTEM_TEMPLATE: &str = "\
You are reading a long document one excerpt at a time and maintaining a single \
running response to the instructions below.

INSTRUCTIONS:
{{instructions}}

Reply with JSON only, matching this schema:
{{schema}}";

const USER_TEMPLATE: &str = "\
{{context}}You have read {{current_percentage}}% of the document. The excerpt \
below covers {{excerpt_percentage}}% more and {{remaining_percentage}}% remains \
after it.

=== EXCERPT ===
{{excerpt}}";

const INITIAL_CONTEXT: &str = "This is the beginning of the document.\n\n";

/// Default response shape for [`DocumentSummarizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DocumentSummary {
    /// Prose summary of everything read so far.
    pub summary: String,
    /// Short standalone facts worth keeping.
    #[serde(default)]
    pub key_points: Vec<String>,
}

// ── Configuration ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Excerpt size in tokens. Derived from the model's context when `None`.
    pub chunk_size: Option<usize>,
    pub overlap: usize,
    /// Applied to the derived chunk size.
    pub chunk_buffer: f64,
    /// Tokens reserved for each response (and for the restated prior one).
    pub response_token_length: usize,
    /// Estimate cost without calling the provider.
    pub dry_run: bool,
    /// What the running response should capture.
    pub instructions: String,
    /// Stop after this many excerpts.
    pub max_excerpts: Option<usize>,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            chunk_size: None,
            overlap: 0,
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
            response_token_length: DEFAULT_RESPONSE_TOKEN_LENGTH,
            dry_run: false,
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            max_excerpts: None,
        }
    }
}

impl SummarizerConfig {
    pub fn with_chunk_size(mut self, tokens: usize) -> Self {
        self.chunk_size = Some(tokens);
        self
    }

    pub fn with_overlap(mut self, tokens: usize) -> Self {
        self.overlap = tokens;
        self
    }

    pub fn with_response_token_length(mut self, tokens: usize) -> Self {
        self.response_token_length = tokens;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_max_excerpts(mut self, max: usize) -> Self {
        self.max_excerpts = Some(max);
        self
    }
}

// ── State and progress ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerPhase {
    Uninitialized,
    Splitting,
    Iterating,
    /// The latest excerpt failed; iteration continues with the next one.
    FailedExcerpt,
    /// Halted early by an observer or the excerpt limit.
    Stopped,
    Done,
}

impl SummarizerPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Done)
    }
}

/// Running state of one summarization, owned by that call.
#[derive(Debug, Clone)]
pub struct SummarizationState {
    pub run_id: String,
    pub started_at: DateTime<Local>,
    pub phase: SummarizerPhase,
    /// Latest successful response; `None` until one succeeds.
    pub response: Option<Value>,
    pub usage: Usage,
    /// Excerpts attempted, failures included.
    pub count: usize,
    pub failed: usize,
    pub excerpt_count: usize,
    pub total_token_length: usize,
    /// Token position just past the last attempted excerpt.
    pub token_offset: usize,
    /// Share of the document already read.
    pub current_percentage: u32,
}

impl SummarizationState {
    fn new() -> Self {
        Self {
            run_id: generate_run_id(),
            started_at: Local::now(),
            phase: SummarizerPhase::Uninitialized,
            response: None,
            usage: Usage::default(),
            count: 0,
            failed: 0,
            excerpt_count: 0,
            total_token_length: 0,
            token_offset: 0,
            current_percentage: 0,
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Local::now() - self.started_at
    }
}

/// What an observer wants after seeing an excerpt's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSignal {
    Continue,
    Stop,
}

/// Observer called after every excerpt, successful or not.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, state: &SummarizationState) -> ProgressSignal {
        let _ = state;
        ProgressSignal::Continue
    }
}

/// Observer that never stops the run.
pub struct NoProgress;
impl ProgressObserver for NoProgress {}

/// Observer that logs each step at info level.
pub struct LoggingProgress;

impl ProgressObserver for LoggingProgress {
    fn on_progress(&self, state: &SummarizationState) -> ProgressSignal {
        info!(
            "[{}] excerpt {}/{} ({}% read, {} failed) {}",
            state.run_id,
            state.count,
            state.excerpt_count,
            state.current_percentage,
            state.failed,
            state.usage.summary()
        );
        ProgressSignal::Continue
    }
}

/// An observer backed by a closure.
pub struct FnProgress<F>(F)
where
    F: Fn(&SummarizationState) -> ProgressSignal + Send + Sync;

impl<F> FnProgress<F>
where
    F: Fn(&SummarizationState) -> ProgressSignal + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ProgressObserver for FnProgress<F>
where
    F: Fn(&SummarizationState) -> ProgressSignal + Send + Sync,
{
    fn on_progress(&self, state: &SummarizationState) -> ProgressSignal {
        (self.0)(state)
    }
}

/// Result of [`DocumentSummarizer::summarize`].
#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    pub run_id: String,
    /// Last successful response; `None` for dry runs or if every excerpt failed.
    pub response: Option<Value>,
    pub usage: Usage,
    pub excerpts_processed: usize,
    pub excerpts_failed: usize,
    pub excerpt_count: usize,
    pub phase: SummarizerPhase,
}

impl SummaryOutcome {
    pub fn parse_into<T: serde::de::DeserializeOwned>(&self) -> Option<Result<T, PromptError>> {
        self.response.as_ref().map(|v| {
            serde_json::from_value(v.clone()).map_err(|e| PromptError::Parse {
                reason: e.to_string(),
            })
        })
    }

    fn from_state(state: SummarizationState) -> Self {
        Self {
            run_id: state.run_id,
            response: state.response,
            usage: state.usage,
            excerpts_processed: state.count,
            excerpts_failed: state.failed,
            excerpt_count: state.excerpt_count,
            phase: state.phase,
        }
    }
}

// ── Summarizer ─────────────────────────────────────────────────────

/// Walks a document excerpt by excerpt through one [`Prompt`].
///
/// Custom prompts passed to [`with_prompt`](Self::with_prompt) receive the
/// variables `instructions`, `schema`, `context`, `current_percentage`,
/// `excerpt_percentage`, `remaining_percentage` and `excerpt`.
#[derive(Debug)]
pub struct DocumentSummarizer {
    prompt: Prompt,
    config: SummarizerConfig,
    chunk_size: OnceLock<usize>,
}

impl DocumentSummarizer {
    /// Summarizer with the built-in prompt and [`DocumentSummary`] schema.
    pub fn new(
        registry: Arc<ModelRegistry>,
        backend: Arc<dyn CompletionBackend>,
        model: &str,
        config: SummarizerConfig,
    ) -> Result<Self, PromptError> {
        let prompt = Prompt::new(
            registry,
            backend,
            default_templates(),
            ResponseSchema::for_type::<DocumentSummary>()?,
            model,
        )?;
        Ok(Self::with_prompt(prompt, config))
    }

    pub fn with_prompt(prompt: Prompt, config: SummarizerConfig) -> Self {
        Self {
            prompt,
            config,
            chunk_size: OnceLock::new(),
        }
    }

    /// Retry policy for every excerpt's call.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.prompt = self.prompt.with_retry(retry);
        self
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Excerpt size in tokens, derived once from the model's context when
    /// not configured.
    pub fn chunk_size(&self) -> Result<usize, SummarizeError> {
        if let Some(size) = self.config.chunk_size.or_else(|| self.chunk_size.get().copied()) {
            return Ok(size);
        }

        let scaffold = self.prompt.count_remaining_tokens(&self.input("", None, 0, 0, 100));
        let remaining = scaffold - 2 * self.config.response_token_length as i64;
        if remaining <= 0 {
            return Err(SummarizeError::NoRoomForExcerpt { remaining });
        }
        let size = (remaining as f64 * self.config.chunk_buffer).floor() as usize;
        debug!(
            "Derived chunk size {size} for '{}' ({remaining} tokens free)",
            self.prompt.model().id()
        );
        Ok(*self.chunk_size.get_or_init(|| size))
    }

    pub fn chunker(&self) -> Result<TextChunker, SummarizeError> {
        let config = ChunkerConfig::new(self.chunk_size()?).with_overlap(self.config.overlap);
        Ok(TextChunker::new(config, self.prompt.model().profile.tokenizer().clone())?)
    }

    /// Tokens of `text` wrapped in the summarization prompt as one excerpt.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.prompt.count_tokens(&self.input(text, None, 0, 100, 0))
    }

    /// [`count_tokens`](Self::count_tokens) subtracted from the model's context.
    pub fn count_remaining_tokens(&self, text: &str) -> i64 {
        self.prompt.count_remaining_tokens(&self.input(text, None, 0, 100, 0))
    }

    pub async fn summarize(
        &self,
        text: &str,
        observer: &dyn ProgressObserver,
    ) -> Result<SummaryOutcome, SummarizeError> {
        let mut state = SummarizationState::new();

        state.phase = SummarizerPhase::Splitting;
        let document = self.chunker()?.split(text);
        state.excerpt_count = document.len();
        state.total_token_length = document.total_token_length;
        info!(
            "[{}] Summarizing {} tokens in {} excerpt(s) with '{}'{}",
            state.run_id,
            document.total_token_length,
            document.len(),
            self.prompt.model().id(),
            if self.config.dry_run { " (dry run)" } else { "" }
        );

        state.phase = SummarizerPhase::Iterating;
        for (index, excerpt) in document.excerpts.iter().enumerate() {
            if self.config.max_excerpts.is_some_and(|max| index >= max) {
                info!("[{}] Excerpt limit reached after {index}", state.run_id);
                state.phase = SummarizerPhase::Stopped;
                break;
            }

            match self.step(excerpt, index, &state).await {
                Ok((response, usage)) => {
                    state.usage += usage;
                    if response.is_some() {
                        state.response = response;
                    }
                    state.phase = SummarizerPhase::Iterating;
                }
                Err(e) => {
                    warn!(
                        "[{}] Excerpt {}/{} failed, skipping: {e}",
                        state.run_id,
                        index + 1,
                        document.len()
                    );
                    state.failed += 1;
                    state.phase = SummarizerPhase::FailedExcerpt;
                }
            }
            state.count += 1;
            state.current_percentage += excerpt.percentage_of_document;
            state.token_offset = excerpt.token_offset + excerpt.token_length;

            if observer.on_progress(&state) == ProgressSignal::Stop {
                info!("[{}] Stopped by observer after {} excerpt(s)", state.run_id, state.count);
                state.phase = SummarizerPhase::Stopped;
                break;
            }
        }

        if !state.phase.is_terminal() {
            state.phase = SummarizerPhase::Done;
        }
        info!(
            "[{}] Summarization {:?} after {} excerpt(s) in {}s: {}",
            state.run_id,
            state.phase,
            state.count,
            state.elapsed().num_seconds(),
            state.usage.summary()
        );
        Ok(SummaryOutcome::from_state(state))
    }

    /// One excerpt: returns the new response (if any) and what it cost.
    async fn step(
        &self,
        excerpt: &Excerpt,
        index: usize,
        state: &SummarizationState,
    ) -> Result<(Option<Value>, Usage), PromptError> {
        if excerpt.is_blank() {
            debug!("[{}] Excerpt {} is blank, skipping", state.run_id, index + 1);
            return Ok((None, Usage::default()));
        }
        let current = state.current_percentage;
        let remaining = 100u32.saturating_sub(excerpt.percentage_of_document + current);
        let input = self.input(
            &excerpt.text,
            state.response.as_ref(),
            current,
            excerpt.percentage_of_document,
            remaining,
        );

        if self.config.dry_run {
            let response_len = self.config.response_token_length;
            let result = self
                .prompt
                .call(&input.with_dry_run(true).with_expected_response_tokens(response_len))
                .await?;
            // Sent side also carries a response's worth of tokens.
            let profile = &self.prompt.model().profile;
            let mut usage = result.usage();
            usage += Usage::new(response_len, 0, profile.cost(response_len, 0));
            return Ok((None, usage));
        }

        let result: CallResult = self.prompt.call(&input).await?;
        debug!(
            "[{}] Excerpt {} done ({}{})",
            state.run_id,
            index + 1,
            result.usage().summary(),
            if result.repaired { ", repaired" } else { "" }
        );
        let usage = result.usage();
        Ok((Some(result.response), usage))
    }

    fn input(
        &self,
        excerpt: &str,
        prior: Option<&Value>,
        current: u32,
        excerpt_percentage: u32,
        remaining: u32,
    ) -> PromptInput {
        PromptInput::new()
            .with_var("instructions", self.config.instructions.as_str())
            .with_var("schema", self.prompt.schema().schema().to_string())
            .with_var("context", context_text(prior))
            .with_var("current_percentage", current)
            .with_var("excerpt_percentage", excerpt_percentage)
            .with_var("remaining_percentage", remaining)
            .with_var("excerpt", excerpt)
    }
}

/// The built-in system and user templates.
pub fn default_templates() -> Vec<MessageTemplate> {
    vec![
        MessageTemplate::system(SYSTEM_TEMPLATE),
        MessageTemplate::user(USER_TEMPLATE),
    ]
}

/// Framing for an excerpt: initial when there is no prior response,
/// otherwise the prior response with a request to update or retain it.
pub fn context_text(prior: Option<&Value>) -> String {
    match prior {
        None => INITIAL_CONTEXT.to_string(),
        Some(prior) => format!(
            "=== PRIOR RESPONSE ===\n{prior}\n\n\
             The prior response covers everything read so far. Update it with \
             anything relevant in the excerpt below, or return it unchanged if \
             the excerpt adds nothing.\n\n"
        ),
    }
}
