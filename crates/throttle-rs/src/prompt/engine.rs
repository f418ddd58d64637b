//! The prompt engine: render, budget-check, admit, call, parse, retry.
//!
//! A [`Prompt`] owns a message template sequence, a response schema and a
//! target model. [`Prompt::call`] is the only path that spends money:
//!
//! 1. Render every template strictly against the input and measure the
//!    transcript. A prompt larger than the model's context fails with
//!    [`PromptError::BudgetExceeded`] before any attempt.
//! 2. Dry runs stop here and return an estimate priced from the profile.
//! 3. Otherwise up to `retry.max_attempts` attempts are made. Each attempt is
//!    admitted through the model's [`AdmissionController`] and covers both
//!    the completion and the parse (including any repair pass). Usage from
//!    every attempt, failed ones included, is threaded through as a
//!    [`Usage`] value and returned with the result.

use super::parser::StructuredResponseParser;
use super::schema::ResponseSchema;
use super::template::MessageTemplate;
use crate::api::admission::{AdmissionController, Metered};
use crate::api::completion::{CompletionBackend, CompletionRequest};
use crate::api::retry::RetryConfig;
use crate::api::usage::Usage;
use crate::error::PromptError;
use crate::model::{ModelHandle, ModelRegistry};
use crate::{Message, format_transcript};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stand-in for variables absent from the input when estimating size.
pub const TEMPLATE_FILLER: &str = "...";

// ── Input / output ─────────────────────────────────────────────────

/// Variables and flags for one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptInput {
    pub vars: Map<String, Value>,
    /// Estimate cost without calling the provider.
    pub dry_run: bool,
    /// Expected response length for dry runs; defaults to the remaining budget.
    pub expected_response_tokens: Option<usize>,
}

impl PromptInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_expected_response_tokens(mut self, tokens: usize) -> Self {
        self.expected_response_tokens = Some(tokens);
        self
    }
}

/// The result of [`Prompt::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    /// Schema-validated response (`Null` for dry runs).
    pub response: Value,
    pub tokens_sent: usize,
    pub tokens_received: usize,
    pub cost: f64,
    /// Whether the final response came from the repair pass.
    pub repaired: bool,
    /// Completion attempts made (0 for dry runs).
    pub attempts: u32,
}

impl CallResult {
    pub fn usage(&self) -> Usage {
        Usage::new(self.tokens_sent, self.tokens_received, self.cost)
    }

    /// Deserialize the validated response into a typed value.
    pub fn parse_into<T: DeserializeOwned>(&self) -> Result<T, PromptError> {
        serde_json::from_value(self.response.clone()).map_err(|e| PromptError::Parse {
            reason: e.to_string(),
        })
    }

    fn from_parts(response: Value, usage: Usage, repaired: bool, attempts: u32) -> Self {
        Self {
            response,
            tokens_sent: usage.tokens_sent,
            tokens_received: usage.tokens_received,
            cost: usage.cost,
            repaired,
            attempts,
        }
    }
}

/// Per-prompt call settings.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub retry: RetryConfig,
    pub temperature: f32,
    /// Response token cap sent to the provider.
    pub max_response_tokens: Option<u32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            temperature: 0.7,
            max_response_tokens: None,
        }
    }
}

// ── Attempt accounting ─────────────────────────────────────────────

/// One admitted attempt: what it spent and how it ended.
struct Attempt {
    usage: Usage,
    /// Tokens charged to the primary model's reservoir.
    completion_tokens: usize,
    result: Result<(Value, bool), PromptError>,
}

impl Metered for Attempt {
    fn tokens_consumed(&self) -> u64 {
        self.completion_tokens as u64
    }
}

// ── Prompt ─────────────────────────────────────────────────────────

/// A reusable, schema-validated prompt bound to one model.
#[derive(Clone)]
pub struct Prompt {
    registry: Arc<ModelRegistry>,
    backend: Arc<dyn CompletionBackend>,
    templates: Vec<MessageTemplate>,
    model: ModelHandle,
    parser: StructuredResponseParser,
    options: CallOptions,
}

impl Prompt {
    pub fn new(
        registry: Arc<ModelRegistry>,
        backend: Arc<dyn CompletionBackend>,
        templates: Vec<MessageTemplate>,
        schema: ResponseSchema,
        model: &str,
    ) -> Result<Self, PromptError> {
        let model = registry.resolve(model)?;
        let parser = Self::build_parser(&registry, &backend, schema);
        Ok(Self {
            registry,
            backend,
            templates,
            model,
            parser,
            options: CallOptions::default(),
        })
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.options.retry = retry;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    /// Replace templates, schema and model, rebuilding the per-model wiring.
    pub fn configure(
        &mut self,
        templates: Vec<MessageTemplate>,
        schema: ResponseSchema,
        model: &str,
    ) -> Result<(), PromptError> {
        self.model = self.registry.resolve(model)?;
        self.parser = Self::build_parser(&self.registry, &self.backend, schema);
        self.templates = templates;
        debug!(
            "Prompt reconfigured: model={}, {} template(s)",
            self.model.id(),
            self.templates.len()
        );
        Ok(())
    }

    fn build_parser(
        registry: &ModelRegistry,
        backend: &Arc<dyn CompletionBackend>,
        schema: ResponseSchema,
    ) -> StructuredResponseParser {
        StructuredResponseParser::new(schema, backend.clone(), registry.repair_model().cloned())
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn templates(&self) -> &[MessageTemplate] {
        &self.templates
    }

    pub fn schema(&self) -> &ResponseSchema {
        self.parser.schema()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.model.admission
    }

    /// Render every template; a missing variable is an error.
    pub fn render(&self, input: &PromptInput) -> Result<Vec<Message>, PromptError> {
        self.templates.iter().map(|t| t.render(&input.vars)).collect()
    }

    /// Token count of the formatted transcript, filling absent variables.
    pub fn count_tokens(&self, input: &PromptInput) -> usize {
        let messages: Vec<Message> = self
            .templates
            .iter()
            .map(|t| t.render_with_filler(&input.vars, TEMPLATE_FILLER))
            .collect();
        self.count_messages(&messages)
    }

    /// `max_context_tokens - count_tokens(input)`; negative when over budget.
    pub fn count_remaining_tokens(&self, input: &PromptInput) -> i64 {
        self.model.profile.max_context_tokens() as i64 - self.count_tokens(input) as i64
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        self.model.profile.count_tokens(&format_transcript(messages))
    }

    /// Call with the prompt's own [`CallOptions`].
    pub async fn call(&self, input: &PromptInput) -> Result<CallResult, PromptError> {
        self.call_with(input, &self.options).await
    }

    /// Call with explicit options for this call only.
    pub async fn call_with(
        &self,
        input: &PromptInput,
        options: &CallOptions,
    ) -> Result<CallResult, PromptError> {
        let retry = &options.retry;
        let messages = self.render(input)?;
        let prompt_tokens = self.count_messages(&messages);
        let max_tokens = self.model.profile.max_context_tokens();
        if prompt_tokens > max_tokens {
            return Err(PromptError::BudgetExceeded {
                prompt_tokens,
                max_tokens,
            });
        }

        if input.dry_run {
            let received = input
                .expected_response_tokens
                .unwrap_or(max_tokens - prompt_tokens);
            let cost = self.model.profile.cost(prompt_tokens, received);
            debug!(
                "Dry run for '{}': {prompt_tokens} sent + {received} received, ${cost:.4}",
                self.model.id()
            );
            return Ok(CallResult::from_parts(
                Value::Null,
                Usage::new(prompt_tokens, received, cost),
                false,
                0,
            ));
        }

        let attempts = retry.attempts();
        let mut usage = Usage::default();
        let mut attempt = 0;
        loop {
            let outcome = self
                .model
                .admission
                .admit(|| self.attempt(&messages, prompt_tokens, options))
                .await;
            usage += outcome.usage;
            attempt += 1;

            match outcome.result {
                Ok((response, repaired)) => {
                    debug!(
                        "Call to '{}' succeeded on attempt {attempt} ({})",
                        self.model.id(),
                        usage.summary()
                    );
                    return Ok(CallResult::from_parts(response, usage, repaired, attempt));
                }
                Err(e) if attempt < attempts && e.is_retryable() => {
                    let delay = retry.delay_for_attempt(attempt - 1);
                    warn!(
                        "Call to '{}' failed (attempt {attempt}/{attempts}): {e}. Retrying in {delay:?}...",
                        self.model.id()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if !usage.is_empty() {
                        info!(
                            "Call to '{}' abandoned after spending {}",
                            self.model.id(),
                            usage.summary()
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn attempt(
        &self,
        messages: &[Message],
        prompt_tokens: usize,
        options: &CallOptions,
    ) -> Attempt {
        let request = CompletionRequest {
            model: self.model.id(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_response_tokens,
            json_mode: self.parser.schema().schema().get("type") == Some(&Value::from("object")),
        };

        let completion = match self.backend.complete(request).await {
            Ok(c) => c,
            Err(e) => {
                return Attempt {
                    usage: Usage::default(),
                    completion_tokens: 0,
                    result: Err(e.into()),
                };
            }
        };

        let (sent, received) = match completion.usage {
            Some(u) => (u.tokens_sent, u.tokens_received),
            None => (
                prompt_tokens,
                self.model.profile.count_tokens(&completion.text),
            ),
        };
        let usage = Usage::new(sent, received, self.model.profile.cost(sent, received));

        let (parsed, repair_usage) = self
            .parser
            .parse_metered(&completion.text, prompt_tokens)
            .await;

        Attempt {
            usage: usage + repair_usage,
            completion_tokens: sent + received,
            result: parsed.map(|p| (p.data, p.repaired)),
        }
    }
}

impl std::fmt::Debug for Prompt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prompt")
            .field("model", &self.model.id())
            .field("templates", &self.templates)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::completion::{Completion, CompletionFuture};
    use crate::model::{HeuristicTokenizer, ModelPricing, ModelProfile};
    use serde_json::json;

    struct Echo;

    impl CompletionBackend for Echo {
        fn complete<'a>(&'a self, _request: CompletionRequest<'a>) -> CompletionFuture<'a> {
            Box::pin(async { Ok(Completion::new(r#"{"ok": true}"#, 10, 4)) })
        }
    }

    fn registry(max_tokens: usize) -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::new(1.0).register(ModelProfile::new(
            "m",
            max_tokens,
            ModelPricing {
                tx_per_token: 0.5,
                rx_per_token: 1.0,
            },
            100,
            100_000,
            Arc::new(HeuristicTokenizer::default()),
        )))
    }

    fn prompt(max_tokens: usize) -> Prompt {
        Prompt::new(
            registry(max_tokens),
            Arc::new(Echo),
            vec![
                MessageTemplate::system("Answer in JSON."),
                MessageTemplate::user("Question: {{question}}"),
            ],
            ResponseSchema::new(json!({"type": "object"})).unwrap(),
            "m",
        )
        .unwrap()
    }

    #[test]
    fn unknown_model_rejected() {
        let result = Prompt::new(
            registry(100),
            Arc::new(Echo),
            vec![],
            ResponseSchema::text().unwrap(),
            "other",
        );
        assert!(matches!(result, Err(PromptError::UnknownModel(_))));
    }

    #[test]
    fn count_tokens_is_monotonic_in_input() {
        let p = prompt(1000);
        let short = p.count_tokens(&PromptInput::new().with_var("question", "why"));
        let long = p.count_tokens(&PromptInput::new().with_var("question", "why is the sky blue"));
        assert!(long > short);
        let empty = PromptInput::new();
        assert_eq!(
            p.count_remaining_tokens(&empty),
            1000 - p.count_tokens(&empty) as i64
        );
    }

    #[test]
    fn remaining_tokens_can_go_negative() {
        let p = prompt(5);
        assert!(p.count_remaining_tokens(&PromptInput::new()) < 0);
    }

    #[tokio::test]
    async fn call_returns_usage_from_provider() {
        let p = prompt(1000);
        let result = p
            .call(&PromptInput::new().with_var("question", "ok?"))
            .await
            .unwrap();
        assert_eq!(result.response, json!({"ok": true}));
        assert_eq!(result.tokens_sent, 10);
        assert_eq!(result.tokens_received, 4);
        assert!((result.cost - 9.0).abs() < 1e-9);
        assert_eq!(result.attempts, 1);
        assert!(!result.repaired);
    }

    #[tokio::test]
    async fn missing_variable_fails_before_calling() {
        let err = prompt(1000).call(&PromptInput::new()).await.unwrap_err();
        assert!(matches!(err, PromptError::Render { .. }));
    }

    #[tokio::test]
    async fn dry_run_prices_the_remaining_budget() {
        let p = prompt(1000);
        let input = PromptInput::new().with_var("question", "q").with_dry_run(true);
        let prompt_tokens = p.count_tokens(&input);
        let result = p.call(&input).await.unwrap();
        assert_eq!(result.tokens_sent, prompt_tokens);
        assert_eq!(result.tokens_received, 1000 - prompt_tokens);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.response, Value::Null);
    }

    #[test]
    fn configure_switches_templates() {
        let mut p = prompt(1000);
        p.configure(
            vec![MessageTemplate::user("{{x}}")],
            ResponseSchema::text().unwrap(),
            "m",
        )
        .unwrap();
        assert_eq!(p.templates().len(), 1);
        assert!(p.configure(vec![], ResponseSchema::text().unwrap(), "nope").is_err());
    }

    #[test]
    fn parse_into_typed_value() {
        #[derive(serde::Deserialize)]
        struct Flag {
            ok: bool,
        }
        let result = CallResult::from_parts(json!({"ok": true}), Usage::default(), false, 1);
        assert!(result.parse_into::<Flag>().unwrap().ok);
    }
}
