//! Schema-validated parsing with a one-shot repair pass.
//!
//! Raw model text is validated directly first. When that fails, the text and
//! the validation error go to a secondary model at temperature 0 whose only
//! job is to restate the output in schema-conformant form. The repair call
//! is admitted through the repair model's own reservoirs.
//!
//! Repair usage is not reported by every provider, so the sent side is
//! estimated as the original prompt size plus 10% for the instructions, and
//! the received side is counted with the repair model's tokenizer.

use super::schema::ResponseSchema;
use crate::Message;
use crate::api::admission::Metered;
use crate::api::completion::{CompletionBackend, CompletionRequest};
use crate::api::usage::Usage;
use crate::error::{PromptError, SchemaError};
use crate::model::ModelHandle;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Repair prompt size relative to the original prompt, in percent.
pub const REPAIR_PROMPT_PERCENT: usize = 110;

const REPAIR_INSTRUCTIONS: &str = "\
You fix malformed model output. You will receive an output that failed validation \
and the validation error. Return the same content rewritten so it conforms exactly \
to the JSON Schema below. Do not add commentary, markdown fences, or fields that \
are not in the schema. Preserve every fact from the original output.

JSON Schema:
";

/// Outcome of [`StructuredResponseParser::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub data: Value,
    /// Whether the repair pass produced `data`.
    pub repaired: bool,
    /// Extra usage incurred by the repair pass (`None` when not repaired).
    pub repair_usage: Option<Usage>,
}

struct RepairOutcome {
    usage: Usage,
    result: Result<Value, String>,
}

impl Metered for RepairOutcome {
    fn tokens_consumed(&self) -> u64 {
        self.usage.total_tokens() as u64
    }
}

/// Validates raw text against a schema, repairing it once if needed.
#[derive(Clone)]
pub struct StructuredResponseParser {
    schema: ResponseSchema,
    backend: Arc<dyn CompletionBackend>,
    repair_model: Option<ModelHandle>,
}

impl StructuredResponseParser {
    /// Without a repair model, validation failures surface immediately.
    pub fn new(
        schema: ResponseSchema,
        backend: Arc<dyn CompletionBackend>,
        repair_model: Option<ModelHandle>,
    ) -> Self {
        Self {
            schema,
            backend,
            repair_model,
        }
    }

    pub fn schema(&self) -> &ResponseSchema {
        &self.schema
    }

    pub fn repair_model(&self) -> Option<&ModelHandle> {
        self.repair_model.as_ref()
    }

    pub async fn parse(
        &self,
        raw: &str,
        prompt_token_count: usize,
    ) -> Result<ParsedResponse, PromptError> {
        self.parse_metered(raw, prompt_token_count).await.0
    }

    /// Like [`parse`](Self::parse), also returning what the repair pass
    /// spent whether or not it succeeded.
    pub async fn parse_metered(
        &self,
        raw: &str,
        prompt_token_count: usize,
    ) -> (Result<ParsedResponse, PromptError>, Usage) {
        let validation_error = match self.schema.validate_text(raw) {
            Ok(data) => {
                let parsed = ParsedResponse {
                    data,
                    repaired: false,
                    repair_usage: None,
                };
                return (Ok(parsed), Usage::default());
            }
            Err(SchemaError::Invalid { reason }) => reason,
            Err(e) => return (Err(e.into()), Usage::default()),
        };

        let Some(ref repair) = self.repair_model else {
            let err = PromptError::Parse {
                reason: validation_error,
            };
            return (Err(err), Usage::default());
        };
        debug!(
            "Output failed validation ({validation_error}); repairing with '{}'",
            repair.id()
        );

        let outcome = repair
            .admission
            .admit(|| self.repair_pass(repair, raw, &validation_error, prompt_token_count))
            .await;

        let result = match outcome.result {
            Ok(data) => {
                info!("Repaired malformed output ({})", outcome.usage.summary());
                Ok(ParsedResponse {
                    data,
                    repaired: true,
                    repair_usage: Some(outcome.usage),
                })
            }
            Err(reason) => {
                warn!(
                    "Repair pass failed: {reason} (spent {})",
                    outcome.usage.summary()
                );
                Err(PromptError::Parse {
                    reason: format!("{validation_error}; repair failed: {reason}"),
                })
            }
        };
        (result, outcome.usage)
    }

    async fn repair_pass(
        &self,
        repair: &ModelHandle,
        raw: &str,
        validation_error: &str,
        prompt_token_count: usize,
    ) -> RepairOutcome {
        let schema_text = serde_json::to_string_pretty(self.schema.schema()).unwrap_or_default();
        let messages = [
            Message::system(format!("{REPAIR_INSTRUCTIONS}{schema_text}")),
            Message::user(format!(
                "Output that failed validation:\n{raw}\n\nValidation error:\n{validation_error}"
            )),
        ];
        let request = CompletionRequest {
            model: repair.id(),
            messages: &messages,
            temperature: 0.0,
            max_tokens: None,
            json_mode: self.schema.schema().get("type") == Some(&Value::from("object")),
        };

        let completion = match self.backend.complete(request).await {
            Ok(c) => c,
            Err(e) => {
                return RepairOutcome {
                    usage: Usage::default(),
                    result: Err(e.to_string()),
                };
            }
        };

        let tokens_sent = (prompt_token_count * REPAIR_PROMPT_PERCENT).div_ceil(100);
        let tokens_received = repair.profile.count_tokens(&completion.text);
        let usage = Usage::new(
            tokens_sent,
            tokens_received,
            repair.profile.cost(tokens_sent, tokens_received),
        );

        RepairOutcome {
            usage,
            result: self
                .schema
                .validate_text(&completion.text)
                .map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::completion::{Completion, CompletionFuture};
    use crate::error::CompletionError;
    use crate::model::{HeuristicTokenizer, ModelPricing, ModelProfile, ModelRegistry};
    use serde_json::json;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<Completion, CompletionError>>>,
        seen: Mutex<Vec<(String, f32)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Completion, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl CompletionBackend for Scripted {
        fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFuture<'a> {
            self.seen
                .lock()
                .unwrap()
                .push((request.model.to_string(), request.temperature));
            let reply = self.replies.lock().unwrap().remove(0);
            Box::pin(async move { reply })
        }
    }

    fn registry() -> ModelRegistry {
        ModelRegistry::new(1.0).register(ModelProfile::new(
            "cheap",
            4096,
            ModelPricing {
                tx_per_token: 0.001,
                rx_per_token: 0.002,
            },
            100,
            100_000,
            Arc::new(HeuristicTokenizer::default()),
        ))
    }

    fn schema() -> ResponseSchema {
        ResponseSchema::new(json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn conforming_output_is_not_repaired() {
        let backend = Scripted::new(vec![]);
        let parser = StructuredResponseParser::new(
            schema(),
            backend.clone(),
            registry().repair_model().cloned(),
        );
        let parsed = parser.parse(r#"{"answer": "42"}"#, 100).await.unwrap();
        assert!(!parsed.repaired);
        assert!(parsed.repair_usage.is_none());
        assert!(backend.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_output_is_repaired_at_zero_temperature() {
        let backend = Scripted::new(vec![Ok(Completion::without_usage(r#"{"answer": "42"}"#))]);
        let parser = StructuredResponseParser::new(
            schema(),
            backend.clone(),
            registry().repair_model().cloned(),
        );
        let parsed = parser.parse("the answer is 42", 100).await.unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.data["answer"], "42");

        let usage = parsed.repair_usage.unwrap();
        assert_eq!(usage.tokens_sent, 110);
        assert!(usage.tokens_received > 0);
        assert!(usage.cost > 0.0);
        assert_eq!(
            backend.seen.lock().unwrap().as_slice(),
            &[("cheap".to_string(), 0.0)]
        );
    }

    #[tokio::test]
    async fn failed_repair_surfaces_parse_error() {
        let backend = Scripted::new(vec![Ok(Completion::without_usage("still not json"))]);
        let parser =
            StructuredResponseParser::new(schema(), backend, registry().repair_model().cloned());
        let (result, spent) = parser.parse_metered("nope", 10).await;
        assert!(matches!(result, Err(PromptError::Parse { .. })));
        assert_eq!(spent.tokens_sent, 11);
        assert!(spent.tokens_received > 0);
    }

    #[tokio::test]
    async fn repair_transport_failure_surfaces_parse_error() {
        let backend = Scripted::new(vec![Err(CompletionError::Transient("HTTP 503".into()))]);
        let parser =
            StructuredResponseParser::new(schema(), backend, registry().repair_model().cloned());
        let err = parser.parse("nope", 10).await.unwrap_err();
        assert!(matches!(err, PromptError::Parse { ref reason } if reason.contains("503")));
    }

    #[tokio::test]
    async fn without_repair_model_validation_errors_surface() {
        let backend = Scripted::new(vec![]);
        let parser = StructuredResponseParser::new(schema(), backend, None);
        assert!(matches!(
            parser.parse("{}", 10).await,
            Err(PromptError::Parse { .. })
        ));
    }
}
