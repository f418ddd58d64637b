//! Shared fixtures: a scripted completion backend and small registries.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use throttle_rs::api::completion::{
    Completion, CompletionBackend, CompletionFuture, CompletionRequest,
};
use throttle_rs::error::CompletionError;
use throttle_rs::model::{HeuristicTokenizer, ModelPricing, ModelProfile, ModelRegistry};
use throttle_rs::{Message, MessageRole};

/// One request as the backend saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<Message>,
}

impl SeenRequest {
    pub fn user_text(&self) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default()
    }
}

/// Replies from a fixed script, in order, and records every request.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<Completion, CompletionError>>>,
    seen: Mutex<Vec<SeenRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<Completion, CompletionError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }
}

impl CompletionBackend for ScriptedBackend {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFuture<'a> {
        self.seen.lock().unwrap().push(SeenRequest {
            model: request.model.to_string(),
            temperature: request.temperature,
            messages: request.messages.to_vec(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CompletionError::Fatal("script exhausted".into())));
        Box::pin(async move { reply })
    }
}

pub fn ok(text: &str, sent: usize, received: usize) -> Result<Completion, CompletionError> {
    Ok(Completion::new(text, sent, received))
}

pub fn transient(msg: &str) -> Result<Completion, CompletionError> {
    Err(CompletionError::Transient(msg.into()))
}

pub fn fatal(msg: &str) -> Result<Completion, CompletionError> {
    Err(CompletionError::Fatal(msg.into()))
}

pub fn profile(id: &str, max_tokens: usize, tx: f64, rx: f64) -> ModelProfile {
    ModelProfile::new(
        id,
        max_tokens,
        ModelPricing::per_million(tx, rx),
        600,
        1_000_000,
        Arc::new(HeuristicTokenizer::default()),
    )
}

/// `main` (8k context) plus a cheaper `cheap` model used for repairs.
pub fn registry() -> Arc<ModelRegistry> {
    Arc::new(
        ModelRegistry::new(1.0)
            .register(profile("main", 8192, 3.0, 15.0))
            .register(profile("cheap", 8192, 0.15, 0.6)),
    )
}

/// A single model with the given context size.
pub fn single(max_tokens: usize) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(1.0).register(profile("main", max_tokens, 3.0, 15.0)))
}
