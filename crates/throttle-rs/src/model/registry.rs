//! Process-wide model registry.
//!
//! Built once at startup (usually from a JSON file) and shared as
//! `Arc<ModelRegistry>` with every prompt and summarizer. It owns exactly one
//! [`ModelProfile`] and one [`AdmissionController`] per model identifier, so
//! all callers targeting a model draw from the same reservoirs.
//!
//! # Config format
//!
//! ```json
//! {
//!   "buffer_fraction": 0.8,
//!   "repair_model": "openai/gpt-4o-mini",
//!   "models": {
//!     "openai/gpt-4o-mini": {
//!       "max_tokens": 128000,
//!       "token_tx_price": 0.00000015,
//!       "token_rx_price": 0.0000006,
//!       "requests_per_minute": 500,
//!       "tokens_per_minute": 200000
//!     }
//!   }
//! }
//! ```
//!
//! Prices are optional and fall back to [`pricing_for_model`]. Token counts
//! use tiktoken's `cl100k_base` unless a model sets `"tokenizer": "heuristic"`
//! or a `chars_per_token` ratio.

use super::profile::{
    DEFAULT_CHARS_PER_TOKEN, HeuristicTokenizer, ModelPricing, ModelProfile, TiktokenTokenizer,
    Tokenizer, pricing_for_model,
};
use crate::api::admission::{AdmissionController, DEFAULT_BUFFER_FRACTION};
use crate::error::{ConfigError, PromptError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Top-level model configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_buffer_fraction", alias = "bufferFraction")]
    pub buffer_fraction: f64,
    #[serde(default, alias = "repairModel")]
    pub repair_model: Option<String>,
    pub models: BTreeMap<String, ModelConfig>,
}

fn default_buffer_fraction() -> f64 {
    DEFAULT_BUFFER_FRACTION
}

/// Settings for one model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(alias = "maxTokens")]
    pub max_tokens: usize,
    #[serde(default, alias = "tokenTxPrice")]
    pub token_tx_price: Option<f64>,
    #[serde(default, alias = "tokenRxPrice", alias = "tokensRxPrice")]
    pub token_rx_price: Option<f64>,
    #[serde(alias = "requestsPerMinute")]
    pub requests_per_minute: u64,
    #[serde(alias = "tokensPerMinute")]
    pub tokens_per_minute: u64,
    #[serde(default)]
    pub tokenizer: Option<TokenizerKind>,
    #[serde(default, alias = "charsPerToken")]
    pub chars_per_token: Option<f64>,
}

/// Which tokenizer a model counts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    #[serde(alias = "cl100k")]
    Cl100kBase,
    Heuristic,
}

impl ModelConfig {
    /// Explicit choice, else heuristic when a ratio is given, else BPE.
    pub fn tokenizer_kind(&self) -> TokenizerKind {
        match (self.tokenizer, self.chars_per_token) {
            (Some(kind), _) => kind,
            (None, Some(_)) => TokenizerKind::Heuristic,
            (None, None) => TokenizerKind::Cl100kBase,
        }
    }
}

/// A model's profile and admission controller, cheap to clone.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub profile: Arc<ModelProfile>,
    pub admission: Arc<AdmissionController>,
}

impl ModelHandle {
    pub fn id(&self) -> &str {
        self.profile.id()
    }
}

/// Registry of every configured model.
#[derive(Debug)]
pub struct ModelRegistry {
    buffer_fraction: f64,
    models: HashMap<String, ModelHandle>,
    repair_model: Option<String>,
}

impl ModelRegistry {
    /// Empty registry; add models with [`register`](Self::register).
    pub fn new(buffer_fraction: f64) -> Self {
        Self {
            buffer_fraction,
            models: HashMap::new(),
            repair_model: None,
        }
    }

    /// Add a model, creating its admission controller.
    pub fn register(mut self, profile: ModelProfile) -> Self {
        let admission = AdmissionController::new(
            profile.id(),
            profile.requests_per_minute(),
            profile.tokens_per_minute(),
            self.buffer_fraction,
        );
        debug!("Registered model {profile:?}");
        self.models.insert(
            profile.id().to_string(),
            ModelHandle {
                profile: Arc::new(profile),
                admission: Arc::new(admission),
            },
        );
        self
    }

    /// Use `model` for repair passes instead of the cheapest model.
    pub fn with_repair_model(mut self, model: impl Into<String>) -> Self {
        self.repair_model = Some(model.into());
        self
    }

    pub fn from_config(config: &ModelsConfig) -> Result<Self, ConfigError> {
        if !(config.buffer_fraction > 0.0 && config.buffer_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "buffer_fraction must be in (0, 1], got {}",
                config.buffer_fraction
            )));
        }
        if config.models.is_empty() {
            return Err(ConfigError::Invalid("no models configured".into()));
        }

        let mut registry = Self::new(config.buffer_fraction);
        let mut bpe = None;
        for (id, model) in &config.models {
            let tokenizer = tokenizer_for(id, model, &mut bpe);
            registry = registry.register(profile_from_config(id, model, tokenizer)?);
        }

        if let Some(ref repair) = config.repair_model {
            if !registry.models.contains_key(repair) {
                return Err(ConfigError::Invalid(format!(
                    "repair_model '{repair}' is not a configured model"
                )));
            }
            registry = registry.with_repair_model(repair.clone());
        }
        info!(
            "Model registry ready: {} model(s), repair model {}",
            registry.models.len(),
            registry.repair_model().map_or("(none)", |h| h.id()),
        );
        Ok(registry)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ModelsConfig = serde_json::from_str(json)?;
        Self::from_config(&config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn get(&self, model: &str) -> Option<&ModelHandle> {
        self.models.get(model)
    }

    pub fn resolve(&self, model: &str) -> Result<ModelHandle, PromptError> {
        self.get(model)
            .cloned()
            .ok_or_else(|| PromptError::UnknownModel(model.to_string()))
    }

    /// The configured repair model, or the model with the lowest token prices.
    pub fn repair_model(&self) -> Option<&ModelHandle> {
        if let Some(ref id) = self.repair_model {
            return self.models.get(id);
        }
        self.models.values().min_by(|a, b| {
            let pa = a.profile.pricing();
            let pb = b.profile.pricing();
            (pa.tx_per_token + pa.rx_per_token)
                .total_cmp(&(pb.tx_per_token + pb.rx_per_token))
                .then_with(|| a.id().cmp(b.id()))
        })
    }

    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Build the model's tokenizer. The BPE tables load once per registry and are
/// shared; if they fail to load the model falls back to the heuristic.
fn tokenizer_for(
    id: &str,
    model: &ModelConfig,
    bpe: &mut Option<Arc<dyn Tokenizer>>,
) -> Arc<dyn Tokenizer> {
    let heuristic = || -> Arc<dyn Tokenizer> {
        Arc::new(HeuristicTokenizer::new(
            model.chars_per_token.unwrap_or(DEFAULT_CHARS_PER_TOKEN),
        ))
    };
    if model.tokenizer_kind() == TokenizerKind::Heuristic {
        return heuristic();
    }
    if let Some(shared) = bpe {
        return Arc::clone(shared);
    }
    match TiktokenTokenizer::new() {
        Ok(tokenizer) => {
            let shared: Arc<dyn Tokenizer> = Arc::new(tokenizer);
            *bpe = Some(Arc::clone(&shared));
            shared
        }
        Err(e) => {
            warn!("{id}: {e}, counting tokens heuristically");
            heuristic()
        }
    }
}

fn profile_from_config(
    id: &str,
    model: &ModelConfig,
    tokenizer: Arc<dyn Tokenizer>,
) -> Result<ModelProfile, ConfigError> {
    if model.max_tokens == 0 {
        return Err(ConfigError::Invalid(format!("{id}: max_tokens must be > 0")));
    }
    if model.requests_per_minute == 0 || model.tokens_per_minute == 0 {
        return Err(ConfigError::Invalid(format!(
            "{id}: requests_per_minute and tokens_per_minute must be > 0"
        )));
    }

    let fallback = pricing_for_model(id);
    let pricing = ModelPricing {
        tx_per_token: model.token_tx_price.unwrap_or(fallback.tx_per_token),
        rx_per_token: model.token_rx_price.unwrap_or(fallback.rx_per_token),
    };
    if pricing.tx_per_token < 0.0 || pricing.rx_per_token < 0.0 {
        return Err(ConfigError::Invalid(format!("{id}: prices must be non-negative")));
    }

    Ok(ModelProfile::new(
        id,
        model.max_tokens,
        pricing,
        model.requests_per_minute,
        model.tokens_per_minute,
        tokenizer,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"{
        "models": {
            "openai/gpt-4o": {
                "maxTokens": 128000,
                "tokenTxPrice": 0.0000025,
                "tokensRxPrice": 0.00001,
                "requestsPerMinute": 100,
                "tokensPerMinute": 30000
            },
            "openai/gpt-4o-mini": {
                "max_tokens": 128000,
                "requests_per_minute": 500,
                "tokens_per_minute": 200000
            }
        }
    }"#;

    #[test]
    fn loads_camel_and_snake_case_keys() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        assert_eq!(registry.model_ids(), vec!["openai/gpt-4o", "openai/gpt-4o-mini"]);
        let big = registry.get("openai/gpt-4o").unwrap();
        assert_eq!(big.profile.max_context_tokens(), 128_000);
        assert!((big.profile.pricing().rx_per_token - 0.00001).abs() < 1e-15);
    }

    #[test]
    fn admission_uses_default_buffer_fraction() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        let snap = registry.get("openai/gpt-4o").unwrap().admission.snapshot();
        assert_eq!(snap.request_capacity, 80);
        assert_eq!(snap.token_capacity, 24_000);
    }

    #[test]
    fn missing_prices_fall_back_to_table() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        let mini = registry.get("openai/gpt-4o-mini").unwrap();
        assert_eq!(mini.profile.pricing(), pricing_for_model("openai/gpt-4o-mini"));
    }

    #[test]
    fn tokenizer_defaults_to_bpe() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        for id in registry.model_ids() {
            let profile = &registry.get(id).unwrap().profile;
            assert_eq!(profile.tokenizer().name(), "cl100k_base");
        }
    }

    #[test]
    fn heuristic_tokenizer_is_configurable() {
        let json = r#"{"models": {
            "explicit": {"max_tokens": 10, "requests_per_minute": 1, "tokens_per_minute": 1,
                         "tokenizer": "heuristic"},
            "ratio": {"max_tokens": 10, "requests_per_minute": 1, "tokens_per_minute": 1,
                      "chars_per_token": 4.0},
            "bpe": {"max_tokens": 10, "requests_per_minute": 1, "tokens_per_minute": 1,
                    "tokenizer": "cl100k_base", "chars_per_token": 4.0}
        }}"#;
        let registry = ModelRegistry::from_json(json).unwrap();
        let name = |id: &str| registry.get(id).unwrap().profile.tokenizer().name().to_string();
        assert_eq!(name("explicit"), "heuristic");
        assert_eq!(name("ratio"), "heuristic");
        assert_eq!(name("bpe"), "cl100k_base");
    }

    #[test]
    fn repair_model_defaults_to_cheapest() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        assert_eq!(registry.repair_model().unwrap().id(), "openai/gpt-4o-mini");
    }

    #[test]
    fn unknown_repair_model_rejected() {
        let json = CONFIG.replacen("{", r#"{ "repair_model": "nope","#, 1);
        assert!(matches!(
            ModelRegistry::from_json(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn zero_limits_rejected() {
        let json = r#"{"models": {"m": {"max_tokens": 0, "requests_per_minute": 1, "tokens_per_minute": 1}}}"#;
        assert!(matches!(
            ModelRegistry::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn resolve_unknown_model_errors() {
        let registry = ModelRegistry::from_json(CONFIG).unwrap();
        assert!(matches!(
            registry.resolve("missing"),
            Err(PromptError::UnknownModel(id)) if id == "missing"
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let registry = ModelRegistry::load(file.path()).unwrap();
        assert!(registry.get("openai/gpt-4o").is_some());

        let missing = ModelRegistry::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
