//! Model metadata: profiles, pricing, tokenizers and the shared registry.

pub mod profile;
pub mod registry;

pub use profile::{
    DEFAULT_CHARS_PER_TOKEN, HeuristicTokenizer, ModelPricing, ModelProfile, TiktokenTokenizer,
    Tokenizer, pricing_for_model,
};
pub use registry::{ModelConfig, ModelHandle, ModelRegistry, ModelsConfig, TokenizerKind};
