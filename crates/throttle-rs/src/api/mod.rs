//! Everything between a prompt and the provider: admission control, the
//! completion capability, retry policy and usage accounting.
//!
//! - [`admission`]: per-model request/token reservoirs refilled every 60s.
//! - [`completion`]: [`CompletionBackend`] trait and the OpenRouter client.
//! - [`retry`]: [`RetryConfig`] and transient/permanent error classification.
//! - [`usage`]: the [`Usage`] accumulator and run ids.

pub mod admission;
pub mod completion;
pub mod retry;
pub mod usage;

pub use admission::{AdmissionController, AdmissionSnapshot, Metered};
pub use completion::{Completion, CompletionBackend, CompletionRequest, OpenRouterClient};
pub use retry::RetryConfig;
pub use usage::{Usage, generate_run_id};
