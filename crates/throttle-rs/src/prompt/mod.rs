//! Prompt construction, output validation and the call engine.

pub mod engine;
pub mod parser;
pub mod schema;
pub mod template;

pub use engine::{CallOptions, CallResult, Prompt, PromptInput, TEMPLATE_FILLER};
pub use parser::{ParsedResponse, StructuredResponseParser};
pub use schema::ResponseSchema;
pub use template::MessageTemplate;
