pub mod api;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod runtime;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use models::{catalog, find, ModelDefinition, Quantization};
pub use runtime::{ChatMessage, ContentPart, FinishReason, GenerationOutput, GenerationRequest};
pub use service::{LlmRuntime, LlmRuntimeBuilder};
