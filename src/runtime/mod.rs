//! Model runtime: backend loading, session contracts and the decode loop

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod backend;
pub mod engine;
#[cfg(feature = "wgpu")]
pub mod gpu;
pub mod guard;
pub mod image;
pub mod loader;
pub mod session;
pub mod streaming;
pub mod template_engine;
pub mod tensor;
pub mod tokenizer;

pub use backend::{default_probe, ExecutionBackend, GpuDevice, GpuProbe, NoGpu, Session, SessionSource, TensorInfo};
pub use engine::InferenceEngine;
pub use guard::{GenerationGate, SingleFlight};
pub use loader::{fallback_ladder, BackendLoader, LoadAttempt, LoadPhase, LoadedModel};
pub use session::{ModelSessions, SessionDescriptor, StateSlot};
pub use streaming::{
    ChannelCallback, CollectingCallback, GenerationEvent, GenerationStream, NoopCallback,
    StreamingCallback,
};
pub use template_engine::PromptMessage;
pub use tensor::{DType, Tensor, TensorMap};
pub use tokenizer::{HfTokenizer, HfTokenizerFactory, PromptInput, Tokenizer, TokenizerFactory};

/// One part of a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    /// Encoded image bytes (PNG, JPEG or WebP)
    Image(Bytes),
}

/// Chat message of a generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self::text("user", text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::text("system", text)
    }

    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: vec![ContentPart::Text(text.into())],
        }
    }

    /// Append an image after the existing content
    pub fn with_image(mut self, image: impl Into<Bytes>) -> Self {
        self.content.push(ContentPart::Image(image.into()));
        self
    }

    pub fn images(&self) -> impl Iterator<Item = &Bytes> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::Image(bytes) => Some(bytes),
            ContentPart::Text(_) => None,
        })
    }
}

/// Generation request parameters
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    /// Token budget; defaults to and is capped by the model's budget
    pub max_tokens: Option<usize>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|m| m.images().next().is_some())
    }
}

/// Reason why generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// The model produced its end-of-sequence token
    EndOfSequence,
    /// The token budget ran out
    MaxTokens,
}

/// Generation result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens_generated: usize,
    pub finish_reason: FinishReason,
    pub elapsed: Duration,
    pub tokens_per_second: f64,
}
