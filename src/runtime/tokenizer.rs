//! Tokenizer seam and the `tokenizers`-backed implementation

use std::sync::Arc;
use tracing::debug;

use super::template_engine::{PromptMessage, TemplateConfig, TemplateEngine};
use crate::error::{Error, Result};
use crate::models::ModelDefinition;

/// Output of chat templating
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Ids(Vec<u32>),
    Text(String),
}

/// Text <-> token id conversion plus chat templating
pub trait Tokenizer: Send + Sync {
    /// Encode text; control markers present in `text` map to their ids
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn token_id(&self, token: &str) -> Option<u32>;

    /// Render a conversation ready for generation
    fn apply_chat_template(&self, messages: &[PromptMessage]) -> Result<PromptInput>;
}

/// Builds a tokenizer from the cached auxiliary files of a model
pub trait TokenizerFactory: Send + Sync {
    fn build(
        &self,
        definition: &ModelDefinition,
        tokenizer_json: &[u8],
        tokenizer_config: Option<&[u8]>,
    ) -> Result<Arc<dyn Tokenizer>>;
}

/// Tokenizer backed by a Hugging Face `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    template: Option<TemplateEngine>,
}

impl HfTokenizer {
    pub fn from_bytes(tokenizer_json: &[u8], tokenizer_config: Option<&[u8]>) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(tokenizer_json)
            .map_err(|e| Error::Tokenizer(format!("invalid tokenizer.json: {e}")))?;

        let template = match tokenizer_config {
            Some(raw) => match TemplateConfig::from_tokenizer_config(raw)
                .and_then(TemplateEngine::new)
            {
                Ok(engine) => Some(engine),
                Err(e) => {
                    debug!("No usable chat template: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self { inner, template })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    fn apply_chat_template(&self, messages: &[PromptMessage]) -> Result<PromptInput> {
        let engine = self
            .template
            .as_ref()
            .ok_or_else(|| Error::Tokenizer("tokenizer has no chat template".to_string()))?;
        engine
            .apply_chat_template(messages, true)
            .map(PromptInput::Text)
    }
}

/// Factory producing [`HfTokenizer`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct HfTokenizerFactory;

impl TokenizerFactory for HfTokenizerFactory {
    fn build(
        &self,
        definition: &ModelDefinition,
        tokenizer_json: &[u8],
        tokenizer_config: Option<&[u8]>,
    ) -> Result<Arc<dyn Tokenizer>> {
        let tokenizer = HfTokenizer::from_bytes(tokenizer_json, tokenizer_config)?;
        let mut required = vec![definition.tokens.eos];
        if definition.supports_images() {
            let tokens = &definition.tokens;
            required.extend([tokens.image, tokens.image_start, tokens.image_end]);
        }
        for token in required {
            if tokenizer.token_id(token).is_none() {
                return Err(Error::Tokenizer(format!(
                    "{} vocabulary lacks {token}",
                    definition.id
                )));
            }
        }
        Ok(Arc::new(tokenizer))
    }
}
