//! Greedy autoregressive decoding over a loaded model
//!
//! The prompt is templated and tokenized, image placeholders are expanded and
//! overwritten with image embeddings, then the decoder runs one step per
//! token. After the first step only the newly chosen token is embedded; the
//! conv and key/value state travels from each step's `present*` outputs into
//! the next step's `past*` inputs.

use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::image::preprocess;
use super::loader::LoadedModel;
use super::session::{ATTENTION_MASK, IMAGE_FEATURES, INPUTS_EMBEDS, INPUT_IDS, LOGITS, PIXEL_VALUES};
use super::streaming::StreamingCallback;
use super::template_engine::{fallback_prompt, sanitize, PromptMessage};
use super::tensor::{argmax, Tensor, TensorMap};
use super::tokenizer::PromptInput;
use super::{ContentPart, FinishReason, GenerationOutput, GenerationRequest};
use crate::error::{Error, Result};

/// Patch embeddings of one image
#[derive(Debug, Clone)]
pub struct ImageEmbedding {
    pub rows: usize,
    /// `rows * hidden` values, row-major
    pub data: Vec<f32>,
}

/// Ids of the image markers in the model vocabulary
#[derive(Debug, Clone, Copy)]
pub struct ImageTokenIds {
    pub placeholder: u32,
    pub start: u32,
    pub end: u32,
}

/// Replace the n-th image placeholder with a start marker, `counts[n]`
/// placeholders and an end marker. Placeholders without a matching image are
/// kept as they are.
pub fn expand_image_placeholders(ids: &[u32], counts: &[usize], tokens: ImageTokenIds) -> Vec<u32> {
    let extra: usize = counts.iter().map(|c| c + 1).sum();
    let mut expanded = Vec::with_capacity(ids.len() + extra);
    let mut images = counts.iter();

    for &id in ids {
        if id != tokens.placeholder {
            expanded.push(id);
            continue;
        }
        match images.next() {
            Some(&count) => {
                expanded.push(tokens.start);
                expanded.extend(std::iter::repeat(tokens.placeholder).take(count));
                expanded.push(tokens.end);
            }
            None => expanded.push(id),
        }
    }
    expanded
}

/// Overwrite the embedding rows at placeholder positions with image rows, in
/// order. Returns the number of image rows that found no placeholder.
pub fn merge_image_rows(
    embeds: &mut Tensor,
    ids: &[u32],
    placeholder: u32,
    image_rows: &[f32],
) -> Result<usize> {
    let hidden = embeds.last_dim();
    if hidden == 0 || image_rows.len() % hidden != 0 {
        return Err(Error::tensor(format!(
            "image embeddings of {} values do not split into rows of {}",
            image_rows.len(),
            hidden
        )));
    }
    let data = embeds.as_f32_mut()?;
    let mut rows = image_rows.chunks_exact(hidden);

    for (position, _) in ids.iter().enumerate().filter(|(_, id)| **id == placeholder) {
        let Some(row) = rows.next() else { break };
        let offset = position * hidden;
        data.get_mut(offset..offset + hidden)
            .ok_or_else(|| Error::tensor("placeholder position beyond embeddings"))?
            .copy_from_slice(row);
    }
    Ok(rows.len())
}

/// Part of `text` past its longest common prefix with `emitted`. That is the
/// appended text, unless decoding rewrote earlier characters, in which case
/// it restarts at the first changed one.
fn text_delta<'t>(emitted: &str, text: &'t str) -> &'t str {
    let common: usize = emitted
        .chars()
        .zip(text.chars())
        .take_while(|(a, b)| a == b)
        .map(|(c, _)| c.len_utf8())
        .sum();
    &text[common..]
}

/// Next chunk to stream, held back while it ends in an incomplete character
fn ready_chunk<'t>(emitted: &str, text: &'t str) -> Option<&'t str> {
    let delta = text_delta(emitted, text);
    if delta.is_empty() || delta.ends_with('\u{FFFD}') {
        return None;
    }
    if delta.len() + emitted.len() != text.len() {
        debug!("Decoded text rewrote earlier output, streaming from the first change");
    }
    Some(delta)
}

/// Runs requests against one loaded model
pub struct InferenceEngine<'a> {
    model: &'a LoadedModel,
}

impl<'a> InferenceEngine<'a> {
    pub fn new(model: &'a LoadedModel) -> Self {
        Self { model }
    }

    /// Requested budget capped by the model's own budget
    pub fn token_budget(&self, requested: Option<usize>) -> usize {
        let limit = self.model.definition.max_new_tokens;
        requested.unwrap_or(limit).min(limit)
    }

    /// Template messages with sanitized text and one placeholder per image,
    /// plus the images in prompt order
    pub fn prompt_messages<'r>(
        &self,
        request: &'r GenerationRequest,
    ) -> (Vec<PromptMessage>, Vec<&'r Bytes>) {
        let tokens = &self.model.definition.tokens;
        let reserved = [tokens.image, tokens.image_start, tokens.image_end, tokens.eos];
        let mut images = Vec::new();

        let messages = request
            .messages
            .iter()
            .map(|message| {
                let mut content = String::new();
                for part in &message.content {
                    match part {
                        ContentPart::Text(text) => content.push_str(&sanitize(text, &reserved)),
                        ContentPart::Image(bytes) => {
                            content.push_str(tokens.image);
                            images.push(bytes);
                        }
                    }
                }
                PromptMessage::new(sanitize(&message.role, &reserved), content)
            })
            .collect();

        (messages, images)
    }

    /// Render and tokenize; falls back to the ChatML format when the
    /// tokenizer cannot template
    pub fn encode_prompt(&self, messages: &[PromptMessage]) -> Result<Vec<u32>> {
        let tokenizer = &self.model.tokenizer;
        match tokenizer.apply_chat_template(messages) {
            Ok(PromptInput::Ids(ids)) => Ok(ids),
            Ok(PromptInput::Text(text)) => tokenizer.encode(&text),
            Err(e) => {
                warn!("Chat template unavailable, using fallback prompt: {}", e);
                tokenizer.encode(&fallback_prompt(messages))
            }
        }
    }

    fn image_token_ids(&self) -> Result<ImageTokenIds> {
        let tokens = &self.model.definition.tokens;
        let tokenizer = &self.model.tokenizer;
        let lookup = |token: &str| {
            tokenizer
                .token_id(token)
                .ok_or_else(|| Error::Multimodal(format!("vocabulary lacks {token}")))
        };
        Ok(ImageTokenIds {
            placeholder: lookup(tokens.image)?,
            start: lookup(tokens.image_start)?,
            end: lookup(tokens.image_end)?,
        })
    }

    /// Run the image embedder over each image
    pub async fn embed_images(&self, images: &[&Bytes]) -> Result<Vec<ImageEmbedding>> {
        let definition = self.model.definition;
        let (Some(layout), Some(embedder)) =
            (definition.vision.as_ref(), self.model.sessions.image_embedder.as_ref())
        else {
            return Err(Error::Multimodal(format!(
                "{} has no image embedder loaded",
                definition.id
            )));
        };

        let hidden = definition.decoder.hidden_size;
        let mut embeddings = Vec::with_capacity(images.len());
        for bytes in images {
            let prepared = preprocess(bytes, layout)?;
            let mut inputs = TensorMap::new();
            inputs.insert(PIXEL_VALUES.to_string(), prepared.pixel_values);

            let mut outputs = embedder.run(inputs).await?;
            let features = outputs
                .remove(IMAGE_FEATURES)
                .ok_or_else(|| Error::tensor("image embedder returned no image_features"))?;
            if features.last_dim() != hidden {
                return Err(Error::tensor(format!(
                    "image features have width {}, decoder expects {}",
                    features.last_dim(),
                    hidden
                )));
            }
            let data = features.as_f32()?.to_vec();
            debug!("Image embedded as {} patches", data.len() / hidden);
            embeddings.push(ImageEmbedding {
                rows: data.len() / hidden,
                data,
            });
        }
        Ok(embeddings)
    }

    async fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor> {
        let mut inputs = TensorMap::new();
        inputs.insert(INPUT_IDS.to_string(), Tensor::token_ids(ids));
        let mut outputs = self.model.sessions.token_embedder.run(inputs).await?;
        let embeds = outputs
            .remove(INPUTS_EMBEDS)
            .ok_or_else(|| Error::tensor("token embedder returned no inputs_embeds"))?;
        if embeds.rank() != 3 || embeds.shape()[1] != ids.len() {
            return Err(Error::tensor(format!(
                "token embeddings have shape {:?} for {} ids",
                embeds.shape(),
                ids.len()
            )));
        }
        Ok(embeds)
    }

    /// The prompt must leave room for at least one generated token
    fn check_context(&self, ids: &[u32]) -> Result<()> {
        let window = self.model.definition.context_window;
        if ids.len() >= window {
            return Err(Error::InvalidRequest(format!(
                "prompt of {} tokens exceeds the {} token context window",
                ids.len(),
                window
            )));
        }
        Ok(())
    }

    /// Prompt ids with images expanded, and the embeddings to start decoding from
    async fn prepare(&self, request: &GenerationRequest) -> Result<(Vec<u32>, Tensor)> {
        if request.has_images() && self.model.sessions.image_embedder.is_none() {
            return Err(Error::Multimodal(format!(
                "{} does not accept images",
                self.model.definition.id
            )));
        }

        let (messages, images) = self.prompt_messages(request);
        let mut ids = self.encode_prompt(&messages)?;

        if images.is_empty() {
            self.check_context(&ids)?;
            let embeds = self.embed_tokens(&ids).await?;
            return Ok((ids, embeds));
        }

        let tokens = self.image_token_ids()?;
        let embeddings = self.embed_images(&images).await?;
        let counts: Vec<usize> = embeddings.iter().map(|e| e.rows).collect();
        ids = expand_image_placeholders(&ids, &counts, tokens);
        self.check_context(&ids)?;

        let mut embeds = self.embed_tokens(&ids).await?;
        let rows: Vec<f32> = embeddings.into_iter().flat_map(|e| e.data).collect();
        let dropped = merge_image_rows(&mut embeds, &ids, tokens.placeholder, &rows)?;
        if dropped > 0 {
            warn!("Dropped {} image embeddings without a placeholder", dropped);
        }
        Ok((ids, embeds))
    }

    /// Greedy decode, streaming text through `callback`
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        callback: &mut dyn StreamingCallback,
    ) -> Result<GenerationOutput> {
        let definition = self.model.definition;
        let tokenizer = &self.model.tokenizer;
        let sessions = &self.model.sessions;
        let eos = tokenizer
            .token_id(definition.tokens.eos)
            .ok_or_else(|| Error::Tokenizer(format!("vocabulary lacks {}", definition.tokens.eos)))?;

        let start = Instant::now();
        let (ids, mut embeds) = self.prepare(request).await?;
        let budget = self
            .token_budget(request.max_tokens)
            .min(definition.context_window - ids.len());
        debug!("Decoding up to {} tokens after a {} token prompt", budget, ids.len());

        let mut past: Vec<Tensor> = sessions.state.iter().map(|s| s.initial_tensor()).collect();
        let mut seen = 0usize;
        let mut generated: Vec<u32> = Vec::new();
        let mut emitted = String::new();
        let mut finish_reason = FinishReason::MaxTokens;

        while generated.len() < budget {
            let step_len = embeds.shape()[1];
            let mut inputs = TensorMap::new();
            inputs.insert(INPUTS_EMBEDS.to_string(), embeds);
            inputs.insert(ATTENTION_MASK.to_string(), Tensor::ones_mask(seen + step_len));
            for (slot, state) in sessions.state.iter().zip(past.drain(..)) {
                inputs.insert(slot.past.clone(), state);
            }

            let mut outputs = sessions.decoder.run(inputs).await?;
            seen += step_len;

            let logits = outputs
                .remove(LOGITS)
                .ok_or_else(|| Error::tensor("decoder returned no logits"))?;
            let token = argmax(logits.last_row()?)
                .ok_or_else(|| Error::tensor("decoder returned empty logits"))? as u32;

            if token == eos {
                finish_reason = FinishReason::EndOfSequence;
                break;
            }
            generated.push(token);

            let text = tokenizer.decode(&generated)?;
            if let Some(chunk) = ready_chunk(&emitted, &text) {
                callback.on_chunk(chunk).await;
                emitted = text;
            }
            let elapsed = start.elapsed();
            if elapsed.as_secs_f64() > 0.0 {
                callback
                    .on_tokens_per_sec(rate(generated.len(), elapsed), generated.len(), elapsed)
                    .await;
            }

            if generated.len() == budget {
                break;
            }
            past = sessions
                .state
                .iter()
                .map(|slot| {
                    outputs
                        .remove(&slot.present)
                        .ok_or_else(|| Error::tensor(format!("decoder returned no {}", slot.present)))
                })
                .collect::<Result<_>>()?;
            embeds = self.embed_tokens(&[token]).await?;
        }

        let text = tokenizer.decode(&generated)?;
        let rest = text_delta(&emitted, &text);
        if !rest.is_empty() {
            callback.on_chunk(rest).await;
        }

        let elapsed = start.elapsed();
        callback.on_complete(generated.len(), elapsed).await;

        Ok(GenerationOutput {
            text,
            tokens_generated: generated.len(),
            finish_reason,
            elapsed,
            tokens_per_second: rate(generated.len(), elapsed),
        })
    }
}

fn rate(tokens: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}
