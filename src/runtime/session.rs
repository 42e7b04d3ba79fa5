//! Typed contracts for the sub-network sessions of a model
//!
//! Each sub-network is validated once, right after construction, against a
//! [`SessionDescriptor`] listing the named tensors the decode loop relies on.
//! The decoder's per-layer state is described by [`StateSlot`]s that map each
//! `present*` output to the `past*` input it feeds on the next step.

use std::sync::Arc;

use super::backend::{Session, TensorInfo};
use super::tensor::{DType, Tensor};
use crate::api::SubNetwork;
use crate::error::{Error, Result};
use crate::models::{DecoderLayout, LayerKind, ModelDefinition};

pub const INPUT_IDS: &str = "input_ids";
pub const INPUTS_EMBEDS: &str = "inputs_embeds";
pub const PIXEL_VALUES: &str = "pixel_values";
pub const IMAGE_FEATURES: &str = "image_features";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const LOGITS: &str = "logits";

/// One recurrent or key/value state tensor of the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSlot {
    pub layer: usize,
    pub kind: LayerKind,
    /// Input name the state is fed through
    pub past: String,
    /// Output name the updated state comes back under
    pub present: String,
    /// Shape of the state before the first step
    pub initial_shape: Vec<usize>,
}

impl StateSlot {
    /// Index of the sequence axis, for state that grows with every step
    pub fn sequence_axis(&self) -> Option<usize> {
        match self.kind {
            LayerKind::Conv => None,
            LayerKind::Attention => Some(2),
        }
    }

    pub fn initial_tensor(&self) -> Tensor {
        Tensor::zeros(self.initial_shape.clone())
    }
}

/// State slots for every decoder layer, in layer order
pub fn state_slots(layout: &DecoderLayout) -> Vec<StateSlot> {
    let mut slots = Vec::new();
    for (layer, kind) in layout.layers.iter().enumerate() {
        match kind {
            LayerKind::Conv => slots.push(StateSlot {
                layer,
                kind: *kind,
                past: format!("past_conv.{layer}"),
                present: format!("present_conv.{layer}"),
                initial_shape: vec![1, layout.hidden_size, layout.conv_cache_len],
            }),
            LayerKind::Attention => {
                for part in ["key", "value"] {
                    slots.push(StateSlot {
                        layer,
                        kind: *kind,
                        past: format!("past_key_values.{layer}.{part}"),
                        present: format!("present.{layer}.{part}"),
                        initial_shape: vec![1, layout.num_kv_heads, 0, layout.head_dim],
                    });
                }
            }
        }
    }
    slots
}

/// Tensors a sub-network must declare
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub role: SubNetwork,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

impl SessionDescriptor {
    pub fn token_embedder() -> Self {
        Self {
            role: SubNetwork::TokenEmbedder,
            inputs: vec![TensorInfo::new(INPUT_IDS, DType::I64, 2)],
            outputs: vec![TensorInfo::new(INPUTS_EMBEDS, DType::F32, 3)],
        }
    }

    pub fn image_embedder() -> Self {
        Self {
            role: SubNetwork::ImageEmbedder,
            inputs: vec![TensorInfo::new(PIXEL_VALUES, DType::F32, 4)],
            outputs: vec![TensorInfo::new(IMAGE_FEATURES, DType::F32, 2)],
        }
    }

    pub fn decoder(layout: &DecoderLayout) -> Self {
        let slots = state_slots(layout);
        let mut inputs = vec![
            TensorInfo::new(INPUTS_EMBEDS, DType::F32, 3),
            TensorInfo::new(ATTENTION_MASK, DType::I64, 2),
        ];
        let mut outputs = vec![TensorInfo::new(LOGITS, DType::F32, 3)];
        for slot in &slots {
            let rank = slot.initial_shape.len();
            inputs.push(TensorInfo::new(&slot.past, DType::F32, rank));
            outputs.push(TensorInfo::new(&slot.present, DType::F32, rank));
        }
        Self {
            role: SubNetwork::Decoder,
            inputs,
            outputs,
        }
    }

    pub fn for_role(role: SubNetwork, definition: &ModelDefinition) -> Self {
        match role {
            SubNetwork::TokenEmbedder => Self::token_embedder(),
            SubNetwork::ImageEmbedder => Self::image_embedder(),
            SubNetwork::Decoder => Self::decoder(&definition.decoder),
        }
    }

    /// Check that `session` declares every expected tensor with the expected
    /// type. A session may declare additional tensors.
    pub fn validate(&self, session: &dyn Session) -> Result<()> {
        check_declared(self.role, "input", &self.inputs, &session.inputs())?;
        check_declared(self.role, "output", &self.outputs, &session.outputs())
    }
}

fn check_declared(
    role: SubNetwork,
    direction: &str,
    expected: &[TensorInfo],
    declared: &[TensorInfo],
) -> Result<()> {
    for want in expected {
        let Some(have) = declared.iter().find(|t| t.name == want.name) else {
            return Err(Error::tensor(format!(
                "{role} session has no {direction} named '{}'",
                want.name
            )));
        };
        if have.dtype != want.dtype {
            return Err(Error::tensor(format!(
                "{role} {direction} '{}' is {}, expected {}",
                want.name, have.dtype, want.dtype
            )));
        }
        if let (Some(have_rank), Some(want_rank)) = (have.rank, want.rank) {
            if have_rank != want_rank {
                return Err(Error::tensor(format!(
                    "{role} {direction} '{}' has rank {}, expected {}",
                    want.name, have_rank, want_rank
                )));
            }
        }
    }
    Ok(())
}

/// The validated sessions of one loaded model
#[derive(Clone)]
pub struct ModelSessions {
    pub token_embedder: Arc<dyn Session>,
    pub image_embedder: Option<Arc<dyn Session>>,
    pub decoder: Arc<dyn Session>,
    pub state: Vec<StateSlot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::find;

    #[test]
    fn test_state_slots_follow_layer_kinds() {
        let model = find("lfm2-350m").expect("test: catalog entry");
        let slots = state_slots(&model.decoder);

        let convs = model.decoder.layers.iter().filter(|k| **k == LayerKind::Conv).count();
        let attns = model.decoder.num_layers() - convs;
        assert_eq!(slots.len(), convs + 2 * attns);

        let first = &slots[0];
        assert_eq!(first.past, "past_conv.0");
        assert_eq!(first.present, "present_conv.0");
        assert_eq!(first.initial_shape, vec![1, 1024, 3]);

        let kv = slots.iter().find(|s| s.kind == LayerKind::Attention).unwrap();
        assert_eq!(kv.past, "past_key_values.2.key");
        assert_eq!(kv.present, "present.2.key");
        assert_eq!(kv.initial_shape, vec![1, 8, 0, 64]);
        assert_eq!(kv.sequence_axis(), Some(2));
    }

    #[test]
    fn test_decoder_descriptor_pairs_past_and_present() {
        let model = find("lfm2-350m").expect("test: catalog entry");
        let descriptor = SessionDescriptor::decoder(&model.decoder);
        assert_eq!(descriptor.inputs.len(), descriptor.outputs.len() + 1);
        assert!(descriptor.outputs.iter().any(|t| t.name == LOGITS));
    }
}
