//! Static catalog of model definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::constants::{cache::GENERATION_SEPARATOR, vision};
use crate::error::Error;

/// Precision/format choice for the same architecture, each with its own file set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    Fp32,
    Fp16,
    Q4F16,
    Q4,
    Q8,
}

impl Quantization {
    /// File-name suffix appended to a sub-network stem
    pub fn suffix(&self) -> &'static str {
        match self {
            Quantization::Fp32 => "",
            Quantization::Fp16 => "_fp16",
            Quantization::Q4F16 => "_q4f16",
            Quantization::Q4 => "_q4",
            Quantization::Q8 => "_quantized",
        }
    }

    /// Bits per weight, used to rank variants by precision
    pub fn weight_bits(&self) -> u8 {
        match self {
            Quantization::Fp32 => 32,
            Quantization::Fp16 => 16,
            Quantization::Q8 => 8,
            Quantization::Q4F16 | Quantization::Q4 => 4,
        }
    }

    /// Whether the variant stores activations in half precision
    pub fn needs_shader_f16(&self) -> bool {
        matches!(self, Quantization::Fp16 | Quantization::Q4F16)
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantization::Fp32 => "fp32",
            Quantization::Fp16 => "fp16",
            Quantization::Q4F16 => "q4f16",
            Quantization::Q4 => "q4",
            Quantization::Q8 => "q8",
        };
        f.write_str(name)
    }
}

impl FromStr for Quantization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp32" | "f32" => Ok(Quantization::Fp32),
            "fp16" | "f16" => Ok(Quantization::Fp16),
            "q4f16" => Ok(Quantization::Q4F16),
            "q4" => Ok(Quantization::Q4),
            "q8" | "quantized" => Ok(Quantization::Q8),
            other => Err(Error::Config(format!("unknown quantization '{other}'"))),
        }
    }
}

/// Kind of a decoder layer, which determines the recurrent state it carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Short convolution block carrying a fixed-size rolling state
    Conv,
    /// Grouped-query attention block carrying a growing key/value cache
    Attention,
}

/// Shape information for the decoder's per-layer state
#[derive(Debug, Clone, Copy)]
pub struct DecoderLayout {
    pub hidden_size: usize,
    pub vocab_size: usize,
    pub layers: &'static [LayerKind],
    /// Length of the rolling convolution state
    pub conv_cache_len: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl DecoderLayout {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// File-name stems of the sub-networks, without quantization suffix
#[derive(Debug, Clone, Copy)]
pub struct SessionStems {
    pub token_embedder: &'static str,
    pub decoder: &'static str,
}

/// Image encoder layout for the multimodal variant
#[derive(Debug, Clone, Copy)]
pub struct VisionLayout {
    pub image_embedder: &'static str,
    pub tile_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// Special tokens the engine needs by literal text
#[derive(Debug, Clone, Copy)]
pub struct SpecialTokens {
    pub eos: &'static str,
    pub image: &'static str,
    pub image_start: &'static str,
    pub image_end: &'static str,
}

/// Immutable description of one servable model
#[derive(Debug, Clone, Copy)]
pub struct ModelDefinition {
    pub id: &'static str,
    pub label: &'static str,
    /// Repository coordinates, `org/name`
    pub repository: &'static str,
    pub revision: &'static str,
    pub quantization: Quantization,
    /// GPU variants tried in order after the primary one fails
    pub fallbacks: &'static [Quantization],
    /// Variant used for the CPU tier
    pub cpu_fallback: Quantization,
    pub context_window: usize,
    pub max_new_tokens: usize,
    pub stems: SessionStems,
    pub vision: Option<VisionLayout>,
    pub decoder: DecoderLayout,
    pub tokens: SpecialTokens,
}

impl ModelDefinition {
    pub fn supports_images(&self) -> bool {
        self.vision.is_some()
    }

    /// GPU variants in ladder order: primary first, then declared fallbacks
    pub fn gpu_variants(&self) -> impl Iterator<Item = Quantization> + '_ {
        std::iter::once(self.quantization).chain(
            self.fallbacks
                .iter()
                .copied()
                .filter(move |q| *q != self.quantization),
        )
    }

    /// Lowest-precision variant among everything the definition declares
    pub fn lowest_precision(&self) -> Quantization {
        self.gpu_variants()
            .chain(std::iter::once(self.cpu_fallback))
            .min_by_key(|q| q.weight_bits())
            .unwrap_or(self.cpu_fallback)
    }

    /// Name of the cache generation holding this model at `revision`
    pub fn cache_generation(&self, revision: &str) -> String {
        format!("{}{}{}", self.id, GENERATION_SEPARATOR, revision)
    }
}

const LFM2_LAYERS: &[LayerKind] = {
    use LayerKind::{Attention as A, Conv as C};
    &[C, C, A, C, C, A, C, C, A, C, A, C, A, C, A, C]
};

const LFM2_TOKENS: SpecialTokens = SpecialTokens {
    eos: "<|im_end|>",
    image: "<image>",
    image_start: "<|image_start|>",
    image_end: "<|image_end|>",
};

const TEXT_STEMS: SessionStems = SessionStems {
    token_embedder: "embed_tokens",
    decoder: "decoder_model_merged",
};

static CATALOG: &[ModelDefinition] = &[
    ModelDefinition {
        id: "lfm2-350m",
        label: "LFM2 350M",
        repository: "onnx-community/LFM2-350M-ONNX",
        revision: "main",
        quantization: Quantization::Q4F16,
        fallbacks: &[Quantization::Fp16, Quantization::Q4],
        cpu_fallback: Quantization::Q4,
        context_window: 32_768,
        max_new_tokens: 1024,
        stems: TEXT_STEMS,
        vision: None,
        decoder: DecoderLayout {
            hidden_size: 1024,
            vocab_size: 65_536,
            layers: LFM2_LAYERS,
            conv_cache_len: 3,
            num_kv_heads: 8,
            head_dim: 64,
        },
        tokens: LFM2_TOKENS,
    },
    ModelDefinition {
        id: "lfm2-1.2b",
        label: "LFM2 1.2B",
        repository: "onnx-community/LFM2-1.2B-ONNX",
        revision: "main",
        quantization: Quantization::Q4F16,
        fallbacks: &[Quantization::Q4],
        cpu_fallback: Quantization::Q4,
        context_window: 32_768,
        max_new_tokens: 2048,
        stems: TEXT_STEMS,
        vision: None,
        decoder: DecoderLayout {
            hidden_size: 2048,
            vocab_size: 65_536,
            layers: LFM2_LAYERS,
            conv_cache_len: 3,
            num_kv_heads: 8,
            head_dim: 64,
        },
        tokens: LFM2_TOKENS,
    },
    ModelDefinition {
        id: "lfm2-vl-450m",
        label: "LFM2-VL 450M",
        repository: "onnx-community/LFM2-VL-450M-ONNX",
        revision: "main",
        quantization: Quantization::Q4F16,
        fallbacks: &[Quantization::Fp16, Quantization::Q4],
        cpu_fallback: Quantization::Q4,
        context_window: 32_768,
        max_new_tokens: 1024,
        stems: TEXT_STEMS,
        vision: Some(VisionLayout {
            image_embedder: "embed_images",
            tile_size: vision::TILE_SIZE,
            mean: vision::MEAN,
            std: vision::STD,
        }),
        decoder: DecoderLayout {
            hidden_size: 1024,
            vocab_size: 65_536,
            layers: LFM2_LAYERS,
            conv_cache_len: 3,
            num_kv_heads: 8,
            head_dim: 64,
        },
        tokens: LFM2_TOKENS,
    },
];

/// All servable model definitions
pub fn catalog() -> &'static [ModelDefinition] {
    CATALOG
}

/// Look up a definition by id
pub fn find(id: &str) -> Option<&'static ModelDefinition> {
    CATALOG.iter().find(|m| m.id == id)
}
