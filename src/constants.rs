//! Shared constants for the draftlm serving subsystem
//!
//! Centralizes network, cache and preprocessing constants to maintain
//! consistency across the codebase.

/// Remote weight repository defaults
pub mod hub {
    /// Default Hugging Face endpoint
    pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";

    /// User agent sent with every request
    pub const USER_AGENT: &str = concat!("draftlm/", env!("CARGO_PKG_VERSION"));

    /// Directory holding ONNX sub-network files inside a repository
    pub const ONNX_DIR: &str = "onnx";

    /// Vocabulary and pre-tokenizer definition
    pub const TOKENIZER_JSON: &str = "tokenizer.json";

    /// Special tokens and chat template
    pub const TOKENIZER_CONFIG: &str = "tokenizer_config.json";

    /// Tokenizer files fetched alongside the weights
    pub const TOKENIZER_FILES: &[&str] = &[TOKENIZER_JSON, TOKENIZER_CONFIG];
}

/// Acquisition and retry limits
pub mod acquisition {
    /// Minimum wall time between two progress ticks
    pub const PROGRESS_INTERVAL_MS: u64 = 500;

    /// Attempts per file before a transient failure propagates
    pub const MAX_ATTEMPTS: u32 = 3;

    /// First backoff delay, doubled on every retry
    pub const BASE_DELAY_MS: u64 = 500;

    /// Upper bound for a single backoff delay
    pub const MAX_DELAY_MS: u64 = 10_000;

    /// Upper bound for concurrent per-file downloads
    pub const MAX_CONCURRENT_DOWNLOADS: usize = 4;
}

/// File-name conventions of the blob cache
pub mod cache {
    /// Extension of committed blob payloads
    pub const BLOB_EXT: &str = "blob";

    /// Extension of the JSON sidecar describing a blob
    pub const SIDECAR_EXT: &str = "json";

    /// Extension of in-progress writes
    pub const PARTIAL_EXT: &str = "partial";

    /// Separator between model id and revision in generation names
    pub const GENERATION_SEPARATOR: char = '@';
}

/// Image preprocessing for vision encoders
pub mod vision {
    /// SigLIP normalization mean [R, G, B]
    pub const MEAN: [f32; 3] = [0.5, 0.5, 0.5];

    /// SigLIP normalization std [R, G, B]
    pub const STD: [f32; 3] = [0.5, 0.5, 0.5];

    /// Side of one square patch in pixels
    pub const TILE_SIZE: u32 = 512;

    /// Aspect ratio beyond which an image is tiled as a single row or column
    pub const STRONG_ASPECT_RATIO: f32 = 2.0;
}

/// Chat prompt markup
pub mod prompt {
    /// Opening marker of a chat turn
    pub const TURN_START: &str = "<|im_start|>";

    /// Closing marker of a chat turn
    pub const TURN_END: &str = "<|im_end|>";

    /// Leading marker of a rendered prompt
    pub const BOS: &str = "<|startoftext|>";
}
