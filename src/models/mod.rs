//! Model definitions served by the runtime
//!
//! The catalog is a small fixed table of ONNX model repositories. Every other
//! component consumes these definitions; nothing mutates them.

pub mod catalog;

pub use catalog::{
    catalog, find, DecoderLayout, LayerKind, ModelDefinition, Quantization, SessionStems,
    SpecialTokens, VisionLayout,
};
