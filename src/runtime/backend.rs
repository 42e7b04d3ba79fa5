//! Seams to the GPU adapter and the tensor execution library
//!
//! The runtime does not ship kernels. A [`GpuProbe`] answers whether a device
//! can be acquired, and an [`ExecutionBackend`] turns cached graph and weight
//! bytes into runnable [`Session`]s on a given tier.

use async_trait::async_trait;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::tensor::{DType, TensorMap};
use crate::api::SubNetwork;
use crate::config::PowerPreference;
use crate::error::{BackendTier, Error, Result};

/// A successfully acquired GPU adapter and device
#[derive(Clone)]
pub struct GpuDevice {
    pub adapter_name: String,
    pub backend: String,
    pub supports_shader_f16: bool,
    /// Library-specific device handle for the execution backend
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDevice")
            .field("adapter_name", &self.adapter_name)
            .field("backend", &self.backend)
            .field("supports_shader_f16", &self.supports_shader_f16)
            .finish()
    }
}

/// GPU capability preflight
#[async_trait]
pub trait GpuProbe: Send + Sync {
    async fn acquire(&self, preference: PowerPreference) -> Result<GpuDevice>;
}

/// Probe for hosts without GPU support
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

#[async_trait]
impl GpuProbe for NoGpu {
    async fn acquire(&self, _preference: PowerPreference) -> Result<GpuDevice> {
        Err(Error::Capability(
            "this build has no GPU support (enable the `wgpu` feature)".to_string(),
        ))
    }
}

/// Declared input or output of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: DType,
    /// `None` when the graph does not fix the rank
    pub rank: Option<usize>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dtype: DType, rank: usize) -> Self {
        Self {
            name: name.into(),
            dtype,
            rank: Some(rank),
        }
    }
}

/// Cached files making up one sub-network
#[derive(Debug, Clone)]
pub struct SessionSource {
    pub role: SubNetwork,
    /// Path of the graph file inside the repository
    pub graph_path: String,
    pub graph: Bytes,
    /// External data files keyed by the file name the graph refers to
    pub external_data: Vec<(String, Bytes)>,
}

impl SessionSource {
    pub fn total_bytes(&self) -> usize {
        self.graph.len() + self.external_data.iter().map(|(_, b)| b.len()).sum::<usize>()
    }
}

/// A constructed, runnable sub-network
#[async_trait]
pub trait Session: Send + Sync {
    fn inputs(&self) -> Vec<TensorInfo>;

    fn outputs(&self) -> Vec<TensorInfo>;

    async fn run(&self, inputs: TensorMap) -> Result<TensorMap>;
}

/// Builds sessions from cached bytes on a chosen tier
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn create_session(
        &self,
        tier: BackendTier,
        device: Option<&GpuDevice>,
        source: SessionSource,
    ) -> Result<Arc<dyn Session>>;
}

/// Default probe for this build
pub fn default_probe() -> Arc<dyn GpuProbe> {
    #[cfg(feature = "wgpu")]
    {
        Arc::new(super::gpu::WgpuProbe::default())
    }
    #[cfg(not(feature = "wgpu"))]
    {
        Arc::new(NoGpu)
    }
}
