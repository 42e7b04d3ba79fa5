//! GPU preflight through wgpu

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::backend::{GpuDevice, GpuProbe};
use crate::config::PowerPreference;
use crate::error::{Error, Result};

/// Handles kept alive for the execution backend
pub struct WgpuHandles {
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

/// Probe acquiring a wgpu adapter and device
#[derive(Default)]
pub struct WgpuProbe {
    instance: wgpu::Instance,
}

#[async_trait]
impl GpuProbe for WgpuProbe {
    async fn acquire(&self, preference: PowerPreference) -> Result<GpuDevice> {
        let power_preference = match preference {
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        };

        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| Error::Capability("no compatible GPU adapter".to_string()))?;

        let info = adapter.get_info();
        let supports_shader_f16 = adapter.features().contains(wgpu::Features::SHADER_F16);
        let required_features = if supports_shader_f16 {
            wgpu::Features::SHADER_F16
        } else {
            wgpu::Features::empty()
        };
        debug!("Adapter {} features: {:?}", info.name, adapter.features());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("draftlm"),
                    required_features,
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| Error::Capability(format!("device request failed: {e}")))?;

        Ok(GpuDevice {
            adapter_name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            supports_shader_f16,
            handle: Some(Arc::new(WgpuHandles {
                adapter,
                device,
                queue,
            })),
        })
    }
}
