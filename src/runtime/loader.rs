//! Backend loading with a GPU-to-CPU fallback ladder
//!
//! A load walks an ordered list of [`LoadAttempt`]s: every GPU variant the
//! model declares, then the CPU fallback. The first attempt whose manifest
//! caches and whose sessions construct and validate wins. A monotonically
//! increasing load generation is snapshotted at the start of every load and
//! re-checked after each suspension point; [`BackendLoader::switch_model`] and
//! [`BackendLoader::dispose`] bump it, so a stale load ends with
//! [`Error::Superseded`] and never publishes its sessions.

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{ExecutionBackend, GpuDevice, GpuProbe, SessionSource};
use super::session::{state_slots, ModelSessions, SessionDescriptor};
use super::tokenizer::{Tokenizer, TokenizerFactory};
use crate::api::{CacheManager, ComponentFiles, ManifestResolver, ManifestSource, ProgressObserver, ShardManifest, SubNetwork};
use crate::config::GpuSettings;
use crate::constants::hub::{TOKENIZER_CONFIG, TOKENIZER_JSON};
use crate::error::{BackendTier, Error, Result};
use crate::models::{find, ModelDefinition, Quantization};

/// Lifecycle of the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadPhase {
    Unloaded,
    Preflighting,
    Downloading,
    Constructing,
    Verifying,
    Ready,
    Failed,
}

/// One rung of the fallback ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadAttempt {
    pub tier: BackendTier,
    pub quantization: Quantization,
}

impl fmt::Display for LoadAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.quantization)
    }
}

/// Attempts for `definition` in the order they are tried
pub fn fallback_ladder(
    definition: &ModelDefinition,
    gpu_available: bool,
    allow_cpu: bool,
) -> Vec<LoadAttempt> {
    let mut ladder = Vec::new();
    if gpu_available {
        ladder.extend(definition.gpu_variants().map(|quantization| LoadAttempt {
            tier: BackendTier::Gpu,
            quantization,
        }));
    }
    if allow_cpu {
        ladder.push(LoadAttempt {
            tier: BackendTier::Cpu,
            quantization: definition.cpu_fallback,
        });
    }
    ladder
}

/// A model whose sessions are constructed and verified
pub struct LoadedModel {
    pub definition: &'static ModelDefinition,
    pub attempt: LoadAttempt,
    pub manifest: ShardManifest,
    pub sessions: ModelSessions,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub device: Option<GpuDevice>,
    /// Load generation the model was committed under
    pub generation: u64,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model", &self.definition.id)
            .field("attempt", &self.attempt)
            .field("generation", &self.generation)
            .finish()
    }
}

struct LoaderState {
    phase: LoadPhase,
    current: Option<Arc<LoadedModel>>,
    target: Option<String>,
}

/// Owns the sessions of the current model and drives loads
pub struct BackendLoader {
    resolver: ManifestResolver,
    cache: Arc<CacheManager>,
    probe: Arc<dyn GpuProbe>,
    backend: Arc<dyn ExecutionBackend>,
    tokenizers: Arc<dyn TokenizerFactory>,
    gpu: GpuSettings,
    generation: AtomicU64,
    state: RwLock<LoaderState>,
}

impl BackendLoader {
    pub fn new(
        resolver: ManifestResolver,
        cache: Arc<CacheManager>,
        probe: Arc<dyn GpuProbe>,
        backend: Arc<dyn ExecutionBackend>,
        tokenizers: Arc<dyn TokenizerFactory>,
        gpu: GpuSettings,
    ) -> Self {
        Self {
            resolver,
            cache,
            probe,
            backend,
            tokenizers,
            gpu,
            generation: AtomicU64::new(0),
            state: RwLock::new(LoaderState {
                phase: LoadPhase::Unloaded,
                current: None,
                target: None,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LoadPhase {
        self.state.read().phase
    }

    /// The committed model, if any
    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.state.read().current.clone()
    }

    /// Model id the loader is moving towards
    pub fn target(&self) -> Option<String> {
        self.state.read().target.clone()
    }

    /// Invalidate in-flight loads, release the current sessions and aim at
    /// `model_id`
    pub fn switch_model(&self, model_id: &str) -> Result<u64> {
        find(model_id).ok_or_else(|| Error::UnknownModel(model_id.to_string()))?;
        let generation = self.reset(Some(model_id.to_string()));
        info!("Switching to {} (generation {})", model_id, generation);
        Ok(generation)
    }

    /// Invalidate in-flight loads and release everything
    pub fn dispose(&self) -> u64 {
        let generation = self.reset(None);
        info!("Disposed runtime (generation {})", generation);
        generation
    }

    fn reset(&self, target: Option<String>) -> u64 {
        let mut state = self.state.write();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        state.current = None;
        state.phase = LoadPhase::Unloaded;
        state.target = target;
        generation
    }

    fn check(&self, generation: u64, definition: &ModelDefinition) -> Result<()> {
        if self.generation() != generation {
            debug!("Load of {} superseded at generation {}", definition.id, generation);
            return Err(Error::Superseded(definition.id.to_string()));
        }
        Ok(())
    }

    /// Phase changes of stale loads are dropped
    fn set_phase(&self, generation: u64, phase: LoadPhase) {
        let mut state = self.state.write();
        if self.generation() == generation {
            state.phase = phase;
        }
    }

    /// Load `model_id`, or return it if it is already the committed model
    pub async fn load(
        &self,
        model_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<Arc<LoadedModel>> {
        let definition = find(model_id).ok_or_else(|| Error::UnknownModel(model_id.to_string()))?;

        let generation = {
            let mut state = self.state.write();
            if let Some(current) = &state.current {
                if current.definition.id == model_id {
                    return Ok(Arc::clone(current));
                }
            }
            state.phase = LoadPhase::Preflighting;
            state.target = Some(model_id.to_string());
            self.generation()
        };

        match self.load_generation(definition, generation, observer.as_ref()).await {
            Ok(model) => Ok(model),
            Err(e) => {
                if !matches!(e, Error::Superseded(_)) {
                    self.set_phase(generation, LoadPhase::Failed);
                }
                Err(e)
            }
        }
    }

    async fn load_generation(
        &self,
        definition: &'static ModelDefinition,
        generation: u64,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) -> Result<Arc<LoadedModel>> {
        let device = self.preflight().await?;
        self.check(generation, definition)?;

        let ladder = fallback_ladder(definition, device.is_some(), !self.gpu.require_gpu);
        let mut failures = 0;
        let mut guessed = None;
        let mut chosen = None;

        for attempt in ladder {
            self.check(generation, definition)?;
            info!("Trying {} on {}", definition.id, attempt);

            match self
                .try_attempt(definition, attempt, device.as_ref(), generation, observer)
                .await
            {
                Ok(built) => {
                    chosen = Some(built);
                    break;
                }
                Err(e) => {
                    // storage failures and supersession end the whole load
                    if matches!(e.root(), Error::Superseded(_) | Error::Cache(_)) {
                        return Err(e);
                    }
                    warn!("{} failed on {}: {}", definition.id, attempt, e);
                    failures += 1;
                    if guessed.is_none() && matches!(e, Error::GuessedManifest { .. }) {
                        guessed = Some(e);
                    }
                }
            }
        }

        let Some((attempt, manifest, sessions)) = chosen else {
            return Err(guessed.unwrap_or(Error::NoBackendAvailable {
                model: definition.id.to_string(),
                attempts: failures,
            }));
        };

        self.check(generation, definition)?;
        self.set_phase(generation, LoadPhase::Verifying);
        let missing = self.cache.verify_cached(&manifest).await?;
        if !missing.is_empty() {
            return Err(match manifest.source {
                ManifestSource::Conventional => Error::GuessedManifest {
                    model: definition.id.to_string(),
                    reason: format!("cached files failed verification: {missing:?}"),
                },
                ManifestSource::Listed => Error::Integrity {
                    model: definition.id.to_string(),
                    missing,
                },
            });
        }

        let tokenizer = self.build_tokenizer(definition, &manifest).await?;

        self.check(generation, definition)?;
        if let Err(e) = self.cache.retain_only(&manifest).await {
            warn!("Could not prune unused variants of {}: {}", definition.id, e);
        }

        let loaded = Arc::new(LoadedModel {
            definition,
            attempt,
            manifest,
            sessions,
            tokenizer,
            device: device.filter(|_| attempt.tier == BackendTier::Gpu),
            generation,
        });

        let mut state = self.state.write();
        self.check(generation, definition)?;
        state.current = Some(Arc::clone(&loaded));
        state.phase = LoadPhase::Ready;
        info!("{} ready on {}", definition.id, attempt);
        Ok(loaded)
    }

    /// Acquire a GPU device. `None` means GPU tiers are skipped.
    async fn preflight(&self) -> Result<Option<GpuDevice>> {
        if !self.gpu.enabled {
            if self.gpu.require_gpu {
                return Err(Error::Capability(
                    "GPU is required but disabled by configuration".to_string(),
                ));
            }
            debug!("GPU disabled by configuration");
            return Ok(None);
        }

        match self.probe.acquire(self.gpu.power_preference).await {
            Ok(device) => {
                info!(
                    "Using GPU adapter {} ({}, shader-f16: {})",
                    device.adapter_name, device.backend, device.supports_shader_f16
                );
                Ok(Some(device))
            }
            Err(e) if self.gpu.require_gpu => Err(match e {
                Error::Capability(_) => e,
                other => Error::Capability(other.to_string()),
            }),
            Err(e) => {
                warn!("GPU unavailable, using CPU tier: {}", e);
                Ok(None)
            }
        }
    }

    async fn try_attempt(
        &self,
        definition: &'static ModelDefinition,
        attempt: LoadAttempt,
        device: Option<&GpuDevice>,
        generation: u64,
        observer: Option<&Arc<dyn ProgressObserver>>,
    ) -> Result<(LoadAttempt, ShardManifest, ModelSessions)> {
        let device = match attempt.tier {
            BackendTier::Gpu => device,
            BackendTier::Cpu => None,
        };
        if let Some(device) = device {
            if attempt.quantization.needs_shader_f16() && !device.supports_shader_f16 {
                return Err(Error::Backend {
                    tier: attempt.tier,
                    quantization: attempt.quantization,
                    message: format!("adapter {} lacks shader-f16", device.adapter_name),
                });
            }
        }

        self.set_phase(generation, LoadPhase::Downloading);
        let manifest = self.resolver.resolve(definition, attempt.quantization).await?;
        self.check(generation, definition)?;

        let report = self.cache.ensure_cached(&manifest, observer.cloned()).await?;
        let manifest = report.manifest;
        self.check(generation, definition)?;

        self.set_phase(generation, LoadPhase::Constructing);
        let sessions = self
            .construct(definition, attempt, device, &manifest, generation)
            .await
            .map_err(|e| match e {
                Error::Superseded(_) | Error::Cache(_) => e,
                e if manifest.source == ManifestSource::Conventional => Error::GuessedManifest {
                    model: definition.id.to_string(),
                    reason: e.to_string(),
                },
                e @ Error::Backend { .. } => e,
                e => Error::Backend {
                    tier: attempt.tier,
                    quantization: attempt.quantization,
                    message: e.to_string(),
                },
            })?;

        Ok((attempt, manifest, sessions))
    }

    async fn construct(
        &self,
        definition: &ModelDefinition,
        attempt: LoadAttempt,
        device: Option<&GpuDevice>,
        manifest: &ShardManifest,
        generation: u64,
    ) -> Result<ModelSessions> {
        let mut token_embedder = None;
        let mut image_embedder = None;
        let mut decoder = None;

        for component in &manifest.components {
            self.check(generation, definition)?;
            let source = self.session_source(manifest, component).await?;
            debug!(
                "Constructing {} from {} ({} bytes)",
                component.role,
                source.graph_path,
                source.total_bytes()
            );
            let session = self.backend.create_session(attempt.tier, device, source).await?;
            SessionDescriptor::for_role(component.role, definition).validate(session.as_ref())?;

            match component.role {
                SubNetwork::TokenEmbedder => token_embedder = Some(session),
                SubNetwork::ImageEmbedder => image_embedder = Some(session),
                SubNetwork::Decoder => decoder = Some(session),
            }
        }

        let missing = |role: SubNetwork| Error::Manifest(format!("manifest has no {role} component"));
        Ok(ModelSessions {
            token_embedder: token_embedder.ok_or_else(|| missing(SubNetwork::TokenEmbedder))?,
            image_embedder,
            decoder: decoder.ok_or_else(|| missing(SubNetwork::Decoder))?,
            state: state_slots(&definition.decoder),
        })
    }

    async fn session_source(
        &self,
        manifest: &ShardManifest,
        component: &ComponentFiles,
    ) -> Result<SessionSource> {
        let graph = self.cache.read(manifest, &component.primary).await?;
        let mut external_data = Vec::with_capacity(component.data_shards.len());
        for shard in &component.data_shards {
            let name = Path::new(&shard.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| shard.path.clone());
            external_data.push((name, self.cache.read(manifest, shard).await?));
        }

        Ok(SessionSource {
            role: component.role,
            graph_path: component.primary.path.clone(),
            graph,
            external_data,
        })
    }

    async fn build_tokenizer(
        &self,
        definition: &ModelDefinition,
        manifest: &ShardManifest,
    ) -> Result<Arc<dyn Tokenizer>> {
        let json = match manifest.auxiliary_file(TOKENIZER_JSON) {
            Some(file) => self.cache.read(manifest, file).await?,
            None => {
                return Err(Error::Tokenizer(format!(
                    "{} has no {}",
                    definition.repository, TOKENIZER_JSON
                )))
            }
        };
        let config = match manifest.auxiliary_file(TOKENIZER_CONFIG) {
            Some(file) => Some(self.cache.read(manifest, file).await?),
            None => None,
        };
        self.tokenizers.build(definition, &json, config.as_deref())
    }
}
