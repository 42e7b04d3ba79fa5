//! The runtime handle applications hold
//!
//! [`LlmRuntime`] owns the cache, the backend loader and the concurrency
//! guards. Loads of the same model are de-duplicated here; cache fills are
//! de-duplicated per variant by the [`CacheManager`], whoever starts them.
//! Generations run one at a time.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::{CacheManager, CacheReport, HfHubClient, ManifestResolver, ProgressObserver, RetryPolicy, ShardManifest, WeightRepository};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::models::{find, ModelDefinition, Quantization};
use crate::runtime::{
    default_probe, BackendLoader, ChannelCallback, ExecutionBackend, GenerationEvent,
    GenerationGate, GenerationOutput, GenerationRequest, GenerationStream, GpuProbe,
    HfTokenizerFactory, InferenceEngine, LoadPhase, LoadedModel, SingleFlight,
    StreamingCallback, TokenizerFactory,
};
use crate::storage::{BlobStore, FsBlobStore};

const STREAM_BUFFER: usize = 64;

/// Builder wiring collaborators into an [`LlmRuntime`]
pub struct LlmRuntimeBuilder {
    config: ServiceConfig,
    repository: Option<Arc<dyn WeightRepository>>,
    store: Option<Arc<dyn BlobStore>>,
    probe: Option<Arc<dyn GpuProbe>>,
    backend: Option<Arc<dyn ExecutionBackend>>,
    tokenizers: Option<Arc<dyn TokenizerFactory>>,
}

impl LlmRuntimeBuilder {
    pub fn repository(mut self, repository: Arc<dyn WeightRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gpu_probe(mut self, probe: Arc<dyn GpuProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn tokenizers(mut self, tokenizers: Arc<dyn TokenizerFactory>) -> Self {
        self.tokenizers = Some(tokenizers);
        self
    }

    /// Build the runtime. An execution backend is required; everything else
    /// defaults to the hub client, the filesystem cache, the build's GPU probe
    /// and `tokenizer.json` tokenizers.
    pub fn build(self) -> Result<LlmRuntime> {
        let config = self.config;
        let backend = self
            .backend
            .ok_or_else(|| Error::Config("no execution backend configured".to_string()))?;
        let repository = match self.repository {
            Some(repository) => repository,
            None => Arc::new(HfHubClient::new(&config.hub)?),
        };
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FsBlobStore::new(config.cache.resolved_dir())));

        let cache = Arc::new(CacheManager::with_settings(
            Arc::clone(&repository),
            store,
            &config.cache,
            RetryPolicy::from(&config.retry),
        ));
        let resolver = ManifestResolver::new(Arc::clone(&repository));
        let loader = Arc::new(BackendLoader::new(
            ManifestResolver::new(repository),
            Arc::clone(&cache),
            self.probe.unwrap_or_else(default_probe),
            backend,
            self.tokenizers.unwrap_or_else(|| Arc::new(HfTokenizerFactory)),
            config.gpu.clone(),
        ));

        Ok(LlmRuntime {
            config,
            resolver,
            cache,
            loader,
            gate: GenerationGate::new(),
            loads: SingleFlight::new(),
        })
    }
}

/// Owned handle over the whole serving subsystem
pub struct LlmRuntime {
    config: ServiceConfig,
    resolver: ManifestResolver,
    cache: Arc<CacheManager>,
    loader: Arc<BackendLoader>,
    gate: GenerationGate,
    loads: SingleFlight<(String, u64), Arc<LoadedModel>>,
}

impl LlmRuntime {
    pub fn builder(config: ServiceConfig) -> LlmRuntimeBuilder {
        LlmRuntimeBuilder {
            config,
            repository: None,
            store: None,
            probe: None,
            backend: None,
            tokenizers: None,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn loader(&self) -> &Arc<BackendLoader> {
        &self.loader
    }

    pub fn phase(&self) -> LoadPhase {
        self.loader.phase()
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.loader.current()
    }

    fn definition(model_id: &str) -> Result<&'static ModelDefinition> {
        find(model_id).ok_or_else(|| Error::UnknownModel(model_id.to_string()))
    }

    /// Resolve the manifest for a model variant
    pub async fn manifest(&self, model_id: &str, quantization: Option<Quantization>) -> Result<ShardManifest> {
        let definition = Self::definition(model_id)?;
        self.resolver
            .resolve(definition, quantization.unwrap_or(definition.quantization))
            .await
    }

    /// Ensure a model variant is cached. Concurrent pulls and loads of the same
    /// variant share one download; only the first caller's observer sees
    /// progress.
    pub async fn pull(
        &self,
        model_id: &str,
        quantization: Option<Quantization>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<CacheReport> {
        let definition = Self::definition(model_id)?;
        let quantization = quantization.unwrap_or(definition.quantization);
        let manifest = self.resolver.resolve(definition, quantization).await?;
        self.cache.ensure_cached(&manifest, observer).await
    }

    /// Load `model_id`, switching away from any other model first. Concurrent
    /// loads of the same model within one load generation share one
    /// execution.
    pub async fn load(
        &self,
        model_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<Arc<LoadedModel>> {
        Self::definition(model_id)?;
        if let Some(current) = self.loader.current() {
            if current.definition.id == model_id {
                return Ok(current);
            }
        }
        if self.loader.target().as_deref() != Some(model_id) {
            self.loader.switch_model(model_id)?;
        }

        let generation = self.loader.generation();
        let loader = Arc::clone(&self.loader);
        let id = model_id.to_string();
        self.loads
            .run((id.clone(), generation), move || async move {
                loader.load(&id, observer).await
            })
            .await
    }

    /// Invalidate in-flight loads and target `model_id`
    pub fn switch_model(&self, model_id: &str) -> Result<()> {
        self.loader.switch_model(model_id).map(|_| ())
    }

    /// Release the current model and invalidate in-flight loads
    pub fn dispose(&self) {
        self.loader.dispose();
    }

    fn clamp(&self, mut request: GenerationRequest) -> GenerationRequest {
        if let Some(cap) = self.config.generation.max_tokens {
            request.max_tokens = Some(request.max_tokens.map_or(cap, |n| n.min(cap)));
        }
        request
    }

    /// Generate a reply with the current model. Calls are serialized.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        callback: &mut dyn StreamingCallback,
    ) -> Result<GenerationOutput> {
        let request = self.clamp(request);
        let _permit = self.gate.acquire().await?;
        let model = self.loader.current().ok_or(Error::ModelNotLoaded)?;
        debug!("Generating with {} on {}", model.definition.id, model.attempt);

        let output = InferenceEngine::new(&model).generate(&request, callback).await?;
        info!(
            "Generated {} tokens in {:?} ({:.1} tok/s, {:?})",
            output.tokens_generated, output.elapsed, output.tokens_per_second, output.finish_reason
        );
        Ok(output)
    }

    /// Generate in a background task, returning the events as a stream
    pub fn generate_stream(self: &Arc<Self>, request: GenerationRequest) -> GenerationStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let runtime = Arc::clone(self);

        tokio::spawn(async move {
            let mut callback = ChannelCallback::new(tx.clone());
            let event = match runtime.generate(request, &mut callback).await {
                Ok(output) => GenerationEvent::Finished(output),
                Err(e) => GenerationEvent::Failed(e),
            };
            // receiver gone
            let _ = tx.send(event).await;
        });

        GenerationStream::new(rx)
    }

    /// Paths of the current model's files that are missing from the cache
    pub async fn verify(&self) -> Result<Vec<String>> {
        let model = self.loader.current().ok_or(Error::ModelNotLoaded)?;
        self.cache.verify_cached(&model.manifest).await
    }
}
