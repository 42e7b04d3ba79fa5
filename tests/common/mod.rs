//! In-process doubles for the runtime's collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use draftlm_core::api::{RemoteBody, RemoteFile, WeightRepository};
use draftlm_core::config::{PowerPreference, ServiceConfig};
use draftlm_core::error::{BackendTier, Error, Result};
use draftlm_core::models::{ModelDefinition, Quantization};
use draftlm_core::runtime::session::{
    state_slots, ATTENTION_MASK, IMAGE_FEATURES, INPUTS_EMBEDS, INPUT_IDS, LOGITS, PIXEL_VALUES,
};
use draftlm_core::runtime::{
    DType, ExecutionBackend, GpuDevice, GpuProbe, PromptInput, PromptMessage, Session,
    SessionSource, StateSlot, Tensor, TensorInfo, TensorMap, Tokenizer, TokenizerFactory,
};
use draftlm_core::storage::{BlobStore, MemoryBlobStore};
use draftlm_core::LlmRuntime;
use futures::stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub const BOS_ID: u32 = 0;
pub const TURN_START_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const IMAGE_ID: u32 = 10;
pub const IMAGE_START_ID: u32 = 11;
pub const IMAGE_END_ID: u32 = 12;
/// Plain characters map to `CHAR_BASE + code point`
pub const CHAR_BASE: u32 = 100;
/// First column of image embedder rows is `IMAGE_MARKER + row`
pub const IMAGE_MARKER: f32 = 50_000.0;

const SPECIALS: &[(&str, u32)] = &[
    ("<|startoftext|>", BOS_ID),
    ("<|im_start|>", TURN_START_ID),
    ("<|im_end|>", EOS_ID),
    ("<image>", IMAGE_ID),
    ("<|image_start|>", IMAGE_START_ID),
    ("<|image_end|>", IMAGE_END_ID),
];

/// Token ids the stub tokenizer assigns to `text`
pub fn text_ids(text: &str) -> Vec<u32> {
    text.chars().map(|c| CHAR_BASE + c as u32).collect()
}

// ---------------------------------------------------------------------------
// Weight repository

/// Repository serving files from memory, with listing and failure controls
pub struct MemoryRepository {
    files: Mutex<HashMap<String, Bytes>>,
    listing: AtomicBool,
    sizes_listed: AtomicBool,
    content_length: AtomicBool,
    /// url -> remaining transient failures
    transient: Mutex<HashMap<String, usize>>,
    /// url -> permanent HTTP status
    permanent: Mutex<HashMap<String, u16>>,
    fetches: Mutex<HashMap<String, usize>>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            listing: AtomicBool::new(true),
            sizes_listed: AtomicBool::new(true),
            content_length: AtomicBool::new(true),
            transient: Mutex::new(HashMap::new()),
            permanent: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
        }
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository holding every variant `definition` declares
    pub fn with_model(definition: &ModelDefinition) -> Self {
        let repo = Self::new();
        repo.add_model(definition);
        repo
    }

    pub fn url(definition: &ModelDefinition, path: &str) -> String {
        format!("mem://{}/{}/{}", definition.repository, definition.revision, path)
    }

    pub fn add_model(&self, definition: &ModelDefinition) {
        let variants: Vec<Quantization> = definition
            .gpu_variants()
            .chain(std::iter::once(definition.cpu_fallback))
            .collect();
        for quantization in variants {
            self.add_variant(definition, quantization);
        }
        self.add_file(definition, "tokenizer.json", b"{\"model\":{}}".to_vec());
        self.add_file(definition, "tokenizer_config.json", b"{}".to_vec());
        self.add_file(definition, "config.json", b"{}".to_vec());
    }

    /// Graph files for every sub-network, plus two data shards for the decoder
    pub fn add_variant(&self, definition: &ModelDefinition, quantization: Quantization) {
        let mut stems = vec![definition.stems.token_embedder, definition.stems.decoder];
        if let Some(vision) = &definition.vision {
            stems.push(vision.image_embedder);
        }
        for stem in stems {
            let graph = format!("onnx/{}{}.onnx", stem, quantization.suffix());
            self.add_file(definition, &graph, format!("graph:{graph}").into_bytes());
            if stem == definition.stems.decoder {
                for suffix in ["", "_1"] {
                    let data = format!("{graph}_data{suffix}");
                    self.add_file(definition, &data, vec![7u8; 4096]);
                }
            }
        }
    }

    pub fn add_file(&self, definition: &ModelDefinition, path: &str, contents: Vec<u8>) {
        self.files
            .lock()
            .insert(Self::url(definition, path), Bytes::from(contents));
    }

    pub fn remove_file(&self, definition: &ModelDefinition, path: &str) {
        self.files.lock().remove(&Self::url(definition, path));
    }

    /// Make `list_files` fail so resolution falls back to the guessed layout
    pub fn disable_listing(&self) {
        self.listing.store(false, Ordering::SeqCst);
    }

    /// Leave every size unknown: no sizes in listings, no Content-Length
    pub fn hide_sizes(&self) {
        self.sizes_listed.store(false, Ordering::SeqCst);
        self.content_length.store(false, Ordering::SeqCst);
    }

    pub fn fail_transiently(&self, url: &str, times: usize) {
        self.transient.lock().insert(url.to_string(), times);
    }

    pub fn fail_permanently(&self, url: &str, status: u16) {
        self.permanent.lock().insert(url.to_string(), status);
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().values().sum()
    }
}

#[async_trait]
impl WeightRepository for MemoryRepository {
    fn file_url(&self, repository: &str, revision: &str, path: &str) -> String {
        format!("mem://{}/{}/{}", repository, revision, path)
    }

    async fn list_files(&self, repository: &str, revision: &str) -> Result<Vec<RemoteFile>> {
        if !self.listing.load(Ordering::SeqCst) {
            return Err(Error::network("mem://listing", Some(503), "listing unavailable"));
        }
        let prefix = format!("mem://{}/{}/", repository, revision);
        let sizes = self.sizes_listed.load(Ordering::SeqCst);
        let mut listing: Vec<RemoteFile> = self
            .files
            .lock()
            .iter()
            .filter_map(|(url, bytes)| {
                url.strip_prefix(&prefix).map(|path| RemoteFile {
                    path: path.to_string(),
                    size: sizes.then_some(bytes.len() as u64),
                })
            })
            .collect();
        listing.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(listing)
    }

    async fn probe_size(&self, url: &str) -> Result<Option<u64>> {
        match self.files.lock().get(url) {
            Some(bytes) if self.sizes_listed.load(Ordering::SeqCst) => Ok(Some(bytes.len() as u64)),
            Some(_) => Ok(None),
            None => Err(Error::network(url, Some(404), "not found")),
        }
    }

    async fn fetch(&self, url: &str) -> Result<RemoteBody> {
        *self.fetches.lock().entry(url.to_string()).or_default() += 1;
        tokio::task::yield_now().await;

        if let Some(status) = self.permanent.lock().get(url) {
            return Err(Error::network(url, Some(*status), "rejected"));
        }
        {
            let mut transient = self.transient.lock();
            if let Some(remaining) = transient.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::network(url, Some(503), "service unavailable"));
                }
            }
        }

        let bytes = self
            .files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::network(url, Some(404), "not found"))?;
        let content_length = self
            .content_length
            .load(Ordering::SeqCst)
            .then_some(bytes.len() as u64);
        let chunks: Vec<Result<Bytes>> = bytes
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        Ok(RemoteBody {
            content_length,
            stream: Box::pin(stream::iter(chunks)),
        })
    }
}

// ---------------------------------------------------------------------------
// GPU probe

/// Probe returning a fixed adapter, or failing
pub struct StubProbe {
    device: Option<(String, bool)>,
    calls: AtomicUsize,
}

impl StubProbe {
    pub fn gpu(supports_shader_f16: bool) -> Self {
        Self {
            device: Some(("Stub Adapter".to_string(), supports_shader_f16)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn none() -> Self {
        Self {
            device: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GpuProbe for StubProbe {
    async fn acquire(&self, _preference: PowerPreference) -> Result<GpuDevice> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.device {
            Some((name, f16)) => Ok(GpuDevice {
                adapter_name: name.clone(),
                backend: "Stub".to_string(),
                supports_shader_f16: *f16,
                handle: None,
            }),
            None => Err(Error::Capability("no adapter found".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer

/// Character-level tokenizer with the LFM2 control markers
pub struct StubTokenizer;

impl Tokenizer for StubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        let mut rest = text;
        'outer: while let Some(c) = rest.chars().next() {
            for (marker, id) in SPECIALS {
                if let Some(after) = rest.strip_prefix(marker) {
                    ids.push(*id);
                    rest = after;
                    continue 'outer;
                }
            }
            ids.push(CHAR_BASE + c as u32);
            rest = &rest[c.len_utf8()..];
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .filter(|id| **id >= CHAR_BASE)
            .filter_map(|id| char::from_u32(id - CHAR_BASE))
            .collect())
    }

    fn token_id(&self, token: &str) -> Option<u32> {
        SPECIALS.iter().find(|(t, _)| *t == token).map(|(_, id)| *id)
    }

    fn apply_chat_template(&self, _messages: &[PromptMessage]) -> Result<PromptInput> {
        Err(Error::Tokenizer("no chat template".to_string()))
    }
}

pub struct StubTokenizerFactory;

impl TokenizerFactory for StubTokenizerFactory {
    fn build(
        &self,
        _definition: &ModelDefinition,
        _tokenizer_json: &[u8],
        _tokenizer_config: Option<&[u8]>,
    ) -> Result<Arc<dyn Tokenizer>> {
        Ok(Arc::new(StubTokenizer))
    }
}

// ---------------------------------------------------------------------------
// Execution backend

/// One decoder step as the scripted decoder saw it
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step: usize,
    pub step_len: usize,
    pub mask_len: usize,
    /// Sequence length of the key/value state fed in
    pub kv_len: usize,
    /// First column of every input embedding row
    pub first_column: Vec<f32>,
}

/// State shared by a backend and the sessions it creates
#[derive(Default)]
pub struct BackendLog {
    pub created: Mutex<Vec<(BackendTier, String)>>,
    pub embedded: Mutex<Vec<Vec<u32>>>,
    pub steps: Mutex<Vec<StepRecord>>,
    pub active_steps: AtomicUsize,
    pub max_active_steps: AtomicUsize,
}

impl BackendLog {
    pub fn created_graphs(&self) -> Vec<String> {
        self.created.lock().iter().map(|(_, g)| g.clone()).collect()
    }

    pub fn tiers(&self) -> Vec<BackendTier> {
        self.created.lock().iter().map(|(t, _)| *t).collect()
    }
}

type FailRule = Box<dyn Fn(BackendTier, &str) -> bool + Send + Sync>;

/// Backend whose sessions honor the tensor contracts and decode a fixed script
pub struct ScriptedBackend {
    definition: &'static ModelDefinition,
    script: Vec<u32>,
    image_rows: usize,
    fail: Option<FailRule>,
    /// Pause the first session construction until released
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
    held: AtomicBool,
    pub log: Arc<BackendLog>,
}

impl ScriptedBackend {
    /// `script` is emitted token by token, then the end-of-sequence token
    pub fn new(definition: &'static ModelDefinition, script: Vec<u32>) -> Self {
        Self {
            definition,
            script,
            image_rows: 4,
            fail: None,
            hold: None,
            held: AtomicBool::new(false),
            log: Arc::new(BackendLog::default()),
        }
    }

    pub fn with_image_rows(mut self, rows: usize) -> Self {
        self.image_rows = rows;
        self
    }

    /// Fail construction whenever `rule(tier, graph_path)` holds
    pub fn failing_when(
        mut self,
        rule: impl Fn(BackendTier, &str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fail = Some(Box::new(rule));
        self
    }

    /// Returns (entered, release): the first construction signals `entered`
    /// and waits for `release`
    pub fn holding_first(mut self) -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.hold = Some((Arc::clone(&entered), Arc::clone(&release)));
        (self, entered, release)
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    async fn create_session(
        &self,
        tier: BackendTier,
        _device: Option<&GpuDevice>,
        source: SessionSource,
    ) -> Result<Arc<dyn Session>> {
        if let Some((entered, release)) = &self.hold {
            if !self.held.swap(true, Ordering::SeqCst) {
                entered.notify_one();
                release.notified().await;
            }
        }
        self.log.created.lock().push((tier, source.graph_path.clone()));

        if let Some(rule) = &self.fail {
            if rule(tier, &source.graph_path) {
                return Err(Error::tensor(format!("cannot build {}", source.graph_path)));
            }
        }

        let hidden = self.definition.decoder.hidden_size;
        let session: Arc<dyn Session> = match source.role {
            draftlm_core::api::SubNetwork::TokenEmbedder => Arc::new(TokenEmbedderSession {
                hidden,
                log: Arc::clone(&self.log),
            }),
            draftlm_core::api::SubNetwork::ImageEmbedder => Arc::new(ImageEmbedderSession {
                hidden,
                rows: self.image_rows,
            }),
            draftlm_core::api::SubNetwork::Decoder => Arc::new(DecoderSession {
                slots: state_slots(&self.definition.decoder),
                vocab: self.definition.decoder.vocab_size,
                script: self.script.clone(),
                log: Arc::clone(&self.log),
            }),
        };
        Ok(session)
    }
}

fn take(inputs: &mut TensorMap, name: &str) -> Result<Tensor> {
    inputs
        .remove(name)
        .ok_or_else(|| Error::tensor(format!("missing input {name}")))
}

struct TokenEmbedderSession {
    hidden: usize,
    log: Arc<BackendLog>,
}

#[async_trait]
impl Session for TokenEmbedderSession {
    fn inputs(&self) -> Vec<TensorInfo> {
        vec![TensorInfo::new(INPUT_IDS, DType::I64, 2)]
    }

    fn outputs(&self) -> Vec<TensorInfo> {
        vec![TensorInfo::new(INPUTS_EMBEDS, DType::F32, 3)]
    }

    async fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let ids: Vec<u32> = take(&mut inputs, INPUT_IDS)?
            .as_i64()?
            .iter()
            .map(|id| *id as u32)
            .collect();
        self.log.embedded.lock().push(ids.clone());

        let mut data = vec![0.0f32; ids.len() * self.hidden];
        for (row, id) in ids.iter().enumerate() {
            data[row * self.hidden] = *id as f32;
        }
        let mut outputs = TensorMap::new();
        outputs.insert(
            INPUTS_EMBEDS.to_string(),
            Tensor::from_f32(vec![1, ids.len(), self.hidden], data)?,
        );
        Ok(outputs)
    }
}

struct ImageEmbedderSession {
    hidden: usize,
    rows: usize,
}

#[async_trait]
impl Session for ImageEmbedderSession {
    fn inputs(&self) -> Vec<TensorInfo> {
        vec![TensorInfo::new(PIXEL_VALUES, DType::F32, 4)]
    }

    fn outputs(&self) -> Vec<TensorInfo> {
        vec![TensorInfo::new(IMAGE_FEATURES, DType::F32, 2)]
    }

    async fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let pixels = take(&mut inputs, PIXEL_VALUES)?;
        if pixels.rank() != 4 {
            return Err(Error::tensor("pixel_values must be rank 4"));
        }
        let mut data = vec![0.0f32; self.rows * self.hidden];
        for row in 0..self.rows {
            data[row * self.hidden] = IMAGE_MARKER + row as f32;
        }
        let mut outputs = TensorMap::new();
        outputs.insert(
            IMAGE_FEATURES.to_string(),
            Tensor::from_f32(vec![self.rows, self.hidden], data)?,
        );
        Ok(outputs)
    }
}

/// Decoder emitting `script[k]` at step `k`. The step counter travels in the
/// first conv state tensor, so it only advances if state is fed back.
struct DecoderSession {
    slots: Vec<StateSlot>,
    vocab: usize,
    script: Vec<u32>,
    log: Arc<BackendLog>,
}

#[async_trait]
impl Session for DecoderSession {
    fn inputs(&self) -> Vec<TensorInfo> {
        let mut inputs = vec![
            TensorInfo::new(INPUTS_EMBEDS, DType::F32, 3),
            TensorInfo::new(ATTENTION_MASK, DType::I64, 2),
        ];
        inputs.extend(
            self.slots
                .iter()
                .map(|s| TensorInfo::new(&s.past, DType::F32, s.initial_shape.len())),
        );
        inputs
    }

    fn outputs(&self) -> Vec<TensorInfo> {
        let mut outputs = vec![TensorInfo::new(LOGITS, DType::F32, 3)];
        outputs.extend(
            self.slots
                .iter()
                .map(|s| TensorInfo::new(&s.present, DType::F32, s.initial_shape.len())),
        );
        outputs
    }

    async fn run(&self, mut inputs: TensorMap) -> Result<TensorMap> {
        let active = self.log.active_steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_active_steps.fetch_max(active, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let embeds = take(&mut inputs, INPUTS_EMBEDS)?;
        let mask = take(&mut inputs, ATTENTION_MASK)?;
        let step_len = embeds.shape()[1];
        let hidden = embeds.last_dim();
        let first_column = embeds.as_f32()?.iter().step_by(hidden).copied().collect();

        let mut outputs = TensorMap::new();
        let mut step = 0usize;
        let mut kv_len = 0usize;
        for (i, slot) in self.slots.iter().enumerate() {
            let past = take(&mut inputs, &slot.past)?;
            let present = match slot.sequence_axis() {
                None => {
                    let mut data = past.as_f32()?.to_vec();
                    if i == 0 {
                        step = data[0] as usize;
                        data[0] += 1.0;
                    }
                    Tensor::from_f32(past.shape().to_vec(), data)?
                }
                Some(axis) => {
                    kv_len = past.shape()[axis];
                    let mut shape = past.shape().to_vec();
                    shape[axis] += step_len;
                    Tensor::zeros(shape)
                }
            };
            outputs.insert(slot.present.clone(), present);
        }

        let token = self.script.get(step).copied().unwrap_or(EOS_ID);
        let mut logits = vec![0.0f32; self.vocab];
        logits[token as usize] = 1.0;
        outputs.insert(LOGITS.to_string(), Tensor::from_f32(vec![1, 1, self.vocab], logits)?);

        self.log.steps.lock().push(StepRecord {
            step,
            step_len,
            mask_len: mask.shape().iter().product(),
            kv_len,
            first_column,
        });
        self.log.active_steps.fetch_sub(1, Ordering::SeqCst);
        Ok(outputs)
    }
}

// ---------------------------------------------------------------------------
// Runtime wiring

pub struct Harness {
    pub runtime: Arc<LlmRuntime>,
    pub repo: Arc<MemoryRepository>,
    pub store: MemoryBlobStore,
    pub probe: Arc<StubProbe>,
    pub log: Arc<BackendLog>,
}

pub fn harness(
    repo: MemoryRepository,
    backend: ScriptedBackend,
    probe: StubProbe,
    config: ServiceConfig,
) -> Harness {
    let repo = Arc::new(repo);
    let store = MemoryBlobStore::new();
    let probe = Arc::new(probe);
    let log = Arc::clone(&backend.log);

    let runtime = LlmRuntime::builder(config)
        .repository(repo.clone())
        .store(Arc::new(store.clone()))
        .gpu_probe(probe.clone())
        .backend(Arc::new(backend))
        .tokenizers(Arc::new(StubTokenizerFactory))
        .build()
        .expect("test: runtime builds");

    Harness {
        runtime: Arc::new(runtime),
        repo,
        store,
        probe,
        log,
    }
}

/// Generations currently held by `store`
pub async fn generations(store: &MemoryBlobStore) -> Vec<String> {
    let mut names = store.generations().await.expect("test: list generations");
    names.sort();
    names
}
