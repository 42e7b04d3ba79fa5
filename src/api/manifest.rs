//! Shard manifest resolution
//!
//! Turns a model definition plus a quantization variant into the exact ordered
//! set of remote files that must be cached before sessions can be built.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{RemoteFile, WeightRepository};
use crate::constants::hub::{ONNX_DIR, TOKENIZER_FILES};
use crate::error::{Error, Result};
use crate::models::{ModelDefinition, Quantization};

/// Sub-network an execution session is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SubNetwork {
    TokenEmbedder,
    ImageEmbedder,
    Decoder,
}

impl fmt::Display for SubNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubNetwork::TokenEmbedder => write!(f, "token embedder"),
            SubNetwork::ImageEmbedder => write!(f, "image embedder"),
            SubNetwork::Decoder => write!(f, "decoder"),
        }
    }
}

/// How the manifest was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ManifestSource {
    /// Built from the remote file listing
    Listed,
    /// Guessed from naming conventions because the listing was unavailable
    Conventional,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFile {
    pub path: String,
    pub url: String,
    pub size: Option<u64>,
}

/// Files of one sub-network: the graph file followed by its external data
#[derive(Debug, Clone, Serialize)]
pub struct ComponentFiles {
    pub role: SubNetwork,
    pub primary: ShardFile,
    pub data_shards: Vec<ShardFile>,
}

impl ComponentFiles {
    pub fn files(&self) -> impl Iterator<Item = &ShardFile> {
        std::iter::once(&self.primary).chain(self.data_shards.iter())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardManifest {
    pub model_id: String,
    pub revision: String,
    pub quantization: Quantization,
    pub source: ManifestSource,
    pub components: Vec<ComponentFiles>,
    /// Tokenizer files, fetched after the weights
    pub auxiliary: Vec<ShardFile>,
}

impl ShardManifest {
    /// Every file in download order
    pub fn files(&self) -> impl Iterator<Item = &ShardFile> {
        self.components
            .iter()
            .flat_map(|c| c.files())
            .chain(self.auxiliary.iter())
    }

    pub fn component(&self, role: SubNetwork) -> Option<&ComponentFiles> {
        self.components.iter().find(|c| c.role == role)
    }

    pub fn auxiliary_file(&self, name: &str) -> Option<&ShardFile> {
        self.auxiliary.iter().find(|f| f.path == name)
    }

    /// Sum of all sizes, or `None` if any size is unknown
    pub fn total_size(&self) -> Option<u64> {
        self.files().map(|f| f.size).sum()
    }

    pub fn cache_generation(&self) -> String {
        format!(
            "{}{}{}",
            self.model_id,
            crate::constants::cache::GENERATION_SEPARATOR,
            self.revision
        )
    }

    /// Copy of the manifest without the given paths. Only data shards and
    /// auxiliary files can be dropped; graph files are always required.
    pub fn without(&self, dropped: &[String]) -> ShardManifest {
        let mut manifest = self.clone();
        for component in &mut manifest.components {
            component.data_shards.retain(|f| !dropped.contains(&f.path));
        }
        manifest.auxiliary.retain(|f| !dropped.contains(&f.path));
        manifest
    }

    /// Whether `path` may be absent upstream without failing the load
    pub fn is_droppable(&self, path: &str) -> bool {
        if self.auxiliary.iter().any(|f| f.path == path) {
            return true;
        }
        self.source == ManifestSource::Conventional
            && self
                .components
                .iter()
                .any(|c| c.data_shards.iter().any(|f| f.path == path))
    }
}

/// Ordering key for external-data shards: the bare `.onnx_data` file first,
/// then numbered suffixes numerically, then anything else by name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ShardOrder {
    Bare,
    Numbered(u64),
    Other(String),
}

fn shard_order(suffix: &str) -> ShardOrder {
    if suffix.is_empty() {
        return ShardOrder::Bare;
    }
    match suffix.strip_prefix('_').map(str::parse::<u64>) {
        Some(Ok(n)) => ShardOrder::Numbered(n),
        _ => ShardOrder::Other(suffix.to_string()),
    }
}

/// Sort shard paths that share `data_prefix` in numeric-aware suffix order
pub fn sort_data_shards(data_prefix: &str, shards: &mut [ShardFile]) {
    shards.sort_by(|a, b| {
        let ka = shard_order(a.path.strip_prefix(data_prefix).unwrap_or(&a.path));
        let kb = shard_order(b.path.strip_prefix(data_prefix).unwrap_or(&b.path));
        ka.cmp(&kb).then_with(|| a.path.cmp(&b.path))
    });
}

/// Sub-networks a definition requires, with their file stems
pub fn sub_networks(definition: &ModelDefinition) -> Vec<(SubNetwork, &'static str)> {
    let mut roles = vec![(SubNetwork::TokenEmbedder, definition.stems.token_embedder)];
    if let Some(vision) = &definition.vision {
        roles.push((SubNetwork::ImageEmbedder, vision.image_embedder));
    }
    roles.push((SubNetwork::Decoder, definition.stems.decoder));
    roles
}

fn graph_path(stem: &str, quantization: Quantization) -> String {
    format!("{}/{}{}.onnx", ONNX_DIR, stem, quantization.suffix())
}

/// Resolves shard manifests against a weight repository
pub struct ManifestResolver {
    repo: Arc<dyn WeightRepository>,
}

impl ManifestResolver {
    pub fn new(repo: Arc<dyn WeightRepository>) -> Self {
        Self { repo }
    }

    /// Resolve the manifest for `definition` at `quantization`
    pub async fn resolve(
        &self,
        definition: &ModelDefinition,
        quantization: Quantization,
    ) -> Result<ShardManifest> {
        match self
            .repo
            .list_files(definition.repository, definition.revision)
            .await
        {
            Ok(listing) => self.from_listing(definition, quantization, &listing),
            Err(e) => {
                warn!(
                    "File listing for {}@{} unavailable ({}), using conventional shard layout",
                    definition.repository, definition.revision, e
                );
                self.conventional(definition, quantization).await
            }
        }
    }

    fn shard(&self, definition: &ModelDefinition, path: &str, size: Option<u64>) -> ShardFile {
        ShardFile {
            path: path.to_string(),
            url: self
                .repo
                .file_url(definition.repository, definition.revision, path),
            size,
        }
    }

    /// Build a manifest from a remote listing
    pub fn from_listing(
        &self,
        definition: &ModelDefinition,
        quantization: Quantization,
        listing: &[RemoteFile],
    ) -> Result<ShardManifest> {
        let mut components = Vec::new();

        for (role, stem) in sub_networks(definition) {
            let primary_path = graph_path(stem, quantization);
            let primary = listing
                .iter()
                .find(|f| f.path == primary_path)
                .ok_or_else(|| {
                    Error::Manifest(format!(
                        "{} has no {} file {} at revision {}",
                        definition.repository, role, primary_path, definition.revision
                    ))
                })?;

            let data_prefix = format!("{}_data", primary_path);
            let mut data_shards: Vec<ShardFile> = listing
                .iter()
                .filter(|f| f.path.starts_with(&data_prefix))
                .map(|f| self.shard(definition, &f.path, f.size))
                .collect();
            sort_data_shards(&data_prefix, &mut data_shards);

            debug!(
                "{} {}: {} + {} data shard(s)",
                definition.id,
                role,
                primary_path,
                data_shards.len()
            );
            components.push(ComponentFiles {
                role,
                primary: self.shard(definition, &primary.path, primary.size),
                data_shards,
            });
        }

        let auxiliary = TOKENIZER_FILES
            .iter()
            .filter_map(|name| listing.iter().find(|f| f.path == *name))
            .map(|f| self.shard(definition, &f.path, f.size))
            .collect();

        Ok(ShardManifest {
            model_id: definition.id.to_string(),
            revision: definition.revision.to_string(),
            quantization,
            source: ManifestSource::Listed,
            components,
            auxiliary,
        })
    }

    /// Guess the conventional layout: one graph file plus a single data shard
    /// per sub-network. Sizes are probed; a guessed data shard the remote
    /// reports as missing is left out.
    pub async fn conventional(
        &self,
        definition: &ModelDefinition,
        quantization: Quantization,
    ) -> Result<ShardManifest> {
        let mut components = Vec::new();

        for (role, stem) in sub_networks(definition) {
            let primary_path = graph_path(stem, quantization);
            let data_path = format!("{}_data", primary_path);

            let primary = self.probe(definition, &primary_path).await;
            let mut data_shards = Vec::new();
            match self.probe_optional(definition, &data_path).await {
                Some(shard) => data_shards.push(shard),
                None => debug!("No external data for {} {}", definition.id, role),
            }

            components.push(ComponentFiles {
                role,
                primary,
                data_shards,
            });
        }

        let mut auxiliary = Vec::new();
        for name in TOKENIZER_FILES {
            if let Some(file) = self.probe_optional(definition, name).await {
                auxiliary.push(file);
            }
        }

        Ok(ShardManifest {
            model_id: definition.id.to_string(),
            revision: definition.revision.to_string(),
            quantization,
            source: ManifestSource::Conventional,
            components,
            auxiliary,
        })
    }

    /// Probe a required file; failures leave the size unknown
    async fn probe(&self, definition: &ModelDefinition, path: &str) -> ShardFile {
        let mut file = self.shard(definition, path, None);
        match self.repo.probe_size(&file.url).await {
            Ok(size) => file.size = size,
            Err(e) => debug!("Size probe failed for {}: {}", file.url, e),
        }
        file
    }

    /// Probe a guessed file; `None` only when the remote positively reports
    /// it missing
    async fn probe_optional(&self, definition: &ModelDefinition, path: &str) -> Option<ShardFile> {
        let mut file = self.shard(definition, path, None);
        match self.repo.probe_size(&file.url).await {
            Ok(size) => {
                file.size = size;
                Some(file)
            }
            Err(Error::Network {
                status: Some(404), ..
            }) => None,
            Err(e) => {
                debug!("Size probe failed for {}: {}", file.url, e);
                Some(file)
            }
        }
    }
}
