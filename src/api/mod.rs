//! Remote weight repository access and model acquisition
//!
//! - [`huggingface`]: HTTP client for the Hugging Face hub
//! - [`manifest`]: discovery of the exact shard set for a model variant
//! - [`model_downloader`]: durable cache fill, verification and eviction

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod huggingface;
pub mod manifest;
pub mod model_downloader;

pub use huggingface::HfHubClient;
pub use manifest::{ComponentFiles, ManifestResolver, ManifestSource, ShardFile, ShardManifest, SubNetwork};
pub use model_downloader::{CacheManager, CacheReport, DownloadProgress, ProgressObserver, RetryPolicy};

/// Stream of body chunks for one remote file
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// An opened remote resource
pub struct RemoteBody {
    /// Value of the Content-Length header, if the server sent one
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

/// One entry of a repository listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    pub size: Option<u64>,
}

/// Read-only access to a versioned weight repository
#[async_trait]
pub trait WeightRepository: Send + Sync {
    /// URL a file is fetched from; also the key it is cached under
    fn file_url(&self, repository: &str, revision: &str, path: &str) -> String;

    /// List every file of `repository` at `revision`
    async fn list_files(&self, repository: &str, revision: &str) -> Result<Vec<RemoteFile>>;

    /// Size of a remote file without downloading it
    async fn probe_size(&self, url: &str) -> Result<Option<u64>>;

    /// Open a remote file as a byte stream
    async fn fetch(&self, url: &str) -> Result<RemoteBody>;
}
