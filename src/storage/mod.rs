//! Durable keyed blob storage for model weights
//!
//! Blobs are addressed by (cache generation, key), where the key is the remote
//! URL a file was fetched from. A generation is created lazily and deleted as a
//! whole when the revision it holds is superseded.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod blob_store;
pub mod memory;

pub use blob_store::FsBlobStore;
pub use memory::MemoryBlobStore;

/// Keyed blob store grouped into named generations
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Open a generation, creating it if needed. Fails when the host does not
    /// allow durable storage.
    async fn open(&self, generation: &str) -> Result<()>;

    /// Names of every generation currently stored
    async fn generations(&self) -> Result<Vec<String>>;

    /// Delete a generation and all of its blobs
    async fn delete_generation(&self, generation: &str) -> Result<bool>;

    /// Length of the blob stored under `key`, if present
    async fn blob_len(&self, generation: &str, key: &str) -> Result<Option<u64>>;

    /// Whether the stored bytes for `key` can still be read back in full
    async fn is_readable(&self, generation: &str, key: &str) -> Result<bool>;

    /// Read a whole blob
    async fn read(&self, generation: &str, key: &str) -> Result<Option<Bytes>>;

    /// Start writing a blob; nothing is visible under `key` until commit
    async fn writer(&self, generation: &str, key: &str) -> Result<Box<dyn BlobWriter>>;

    /// Keys stored in a generation
    async fn keys(&self, generation: &str) -> Result<Vec<String>>;

    /// Remove one blob
    async fn remove(&self, generation: &str, key: &str) -> Result<bool>;
}

/// Streaming writer that publishes its blob atomically on commit
#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Publish the blob and return its length
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Discard everything written so far
    async fn abort(self: Box<Self>);
}
