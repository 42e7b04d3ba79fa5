//! In-memory blob store, for ephemeral runs and tests

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{BlobStore, BlobWriter};
use crate::error::{Error, Result};

type Generations = HashMap<String, BTreeMap<String, Bytes>>;

/// Blob store kept entirely in memory
#[derive(Default, Clone)]
pub struct MemoryBlobStore {
    generations: Arc<RwLock<Generations>>,
    disallowed: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose host refuses durable storage
    pub fn disallowed() -> Self {
        Self {
            disallowed: true,
            ..Self::default()
        }
    }

    /// Total number of blobs across all generations
    pub fn blob_count(&self) -> usize {
        self.generations.read().values().map(|g| g.len()).sum()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn open(&self, generation: &str) -> Result<()> {
        if self.disallowed {
            return Err(Error::cache("durable storage is disallowed by the host"));
        }
        self.generations
            .write()
            .entry(generation.to_string())
            .or_default();
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.generations.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        Ok(self.generations.write().remove(generation).is_some())
    }

    async fn blob_len(&self, generation: &str, key: &str) -> Result<Option<u64>> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .and_then(|g| g.get(key))
            .map(|b| b.len() as u64))
    }

    async fn is_readable(&self, generation: &str, key: &str) -> Result<bool> {
        Ok(self.blob_len(generation, key).await?.is_some())
    }

    async fn read(&self, generation: &str, key: &str) -> Result<Option<Bytes>> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .and_then(|g| g.get(key))
            .cloned())
    }

    async fn writer(&self, generation: &str, key: &str) -> Result<Box<dyn BlobWriter>> {
        if !self.generations.read().contains_key(generation) {
            return Err(Error::cache(format!("generation {generation} is not open")));
        }
        Ok(Box::new(MemoryBlobWriter {
            generations: Arc::clone(&self.generations),
            generation: generation.to_string(),
            key: key.to_string(),
            buffer: BytesMut::new(),
        }))
    }

    async fn keys(&self, generation: &str) -> Result<Vec<String>> {
        Ok(self
            .generations
            .read()
            .get(generation)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, generation: &str, key: &str) -> Result<bool> {
        Ok(self
            .generations
            .write()
            .get_mut(generation)
            .map(|g| g.remove(key).is_some())
            .unwrap_or(false))
    }
}

struct MemoryBlobWriter {
    generations: Arc<RwLock<Generations>>,
    generation: String,
    key: String,
    buffer: BytesMut,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let MemoryBlobWriter {
            generations,
            generation,
            key,
            buffer,
        } = *self;
        let len = buffer.len() as u64;
        let mut generations = generations.write();
        let blobs = generations
            .get_mut(&generation)
            .ok_or_else(|| Error::cache(format!("generation {generation} was deleted")))?;
        blobs.insert(key, buffer.freeze());
        Ok(len)
    }

    async fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disallowed_store_refuses_open() {
        let store = MemoryBlobStore::disallowed();
        let err = store.open("g").await.expect_err("test: storage disallowed");
        assert!(matches!(err, Error::Cache(_)));
    }

    #[tokio::test]
    async fn test_commit_into_deleted_generation_fails() {
        let store = MemoryBlobStore::new();
        store.open("g").await.unwrap();
        let mut writer = store.writer("g", "k").await.unwrap();
        writer.write(b"abc").await.unwrap();
        store.delete_generation("g").await.unwrap();
        assert!(writer.commit().await.is_err());
        assert_eq!(store.blob_count(), 0);
    }
}
