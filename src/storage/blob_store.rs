//! Filesystem blob store
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<generation dir>/generation.json        name and creation time
//! <root>/<generation dir>/<sha256(key)>.blob     payload
//! <root>/<generation dir>/<sha256(key)>.json     key, size, store time
//! ```
//!
//! Generation directories are the generation name with every byte outside
//! `[A-Za-z0-9@-]` escaped as `_XX`, so distinct names never share a directory.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{BlobStore, BlobWriter};
use crate::constants::cache::{BLOB_EXT, PARTIAL_EXT, SIDECAR_EXT};
use crate::error::{Error, Result};

const GENERATION_FILE: &str = "generation.json";

#[derive(Debug, Serialize, Deserialize)]
struct GenerationInfo {
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobInfo {
    key: String,
    size: u64,
    stored_at: DateTime<Utc>,
}

/// Blob store persisted under a cache directory
pub struct FsBlobStore {
    root: PathBuf,
    next_partial: AtomicU64,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_partial: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &str) -> PathBuf {
        self.root.join(escape_generation(generation))
    }

    fn blob_stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    fn blob_path(&self, generation: &str, key: &str) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{}.{}", Self::blob_stem(key), BLOB_EXT))
    }

    fn sidecar_path(&self, generation: &str, key: &str) -> PathBuf {
        self.generation_dir(generation)
            .join(format!("{}.{}", Self::blob_stem(key), SIDECAR_EXT))
    }

    async fn read_sidecar(path: &Path) -> Result<Option<BlobInfo>> {
        match fs::read(path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn escape_generation(generation: &str) -> String {
    let mut escaped = String::with_capacity(generation.len());
    for byte in generation.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'@') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("_{:02X}", byte));
        }
    }
    escaped
}

fn unavailable(path: &Path, err: std::io::Error) -> Error {
    Error::cache(format!("cache storage at {} unavailable: {}", path.display(), err))
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn open(&self, generation: &str) -> Result<()> {
        let dir = self.generation_dir(generation);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(&dir, e))?;

        let info_path = dir.join(GENERATION_FILE);
        if fs::metadata(&info_path).await.is_err() {
            let info = GenerationInfo {
                name: generation.to_string(),
                created_at: Utc::now(),
            };
            fs::write(&info_path, serde_json::to_vec_pretty(&info)?)
                .await
                .map_err(|e| unavailable(&info_path, e))?;
            debug!("Created cache generation {}", generation);
        }
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(unavailable(&self.root, e)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let info_path = entry.path().join(GENERATION_FILE);
            match fs::read(&info_path).await {
                Ok(raw) => match serde_json::from_slice::<GenerationInfo>(&raw) {
                    Ok(info) => names.push(info.name),
                    Err(e) => warn!("Ignoring unreadable {}: {}", info_path.display(), e),
                },
                Err(_) => continue,
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        let dir = self.generation_dir(generation);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn blob_len(&self, generation: &str, key: &str) -> Result<Option<u64>> {
        match fs::metadata(self.blob_path(generation, key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_readable(&self, generation: &str, key: &str) -> Result<bool> {
        let sidecar = match Self::read_sidecar(&self.sidecar_path(generation, key)).await {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(false),
            Err(e) => {
                warn!("Blob metadata for {} unreadable: {}", key, e);
                return Ok(false);
            }
        };
        if sidecar.key != key {
            return Ok(false);
        }

        let path = self.blob_path(generation, key);
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(_) => return Ok(false),
        };
        let len = file.metadata().await?.len();
        if len != sidecar.size {
            warn!(
                "Blob for {} is {} bytes, expected {}",
                key, len, sidecar.size
            );
            return Ok(false);
        }
        if len > 0 {
            let mut probe = [0u8; 1];
            if file.read(&mut probe).await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn read(&self, generation: &str, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.blob_path(generation, key)).await {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn writer(&self, generation: &str, key: &str) -> Result<Box<dyn BlobWriter>> {
        let blob = self.blob_path(generation, key);
        // one partial file per writer; the last commit wins the rename
        let n = self.next_partial.fetch_add(1, Ordering::Relaxed);
        let partial = blob.with_extension(format!("{}-{}.{}", std::process::id(), n, PARTIAL_EXT));
        let file = fs::File::create(&partial)
            .await
            .map_err(|e| unavailable(&partial, e))?;

        Ok(Box::new(FsBlobWriter {
            file,
            partial,
            blob,
            sidecar: self.sidecar_path(generation, key),
            key: key.to_string(),
            written: 0,
        }))
    }

    async fn keys(&self, generation: &str) -> Result<Vec<String>> {
        let dir = self.generation_dir(generation);
        let mut keys = Vec::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_sidecar = path.extension().map(|e| e == SIDECAR_EXT).unwrap_or(false)
                && path.file_name().map(|n| n != GENERATION_FILE).unwrap_or(false);
            if !is_sidecar {
                continue;
            }
            if let Some(info) = Self::read_sidecar(&path).await? {
                keys.push(info.key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, generation: &str, key: &str) -> Result<bool> {
        let existed = match fs::remove_file(self.blob_path(generation, key)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match fs::remove_file(self.sidecar_path(generation, key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(existed),
            Err(e) => Err(e.into()),
        }
    }
}

struct FsBlobWriter {
    file: fs::File,
    partial: PathBuf,
    blob: PathBuf,
    sidecar: PathBuf,
    key: String,
    written: u64,
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let FsBlobWriter {
            mut file,
            partial,
            blob,
            sidecar,
            key,
            written,
        } = *self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        // Sidecar is written last so a blob without one is never treated as readable
        fs::rename(&partial, &blob).await?;
        let info = BlobInfo {
            key,
            size: written,
            stored_at: Utc::now(),
        };
        fs::write(&sidecar, serde_json::to_vec(&info)?).await?;
        Ok(written)
    }

    async fn abort(self: Box<Self>) {
        let FsBlobWriter { file, partial, .. } = *self;
        drop(file);
        if let Err(e) = fs::remove_file(&partial).await {
            debug!("Could not remove {}: {}", partial.display(), e);
        }
    }
}
