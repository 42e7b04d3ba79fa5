//! Acquisition of model weights into the durable blob cache
//!
//! [`CacheManager`] makes sure every file of a [`ShardManifest`] is present in
//! the revision-scoped cache generation of its model, downloading what is
//! missing with bounded concurrency, retrying transient failures and reporting
//! throughput to a [`ProgressObserver`]. Fills of the same variant share one
//! execution, so a blob key never has two concurrent writers.

use bytes::Bytes;
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::manifest::{ShardFile, ShardManifest};
use super::WeightRepository;
use crate::config::{CacheSettings, RetrySettings};
use crate::constants::cache::GENERATION_SEPARATOR;
use crate::error::{Error, Result};
use crate::models::Quantization;
use crate::runtime::SingleFlight;
use crate::storage::{BlobStore, BlobWriter};

/// Snapshot of an in-flight acquisition
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DownloadProgress {
    /// Bytes downloaded so far, cache hits included
    pub downloaded_bytes: u64,
    /// Sum of all manifest sizes, if every size is known
    pub total_bytes: Option<u64>,
    /// Throughput since the previous tick
    pub speed_bytes_per_sec: f64,
    pub completed_files: usize,
    pub total_files: usize,
}

impl DownloadProgress {
    /// Completion in percent. Falls back to the share of completed files when
    /// the total size is unknown.
    pub fn percentage(&self) -> f64 {
        let pct = match self.total_bytes {
            Some(total) if total > 0 => self.downloaded_bytes as f64 / total as f64 * 100.0,
            _ if self.total_files > 0 => {
                self.completed_files as f64 / self.total_files as f64 * 100.0
            }
            _ => 100.0,
        };
        pct.min(100.0)
    }
}

/// Receives acquisition progress ticks
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percentage: f64, stats: &DownloadProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(f64, &DownloadProgress) + Send + Sync,
{
    fn on_progress(&self, percentage: f64, stats: &DownloadProgress) {
        self(percentage, stats)
    }
}

/// Exponential backoff for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, what, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcome of one `ensure_cached` call
#[derive(Debug, Clone)]
pub struct CacheReport {
    pub generation: String,
    /// The manifest actually cached, without dropped files
    pub manifest: ShardManifest,
    pub downloaded: Vec<String>,
    pub hits: Vec<String>,
    /// Guessed files the remote does not have
    pub dropped: Vec<String>,
    pub bytes_downloaded: u64,
    /// Generations of the same model removed before downloading
    pub evicted: Vec<String>,
}

enum FileOutcome {
    Hit(String),
    Downloaded(String, u64),
    Dropped(String),
}

struct TrackerState {
    stats: DownloadProgress,
    last_tick: Instant,
    bytes_at_last_tick: u64,
}

/// Shared accumulator behind the progress ticks of one acquisition
struct ProgressTracker<'a> {
    state: Mutex<TrackerState>,
    interval: Duration,
    observer: Option<&'a dyn ProgressObserver>,
}

impl<'a> ProgressTracker<'a> {
    fn new(manifest: &ShardManifest, interval: Duration, observer: Option<&'a dyn ProgressObserver>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                stats: DownloadProgress {
                    total_bytes: manifest.total_size(),
                    total_files: manifest.files().count(),
                    ..DownloadProgress::default()
                },
                last_tick: Instant::now(),
                bytes_at_last_tick: 0,
            }),
            interval,
            observer,
        }
    }

    fn add_bytes(&self, n: u64) {
        self.state.lock().stats.downloaded_bytes += n;
        self.maybe_tick();
    }

    /// Undo the bytes of a failed attempt that is about to be retried
    fn rewind(&self, n: u64) {
        let mut state = self.state.lock();
        state.stats.downloaded_bytes = state.stats.downloaded_bytes.saturating_sub(n);
        state.bytes_at_last_tick = state.bytes_at_last_tick.min(state.stats.downloaded_bytes);
    }

    fn file_done(&self) {
        self.state.lock().stats.completed_files += 1;
        self.maybe_tick();
    }

    fn maybe_tick(&self) {
        let Some(observer) = self.observer else { return };
        let snapshot = {
            let mut state = self.state.lock();
            let elapsed = state.last_tick.elapsed();
            if elapsed < self.interval {
                return;
            }
            let delta = state.stats.downloaded_bytes - state.bytes_at_last_tick;
            state.stats.speed_bytes_per_sec = delta as f64 / elapsed.as_secs_f64();
            state.last_tick = Instant::now();
            state.bytes_at_last_tick = state.stats.downloaded_bytes;
            state.stats.clone()
        };
        observer.on_progress(snapshot.percentage(), &snapshot);
    }

    fn finish(&self) {
        let Some(observer) = self.observer else { return };
        let snapshot = {
            let mut state = self.state.lock();
            state.stats.completed_files = state.stats.total_files;
            state.stats.clone()
        };
        observer.on_progress(100.0, &snapshot);
    }
}

/// Fills, verifies and evicts the weight cache
pub struct CacheManager {
    repo: Arc<dyn WeightRepository>,
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    max_concurrent: usize,
    progress_interval: Duration,
    fills: SingleFlight<(String, Quantization), CacheReport>,
}

impl CacheManager {
    pub fn new(repo: Arc<dyn WeightRepository>, store: Arc<dyn BlobStore>) -> Self {
        Self::with_settings(repo, store, &CacheSettings::default(), RetryPolicy::default())
    }

    pub fn with_settings(
        repo: Arc<dyn WeightRepository>,
        store: Arc<dyn BlobStore>,
        cache: &CacheSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repo,
            store,
            retry,
            max_concurrent: cache.max_concurrent_downloads.max(1),
            progress_interval: Duration::from_millis(cache.progress_interval_ms),
            fills: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Make every file of `manifest` present in its cache generation.
    ///
    /// A call for a variant that is already being filled waits for that fill
    /// and gets its report; only the first caller's observer sees progress.
    pub async fn ensure_cached(
        self: &Arc<Self>,
        manifest: &ShardManifest,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<CacheReport> {
        let key = (manifest.cache_generation(), manifest.quantization);
        let cache = Arc::clone(self);
        let manifest = manifest.clone();
        self.fills
            .run(key, move || async move {
                cache.fill(&manifest, observer.as_deref()).await
            })
            .await
    }

    async fn fill(
        &self,
        manifest: &ShardManifest,
        observer: Option<&dyn ProgressObserver>,
    ) -> Result<CacheReport> {
        let generation = manifest.cache_generation();
        let evicted = self
            .evict_stale(&manifest.model_id, &manifest.revision)
            .await?;
        self.store.open(&generation).await?;

        let tracker = ProgressTracker::new(manifest, self.progress_interval, observer);
        let outcomes: Vec<FileOutcome> = stream::iter(
            manifest
                .files()
                .map(|file| {
                    self.ensure_file(manifest, &generation, file, &tracker)
                        .boxed()
                })
                .collect::<Vec<_>>(),
        )
        .buffer_unordered(self.max_concurrent)
        .try_collect()
        .await?;

        let mut report = CacheReport {
            generation,
            manifest: manifest.clone(),
            downloaded: Vec::new(),
            hits: Vec::new(),
            dropped: Vec::new(),
            bytes_downloaded: 0,
            evicted,
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::Hit(path) => report.hits.push(path),
                FileOutcome::Downloaded(path, bytes) => {
                    report.bytes_downloaded += bytes;
                    report.downloaded.push(path);
                }
                FileOutcome::Dropped(path) => report.dropped.push(path),
            }
        }
        if !report.dropped.is_empty() {
            report.manifest = manifest.without(&report.dropped);
        }

        tracker.finish();
        info!(
            "Cached {} {}: {} downloaded ({} bytes), {} already present",
            manifest.model_id,
            manifest.quantization,
            report.downloaded.len(),
            report.bytes_downloaded,
            report.hits.len()
        );
        Ok(report)
    }

    async fn ensure_file(
        &self,
        manifest: &ShardManifest,
        generation: &str,
        file: &ShardFile,
        tracker: &ProgressTracker<'_>,
    ) -> Result<FileOutcome> {
        if let Some(len) = self.store.blob_len(generation, &file.url).await? {
            let size_ok = file.size.map_or(true, |size| size == len);
            if size_ok && self.store.is_readable(generation, &file.url).await? {
                debug!("Cache hit for {}", file.path);
                tracker.add_bytes(len);
                tracker.file_done();
                return Ok(FileOutcome::Hit(file.path.clone()));
            }
            debug!(
                "Cached {} failed validation ({} bytes, expected {:?}); downloading again",
                file.path, len, file.size
            );
        }

        let result = self
            .retry
            .run(&file.path, |_| self.download(generation, file, tracker))
            .await;

        match result {
            Ok(bytes) => {
                tracker.file_done();
                Ok(FileOutcome::Downloaded(file.path.clone(), bytes))
            }
            Err(Error::Network {
                status: Some(404), ..
            }) if manifest.is_droppable(&file.path) => {
                warn!("{} not found upstream, continuing without it", file.path);
                tracker.file_done();
                Ok(FileOutcome::Dropped(file.path.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// One download attempt, committed atomically
    async fn download(
        &self,
        generation: &str,
        file: &ShardFile,
        tracker: &ProgressTracker<'_>,
    ) -> Result<u64> {
        let body = self.repo.fetch(&file.url).await?;
        let expected = file.size.or(body.content_length);

        let mut writer = self.store.writer(generation, &file.url).await?;
        let mut written = 0u64;
        let streamed = stream_into(body.stream, writer.as_mut(), tracker, &mut written).await;

        let result = streamed.and_then(|()| match expected {
            Some(size) if size != written => Err(Error::network(
                &file.url,
                None,
                format!("truncated body: {} of {} bytes", written, size),
            )),
            _ => Ok(()),
        });

        match result {
            Ok(()) => {
                let len = writer.commit().await?;
                debug!("Downloaded {} ({} bytes)", file.path, len);
                Ok(len)
            }
            Err(e) => {
                writer.abort().await;
                tracker.rewind(written);
                Err(e)
            }
        }
    }

    /// Paths of manifest files that are missing, unreadable or of the wrong size
    pub async fn verify_cached(&self, manifest: &ShardManifest) -> Result<Vec<String>> {
        let generation = manifest.cache_generation();
        let mut missing = Vec::new();

        for file in manifest.files() {
            let readable = self.store.is_readable(&generation, &file.url).await?;
            let len = self.store.blob_len(&generation, &file.url).await?;
            let size_ok = match (file.size, len) {
                (Some(expected), Some(actual)) => expected == actual,
                (_, None) => false,
                (None, Some(_)) => true,
            };
            if !readable || !size_ok {
                missing.push(file.path.clone());
            }
        }
        if !missing.is_empty() {
            warn!("{} has {} missing files: {:?}", generation, missing.len(), missing);
        }
        Ok(missing)
    }

    /// Read one cached manifest file
    pub async fn read(&self, manifest: &ShardManifest, file: &ShardFile) -> Result<Bytes> {
        self.store
            .read(&manifest.cache_generation(), &file.url)
            .await?
            .ok_or_else(|| Error::Integrity {
                model: manifest.model_id.clone(),
                missing: vec![file.path.clone()],
            })
    }

    /// Delete every generation of `model_id` other than `keep_revision`
    pub async fn evict_stale(&self, model_id: &str, keep_revision: &str) -> Result<Vec<String>> {
        let keep = format!("{}{}{}", model_id, GENERATION_SEPARATOR, keep_revision);
        self.evict_where(model_id, |name| name != keep).await
    }

    /// Delete every generation of `model_id`
    pub async fn evict_all(&self, model_id: &str) -> Result<Vec<String>> {
        self.evict_where(model_id, |_| true).await
    }

    async fn evict_where(
        &self,
        model_id: &str,
        predicate: impl Fn(&str) -> bool,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}{}", model_id, GENERATION_SEPARATOR);
        let mut evicted = Vec::new();

        for name in self.store.generations().await? {
            if name.starts_with(&prefix) && predicate(&name) {
                self.store.delete_generation(&name).await?;
                info!("Evicted cache generation {}", name);
                evicted.push(name);
            }
        }
        Ok(evicted)
    }

    /// Remove blobs of the generation that `manifest` does not reference, so
    /// it holds exactly one variant
    pub async fn retain_only(&self, manifest: &ShardManifest) -> Result<Vec<String>> {
        let generation = manifest.cache_generation();
        let mut removed = Vec::new();

        for key in self.store.keys(&generation).await? {
            if !manifest.files().any(|f| f.url == key) {
                self.store.remove(&generation, &key).await?;
                removed.push(key);
            }
        }
        if !removed.is_empty() {
            debug!("Removed {} unused blobs from {}", removed.len(), generation);
        }
        Ok(removed)
    }
}

async fn stream_into(
    mut body: super::ByteStream,
    writer: &mut dyn BlobWriter,
    tracker: &ProgressTracker<'_>,
    written: &mut u64,
) -> Result<()> {
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        writer.write(&chunk).await?;
        *written += chunk.len() as u64;
        tracker.add_bytes(chunk.len() as u64);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent_error() {
        let policy = RetryPolicy::default();
        let mut calls = 0;
        let result: Result<()> = policy
            .run("file", |_| {
                calls += 1;
                async { Err(Error::network("u", Some(403), "forbidden")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_error() {
        let policy = RetryPolicy::default();
        let result = policy
            .run("file", |attempt| async move {
                if attempt < 3 {
                    Err(Error::network("u", Some(503), "unavailable"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_percentage_falls_back_to_file_count() {
        let stats = DownloadProgress {
            downloaded_bytes: 10,
            total_bytes: None,
            completed_files: 1,
            total_files: 4,
            ..DownloadProgress::default()
        };
        assert_eq!(stats.percentage(), 25.0);

        let stats = DownloadProgress {
            downloaded_bytes: 30,
            total_bytes: Some(120),
            ..stats
        };
        assert_eq!(stats.percentage(), 25.0);
    }
}
