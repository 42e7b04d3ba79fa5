//! Streaming support for token-by-token generation
//!
//! The decode loop reports through a [`StreamingCallback`]. [`ChannelCallback`]
//! forwards everything into an mpsc channel so callers can consume a
//! [`GenerationStream`] instead.

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::GenerationOutput;
use crate::error::Error;

/// Async callback trait for streaming token generation
#[async_trait]
pub trait StreamingCallback: Send {
    /// Called with each newly decoded piece of text
    async fn on_chunk(&mut self, chunk: &str);

    /// Called after every generated token with the running throughput, the
    /// tokens generated so far and the time since the request started
    async fn on_tokens_per_sec(&mut self, _tokens_per_sec: f64, _total_tokens: usize, _elapsed: Duration) {}

    /// Called once when the decode loop ends
    async fn on_complete(&mut self, _total_tokens: usize, _elapsed: Duration) {}
}

/// Callback that ignores everything
pub struct NoopCallback;

#[async_trait]
impl StreamingCallback for NoopCallback {
    async fn on_chunk(&mut self, _chunk: &str) {}
}

/// Simple callback for collecting generated text
#[derive(Debug, Default)]
pub struct CollectingCallback {
    pub text: String,
    pub chunks: Vec<String>,
    /// `(tokens_per_sec, total_tokens, elapsed)` per generated token
    pub rates: Vec<(f64, usize, Duration)>,
    pub completed: Option<(usize, Duration)>,
}

impl CollectingCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamingCallback for CollectingCallback {
    async fn on_chunk(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.chunks.push(chunk.to_string());
    }

    async fn on_tokens_per_sec(&mut self, tokens_per_sec: f64, total_tokens: usize, elapsed: Duration) {
        self.rates.push((tokens_per_sec, total_tokens, elapsed));
    }

    async fn on_complete(&mut self, total_tokens: usize, elapsed: Duration) {
        self.completed = Some((total_tokens, elapsed));
    }
}

/// Events of a streamed generation
#[derive(Debug)]
pub enum GenerationEvent {
    Chunk(String),
    TokensPerSec {
        tokens_per_sec: f64,
        total_tokens: usize,
        elapsed: Duration,
    },
    Complete {
        total_tokens: usize,
        elapsed: Duration,
    },
    /// Final result, sent after `Complete`
    Finished(GenerationOutput),
    Failed(Error),
}

/// Callback forwarding events into a channel. Sends wait for capacity, so a
/// slow consumer slows the decode loop down; a dropped receiver just stops
/// delivery.
pub struct ChannelCallback {
    sender: mpsc::Sender<GenerationEvent>,
}

impl ChannelCallback {
    pub fn new(sender: mpsc::Sender<GenerationEvent>) -> Self {
        Self { sender }
    }

    async fn send(&self, event: GenerationEvent) {
        // receiver gone
        let _ = self.sender.send(event).await;
    }
}

#[async_trait]
impl StreamingCallback for ChannelCallback {
    async fn on_chunk(&mut self, chunk: &str) {
        self.send(GenerationEvent::Chunk(chunk.to_string())).await;
    }

    async fn on_tokens_per_sec(&mut self, tokens_per_sec: f64, total_tokens: usize, elapsed: Duration) {
        self.send(GenerationEvent::TokensPerSec {
            tokens_per_sec,
            total_tokens,
            elapsed,
        })
        .await;
    }

    async fn on_complete(&mut self, total_tokens: usize, elapsed: Duration) {
        self.send(GenerationEvent::Complete {
            total_tokens,
            elapsed,
        })
        .await;
    }
}

/// Stream of [`GenerationEvent`]s for one request
pub struct GenerationStream {
    inner: ReceiverStream<GenerationEvent>,
}

impl GenerationStream {
    pub fn new(receiver: mpsc::Receiver<GenerationEvent>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
        }
    }
}

impl Stream for GenerationStream {
    type Item = GenerationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
