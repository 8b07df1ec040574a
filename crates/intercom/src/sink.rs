//! Byte stream seams shared by the fan-out and the audio backend.

use async_trait::async_trait;
use bytes::Bytes;

/// Why a sink stopped accepting bytes.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("stream closed by the other side")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("host did not resolve: {0}")]
    Unresolved(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("peer answered with status {0}")]
    Status(u16),
}

/// Sequential byte consumer: a peer stream or the local playback process.
#[async_trait]
pub trait ByteSink: Send {
    /// Write one chunk. An error means the sink is unusable.
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;

    /// Flush and close. Consumes the sink.
    async fn finish(self: Box<Self>) -> Result<(), SinkError>;
}

/// Sequential byte producer: the local capture process.
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk, or `None` once the producer has ended.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;
}

/// Opens one outbound audio stream per peer.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, hostname: &str) -> Result<Box<dyn ByteSink>, SinkError>;
}
