//! Stream fan-out.
//!
//! Replicates one producer's chunks to a fixed set of peer sinks. Peers that
//! fail to open are left out; peers that fail or stall on a write are
//! dropped. Neither case is reported to the producer.

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::time::timeout;

use crate::config::{STREAM_CLOSE_TIMEOUT, STREAM_OPEN_TIMEOUT, STREAM_WRITE_TIMEOUT};
use crate::sink::{ByteSink, PeerConnector, SinkError};

struct PeerStream {
    hostname: String,
    sink: Box<dyn ByteSink>,
    bytes_sent: u64,
}

/// Open peer streams for one recording session.
#[derive(Default)]
pub struct Fanout {
    streams: Vec<PeerStream>,
}

impl Fanout {
    /// Open one stream per hostname, concurrently.
    ///
    /// Targets that fail to open are logged and absent from the result.
    pub async fn open(connector: &dyn PeerConnector, hostnames: &[String]) -> Self {
        let opened = join_all(hostnames.iter().map(|hostname| async move {
            let opened = timeout(STREAM_OPEN_TIMEOUT, connector.open(hostname))
                .await
                .unwrap_or(Err(SinkError::Timeout));
            (hostname, opened)
        }))
        .await;

        let mut streams = Vec::with_capacity(opened.len());
        for (hostname, result) in opened {
            match result {
                Ok(sink) => streams.push(PeerStream {
                    hostname: hostname.clone(),
                    sink,
                    bytes_sent: 0,
                }),
                Err(e) => {
                    tracing::warn!(hostname = %hostname, error = %e, "fanout: open failed, skipping peer");
                }
            }
        }
        tracing::debug!(
            requested = hostnames.len(),
            opened = streams.len(),
            "fanout: streams opened"
        );
        Self { streams }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn hostnames(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.hostname.as_str()).collect()
    }

    /// Write `chunk` to every open stream; drop the ones that fail or do not
    /// accept it within [`STREAM_WRITE_TIMEOUT`].
    pub async fn write(&mut self, chunk: Bytes) {
        if self.streams.is_empty() {
            return;
        }
        let results = join_all(self.streams.iter_mut().map(|stream| {
            let write = stream.sink.write(chunk.clone());
            async move {
                timeout(STREAM_WRITE_TIMEOUT, write)
                    .await
                    .unwrap_or(Err(SinkError::Timeout))
            }
        }))
        .await;

        let mut kept = Vec::with_capacity(self.streams.len());
        for (mut stream, result) in self.streams.drain(..).zip(results) {
            match result {
                Ok(()) => {
                    stream.bytes_sent += chunk.len() as u64;
                    kept.push(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        hostname = %stream.hostname,
                        bytes_sent = stream.bytes_sent,
                        error = %e,
                        "fanout: write failed, dropping peer"
                    );
                }
            }
        }
        self.streams = kept;
    }

    /// Finish every remaining stream. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let streams = std::mem::take(&mut self.streams);
        if streams.is_empty() {
            return;
        }
        let results = join_all(streams.into_iter().map(|stream| async move {
            let result = timeout(STREAM_CLOSE_TIMEOUT, stream.sink.finish())
                .await
                .unwrap_or(Err(SinkError::Timeout));
            (stream.hostname, stream.bytes_sent, result)
        }))
        .await;
        for (hostname, bytes_sent, result) in results {
            match result {
                Ok(()) => tracing::debug!(hostname = %hostname, bytes_sent, "fanout: stream closed"),
                Err(e) => {
                    tracing::warn!(hostname = %hostname, bytes_sent, error = %e, "fanout: close failed")
                }
            }
        }
    }
}
