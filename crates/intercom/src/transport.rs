//! Outbound HTTP audio streams.
//!
//! Each peer stream is a chunked `POST /intercom` whose body is fed from a
//! bounded channel, so writes apply backpressure per peer.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{
    ID_HEADER, INTERCOM_PATH, STREAM_CHANNEL_CAPACITY, STREAM_CLOSE_TIMEOUT, STREAM_OPEN_TIMEOUT,
};
use crate::identity::PeerId;
use crate::sink::{ByteSink, PeerConnector, SinkError};

/// Build `http://host:port/path`, bracketing bare IPv6 addresses.
pub(crate) fn peer_url(hostname: &str, port: u16, path: &str) -> String {
    if hostname.contains(':') && !hostname.starts_with('[') {
        format!("http://[{hostname}]:{port}{path}")
    } else {
        format!("http://{hostname}:{port}{path}")
    }
}

/// Opens streaming POSTs to peers, tagged with our identity.
pub struct HttpPeerConnector {
    client: reqwest::Client,
    port: u16,
    self_id: PeerId,
}

impl HttpPeerConnector {
    pub fn new(client: reqwest::Client, port: u16, self_id: PeerId) -> Self {
        Self {
            client,
            port,
            self_id,
        }
    }
}

#[async_trait]
impl PeerConnector for HttpPeerConnector {
    async fn open(&self, hostname: &str) -> Result<Box<dyn ByteSink>, SinkError> {
        let lookup = tokio::net::lookup_host((hostname.trim_matches(['[', ']']), self.port));
        let mut addrs = tokio::time::timeout(STREAM_OPEN_TIMEOUT, lookup)
            .await
            .map_err(|_| SinkError::Timeout)??;
        if addrs.next().is_none() {
            return Err(SinkError::Unresolved(hostname.to_string()));
        }

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|chunk| (Ok::<Bytes, std::io::Error>(chunk), rx))
        });
        let request = self
            .client
            .post(peer_url(hostname, self.port, INTERCOM_PATH))
            .header(ID_HEADER, self.self_id.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(body))
            .send();
        let host = hostname.to_string();
        let request = tokio::spawn(async move {
            let result = request.await.map(|resp| resp.status().as_u16());
            if let Err(e) = &result {
                tracing::warn!(hostname = %host, error = %e, "peer stream failed");
            }
            result
        });

        Ok(Box::new(HttpPeerSink {
            tx: Some(tx),
            request,
        }))
    }
}

struct HttpPeerSink {
    tx: Option<mpsc::Sender<Bytes>>,
    request: JoinHandle<Result<u16, reqwest::Error>>,
}

#[async_trait]
impl ByteSink for HttpPeerSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        let tx = self.tx.as_ref().ok_or(SinkError::Closed)?;
        tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    async fn finish(mut self: Box<Self>) -> Result<(), SinkError> {
        // Dropping the sender ends the request body.
        self.tx = None;
        let outcome = tokio::time::timeout(STREAM_CLOSE_TIMEOUT, &mut self.request).await;
        let joined = match outcome {
            Ok(joined) => joined,
            Err(_) => {
                self.request.abort();
                return Err(SinkError::Timeout);
            }
        };
        let status = joined.map_err(|_| SinkError::Closed)??;
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(SinkError::Status(status))
        }
    }
}
