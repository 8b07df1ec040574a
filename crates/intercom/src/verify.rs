//! Identity verification probes.
//!
//! A probe asks `GET /id` on a hostname and reports the identity it answers
//! with. Probes are fire-and-forget: the result comes back to the node as an
//! event, in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{ID_HEADER, ID_PATH, IDENTITY_PROBE_TIMEOUT};
use crate::identity::PeerId;
use crate::node::NodeEvent;
use crate::transport::peer_url;

/// Why a probe produced no identity.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("empty identity body")]
    EmptyBody,
}

/// Asks a hostname for its identity.
#[async_trait]
pub trait IdentityProbe: Send + Sync {
    async fn probe(&self, hostname: &str) -> Result<PeerId, ProbeError>;
}

/// `GET /id` over HTTP, tagged with our own identity.
pub struct HttpIdentityProbe {
    client: reqwest::Client,
    port: u16,
    self_id: PeerId,
}

impl HttpIdentityProbe {
    pub fn new(client: reqwest::Client, port: u16, self_id: PeerId) -> Self {
        Self {
            client,
            port,
            self_id,
        }
    }
}

#[async_trait]
impl IdentityProbe for HttpIdentityProbe {
    async fn probe(&self, hostname: &str) -> Result<PeerId, ProbeError> {
        let url = peer_url(hostname, self.port, ID_PATH);
        let resp = self
            .client
            .get(&url)
            .timeout(IDENTITY_PROBE_TIMEOUT)
            .header(ID_HEADER, self.self_id.as_str())
            .send()
            .await
            .map_err(timeout_or_request)?;
        if !resp.status().is_success() {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }
        let body = resp.text().await.map_err(timeout_or_request)?;
        PeerId::parse(&body).ok_or(ProbeError::EmptyBody)
    }
}

fn timeout_or_request(err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Request(err)
    }
}

/// Spawns probes and reports their outcome to the node.
#[derive(Clone)]
pub struct Verifier {
    probe: Arc<dyn IdentityProbe>,
    events: UnboundedSender<NodeEvent>,
}

impl Verifier {
    pub fn new(probe: Arc<dyn IdentityProbe>, events: UnboundedSender<NodeEvent>) -> Self {
        Self { probe, events }
    }

    /// Start verifying `hostname`. Returns immediately.
    ///
    /// Earlier probes for the same hostname keep running; whichever answer
    /// arrives last is applied last.
    pub fn announce(&self, hostname: String) {
        let probe = self.probe.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let event = match probe.probe(&hostname).await {
                Ok(identity) => NodeEvent::IdentityVerified { hostname, identity },
                Err(err) => NodeEvent::IdentityProbeFailed {
                    hostname,
                    error: err.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }
}
