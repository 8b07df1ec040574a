//! Node reactor.
//!
//! One task owns the identity registry and the session coordinator and applies
//! events one at a time. Everything else (mDNS browser, button poller, HTTP
//! handlers, probes, timers, pumps) only sends [`NodeEvent`]s, so neither the
//! registry nor the session needs a lock.

use std::sync::Arc;
use std::time::Duration;

use intercom_types::RegistrySnapshot;
use tokio::sync::{mpsc, oneshot};

use crate::audio::AudioBackend;
use crate::button::ButtonEdge;
use crate::config::SERVICE_TYPE;
use crate::discovery::{DiscoveryAdapter, PeerDescriptor};
use crate::identity::PeerId;
use crate::registry::IdentityRegistry;
use crate::session::{SessionCoordinator, SessionEvent};
use crate::sink::PeerConnector;
use crate::verify::{IdentityProbe, Verifier};

#[derive(Debug)]
pub enum NodeEvent {
    PeerUp(PeerDescriptor),
    PeerDown(PeerDescriptor),
    /// An inbound request declared `origin` from `remote_host`.
    InboundOrigin {
        remote_host: String,
        origin: PeerId,
    },
    IdentityVerified {
        hostname: String,
        identity: PeerId,
    },
    IdentityProbeFailed {
        hostname: String,
        error: String,
    },
    Button(ButtonEdge),
    Session(SessionEvent),
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    Shutdown,
}

/// Cloneable sender side of the reactor.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    /// Returns `false` once the node has stopped.
    pub fn send(&self, event: NodeEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn button(&self, edge: ButtonEdge) -> bool {
        self.send(NodeEvent::Button(edge))
    }

    pub fn shutdown(&self) -> bool {
        self.send(NodeEvent::Shutdown)
    }

    /// Handle whose events land in the returned receiver instead of a node.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Current registry contents, or `None` when the node is gone.
    pub async fn snapshot(&self) -> Option<RegistrySnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(NodeEvent::Snapshot(reply)) {
            return None;
        }
        rx.await.ok()
    }
}

pub struct Node {
    self_id: PeerId,
    registry: IdentityRegistry,
    discovery: DiscoveryAdapter,
    verifier: Verifier,
    session: SessionCoordinator,
    events: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Node {
    pub fn new(
        self_id: PeerId,
        recording_timeout: Duration,
        probe: Arc<dyn IdentityProbe>,
        audio: Arc<dyn AudioBackend>,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, NodeHandle) {
        let (tx, events) = mpsc::unbounded_channel();
        let node = Self {
            self_id,
            registry: IdentityRegistry::new(),
            discovery: DiscoveryAdapter::new(SERVICE_TYPE),
            verifier: Verifier::new(probe, tx.clone()),
            session: SessionCoordinator::new(audio, connector, tx.clone(), recording_timeout),
            events,
        };
        (node, NodeHandle { tx })
    }

    /// Apply events until [`NodeEvent::Shutdown`], then close any open session.
    ///
    /// The event channel is closed before the session drains, so handles see
    /// the node as stopped from then on.
    pub async fn run(mut self) {
        tracing::info!(peer_id = %self.self_id, "node: started");
        while self.step().await {}
        self.events.close();
        self.session.shutdown().await;
        tracing::info!("node: stopped");
    }

    async fn step(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => self.dispatch(event),
            None => false,
        }
    }

    fn dispatch(&mut self, event: NodeEvent) -> bool {
        match event {
            NodeEvent::PeerUp(descriptor) => self.discovery.peer_up(&descriptor, &self.verifier),
            NodeEvent::PeerDown(descriptor) => {
                self.discovery.peer_down(&descriptor, &mut self.registry)
            }
            NodeEvent::InboundOrigin {
                remote_host,
                origin,
            } => {
                self.discovery.inbound_origin(
                    &remote_host,
                    &origin,
                    &self.self_id,
                    &self.registry,
                    &self.verifier,
                );
            }
            NodeEvent::IdentityVerified { hostname, identity } => {
                self.registry.reconcile(&hostname, identity);
            }
            NodeEvent::IdentityProbeFailed { hostname, error } => {
                tracing::debug!(hostname = %hostname, error = %error, "identity probe failed");
            }
            NodeEvent::Button(ButtonEdge::Pressed) => self.session.press(),
            NodeEvent::Button(ButtonEdge::Released) => self.session.release(),
            NodeEvent::Session(event) => {
                let registry = &self.registry;
                let self_id = &self.self_id;
                self.session
                    .handle(event, || registry.peer_hostnames(self_id));
            }
            NodeEvent::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            NodeEvent::Shutdown => return false,
        }
        true
    }
}
