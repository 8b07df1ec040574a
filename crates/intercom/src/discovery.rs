//! Discovery adapter.
//!
//! Validates raw discovery events at the boundary and turns them into
//! registry operations. Also decides when an inbound HTTP caller should be
//! announced as a peer before mDNS has converged.

use crate::identity::PeerId;
use crate::registry::IdentityRegistry;
use crate::verify::Verifier;

/// What a discovery collaborator reports about a service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerDescriptor {
    /// Host name the peer can be reached at (for example `pi-kitchen.local`).
    pub name: String,
    /// Fully qualified service type the instance was announced under.
    pub service_type: String,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
        }
    }
}

/// Filters discovery events down to the intercom service type.
#[derive(Clone, Debug)]
pub struct DiscoveryAdapter {
    service_type: String,
}

impl DiscoveryAdapter {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
        }
    }

    /// Return the normalized hostname when the descriptor is ours and named.
    pub fn accept(&self, descriptor: &PeerDescriptor) -> Option<String> {
        if !same_service_type(&descriptor.service_type, &self.service_type) {
            tracing::debug!(
                name = %descriptor.name,
                service_type = %descriptor.service_type,
                "discovery: ignoring foreign service type"
            );
            return None;
        }
        normalize_hostname(&descriptor.name)
    }

    /// A peer came up: start verifying its identity.
    pub fn peer_up(&self, descriptor: &PeerDescriptor, verifier: &Verifier) {
        if let Some(hostname) = self.accept(descriptor) {
            tracing::debug!(hostname = %hostname, "discovery: peer up");
            verifier.announce(hostname);
        }
    }

    /// A peer went away: drop it from the table.
    pub fn peer_down(&self, descriptor: &PeerDescriptor, registry: &mut IdentityRegistry) {
        if let Some(hostname) = self.accept(descriptor) {
            tracing::debug!(hostname = %hostname, "discovery: peer down");
            registry.withdraw(&hostname);
        }
    }

    /// An inbound request declared `origin` from `remote_host`.
    ///
    /// Unknown identities are announced so a peer that reached us over HTTP
    /// first is registered without waiting for mDNS. Returns `true` when a
    /// verification was started.
    pub fn inbound_origin(
        &self,
        remote_host: &str,
        origin: &PeerId,
        self_id: &PeerId,
        registry: &IdentityRegistry,
        verifier: &Verifier,
    ) -> bool {
        if origin == self_id || registry.contains_identity(origin) {
            return false;
        }
        let Some(hostname) = normalize_hostname(remote_host) else {
            return false;
        };
        tracing::info!(
            peer_id = %origin,
            hostname = %hostname,
            "discovery: request from unknown peer, registering"
        );
        verifier.announce(hostname);
        true
    }
}

/// Trim whitespace and a trailing root dot; `None` for empty names.
pub fn normalize_hostname(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn same_service_type(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}
