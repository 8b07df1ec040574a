//! Identity registry.
//!
//! Maps network locations (hostnames) to peer identities. Discovery events
//! arrive duplicated and out of order, so every mutation goes through
//! [`IdentityRegistry::reconcile`] or [`IdentityRegistry::withdraw`], which keep
//! the table a partial bijection: no hostname maps to two identities and no
//! identity is held by two hostnames.

use std::collections::{BTreeMap, HashMap};

use intercom_types::RegistrySnapshot;

use crate::identity::PeerId;

/// Outcome of applying one verified (hostname, identity) report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Identity the hostname carried before, when it reported a different one.
    pub replaced: Option<PeerId>,
    /// Hostname that held this identity before the peer moved.
    pub moved_from: Option<String>,
    /// `false` when the report matched the table exactly.
    pub changed: bool,
}

/// Hostname ↔ identity table owned by the node reactor.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    by_hostname: BTreeMap<String, PeerId>,
    by_identity: HashMap<PeerId, String>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a verification response into the table.
    ///
    /// Resolves by hostname first, then by identity, then inserts, so the
    /// report applied last always wins.
    pub fn reconcile(&mut self, hostname: &str, identity: PeerId) -> Reconciled {
        let mut outcome = Reconciled::default();

        if self.by_hostname.get(hostname) == Some(&identity) {
            return outcome;
        }

        if let Some(old) = self.by_hostname.remove(hostname) {
            tracing::info!(
                hostname,
                old_id = %old,
                new_id = %identity,
                "registry: hostname reported a new identity, dropping old one"
            );
            self.by_identity.remove(&old);
            outcome.replaced = Some(old);
        }

        if let Some(stale_host) = self.by_identity.remove(&identity) {
            if stale_host != hostname {
                tracing::info!(
                    peer_id = %identity,
                    stale_hostname = %stale_host,
                    hostname,
                    "registry: identity moved to a new hostname, dropping stale entry"
                );
                self.by_hostname.remove(&stale_host);
                outcome.moved_from = Some(stale_host);
            }
        }

        tracing::info!(hostname, peer_id = %identity, "registry: peer registered");
        self.by_hostname.insert(hostname.to_string(), identity.clone());
        self.by_identity.insert(identity, hostname.to_string());
        outcome.changed = true;
        outcome
    }

    /// Remove a hostname and its identity. No-op when absent.
    pub fn withdraw(&mut self, hostname: &str) -> Option<PeerId> {
        let identity = self.by_hostname.remove(hostname)?;
        self.by_identity.remove(&identity);
        tracing::info!(hostname, peer_id = %identity, "registry: peer withdrawn");
        Some(identity)
    }

    /// Registered hostnames, sorted, skipping the one holding `excluding`.
    pub fn peer_hostnames(&self, excluding: &PeerId) -> Vec<String> {
        self.by_hostname
            .iter()
            .filter(|(_, id)| *id != excluding)
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub fn contains_identity(&self, identity: &PeerId) -> bool {
        self.by_identity.contains_key(identity)
    }

    pub fn identity_of(&self, hostname: &str) -> Option<&PeerId> {
        self.by_hostname.get(hostname)
    }

    pub fn len(&self) -> usize {
        self.by_hostname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hostname.is_empty()
    }

    /// Copy of the table for `GET /debug`.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let services = self
            .by_hostname
            .iter()
            .map(|(host, id)| (host.clone(), id.to_string()))
            .collect();
        let mut services_set: Vec<String> =
            self.by_identity.keys().map(|id| id.to_string()).collect();
        services_set.sort();
        RegistrySnapshot {
            services,
            services_set,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    fn entries(registry: &IdentityRegistry) -> Vec<(String, String)> {
        registry
            .snapshot()
            .services
            .into_iter()
            .collect::<Vec<_>>()
    }

    fn pair(host: &str, identity: &str) -> (String, String) {
        (host.to_string(), identity.to_string())
    }

    fn assert_bijection(registry: &IdentityRegistry) {
        assert_eq!(registry.by_hostname.len(), registry.by_identity.len());
        for (host, identity) in &registry.by_hostname {
            assert_eq!(registry.by_identity.get(identity), Some(host));
        }
    }

    #[test]
    fn same_identity_on_new_host_evicts_old_host() {
        let mut registry = IdentityRegistry::new();
        registry.reconcile("host-a", id("X"));
        assert_eq!(entries(&registry), vec![pair("host-a", "X")]);

        let outcome = registry.reconcile("host-b", id("X"));
        assert_eq!(outcome.moved_from.as_deref(), Some("host-a"));
        assert_eq!(entries(&registry), vec![pair("host-b", "X")]);

        registry.withdraw("host-b");
        assert!(registry.is_empty());
        assert!(registry.snapshot().services_set.is_empty());
    }

    #[test]
    fn identical_report_is_noop() {
        let mut registry = IdentityRegistry::new();
        assert!(registry.reconcile("host-a", id("X")).changed);
        let second = registry.reconcile("host-a", id("X"));
        assert_eq!(second, Reconciled::default());
        assert_eq!(entries(&registry), vec![pair("host-a", "X")]);
    }

    #[test]
    fn withdraw_is_idempotent() {
        let mut registry = IdentityRegistry::new();
        registry.reconcile("host-a", id("X"));
        registry.reconcile("host-b", id("Y"));

        assert_eq!(registry.withdraw("host-a"), Some(id("X")));
        let after_first = registry.snapshot();
        assert_eq!(registry.withdraw("host-a"), None);
        assert_eq!(registry.snapshot(), after_first);
        assert_eq!(registry.withdraw("never-seen"), None);
        assert_eq!(registry.snapshot(), after_first);
    }

    #[test]
    fn later_arrival_wins_when_x_then_y() {
        let mut registry = IdentityRegistry::new();
        registry.reconcile("host-a", id("X"));
        let outcome = registry.reconcile("host-a", id("Y"));
        assert_eq!(outcome.replaced, Some(id("X")));
        assert_eq!(entries(&registry), vec![pair("host-a", "Y")]);
        assert!(!registry.contains_identity(&id("X")));
        assert_bijection(&registry);
    }

    #[test]
    fn later_arrival_wins_when_y_then_x() {
        let mut registry = IdentityRegistry::new();
        registry.reconcile("host-a", id("Y"));
        registry.reconcile("host-a", id("X"));
        assert_eq!(entries(&registry), vec![pair("host-a", "X")]);
        assert!(!registry.contains_identity(&id("Y")));
        assert_bijection(&registry);
    }

    #[test]
    fn swap_between_two_hosts_keeps_bijection() {
        let mut registry = IdentityRegistry::new();
        registry.reconcile("host-a", id("X"));
        registry.reconcile("host-b", id("Y"));
        // host-a now answers with Y: host-b's claim on Y is stale.
        let outcome = registry.reconcile("host-a", id("Y"));
        assert_eq!(outcome.replaced, Some(id("X")));
        assert_eq!(outcome.moved_from.as_deref(), Some("host-b"));
        assert_eq!(entries(&registry), vec![pair("host-a", "Y")]);
        assert_bijection(&registry);
    }

    #[test]
    fn peer_hostnames_excludes_self_and_is_sorted() {
        let me = id("self");
        let mut registry = IdentityRegistry::new();
        registry.reconcile("pi-zeta", id("Z"));
        registry.reconcile("localhost", me.clone());
        registry.reconcile("pi-alpha", id("A"));

        assert_eq!(registry.peer_hostnames(&me), vec!["pi-alpha", "pi-zeta"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn bijection_holds_for_arbitrary_event_sequences() {
        let hosts = ["h0", "h1", "h2", "h3"];
        let ids = ["A", "B", "C"];
        let mut registry = IdentityRegistry::new();
        // Small LCG so the sequence is long and varied but deterministic.
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..5_000 {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let host = hosts[(state >> 33) as usize % hosts.len()];
            let ident = ids[(state >> 17) as usize % ids.len()];
            if (state >> 60) % 4 == 0 {
                registry.withdraw(host);
            } else {
                registry.reconcile(host, id(ident));
                assert_eq!(registry.identity_of(host), Some(&id(ident)));
            }
            assert_bijection(&registry);
        }
    }
}
