//! mDNS advertisement and browsing.
//!
//! Publishes this node under the intercom service type and feeds peer
//! up/down events for the same type into the node.

use std::collections::HashMap;
use std::time::Duration;

use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::config::SERVICE_TYPE;
use crate::discovery::PeerDescriptor;
use crate::identity::PeerId;
use crate::node::{NodeEvent, NodeHandle};

const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Start an mDNS daemon, optionally limited to one network interface.
fn start_daemon(interface: Option<&str>) -> Option<ServiceDaemon> {
    let daemon = match ServiceDaemon::new() {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(error = %e, "mdns: daemon start failed");
            return None;
        }
    };
    if let Some(name) = interface {
        let pinned = daemon
            .disable_interface(IfKind::All)
            .and_then(|()| daemon.enable_interface(IfKind::Name(name.to_string())));
        if let Err(e) = pinned {
            tracing::warn!(interface = name, error = %e, "mdns: interface selection failed");
        }
    }
    Some(daemon)
}

/// Service record for this node. Addresses are filled in by the daemon from
/// the enabled interfaces and follow address changes.
fn service_info(
    instance: &str,
    port: u16,
    self_id: &PeerId,
) -> Result<ServiceInfo, mdns_sd::Error> {
    let host = advertised_host(instance);
    let properties: HashMap<String, String> = [("id".to_string(), self_id.to_string())]
        .into_iter()
        .collect();
    ServiceInfo::new(SERVICE_TYPE, instance, &host, "", port, properties)
        .map(ServiceInfo::enable_addr_auto)
}

/// Active mDNS advertisement. Registered once; the daemon answers queries
/// and re-announces for as long as it runs.
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    fullname: String,
}

/// Start advertising this node on `port`.
pub fn spawn_mdns_publisher(
    port: u16,
    self_id: &PeerId,
    interface: Option<&str>,
) -> Option<MdnsPublisher> {
    let daemon = start_daemon(interface)?;
    let instance = local_host_name();
    let info = match service_info(&instance, port, self_id) {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(error = %e, "mdns: invalid service info");
            return None;
        }
    };
    let fullname = info.get_fullname().to_string();
    if let Err(e) = daemon.register(info) {
        tracing::warn!(error = %e, "mdns: register failed");
        return None;
    }
    tracing::info!(
        instance = %instance,
        peer_id = %self_id,
        port,
        interface = interface.unwrap_or("all"),
        "mdns: advertised intercom"
    );
    Some(MdnsPublisher { daemon, fullname })
}

impl MdnsPublisher {
    /// Withdraw the advertisement and stop the daemon.
    pub fn shutdown(self) {
        if let Ok(rx) = self.daemon.unregister(&self.fullname) {
            let _ = rx.recv_timeout(DAEMON_STOP_TIMEOUT);
        }
        if let Ok(rx) = self.daemon.shutdown() {
            let _ = rx.recv_timeout(DAEMON_STOP_TIMEOUT);
        }
        tracing::info!("mdns: advertisement withdrawn");
    }
}

/// Browses for peers and forwards them to the node.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

pub fn spawn_mdns_browser(node: NodeHandle, interface: Option<&str>) -> Option<MdnsBrowser> {
    let daemon = start_daemon(interface)?;
    let receiver = match daemon.browse(SERVICE_TYPE) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "mdns: browse failed");
            return None;
        }
    };
    tracing::info!("mdns: browsing for {SERVICE_TYPE}");
    std::thread::spawn(move || {
        let mut fullname_to_host: HashMap<String, String> = HashMap::new();
        for event in receiver {
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    let fullname = info.get_fullname().to_string();
                    let host = info.get_hostname().to_string();
                    tracing::debug!(
                        fullname = %fullname,
                        host = %host,
                        port = info.get_port(),
                        "mdns: service resolved"
                    );
                    let service_type = service_type_of(&fullname).unwrap_or(SERVICE_TYPE);
                    let descriptor = PeerDescriptor::new(host.clone(), service_type);
                    fullname_to_host.insert(fullname, host);
                    if !node.send(NodeEvent::PeerUp(descriptor)) {
                        break;
                    }
                }
                ServiceEvent::ServiceRemoved(ty, fullname) => {
                    let Some(host) = fullname_to_host.remove(&fullname) else {
                        continue;
                    };
                    tracing::debug!(fullname = %fullname, host = %host, "mdns: service removed");
                    if !node.send(NodeEvent::PeerDown(PeerDescriptor::new(host, ty))) {
                        break;
                    }
                }
                ServiceEvent::SearchStopped(_) => break,
                _ => {}
            }
        }
        tracing::debug!("mdns: browser stopped");
    });
    Some(MdnsBrowser { daemon })
}

impl MdnsBrowser {
    pub fn shutdown(self) {
        let _ = self.daemon.stop_browse(SERVICE_TYPE);
        if let Ok(rx) = self.daemon.shutdown() {
            let _ = rx.recv_timeout(DAEMON_STOP_TIMEOUT);
        }
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().to_string())
        .trim()
        .trim_end_matches('.')
        .trim_end_matches(".local")
        .to_string()
}

/// `pi-kitchen` -> `pi-kitchen.local.`
fn advertised_host(host_base: &str) -> String {
    if host_base.ends_with(".local.") {
        host_base.to_string()
    } else {
        format!("{host_base}.local.")
    }
}

/// `pi._rpi-intercom._tcp.local.` -> `_rpi-intercom._tcp.local.`
fn service_type_of(fullname: &str) -> Option<&str> {
    fullname.find("._").map(|idx| &fullname[idx + 1..])
}
