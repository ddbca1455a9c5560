//! Listen-address derivation from the host's network interfaces.
//!
//! Sensors advertise `tcp://<listen address>:<port>` URLs, so the address
//! must be reachable from the network. It is either fixed by configuration
//! or taken from the first IPv4 address of an interface, and re-checked
//! periodically so a DHCP renewal or Wi-Fi roam triggers a rebind.

use crate::coordinator::Coordinator;
use crate::error::BridgeError;
use log::{info, warn};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use nix::sys::socket::{AddressFamily, SockaddrLike};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Where the coordinator takes its listen address from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    /// A configured address, never re-derived.
    Fixed(String),
    /// First IPv4 address of the named interface, or of the first running
    /// non-loopback interface when no name is given.
    Interface(Option<String>),
}

impl AddressSource {
    pub fn resolve(&self) -> Option<String> {
        match self {
            AddressSource::Fixed(address) => Some(address.clone()),
            AddressSource::Interface(name) => {
                interface_ipv4(name.as_deref()).map(|ip| ip.to_string())
            }
        }
    }
}

impl Default for AddressSource {
    fn default() -> Self {
        AddressSource::Interface(None)
    }
}

/// IPv4 addresses of running interfaces as `(interface, address)` pairs.
pub fn ipv4_addresses() -> Vec<(String, Ipv4Addr)> {
    let Ok(addrs) = getifaddrs() else {
        warn!("Failed to list network interfaces");
        return Vec::new();
    };

    let mut found = Vec::new();
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_RUNNING) {
            continue;
        }
        if let Some(addr) = ifaddr.address
            && addr.family() == Some(AddressFamily::Inet)
            && let Some(sockaddr) = addr.as_sockaddr_in()
        {
            found.push((ifaddr.interface_name.clone(), sockaddr.ip()));
        }
    }
    found
}

fn interface_ipv4(interface: Option<&str>) -> Option<Ipv4Addr> {
    pick_address(&ipv4_addresses(), interface)
}

fn pick_address(candidates: &[(String, Ipv4Addr)], interface: Option<&str>) -> Option<Ipv4Addr> {
    match interface {
        Some(name) => candidates
            .iter()
            .find(|(iface, _)| iface == name)
            .map(|(_, ip)| *ip),
        None => candidates
            .iter()
            .find(|(_, ip)| !ip.is_loopback() && !ip.is_link_local())
            .map(|(_, ip)| *ip),
    }
}

/// Poll `source` every `interval` and tell the coordinator when the
/// resolved address changes.
pub fn spawn_address_watcher(
    source: AddressSource,
    interval: Duration,
    coordinator: Coordinator,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = tokio::task::spawn_blocking({
            let source = source.clone();
            move || source.resolve()
        })
        .await
        .ok()
        .flatten();
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let source = source.clone();
            let current = match tokio::task::spawn_blocking(move || source.resolve()).await {
                Ok(current) => current,
                Err(e) => {
                    warn!("[Netif] Address lookup failed: {}", e);
                    continue;
                }
            };
            if current == last {
                continue;
            }

            info!(
                "[Netif] Listen address changed: {} -> {}",
                last.as_deref().unwrap_or("none"),
                current.as_deref().unwrap_or("none")
            );
            last = current;
            if let Err(e) = coordinator.address_changed().await {
                warn!("[Netif] Failed to rebind sensors: {}", e);
                if matches!(e, BridgeError::CoordinatorStopped) {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<(String, Ipv4Addr)> {
        vec![
            ("lo".into(), Ipv4Addr::LOCALHOST),
            ("wlan0".into(), Ipv4Addr::new(169, 254, 3, 4)),
            ("eth0".into(), Ipv4Addr::new(192, 168, 1, 20)),
            ("eth1".into(), Ipv4Addr::new(10, 0, 0, 5)),
        ]
    }

    #[test]
    fn test_pick_first_routable_address() {
        assert_eq!(
            pick_address(&candidates(), None),
            Some(Ipv4Addr::new(192, 168, 1, 20))
        );
    }

    #[test]
    fn test_pick_named_interface() {
        assert_eq!(
            pick_address(&candidates(), Some("eth1")),
            Some(Ipv4Addr::new(10, 0, 0, 5))
        );
        assert_eq!(pick_address(&candidates(), Some("eth9")), None);
    }

    #[test]
    fn test_fixed_source_resolves_to_itself() {
        let source = AddressSource::Fixed("10.1.2.3".into());
        assert_eq!(source.resolve().as_deref(), Some("10.1.2.3"));
    }
}
