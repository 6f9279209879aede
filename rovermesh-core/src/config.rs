//! Mesh configuration.

use crate::group::{filter_key, group_to_port, Ipv4Cidr};
use std::net::SocketAddrV4;
use std::time::Duration;

/// Tunable knobs for a mesh member.
///
/// Only the group name is required; the timing defaults match the rates
/// the rest of the library is written against (beacons every 100 ms,
/// peers expiring after 1 s of silence).
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Logical mesh identifier; determines the UDP port and filter key.
    pub group: String,
    /// IPv4 network used to pick the directed broadcast address.
    pub network: Ipv4Cidr,
    /// Interval between beacon broadcasts.
    pub gossip_rate: Duration,
    /// Silence after which a peer is dropped from the registry.
    pub peer_expiry: Duration,
    /// Delay between failed dial attempts.
    pub connect_retry: Duration,
    /// How long `send`/`request` wait for an undiscovered peer's beacon.
    pub discovery_grace: Duration,
}

impl MeshConfig {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            network: Ipv4Cidr::UNSPECIFIED,
            gossip_rate: Duration::from_millis(100),
            peer_expiry: Duration::from_secs(1),
            connect_retry: Duration::from_millis(100),
            discovery_grace: Duration::from_millis(500),
        }
    }

    pub fn with_network(mut self, network: Ipv4Cidr) -> Self {
        self.network = network;
        self
    }

    /// UDP beacon port derived from the group name.
    pub fn port(&self) -> u16 {
        group_to_port(&self.group)
    }

    /// Beacon filter key derived from the port.
    pub fn key(&self) -> [u8; 4] {
        filter_key(self.port())
    }

    /// Where beacons are sent.
    pub fn broadcast_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.network.broadcast_address(), self.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn defaults() {
        let config = MeshConfig::new("g1");
        assert_eq!(config.gossip_rate, Duration::from_millis(100));
        assert_eq!(config.peer_expiry, Duration::from_secs(1));
        assert_eq!(config.connect_retry, Duration::from_millis(100));
        assert_eq!(config.discovery_grace, Duration::from_millis(500));
        assert_eq!(
            config.broadcast_addr(),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, config.port())
        );
    }

    #[test]
    fn directed_broadcast_from_network() {
        let config =
            MeshConfig::new("g1").with_network("10.1.2.0/24".parse().unwrap());
        assert_eq!(
            *config.broadcast_addr().ip(),
            Ipv4Addr::new(10, 1, 2, 255)
        );
    }
}
