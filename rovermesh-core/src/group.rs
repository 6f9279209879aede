//! Group-name derived network parameters.
//!
//! A mesh group is identified by a user-chosen string. Two members can
//! only see each other if they agree on the group, so everything the
//! transport needs is derived deterministically from it:
//!
//! - the UDP beacon port (SHA-256 of the group name),
//! - the 4-byte beacon filter key (separates groups that end up
//!   sharing a port),
//! - the directed broadcast address (from the configured IPv4 network).

use sha2::{Digest, Sha256};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Derive the UDP beacon port for a group name.
///
/// The first two bytes of the SHA-256 digest are read big-endian. Ports
/// below 1024 are privileged, so the hash is extended with a salt and
/// re-digested until the value lands at 1024 or above.
pub fn group_to_port(group: &str) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(group.as_bytes());
    loop {
        let digest = hasher.clone().finalize();
        let port = u16::from_be_bytes([digest[0], digest[1]]);
        if port >= 1024 {
            return port;
        }
        hasher.update(b"salt!");
    }
}

/// The 4-byte key prefixed to every beacon datagram.
///
/// Unrelated groups can hash to the same port; the key (`port * port`,
/// big-endian) lets receivers drop their traffic cheaply.
pub fn filter_key(port: u16) -> [u8; 4] {
    (u32::from(port) * u32::from(port)).to_be_bytes()
}

/// Error parsing an IPv4 CIDR string.
#[derive(Debug, Error)]
#[error("invalid IPv4 CIDR notation: {0}")]
pub struct CidrError(pub String);

/// An IPv4 network in CIDR notation, e.g. `192.168.1.0/24`.
///
/// Used to pick the directed broadcast address beacons are sent to.
/// The default `0.0.0.0/0` broadcasts to `255.255.255.255`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    /// The limited-broadcast network, `0.0.0.0/0`.
    pub const UNSPECIFIED: Ipv4Cidr = Ipv4Cidr {
        addr: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError(format!("{addr}/{prefix}")));
        }
        Ok(Self { addr, prefix })
    }

    /// The directed broadcast address: all host bits set.
    pub fn broadcast_address(&self) -> Ipv4Addr {
        let host_bits = u32::MAX.checked_shr(u32::from(self.prefix)).unwrap_or(0);
        Ipv4Addr::from(u32::from(self.addr) | host_bits)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s.split_once('/').ok_or_else(|| CidrError(s.to_string()))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| CidrError(s.to_string()))?;
        let prefix: u8 = prefix.parse().map_err(|_| CidrError(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}
