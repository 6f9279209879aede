//! Beacon gossip: periodic UDP broadcast of local identity, plus the
//! receive side that populates and refreshes the peer registry.
//!
//! The socket is bound with reuse-address and reuse-port so several
//! members of the same group can share one machine; broadcast loopback
//! also delivers our own beacons back to us, which is why receivers
//! filter by uid rather than by source address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use rovermesh_core::wire::{Beacon, MAX_BEACON_LEN};

use crate::lock;
use crate::member::MemberInner;

/// Bind the shared gossip socket for a group port.
pub(crate) fn bind_broadcast_socket(port: u16) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;
    Ok(socket.into())
}

/// Emit one beacon every gossip interval.
pub(crate) async fn send_loop(
    member: Arc<MemberInner>,
    socket: Arc<UdpSocket>,
) -> anyhow::Result<()> {
    let key = member.config.key();
    let target = SocketAddr::from(member.config.broadcast_addr());
    loop {
        let beacon = Beacon {
            name: member.name.clone(),
            uid: member.uid,
            accept_port: member
                .accept_port
                .load(std::sync::atomic::Ordering::Relaxed),
            wants: lock(&member.wants).iter().cloned().collect(),
            subs: lock(&member.subscriptions).iter().cloned().collect(),
        };
        if let Err(err) = socket.send_to(&beacon.encode(&key), target).await {
            warn!("beacon send failed: {err}");
        }
        tokio::time::sleep(member.config.gossip_rate).await;
    }
}

/// Receive beacons and keep the registry current.
pub(crate) async fn recv_loop(
    member: Arc<MemberInner>,
    socket: Arc<UdpSocket>,
) -> anyhow::Result<()> {
    let key = member.config.key();
    let mut buf = [0u8; MAX_BEACON_LEN];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                warn!("gossip recv failed: {err}");
                continue;
            }
        };
        // wrong key, foreign traffic and malformed JSON are all dropped
        // without comment; broadcast ports see plenty of noise
        let Ok(beacon) = Beacon::decode(&buf[..len], &key) else {
            continue;
        };
        // broadcast loopback echoes our own beacons
        if beacon.uid == member.uid {
            continue;
        }
        member.upsert_peer(beacon, source.ip()).await;
    }
}

/// Sweep out peers whose beacons stopped.
pub(crate) async fn expire_loop(member: Arc<MemberInner>) -> anyhow::Result<()> {
    loop {
        tokio::time::sleep(member.config.gossip_rate).await;
        let expired: Vec<String> = lock(&member.peers)
            .iter()
            .filter(|(_, peer)| peer.last_seen().elapsed() > member.config.peer_expiry)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            info!("peer {name} expired");
            member.remove_peer(&name).await;
        }
    }
}
