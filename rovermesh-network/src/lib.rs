//! Rovermesh LAN networking: peer discovery over UDP broadcast plus
//! reliable unicast messaging over TCP.
//!
//! Responsibilities
//! ----------------
//! • Periodically broadcast a beacon (name, uid, accept port, wants,
//!   subscriptions) and track every peer seen on the group port.
//! • Keep exactly one TCP stream per peer pair: the larger uid accepts,
//!   the smaller dials.
//! • Multiplex `send`, `request` and `response` frames over that stream
//!   and correlate responses to in-flight requests.
//! • Route inbound frames to subscription, direct-recv and request
//!   handlers registered on the [`Member`].
//! • Expire peers whose beacons stop and fail their pending requests.
//!
//! Notes
//! -----
//! • Publish is best-effort: a subscriber that has not been discovered
//!   yet simply misses the message.
//! • Everything runs on tokio; `Member::stop` cancels all daemons and
//!   closes every socket.

pub mod member;
pub mod scheduler;

mod accept;
mod frames;
mod gossip;
mod peer;

pub use member::{Member, PeerInfo, NO_SUCH_ENDPOINT};
pub use rovermesh_core::wire::Kwargs;
pub use rovermesh_core::{MeshConfig, MeshError};
pub use scheduler::Scheduler;

/// Lock a mutex, riding through poisoning: a panicked handler must not
/// wedge the rest of the mesh.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
