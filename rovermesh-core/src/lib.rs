//! Core rovermesh primitives: wire formats, glob patterns, group/port
//! derivation, configuration and error types.
//!
//! Everything in this crate is pure computation. Sockets, timers and
//! tasks live in `rovermesh-network`; this crate only defines what goes
//! over the wire and how a group name maps onto the local network.

pub mod config;
pub mod error;
pub mod group;
pub mod pattern;
pub mod wire;

pub use config::MeshConfig;
pub use error::MeshError;
pub use group::{filter_key, group_to_port, Ipv4Cidr};
pub use pattern::{glob_match, NamePattern};
pub use wire::{Beacon, Frame, WireError};
