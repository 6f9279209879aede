//! Error types shared across the mesh.

use crate::wire::WireError;
use thiserror::Error;

/// Errors surfaced by mesh operations.
///
/// The request sentinel `"no such endpoint"` is deliberately *not* in
/// this enum: a remote member without a handler replies with that
/// string as a regular value.
#[derive(Debug, Error)]
pub enum MeshError {
    /// No beacon from the named peer arrived within the grace window.
    #[error("peer not discovered: {0}")]
    UnknownPeer(String),
    /// The peer connection closed while an operation was in flight.
    #[error("connection to peer lost")]
    ConnectionLost,
    /// A frame failed to parse.
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] WireError),
    /// An operation was attempted before `start()`.
    #[error("member is not started")]
    NotStarted,
    /// The member was stopped; it cannot be restarted or used further.
    #[error("member is stopped")]
    Stopped,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
