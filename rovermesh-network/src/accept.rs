//! TCP accept loop.
//!
//! The listener sits on an ephemeral port that the gossiper advertises.
//! A dialing peer introduces itself with one length-prefixed frame
//! holding its bare name; the stream is then handed to that peer's
//! record. Unknown names and malformed handshakes just lose the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use rovermesh_core::wire::Frame;
use rovermesh_core::{MeshError, WireError};

use crate::member::MemberInner;
use crate::{frames, lock};

/// A dialer that connects but never finishes its handshake would stall
/// every other accept; cut it off after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) async fn accept_loop(
    member: Arc<MemberInner>,
    listener: Arc<TcpListener>,
) -> anyhow::Result<()> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let name = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(&mut stream)).await {
            Ok(Ok(name)) => name,
            Ok(Err(err)) => {
                debug!("bad handshake from {addr}: {err}");
                continue;
            }
            Err(_) => {
                debug!("handshake from {addr} timed out");
                continue;
            }
        };
        let peer = lock(&member.peers).get(&name).cloned();
        match peer {
            Some(peer) => {
                debug!("accepted connection from {name} at {addr}");
                peer.accept(stream).await;
            }
            None => {
                debug!("dropping connection from unknown peer {name} at {addr}");
            }
        }
    }
}

/// Read the dialer's one-frame introduction: a bare JSON string name.
async fn read_hello(stream: &mut TcpStream) -> Result<String, MeshError> {
    match frames::read_frame(stream).await? {
        Frame::Hello { name } => Ok(name),
        _ => Err(MeshError::InvalidFrame(WireError::WrongShape(
            "handshake must be a bare name",
        ))),
    }
}
