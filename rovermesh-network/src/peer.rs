//! Per-peer connection state machine.
//!
//! One `Peer` exists for every remote member the gossiper has seen. It
//! owns at most one TCP stream and runs one daemon:
//!
//! ```text
//! IDLE --wanted--> WAITING --accept/dial--> CONNECTED --error/EOF--> WAITING
//! ```
//!
//! Which side opens the stream is decided by uid: the member with the
//! *larger* uid accepts, the smaller one dials. Two members that
//! collide on uid both wait to accept and never connect; the pair heals
//! when one of them restarts with a fresh uid.
//!
//! Wantedness and connectedness are level-triggered `watch` conditions;
//! senders wait on `connected` while the daemon drives the transitions.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rovermesh_core::pattern::NamePattern;
use rovermesh_core::wire::{Frame, Kwargs};
use rovermesh_core::{glob_match, MeshError, WireError};

use crate::member::MemberInner;
use crate::{frames, lock};

/// Consecutive undecodable frames tolerated before the stream is cut.
const MAX_BAD_FRAMES: u32 = 3;

pub(crate) struct Peer {
    name: String,
    uid: u32,
    member: Weak<MemberInner>,
    connect_retry: Duration,

    /// Last advertised accepter address.
    address: Mutex<Option<SocketAddr>>,
    /// Last advertised subscription patterns.
    subs: Mutex<Vec<NamePattern>>,
    /// Last advertised wants patterns.
    wants: Mutex<Vec<NamePattern>>,
    last_seen: Mutex<Instant>,

    wanted: watch::Sender<bool>,
    connected: watch::Sender<bool>,
    /// Cancelled exactly once, when the peer is removed.
    gone: CancellationToken,

    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    /// Parked read half, taken by the daemon once `connected` is set.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// In-flight requests by rid.
    pending: Mutex<HashMap<u32, oneshot::Sender<Value>>>,
}

impl Peer {
    pub(crate) fn new(member: &std::sync::Arc<MemberInner>, name: String, uid: u32) -> Self {
        Self {
            name,
            uid,
            member: std::sync::Arc::downgrade(member),
            connect_retry: member.config.connect_retry,
            address: Mutex::new(None),
            subs: Mutex::new(Vec::new()),
            wants: Mutex::new(Vec::new()),
            last_seen: Mutex::new(Instant::now()),
            wanted: watch::channel(false).0,
            connected: watch::channel(false).0,
            gone: member.scheduler.child_token(),
            writer: AsyncMutex::new(None),
            reader: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn uid(&self) -> u32 {
        self.uid
    }

    pub(crate) fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub(crate) fn address(&self) -> Option<SocketAddr> {
        *lock(&self.address)
    }

    pub(crate) fn last_seen(&self) -> Instant {
        *lock(&self.last_seen)
    }

    pub(crate) fn subscription_patterns(&self) -> Vec<String> {
        lock(&self.subs)
            .iter()
            .map(|pattern| pattern.as_str().to_string())
            .collect()
    }

    /// Fold a fresh beacon into the record.
    pub(crate) async fn update_from_beacon(
        &self,
        member: &MemberInner,
        addr: SocketAddr,
        wants: &[String],
        subs: &[String],
    ) {
        let moved = {
            let mut address = lock(&self.address);
            let moved = address.is_some() && *address != Some(addr);
            *address = Some(addr);
            moved
        };
        if moved {
            // the accepter moved; any live stream points at a dead address
            debug!("peer {} moved to {addr}", self.name);
            self.close().await;
        }
        *lock(&self.wants) = wants.iter().map(|w| NamePattern::new(w)).collect();
        *lock(&self.subs) = subs.iter().map(|s| NamePattern::new(s)).collect();
        *lock(&self.last_seen) = Instant::now();
        self.update_wanted(member);
    }

    /// Recompute the level-triggered wanted flag: either side's wants
    /// glob-matching the other's name makes the pair interesting.
    pub(crate) fn update_wanted(&self, member: &MemberInner) {
        let locally_wanted = lock(&member.wants)
            .iter()
            .any(|pattern| glob_match(pattern, &self.name));
        let wanted = locally_wanted
            || lock(&self.wants)
                .iter()
                .any(|pattern| pattern.matches(&member.name));
        self.wanted.send_replace(wanted);
    }

    /// Whether any advertised subscription matches `topic`.
    pub(crate) fn subscribed_to(&self, topic: &str) -> bool {
        lock(&self.subs).iter().any(|pattern| pattern.matches(topic))
    }

    /// Take ownership of a stream the accepter validated for us.
    /// An existing connection wins; the new stream is dropped.
    pub(crate) async fn accept(&self, stream: TcpStream) {
        if *self.connected.borrow() {
            debug!("peer {} already connected, dropping accepted stream", self.name);
            return;
        }
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        *lock(&self.reader) = Some(reader);
        self.connected.send_replace(true);
    }

    async fn wait_connected(&self) -> Result<(), MeshError> {
        let mut connected = self.connected.subscribe();
        tokio::select! {
            _ = self.gone.cancelled() => Err(MeshError::ConnectionLost),
            result = connected.wait_for(|up| *up) => {
                result.map(|_| ()).map_err(|_| MeshError::ConnectionLost)
            }
        }
    }

    /// One fire-and-forget frame; waits for the connection first.
    pub(crate) async fn send(&self, endpoint: &str, data: Value) -> Result<(), MeshError> {
        self.wait_connected().await?;
        self.write_frame(&Frame::Send {
            endpoint: endpoint.to_string(),
            data,
        })
        .await
    }

    /// Issue a request and suspend until the correlated response.
    pub(crate) async fn request(
        &self,
        endpoint: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, MeshError> {
        self.wait_connected().await?;
        let rid: u32 = rand::random();
        let (slot, response) = oneshot::channel();
        // a colliding rid overwrites the older slot, whose waiter then
        // completes with ConnectionLost
        lock(&self.pending).insert(rid, slot);
        let frame = Frame::Request {
            rid,
            endpoint: endpoint.to_string(),
            args,
            kwargs,
        };
        if let Err(err) = self.write_frame(&frame).await {
            lock(&self.pending).remove(&rid);
            return Err(err);
        }
        response.await.map_err(|_| MeshError::ConnectionLost)
    }

    async fn write_frame(&self, frame: &Frame) -> Result<(), MeshError> {
        let packet = frame.encode();
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(MeshError::ConnectionLost);
        };
        match stream.write_all(&packet).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *writer = None;
                drop(writer);
                self.close().await;
                Err(MeshError::Io(err))
            }
        }
    }

    /// Tear down the connection and fail everything in flight.
    pub(crate) async fn close(&self) {
        self.connected.send_replace(false);
        *self.writer.lock().await = None;
        *lock(&self.reader) = None;
        // dropping the slots completes every pending request with ConnectionLost
        lock(&self.pending).clear();
    }

    /// Permanently remove the peer: stop the daemon, drop the stream,
    /// fail pending requests and wake anyone waiting on `connected`.
    pub(crate) async fn shutdown(&self) {
        self.gone.cancel();
        self.close().await;
    }

    /// The connection daemon. Runs until the peer is removed.
    pub(crate) async fn run(self: std::sync::Arc<Self>) -> anyhow::Result<()> {
        let mut wanted = self.wanted.subscribe();
        let mut connected = self.connected.subscribe();
        loop {
            tokio::select! {
                _ = self.gone.cancelled() => return Ok(()),
                result = wanted.wait_for(|w| *w) => { result?; }
            }
            let Some(member) = self.member.upgrade() else {
                return Ok(());
            };
            if member.uid >= self.uid {
                // the remote dials us; wait for the accepter's handoff
                drop(member);
                tokio::select! {
                    _ = self.gone.cancelled() => return Ok(()),
                    result = connected.wait_for(|up| *up) => { result?; }
                }
            } else if !*connected.borrow() {
                let Some(addr) = *lock(&self.address) else {
                    drop(member);
                    tokio::time::sleep(self.connect_retry).await;
                    continue;
                };
                let dial = tokio::select! {
                    _ = self.gone.cancelled() => return Ok(()),
                    result = TcpStream::connect(addr) => result,
                };
                match dial {
                    Ok(stream) => {
                        let (reader, writer) = stream.into_split();
                        *self.writer.lock().await = Some(writer);
                        *lock(&self.reader) = Some(reader);
                        let hello = Frame::Hello {
                            name: member.name.clone(),
                        };
                        drop(member);
                        if let Err(err) = self.write_frame(&hello).await {
                            debug!("handshake to {} failed: {err}", self.name);
                            self.close().await;
                            tokio::time::sleep(self.connect_retry).await;
                            continue;
                        }
                        self.connected.send_replace(true);
                        debug!("connected to {} at {addr}", self.name);
                    }
                    Err(err) => {
                        drop(member);
                        debug!("dial {} at {addr} failed: {err}", self.name);
                        self.close().await;
                        tokio::time::sleep(self.connect_retry).await;
                        continue;
                    }
                }
            } else {
                drop(member);
            }

            let Some(mut reader) = lock(&self.reader).take() else {
                continue;
            };
            let result = tokio::select! {
                _ = self.gone.cancelled() => {
                    self.close().await;
                    return Ok(());
                }
                result = self.recv_frames(&mut reader) => result,
            };
            match result {
                Err(MeshError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("peer {} closed the connection", self.name);
                }
                Err(err) => debug!("connection to {} lost: {err}", self.name),
                Ok(()) => {}
            }
            self.close().await;
        }
    }

    /// Pump frames off the stream until it breaks.
    async fn recv_frames(&self, reader: &mut OwnedReadHalf) -> Result<(), MeshError> {
        let mut bad_frames = 0u32;
        loop {
            match frames::read_frame(reader).await {
                Ok(frame) => {
                    bad_frames = 0;
                    self.dispatch(frame).await;
                }
                // a bogus length prefix cannot be resynced past
                Err(MeshError::InvalidFrame(err @ WireError::Oversize(_))) => {
                    return Err(MeshError::InvalidFrame(err));
                }
                Err(MeshError::InvalidFrame(err)) => {
                    bad_frames += 1;
                    warn!("dropping invalid frame from {}: {err}", self.name);
                    if bad_frames >= MAX_BAD_FRAMES {
                        return Err(MeshError::InvalidFrame(err));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        let Some(member) = self.member.upgrade() else {
            return;
        };
        match frame {
            Frame::Send { endpoint, data } => {
                member.dispatch_send(&self.name, &endpoint, data).await;
            }
            Frame::Request {
                rid,
                endpoint,
                args,
                kwargs,
            } => {
                let result = member.handle_request(&endpoint, args, kwargs).await;
                if let Err(err) = self.write_frame(&Frame::Response { rid, result }).await {
                    debug!("response to {} not sent: {err}", self.name);
                }
            }
            Frame::Response { rid, result } => {
                // unknown rids are dropped silently
                if let Some(slot) = lock(&self.pending).remove(&rid) {
                    let _ = slot.send(result);
                }
            }
            // a name announcement mid-stream carries no information
            Frame::Hello { .. } => {}
        }
    }
}
