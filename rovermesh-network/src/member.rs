//! The mesh member: peer registry, handler tables and the public API.
//!
//! A `Member` is one named endpoint in a group. It owns the gossiper
//! and accepter daemons, a lazily-populated registry of [`Peer`]s, and
//! three handler tables:
//!
//! - recv handlers (glob on endpoint) for `send` frames, fanned out to
//!   every match, at most once each per packet;
//! - subscription entries, recv handlers keyed `"<peer>/<endpoint>"`
//!   that additionally require the source name to match the peer glob;
//! - request handlers (exact endpoint), whose return value travels
//!   back in a `response` frame.
//!
//! Callbacks are stored as boxed futures so plain and async closures
//! register interchangeably.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info};

use rovermesh_core::pattern::NamePattern;
use rovermesh_core::wire::{Beacon, Kwargs};
use rovermesh_core::{MeshConfig, MeshError};

use crate::peer::Peer;
use crate::scheduler::Scheduler;
use crate::{accept, gossip, lock};

/// The value a member replies with when a request names an endpoint it
/// has no handler for. Callers receive it as a regular result.
pub const NO_SUCH_ENDPOINT: &str = "no such endpoint";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RecvFn = Arc<dyn Fn(String, String, Value) -> BoxFuture<()> + Send + Sync>;
type RequestFn = Arc<dyn Fn(Vec<Value>, Kwargs) -> BoxFuture<Value> + Send + Sync>;

struct RecvEntry {
    endpoint: NamePattern,
    /// Present on subscription entries: the source peer must match.
    source: Option<NamePattern>,
    callback: RecvFn,
}

// member lifecycle: NEW -> RUNNING -> STOPPED, one way only
const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

pub(crate) struct MemberInner {
    pub(crate) name: String,
    pub(crate) uid: u32,
    pub(crate) config: MeshConfig,
    pub(crate) scheduler: Scheduler,
    /// Peer-name globs this member is interested in; gossiped out.
    pub(crate) wants: Mutex<HashSet<String>>,
    /// Advertised `"<peer>/<endpoint>"` subscription patterns.
    pub(crate) subscriptions: Mutex<HashSet<String>>,
    pub(crate) peers: Mutex<HashMap<String, Arc<Peer>>>,
    pub(crate) accept_port: AtomicU16,
    recv_handlers: Mutex<Vec<RecvEntry>>,
    request_handlers: Mutex<HashMap<String, RequestFn>>,
    state: AtomicU8,
}

impl MemberInner {
    fn ensure_running(&self) -> Result<(), MeshError> {
        match self.state.load(Ordering::SeqCst) {
            STATE_NEW => Err(MeshError::NotStarted),
            STATE_STOPPED => Err(MeshError::Stopped),
            _ => Ok(()),
        }
    }

    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    /// Add a peer-name glob to the local wants and wake any peer whose
    /// wanted flag this flips.
    pub(crate) fn add_want(&self, pattern: &str) {
        let inserted = lock(&self.wants).insert(pattern.to_string());
        if inserted {
            for peer in lock(&self.peers).values() {
                peer.update_wanted(self);
            }
        }
    }

    /// Create or refresh a peer record from a validated foreign beacon.
    pub(crate) async fn upsert_peer(self: &Arc<Self>, beacon: Beacon, source_ip: IpAddr) {
        let addr = SocketAddr::new(source_ip, beacon.accept_port);
        let existing = lock(&self.peers).get(&beacon.name).cloned();
        let existing = match existing {
            Some(peer) if peer.uid() != beacon.uid => {
                // a new uid means the peer restarted; the old record
                // pins a stale symmetry-break decision
                info!("peer {} restarted with a new uid", beacon.name);
                self.remove_peer(&beacon.name).await;
                None
            }
            other => other,
        };
        let peer = match existing {
            Some(peer) => peer,
            None => {
                let peer = Arc::new(Peer::new(self, beacon.name.clone(), beacon.uid));
                lock(&self.peers).insert(beacon.name.clone(), peer.clone());
                let daemon = peer.clone();
                self.scheduler
                    .spawn_daemon(format!("peer-{}", beacon.name), move || daemon.clone().run());
                info!("discovered peer {} at {addr}", beacon.name);
                peer
            }
        };
        peer.update_from_beacon(self, addr, &beacon.wants, &beacon.subs)
            .await;
    }

    /// Drop a peer: cancel its daemon, close the stream, fail pending.
    pub(crate) async fn remove_peer(&self, name: &str) {
        let peer = lock(&self.peers).remove(name);
        if let Some(peer) = peer {
            peer.shutdown().await;
        }
    }

    /// Fan an inbound `send` frame out to every matching handler.
    pub(crate) async fn dispatch_send(&self, source: &str, endpoint: &str, data: Value) {
        let matching: Vec<RecvFn> = lock(&self.recv_handlers)
            .iter()
            .filter(|entry| {
                entry.endpoint.matches(endpoint)
                    && entry
                        .source
                        .as_ref()
                        .map_or(true, |peer| peer.matches(source))
            })
            .map(|entry| entry.callback.clone())
            .collect();
        for callback in matching {
            callback(source.to_string(), endpoint.to_string(), data.clone()).await;
        }
    }

    /// Run the request handler for `endpoint`, or produce the sentinel.
    pub(crate) async fn handle_request(
        &self,
        endpoint: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Value {
        let handler = lock(&self.request_handlers).get(endpoint).cloned();
        match handler {
            Some(handler) => handler(args, kwargs).await,
            None => Value::String(NO_SUCH_ENDPOINT.to_string()),
        }
    }
}

/// Registry snapshot of one known peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub name: String,
    pub uid: u32,
    pub address: Option<SocketAddr>,
    pub connected: bool,
    pub subscriptions: Vec<String>,
    /// Seconds since the last beacon (approx).
    pub last_seen_secs: f64,
}

/// One named endpoint on the mesh.
pub struct Member {
    inner: Arc<MemberInner>,
}

impl Member {
    pub fn new(name: impl Into<String>, config: MeshConfig) -> Self {
        Self::with_uid(name, config, rand::random())
    }

    /// Like [`Member::new`] but with a caller-chosen uid, for tools and
    /// tests that need a predictable symmetry break.
    pub fn with_uid(name: impl Into<String>, config: MeshConfig, uid: u32) -> Self {
        Self {
            inner: Arc::new(MemberInner {
                name: name.into(),
                uid,
                config,
                scheduler: Scheduler::new(),
                wants: Mutex::new(HashSet::new()),
                subscriptions: Mutex::new(HashSet::new()),
                peers: Mutex::new(HashMap::new()),
                accept_port: AtomicU16::new(0),
                recv_handlers: Mutex::new(Vec::new()),
                request_handlers: Mutex::new(HashMap::new()),
                state: AtomicU8::new(STATE_NEW),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn uid(&self) -> u32 {
        self.inner.uid
    }

    /// Bind the sockets and spawn the gossip, accept and expiry
    /// daemons. Calling `start` twice is a no-op. A member does not
    /// restart: once stopped it fails with [`MeshError::Stopped`], so
    /// create a fresh `Member` instead.
    pub async fn start(&self) -> Result<(), MeshError> {
        let inner = &self.inner;
        match inner.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(STATE_RUNNING) => return Ok(()),
            Err(_) => return Err(MeshError::Stopped),
        }
        let (listener, udp, accept_port) = match bind_sockets(inner).await {
            Ok(bound) => bound,
            Err(err) => {
                // nothing was spawned; leave the member startable
                inner.state.store(STATE_NEW, Ordering::SeqCst);
                return Err(err);
            }
        };
        inner.accept_port.store(accept_port, Ordering::Relaxed);
        info!(
            "member {} (uid {}) joined group '{}': udp {}, tcp {}",
            inner.name,
            inner.uid,
            inner.config.group,
            inner.config.port(),
            accept_port
        );

        let listener = Arc::new(listener);
        let udp = Arc::new(udp);
        {
            let member = inner.clone();
            let socket = udp.clone();
            inner
                .scheduler
                .spawn_daemon("gossip-send", move || {
                    gossip::send_loop(member.clone(), socket.clone())
                });
        }
        {
            let member = inner.clone();
            let socket = udp.clone();
            inner
                .scheduler
                .spawn_daemon("gossip-recv", move || {
                    gossip::recv_loop(member.clone(), socket.clone())
                });
        }
        {
            let member = inner.clone();
            inner
                .scheduler
                .spawn_daemon("peer-expiry", move || gossip::expire_loop(member.clone()));
        }
        {
            let member = inner.clone();
            inner.scheduler.spawn_daemon("accept", move || {
                accept::accept_loop(member.clone(), listener.clone())
            });
        }
        Ok(())
    }

    /// Cancel every daemon, close the sockets, drop all peers and fail
    /// their pending requests. The member is single-use: once stopped
    /// it cannot be started again, and in-flight operations complete
    /// with [`MeshError::Stopped`].
    pub async fn stop(&self) {
        if self.inner.state.swap(STATE_STOPPED, Ordering::SeqCst) != STATE_RUNNING {
            return;
        }
        self.inner.scheduler.stop().await;
        let peers: Vec<Arc<Peer>> = lock(&self.inner.peers).drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.shutdown().await;
        }
        info!("member {} stopped", self.inner.name);
    }

    /// Best-effort broadcast of `"<name>/<endpoint>"` to every peer
    /// whose advertised subscriptions match. Zero matches is fine; the
    /// only errors are lifecycle ones.
    pub async fn publish(&self, endpoint: &str, data: Value) -> Result<(), MeshError> {
        self.inner.ensure_running()?;
        let topic = format!("{}/{}", self.inner.name, endpoint);
        let peers: Vec<Arc<Peer>> = lock(&self.inner.peers).values().cloned().collect();
        for peer in peers {
            if peer.subscribed_to(&topic) {
                if let Err(err) = peer.send(&topic, data.clone()).await {
                    debug!("publish {topic} to {} failed: {err}", peer.name());
                }
            }
        }
        Ok(())
    }

    /// Send `data` straight to one endpoint on one peer.
    pub async fn send(&self, peer: &str, endpoint: &str, data: Value) -> Result<(), MeshError> {
        self.inner.ensure_running()?;
        let peer = self.try_peer(peer).await?;
        self.inner.add_want(peer.name());
        match peer.send(endpoint, data).await {
            Err(MeshError::ConnectionLost) if self.inner.is_stopped() => Err(MeshError::Stopped),
            other => other,
        }
    }

    /// Call a request endpoint on a peer and wait for its result.
    ///
    /// A peer without a handler replies with [`NO_SUCH_ENDPOINT`],
    /// which comes back as a regular value.
    pub async fn request(
        &self,
        peer: &str,
        endpoint: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, MeshError> {
        self.inner.ensure_running()?;
        let peer = self.try_peer(peer).await?;
        self.inner.add_want(peer.name());
        match peer.request(endpoint, args, kwargs).await {
            Err(MeshError::ConnectionLost) if self.inner.is_stopped() => Err(MeshError::Stopped),
            other => other,
        }
    }

    /// Subscribe to publications matching `"<peer>/<endpoint>"`.
    ///
    /// The callback receives `(source, topic, data)` and only fires
    /// when the source peer's name matches the `peer` glob.
    pub fn subscribe<F, Fut>(&self, peer: &str, endpoint: &str, callback: F)
    where
        F: Fn(String, String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = format!("{peer}/{endpoint}");
        lock(&self.inner.subscriptions).insert(key.clone());
        lock(&self.inner.recv_handlers).push(RecvEntry {
            endpoint: NamePattern::new(&key),
            source: Some(NamePattern::new(peer)),
            callback: Arc::new(move |source, topic, data| Box::pin(callback(source, topic, data))),
        });
        self.inner.add_want(peer);
    }

    /// Register a direct-recv callback `(source, data)` for endpoints
    /// matching the glob.
    pub fn on_recv<F, Fut>(&self, endpoint: &str, callback: F)
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        lock(&self.inner.recv_handlers).push(RecvEntry {
            endpoint: NamePattern::new(endpoint),
            source: None,
            callback: Arc::new(move |source, _topic, data| Box::pin(callback(source, data))),
        });
    }

    /// Register a request handler `(args, kwargs) -> result` for an
    /// exact endpoint name.
    pub fn on_request<F, Fut>(&self, endpoint: &str, callback: F)
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        lock(&self.inner.request_handlers).insert(
            endpoint.to_string(),
            Arc::new(move |args, kwargs| Box::pin(callback(args, kwargs))),
        );
    }

    /// Names of all currently known peers.
    pub fn peers(&self) -> Vec<String> {
        lock(&self.inner.peers).keys().cloned().collect()
    }

    /// Registry snapshot for debugging and UIs.
    pub fn list_peers(&self) -> Vec<PeerInfo> {
        let now = Instant::now();
        lock(&self.inner.peers)
            .values()
            .map(|peer| PeerInfo {
                name: peer.name().to_string(),
                uid: peer.uid(),
                address: peer.address(),
                connected: peer.is_connected(),
                subscriptions: peer.subscription_patterns(),
                last_seen_secs: now.duration_since(peer.last_seen()).as_secs_f64(),
            })
            .collect()
    }

    /// Look up a peer, waiting out the discovery grace window before
    /// giving up with [`MeshError::UnknownPeer`].
    async fn try_peer(&self, name: &str) -> Result<Arc<Peer>, MeshError> {
        let deadline = Instant::now() + self.inner.config.discovery_grace;
        loop {
            // a stop() during the grace window ends the wait
            self.inner.ensure_running()?;
            if let Some(peer) = lock(&self.inner.peers).get(name).cloned() {
                return Ok(peer);
            }
            if Instant::now() >= deadline {
                return Err(MeshError::UnknownPeer(name.to_string()));
            }
            tokio::time::sleep(self.inner.config.gossip_rate).await;
        }
    }
}

async fn bind_sockets(inner: &MemberInner) -> Result<(TcpListener, UdpSocket, u16), MeshError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let accept_port = listener.local_addr()?.port();
    let udp = UdpSocket::from_std(gossip::bind_broadcast_socket(inner.config.port())?)?;
    Ok((listener, udp, accept_port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn member(name: &str) -> Member {
        Member::new(name, MeshConfig::new("dispatch-tests"))
    }

    #[tokio::test]
    async fn direct_recv_gets_source_and_data() {
        let m = member("local");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.on_recv("direct", move |source, data| {
            let sink = sink.clone();
            async move {
                lock(&sink).push((source, data));
            }
        });
        m.inner
            .dispatch_send("remote", "direct", json!({"k": 1234}))
            .await;
        let seen = lock(&seen).clone();
        assert_eq!(seen, vec![("remote".to_string(), json!({"k": 1234}))]);
    }

    #[tokio::test]
    async fn subscription_requires_matching_source() {
        let m = member("device-a");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        m.subscribe("device-b", "hello", move |_source, _topic, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        // topic matches, source matches
        m.inner
            .dispatch_send("device-b", "device-b/hello", json!("world"))
            .await;
        // topic matches the glob but the source is an imposter
        m.inner
            .dispatch_send("imposter", "device-b/hello", json!("world"))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wildcard_subscription() {
        let m = member("device-a");
        let topics = Arc::new(Mutex::new(Vec::new()));
        let sink = topics.clone();
        m.subscribe("*", "telemetry", move |_source, topic, _data| {
            let sink = sink.clone();
            async move {
                lock(&sink).push(topic);
            }
        });
        m.inner
            .dispatch_send("rover-1", "rover-1/telemetry", json!(1))
            .await;
        m.inner
            .dispatch_send("rover-2", "rover-2/telemetry", json!(2))
            .await;
        assert_eq!(
            lock(&topics).clone(),
            vec!["rover-1/telemetry", "rover-2/telemetry"]
        );
    }

    #[tokio::test]
    async fn each_handler_fires_at_most_once_per_packet() {
        let m = member("local");
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let counter = hits.clone();
            m.on_recv("pose*", move |_source, _data| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        m.inner.dispatch_send("remote", "pose", json!(null)).await;
        // two registered handlers, one packet: exactly two invocations
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn request_handler_and_sentinel() {
        let m = member("local");
        m.on_request("add", |args, _kwargs| async move {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            json!(a + b)
        });
        let result = m
            .inner
            .handle_request("add", vec![json!(2), json!(3)], Kwargs::new())
            .await;
        assert_eq!(result, json!(5));

        let missing = m
            .inner
            .handle_request("nope", Vec::new(), Kwargs::new())
            .await;
        assert_eq!(missing, json!(NO_SUCH_ENDPOINT));
    }

    #[tokio::test]
    async fn subscribe_adds_want_and_advertises() {
        let m = member("device-a");
        m.subscribe("device-b", "hello", |_s, _t, _d| async {});
        assert!(lock(&m.inner.wants).contains("device-b"));
        assert!(lock(&m.inner.subscriptions).contains("device-b/hello"));
    }

    #[tokio::test]
    async fn operations_require_start() {
        let m = member("local");
        assert!(matches!(
            m.send("anyone", "direct", json!(1)).await,
            Err(MeshError::NotStarted)
        ));
        assert!(matches!(
            m.request("anyone", "add", Vec::new(), Kwargs::new()).await,
            Err(MeshError::NotStarted)
        ));
        assert!(matches!(
            m.publish("hello", json!(1)).await,
            Err(MeshError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn stopped_member_stays_stopped() {
        let m = member("local");
        m.start().await.expect("start");
        m.stop().await;
        assert!(matches!(m.start().await, Err(MeshError::Stopped)));
        assert!(matches!(
            m.send("anyone", "direct", json!(1)).await,
            Err(MeshError::Stopped)
        ));
        assert!(matches!(
            m.request("anyone", "add", Vec::new(), Kwargs::new()).await,
            Err(MeshError::Stopped)
        ));
        assert!(matches!(
            m.publish("hello", json!(1)).await,
            Err(MeshError::Stopped)
        ));
    }
}
