//! The mesh socket: the user-facing object, its routing tables, the
//! handshake/peers-exchange/waterfall/rendezvous dispatch, and the single
//! dispatcher task that serializes every mutation of shared state
//! (`SPEC_FULL.md` §4.4, §5).

use crate::compression::LOCAL_SUPPORTED;
use crate::daemon::{self, DaemonEvent};
use crate::error::MeshError;
use crate::message::{ExceptionRecord, Message};
use crate::peer::PeerHandle;
use crate::transport::StreamFactory;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use waterfall_core::config::NodeConfig;
use waterfall_core::flags::{CompressionMethod, Flag};
use waterfall_core::ids::{time_to_base58, MessageId, NodeId, RequestId};
use waterfall_core::protocol::{InternalMessage, Protocol};

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// A callback invoked for any message type the built-in dispatch table
/// doesn't consume. The socket holds an ordered list of these and invokes
/// them in registration order, stopping at the first `true`
/// (`SPEC_FULL.md` §9's `MessageHandler` capability).
pub type MessageHandler = Box<dyn Fn(&Message, &PeerHandle) -> bool + Send + Sync>;

struct PendingSend {
    msg_type: Flag,
    payload: Vec<Vec<u8>>,
}

/// Everything the dispatcher (and, briefly, the public API) mutates under
/// one lock. A single mutex per socket is explicitly acceptable per
/// `SPEC_FULL.md` §5 so long as the invariants below hold:
/// - every peer is in exactly one of `awaiting` / `routing_table`
/// - every routed peer's id is in exactly one of `outgoing_ids` / `incoming_ids`
struct State {
    connections: HashMap<u64, PeerHandle>,
    routing_table: HashMap<NodeId, PeerHandle>,
    outgoing_ids: HashSet<NodeId>,
    incoming_ids: HashSet<NodeId>,
    awaiting: HashSet<u64>,
    seen: VecDeque<(MessageId, i64)>,
    requests: HashMap<RequestId, PendingSend>,
}

impl State {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            routing_table: HashMap::new(),
            outgoing_ids: HashSet::new(),
            incoming_ids: HashSet::new(),
            awaiting: HashSet::new(),
            seen: VecDeque::new(),
            requests: HashMap::new(),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) node_id: NodeId,
    protocol: Protocol,
    config: NodeConfig,
    outward_addr: (String, u16),
    transport: Arc<dyn StreamFactory>,
    state: Mutex<State>,
    user_queue: Mutex<VecDeque<Message>>,
    queue_notify: Notify,
    handlers: Mutex<Vec<MessageHandler>>,
    exceptions: Mutex<VecDeque<ExceptionRecord>>,
    event_tx: mpsc::UnboundedSender<DaemonEvent>,
    next_conn_id: AtomicU64,
    alive: AtomicBool,
}

impl Inner {
    async fn record_exception(&self, message: impl Into<String>) {
        let mut exceptions = self.exceptions.lock().await;
        exceptions.push_back(ExceptionRecord {
            at: now_unix(),
            message: message.into(),
        });
        while exceptions.len() > 200 {
            exceptions.pop_front();
        }
    }

    async fn enqueue_user_message(&self, msg: &InternalMessage) {
        let message = Message {
            sender: msg.sender_id.clone(),
            id: msg.id(),
            timestamp: msg.timestamp,
            payload: msg.payload.clone(),
        };
        self.user_queue.lock().await.push_back(message);
        self.queue_notify.notify_waiters();
    }

    async fn fallthrough(&self, msg: &InternalMessage, peer: &PeerHandle) {
        let message = Message {
            sender: msg.sender_id.clone(),
            id: msg.id(),
            timestamp: msg.timestamp,
            payload: msg.payload.clone(),
        };
        let handlers = self.handlers.lock().await;
        for handler in handlers.iter() {
            if handler(&message, peer) {
                break;
            }
        }
    }

    /// A freshly constructed `whisper` or `broadcast` frame, ready to send:
    /// `[subtype, *rest]` as its payload, our own node id as sender, "now"
    /// as the timestamp, and our supported compression methods advertised.
    fn build(&self, outer: Flag, subtype: Flag, rest: Vec<Vec<u8>>) -> InternalMessage {
        let mut payload = Vec::with_capacity(1 + rest.len());
        payload.push(vec![subtype.0]);
        payload.extend(rest);
        InternalMessage::new(
            outer,
            self.node_id.clone(),
            payload,
            now_unix(),
            LOCAL_SUPPORTED.to_vec(),
        )
    }

    async fn whisper_one(&self, peer: &PeerHandle, subtype: Flag, rest: Vec<Vec<u8>>) {
        let msg = self.build(Flag::WHISPER, subtype, rest);
        if let Err(e) = peer.send(&msg) {
            self.record_exception(format!("whisper send failed: {e}")).await;
        }
    }

    /// Inserts `(id, timestamp)` into the seen-set without relaying —
    /// used when *we* originate a broadcast, so a later reflected copy of
    /// it is recognized and dropped rather than relayed back out.
    async fn remember_seen(&self, id: MessageId, timestamp: i64) {
        let mut state = self.state.lock().await;
        state.seen.push_back((id, timestamp));
        evict_seen(&mut state.seen, self.config.seen_set_cap, self.config.seen_set_ttl_secs);
    }

    async fn relay_to_all(&self, msg: &InternalMessage) {
        let peers: Vec<PeerHandle> = {
            let state = self.state.lock().await;
            state.routing_table.values().cloned().collect()
        };
        for peer in peers {
            if let Err(e) = peer.send(msg) {
                self.record_exception(format!("broadcast relay failed: {e}")).await;
            }
        }
    }

    /// Originates a new broadcast (`SPEC_FULL.md` §4.4 `Send`): records it
    /// in our own seen-set and relays it to every routed peer.
    async fn originate_broadcast(&self, subtype: Flag, rest: Vec<Vec<u8>>) {
        let msg = self.build(Flag::BROADCAST, subtype, rest);
        self.remember_seen(msg.id(), msg.timestamp).await;
        self.relay_to_all(&msg).await;
    }

    /// The waterfall algorithm (`SPEC_FULL.md` §4.4): returns `true` the
    /// first (and only the first) time a given message id is observed,
    /// relaying it to every currently routed peer as a side effect.
    async fn waterfall(&self, msg: &InternalMessage) -> bool {
        let id = msg.id();
        {
            let mut state = self.state.lock().await;
            if state.seen.iter().any(|(seen_id, _)| *seen_id == id) {
                return false;
            }
            state.seen.push_back((id, msg.timestamp));
            evict_seen(&mut state.seen, self.config.seen_set_cap, self.config.seen_set_ttl_secs);
        }
        self.relay_to_all(msg).await;
        true
    }

    /// Removes `conn_id` from every tracked set and tears down its reader
    /// and writer tasks, closing the underlying socket. Idempotent:
    /// `connections.remove` finds nothing on a second call. `fault`, when
    /// present, is recorded to the exceptions queue — `SPEC_FULL.md` §7's
    /// `FramingError`/`ChecksumError`/`CompressionError`/`TransportError`/
    /// `StaleConnection` kinds all surface this way; a clean EOF or a
    /// peer-reset/bad-descriptor socket error passes `None` and stays
    /// debug-log-only.
    async fn disconnect_conn(&self, conn_id: u64, fault: Option<String>) {
        if let Some(reason) = fault {
            self.record_exception(reason).await;
        }
        let mut state = self.state.lock().await;
        let Some(peer) = state.connections.remove(&conn_id) else {
            return;
        };
        state.awaiting.remove(&conn_id);
        if let Some(id) = peer.id() {
            state.routing_table.remove(&id);
            state.outgoing_ids.remove(&id);
            state.incoming_ids.remove(&id);
            debug!(peer = %id, conn_id, "peer disconnected");
        } else {
            debug!(conn_id, "unrouted connection disconnected");
        }
        drop(state);
        peer.shutdown();
    }

    pub(crate) async fn accept_peer(self: Arc<Self>, stream: Box<dyn crate::transport::Stream>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let peer = PeerHandle::spawn(
            conn_id,
            false,
            self.node_id.clone(),
            stream,
            self.config.stale_peer_secs,
            self.event_tx.clone(),
        );
        {
            let mut state = self.state.lock().await;
            state.connections.insert(conn_id, peer.clone());
            state.awaiting.insert(conn_id);
        }
        self.send_handshake(&peer).await;
    }

    async fn send_handshake(&self, peer: &PeerHandle) {
        let addr_json = serde_json::to_vec(&self.outward_addr).unwrap_or_default();
        let compression_flags: Vec<u8> = LOCAL_SUPPORTED.iter().map(|m| m.flag().0).collect();
        let compression_json = serde_json::to_vec(&compression_flags).unwrap_or_default();
        let rest = vec![
            self.node_id.as_str().as_bytes().to_vec(),
            self.protocol.id().into_bytes(),
            addr_json,
            compression_json,
        ];
        self.whisper_one(peer, Flag::HANDSHAKE, rest).await;
    }

    pub(crate) async fn dispatch(&self, event: DaemonEvent) {
        match event {
            DaemonEvent::Frame { conn_id, msg } => self.handle_frame(conn_id, msg).await,
            DaemonEvent::Disconnected { conn_id, fault } => {
                self.disconnect_conn(conn_id, fault).await
            }
        }
    }

    async fn handle_frame(&self, conn_id: u64, msg: InternalMessage) {
        let peer = {
            let state = self.state.lock().await;
            state.connections.get(&conn_id).cloned()
        };
        let Some(peer) = peer else { return };

        if msg.msg_type == Flag::WHISPER {
            let subtype = Flag(msg.payload.first().and_then(|p| p.first()).copied().unwrap_or(0));
            let rest: &[Vec<u8>] = if msg.payload.is_empty() { &[] } else { &msg.payload[1..] };
            match subtype {
                Flag::HANDSHAKE => self.handle_handshake(conn_id, &peer, &msg, rest).await,
                Flag::PEERS => self.handle_peers(rest).await,
                Flag::WHISPER => self.enqueue_user_message(&msg).await,
                _ => self.fallthrough(&msg, &peer).await,
            }
        } else if msg.msg_type == Flag::BROADCAST {
            if self.waterfall(&msg).await {
                let subtype = Flag(msg.payload.first().and_then(|p| p.first()).copied().unwrap_or(0));
                match subtype {
                    Flag::REQUEST => self.handle_request(&msg).await,
                    Flag::RESPONSE => self.handle_response(&msg).await,
                    _ => self.enqueue_user_message(&msg).await,
                }
            }
        } else {
            self.fallthrough(&msg, &peer).await;
        }
    }

    async fn handle_handshake(
        &self,
        conn_id: u64,
        peer: &PeerHandle,
        msg: &InternalMessage,
        rest: &[Vec<u8>],
    ) {
        if rest.len() < 4 {
            warn!(conn_id, "malformed handshake payload, disconnecting");
            self.disconnect_conn(conn_id, Some("malformed handshake payload".to_string()))
                .await;
            return;
        }
        let peer_protocol_id = String::from_utf8_lossy(&rest[1]).into_owned();
        if peer_protocol_id != self.protocol.id() {
            // Protocol mismatch is `HandshakeRejected` (`SPEC_FULL.md` §7):
            // close and silently drop, not an exceptions-queue entry.
            debug!(conn_id, "protocol mismatch, dropping peer");
            self.disconnect_conn(conn_id, None).await;
            return;
        }

        let addr: (String, u16) = String::from_utf8_lossy(&rest[2])
            .parse_json()
            .unwrap_or_default();
        let compression_flags: Vec<u8> = String::from_utf8_lossy(&rest[3])
            .parse_json()
            .unwrap_or_default();
        let compression: Vec<CompressionMethod> = compression_flags
            .into_iter()
            .filter_map(|b| CompressionMethod::from_flag(Flag(b)))
            .collect();

        let sender_id = msg.sender_id.clone();
        peer.set_routed(sender_id.clone(), addr, compression);

        let peer_list = {
            let mut state = self.state.lock().await;
            state.awaiting.remove(&conn_id);
            state.routing_table.insert(sender_id.clone(), peer.clone());
            if peer.outgoing() {
                state.outgoing_ids.insert(sender_id.clone());
            } else {
                state.incoming_ids.insert(sender_id.clone());
            }
            state
                .routing_table
                .iter()
                .filter_map(|(id, p)| p.addr().map(|a| (id.as_str().to_string(), a)))
                .collect::<Vec<_>>()
        };
        info!(peer = %sender_id, conn_id, "peer routed after handshake");

        let json = serde_json::to_vec(&peer_list).unwrap_or_default();
        self.whisper_one(peer, Flag::PEERS, vec![json]).await;
    }

    async fn handle_peers(&self, rest: &[Vec<u8>]) {
        let Some(list_bytes) = rest.first() else { return };
        let Ok(list) = serde_json::from_slice::<Vec<(String, (String, u16))>>(list_bytes) else {
            return;
        };
        for (id_str, (host, port)) in list {
            if host.is_empty() {
                continue;
            }
            let target_id = NodeId::from_base58(id_str);
            if target_id == self.node_id {
                continue;
            }
            let under_fanout = {
                let state = self.state.lock().await;
                state.outgoing_ids.len() < self.config.max_outgoing
                    && !state.routing_table.contains_key(&target_id)
            };
            if under_fanout {
                let _ = self.connect(&host, port, Some(target_id)).await;
            }
        }
    }

    async fn handle_request(&self, msg: &InternalMessage) {
        let rest = &msg.payload[1..];
        if rest.len() < 2 {
            return;
        }
        let req_id = RequestId::from_base58(String::from_utf8_lossy(&rest[0]).into_owned());
        let target_id = NodeId::from_base58(String::from_utf8_lossy(&rest[1]).into_owned());

        let target_addr = {
            let state = self.state.lock().await;
            state.routing_table.get(&target_id).and_then(|p| p.addr())
        };
        if let Some(addr) = target_addr {
            let addr_json = serde_json::to_vec(&addr).unwrap_or_default();
            let rest = vec![
                req_id.as_str().as_bytes().to_vec(),
                addr_json,
                target_id.as_str().as_bytes().to_vec(),
            ];
            self.originate_broadcast(Flag::RESPONSE, rest).await;
        }
    }

    async fn handle_response(&self, msg: &InternalMessage) {
        let rest = &msg.payload[1..];
        if rest.len() < 3 {
            return;
        }
        let req_id = RequestId::from_base58(String::from_utf8_lossy(&rest[0]).into_owned());
        let pending = {
            let mut state = self.state.lock().await;
            state.requests.remove(&req_id)
        };
        let Some(pending) = pending else { return };

        let Ok(addr) = String::from_utf8_lossy(&rest[1]).parse_json::<(String, u16)>() else {
            return;
        };
        let target_id = NodeId::from_base58(String::from_utf8_lossy(&rest[2]).into_owned());

        if self.connect(&addr.0, addr.1, Some(target_id.clone())).await.unwrap_or(false) {
            let peer = {
                let state = self.state.lock().await;
                state.routing_table.get(&target_id).cloned()
            };
            if let Some(peer) = peer {
                let reply = self.build(pending.msg_type, Flag::WHISPER, pending.payload);
                if let Err(e) = peer.send(&reply) {
                    self.record_exception(format!("rendezvous delivery failed: {e}")).await;
                }
            }
        }
    }

    pub(crate) async fn connect(
        &self,
        addr: &str,
        port: u16,
        id: Option<NodeId>,
    ) -> Result<bool, MeshError> {
        if (addr, port) == (self.outward_addr.0.as_str(), self.outward_addr.1) {
            return Ok(false);
        }
        if let Some(id) = &id {
            let state = self.state.lock().await;
            if state.routing_table.contains_key(id) {
                return Ok(false);
            }
        }

        let dial = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.connect_timeout_ms),
            self.transport.dial(addr, port),
        )
        .await;
        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(MeshError::Transport(e)),
            Err(_) => {
                return Err(MeshError::Transport(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {addr}:{port} timed out"),
                )))
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let peer = PeerHandle::spawn(
            conn_id,
            true,
            self.node_id.clone(),
            stream,
            self.config.stale_peer_secs,
            self.event_tx.clone(),
        );

        {
            let mut state = self.state.lock().await;
            state.connections.insert(conn_id, peer.clone());
            match &id {
                Some(known_id) => {
                    peer.set_routed((*known_id).clone(), (addr.to_string(), port), Vec::new());
                    state.routing_table.insert(known_id.clone(), peer.clone());
                    state.outgoing_ids.insert(known_id.clone());
                }
                None => {
                    state.awaiting.insert(conn_id);
                }
            }
        }

        self.send_handshake(&peer).await;
        Ok(true)
    }
}

trait ParseJson {
    fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error>;
}
impl ParseJson for std::borrow::Cow<'_, str> {
    fn parse_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(self)
    }
}

fn evict_seen(seen: &mut VecDeque<(MessageId, i64)>, cap: usize, ttl_secs: u64) {
    let now = now_unix();
    // Entries arrive in arrival order, not timestamp order — broadcasts
    // can reach this node out of chronological order across different
    // peers — so a stale pair isn't necessarily at the front. A full scan
    // is required to actually enforce the TTL invariant.
    seen.retain(|(_, ts)| now - *ts <= ttl_secs as i64);
    while seen.len() > cap {
        seen.pop_front();
    }
}

/// The user-facing peer-to-peer mesh socket. Cloning a `MeshSocket` is
/// cheap (it's a handle to a shared `Arc<Inner>`); every clone observes
/// the same daemon and routing state.
#[derive(Clone)]
pub struct MeshSocket {
    inner: Arc<Inner>,
    dispatcher: Arc<JoinHandle<()>>,
    accept_loop: Arc<JoinHandle<()>>,
}

impl MeshSocket {
    /// Binds the listener, derives this node's identity, and starts the
    /// accept loop and dispatcher tasks.
    pub async fn bind(config: NodeConfig, transport: Arc<dyn StreamFactory>) -> Result<Self, MeshError> {
        let listener = transport.listen(&config.bind_addr, config.bind_port).await?;
        let bound_addr = listener.local_addr()?;
        let outward_addr = config
            .outward_addr
            .clone()
            .unwrap_or_else(|| (bound_addr.ip().to_string(), bound_addr.port()));

        let protocol = config.protocol();
        let node_id = NodeId::derive(
            &format!("{}:{}", outward_addr.0, outward_addr.1),
            &protocol.id(),
            None,
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            node_id: node_id.clone(),
            protocol,
            config,
            outward_addr,
            transport,
            state: Mutex::new(State::new()),
            user_queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            handlers: Mutex::new(Vec::new()),
            exceptions: Mutex::new(VecDeque::new()),
            event_tx,
            next_conn_id: AtomicU64::new(0),
            alive: AtomicBool::new(true),
        });

        info!(node_id = %node_id, addr = %bound_addr, "mesh socket bound");

        let accept_inner = inner.clone();
        let accept_loop = tokio::spawn(daemon::run_accept_loop(accept_inner, listener));
        let dispatcher_inner = inner.clone();
        let dispatcher = tokio::spawn(daemon::run_dispatcher(dispatcher_inner, event_rx));

        Ok(Self {
            inner,
            dispatcher: Arc::new(dispatcher),
            accept_loop: Arc::new(accept_loop),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn outward_addr(&self) -> &(String, u16) {
        &self.inner.outward_addr
    }

    /// Dials `addr:port`. Returns `Ok(false)` (not an error) if the target
    /// is our own outward address or already routed — `SPEC_FULL.md` §7's
    /// `AlreadyConnected` is non-fatal by design.
    pub async fn connect(&self, addr: &str, port: u16) -> Result<bool, MeshError> {
        self.inner.connect(addr, port, None).await
    }

    /// Broadcasts `payload` (as a `broadcast/broadcast/...` frame) to
    /// every currently routed peer, flooding onward via waterfall as peers
    /// relay it.
    pub async fn send(&self, payload: Vec<Vec<u8>>) {
        self.inner.originate_broadcast(Flag::BROADCAST, payload).await;
    }

    /// Sends `payload` directly to one routed peer as a `whisper`. Returns
    /// `false` if `peer_id` isn't currently routed.
    pub async fn whisper_to(&self, peer_id: &NodeId, payload: Vec<Vec<u8>>) -> bool {
        let peer = {
            let state = self.inner.state.lock().await;
            state.routing_table.get(peer_id).cloned()
        };
        match peer {
            Some(peer) => {
                self.inner.whisper_one(&peer, Flag::WHISPER, payload).await;
                true
            }
            None => false,
        }
    }

    /// Replies to the sender of a received `Message`. If the sender is
    /// directly routed, this is a plain whisper; otherwise it starts the
    /// request/response rendezvous (`SPEC_FULL.md` §4.4) and the payload
    /// is delivered once the direct connection is established.
    pub async fn reply(&self, msg: &Message, payload: Vec<Vec<u8>>) {
        let sender = msg.sender.clone();
        let direct = {
            let state = self.inner.state.lock().await;
            state.routing_table.get(&sender).cloned()
        };
        if let Some(peer) = direct {
            self.inner.whisper_one(&peer, Flag::WHISPER, payload).await;
            return;
        }

        let now = now_unix();
        let req_id = RequestId::derive(&sender, &time_to_base58(now));
        {
            let mut state = self.inner.state.lock().await;
            state.requests.insert(
                req_id.clone(),
                PendingSend {
                    msg_type: Flag::WHISPER,
                    payload,
                },
            );
        }
        let rest = vec![
            req_id.as_str().as_bytes().to_vec(),
            sender.as_str().as_bytes().to_vec(),
        ];
        self.inner.originate_broadcast(Flag::REQUEST, rest).await;
    }

    /// Pops the oldest queued message, or `None` if the queue is empty —
    /// an empty queue is not an error (`SPEC_FULL.md` §7's `QueueEmpty`).
    pub async fn recv(&self) -> Option<Message> {
        self.inner.user_queue.lock().await.pop_front()
    }

    /// Waits (with a bound) for a message to arrive, then pops it. A
    /// convenience over `recv()` for tests and simple client loops; does
    /// not change `recv()`'s own non-blocking semantics.
    pub async fn recv_wait(&self, timeout: std::time::Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(msg) = self.recv().await {
                return Some(msg);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining, self.inner.queue_notify.notified()).await;
        }
    }

    /// Registers a fallback handler invoked for message types the built-in
    /// dispatch table doesn't consume.
    pub async fn register_handler(&self, handler: MessageHandler) {
        self.inner.handlers.lock().await.push(handler);
    }

    /// Returns the accumulated non-fatal exceptions queue.
    pub async fn status(&self) -> Vec<ExceptionRecord> {
        self.inner.exceptions.lock().await.iter().cloned().collect()
    }

    /// The number of peers currently in the routing table.
    pub async fn peer_count(&self) -> usize {
        self.inner.state.lock().await.routing_table.len()
    }

    /// Whether `peer_id` is currently routed.
    pub async fn is_routed(&self, peer_id: &NodeId) -> bool {
        self.inner.state.lock().await.routing_table.contains_key(peer_id)
    }

    /// Number of routed peers we dialed ourselves.
    pub async fn outgoing_count(&self) -> usize {
        self.inner.state.lock().await.outgoing_ids.len()
    }

    /// Number of routed peers that dialed us.
    pub async fn incoming_count(&self) -> usize {
        self.inner.state.lock().await.incoming_ids.len()
    }

    /// Number of connections that have not yet completed a handshake.
    pub async fn awaiting_count(&self) -> usize {
        self.inner.state.lock().await.awaiting.len()
    }

    /// Current size of the waterfall seen-set.
    pub async fn seen_count(&self) -> usize {
        self.inner.state.lock().await.seen.len()
    }

    /// Shuts the socket down: stops the accept loop and dispatcher and
    /// drops every peer connection. A second call is a programmer error
    /// (`SPEC_FULL.md` §7's `DoubleClose`).
    pub async fn close(&self) -> Result<(), MeshError> {
        if self
            .inner
            .alive
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MeshError::AlreadyClosed);
        }
        self.accept_loop.abort();
        self.dispatcher.abort();
        let mut state = self.inner.state.lock().await;
        for (_, peer) in state.connections.drain() {
            peer.shutdown();
        }
        state.routing_table.clear();
        state.outgoing_ids.clear();
        state.incoming_ids.clear();
        state.awaiting.clear();
        Ok(())
    }
}

/// Multi-node integration scenarios for the mesh socket, binding to
/// `127.0.0.1:0` so concurrent test runs never collide on a port
/// (`SPEC_FULL.md` §8's end-to-end scenarios).
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PlaintextTransport;

    fn test_config() -> NodeConfig {
        NodeConfig {
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
            ..NodeConfig::default()
        }
    }

    async fn bind_node() -> MeshSocket {
        MeshSocket::bind(test_config(), Arc::new(PlaintextTransport))
            .await
            .expect("bind should succeed on an OS-assigned port")
    }

    const SETTLE: std::time::Duration = std::time::Duration::from_secs(2);

    #[tokio::test(flavor = "multi_thread")]
    async fn handshake_and_peers_exchange() {
        let a = bind_node().await;
        let b = bind_node().await;

        let a_addr = a.outward_addr().clone();
        let connected = b.connect(&a_addr.0, a_addr.1).await.unwrap();
        assert!(connected);

        tokio::time::sleep(SETTLE).await;

        assert_eq!(a.peer_count().await, 1);
        assert_eq!(b.peer_count().await, 1);
        assert!(a.is_routed(b.node_id()).await);
        assert!(b.is_routed(a.node_id()).await);

        assert_eq!(b.outgoing_count().await, 1);
        assert_eq!(a.incoming_count().await, 1);
        assert_eq!(a.outgoing_count().await, 0);
        assert_eq!(b.incoming_count().await, 0);

        assert_eq!(a.awaiting_count().await, 0);
        assert_eq!(b.awaiting_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn whisper_delivery() {
        let a = bind_node().await;
        let b = bind_node().await;

        let a_addr = a.outward_addr().clone();
        b.connect(&a_addr.0, a_addr.1).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        let delivered = a
            .whisper_to(b.node_id(), vec![b"hello".to_vec()])
            .await;
        assert!(delivered);

        let msg = b
            .recv_wait(std::time::Duration::from_secs(2))
            .await
            .expect("b should receive the whisper");
        assert_eq!(msg.sender, *a.node_id());
        assert_eq!(msg.body(), &[b"hello".to_vec()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broadcast_reaches_and_dedups_across_a_triangle() {
        let a = bind_node().await;
        let b = bind_node().await;
        let c = bind_node().await;

        let a_addr = a.outward_addr().clone();
        let b_addr = b.outward_addr().clone();
        let c_addr = c.outward_addr().clone();

        b.connect(&a_addr.0, a_addr.1).await.unwrap();
        c.connect(&b_addr.0, b_addr.1).await.unwrap();
        c.connect(&a_addr.0, a_addr.1).await.unwrap();
        let _ = c_addr;
        tokio::time::sleep(SETTLE).await;

        assert_eq!(a.peer_count().await, 2);
        assert_eq!(b.peer_count().await, 2);
        assert_eq!(c.peer_count().await, 2);

        a.send(vec![b"triangle".to_vec()]).await;

        let b_msg = b
            .recv_wait(std::time::Duration::from_secs(2))
            .await
            .expect("b should see the broadcast");
        let c_msg = c
            .recv_wait(std::time::Duration::from_secs(2))
            .await
            .expect("c should see the broadcast");
        assert_eq!(b_msg.body(), &[b"triangle".to_vec()]);
        assert_eq!(c_msg.body(), &[b"triangle".to_vec()]);

        // The message loops back to each node via the third edge of the
        // triangle; the seen-set must absorb that without a second delivery.
        assert!(b.recv_wait(std::time::Duration::from_millis(500)).await.is_none());
        assert!(c.recv_wait(std::time::Duration::from_millis(500)).await.is_none());
        assert_eq!(b.seen_count().await, 1);
        assert_eq!(c.seen_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waterfall_seen_set_is_capped() {
        let a = bind_node().await;
        let b = bind_node().await;

        let a_addr = a.outward_addr().clone();
        b.connect(&a_addr.0, a_addr.1).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        for i in 0..150u32 {
            a.send(vec![i.to_be_bytes().to_vec()]).await;
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;

        assert_eq!(a.seen_count().await, 100);
        assert_eq!(b.seen_count().await, 100);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_rendezvous_connects_sender_and_replier_directly() {
        let a = bind_node().await;
        let b = bind_node().await;
        let c = bind_node().await;

        let b_addr = b.outward_addr().clone();
        let c_addr = c.outward_addr().clone();

        a.connect(&b_addr.0, b_addr.1).await.unwrap();
        c.connect(&b_addr.0, b_addr.1).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        assert!(!a.is_routed(c.node_id()).await);
        assert!(!c.is_routed(a.node_id()).await);

        a.send(vec![b"reach me".to_vec()]).await;
        let received = c
            .recv_wait(std::time::Duration::from_secs(2))
            .await
            .expect("c should see a's broadcast relayed through b");
        assert_eq!(received.sender, *a.node_id());

        c.reply(&received, vec![b"ack".to_vec()]).await;

        let reply = a
            .recv_wait(std::time::Duration::from_secs(5))
            .await
            .expect("a should eventually receive c's rendezvous reply");
        assert_eq!(reply.sender, *c.node_id());
        assert_eq!(reply.body(), &[b"ack".to_vec()]);

        let _ = c_addr;
        assert!(a.is_routed(c.node_id()).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mismatched_protocol_never_routes() {
        let mut config_a = test_config();
        config_a.subnet = "mesh-x".to_string();
        let mut config_b = test_config();
        config_b.subnet = "mesh-y".to_string();

        let a = MeshSocket::bind(config_a, Arc::new(PlaintextTransport)).await.unwrap();
        let b = MeshSocket::bind(config_b, Arc::new(PlaintextTransport)).await.unwrap();

        let a_addr = a.outward_addr().clone();
        b.connect(&a_addr.0, a_addr.1).await.unwrap();
        tokio::time::sleep(SETTLE).await;

        assert_eq!(a.peer_count().await, 0);
        assert_eq!(b.peer_count().await, 0);
        assert_eq!(a.awaiting_count().await, 0);
        assert_eq!(b.awaiting_count().await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_close_is_rejected() {
        let a = bind_node().await;
        a.close().await.unwrap();
        let second = a.close().await;
        assert!(second.is_err());
    }
}
