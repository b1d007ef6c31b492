//! Peer connection: per-stream framing state, the send half, and
//! renegotiation handling (`SPEC_FULL.md` §4.2).
//!
//! Each accepted or dialed stream becomes a [`PeerHandle`] plus two tokio
//! tasks: a writer task draining an unbounded channel of already-framed
//! bytes, and a reader task that reads one frame at a time via
//! `waterfall_core::protocol::read_frame_len`/`read_frame_body` (the
//! bulk-read substitution for one-byte-at-a-time buffering the spec
//! allows) and forwards decoded messages to the dispatcher through
//! `event_tx`. The two reads are split so the stale-peer timeout only
//! ever applies to the body read — a connection with nothing new to send
//! is not mid-frame and must not be reaped just for being idle.
//! `renegotiate` frames are intercepted here and never reach the
//! dispatcher, matching the spec's placement of that handling inside the
//! Peer Connection rather than the Mesh Socket.

use crate::compression::{all_supported, LOCAL_SUPPORTED};
use crate::daemon::DaemonEvent;
use crate::transport::Stream;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use waterfall_core::error::WireError;
use waterfall_core::flags::{CompressionMethod, Flag};
use waterfall_core::ids::NodeId;
use waterfall_core::protocol::InternalMessage;

/// Whether an I/O failure reading from or writing to a peer is one of the
/// cases `SPEC_FULL.md` §4.2 calls out to log quietly rather than surface
/// through the exceptions queue: a clean EOF (the peer simply closed its
/// end) or a socket error indicating a reset/already-gone connection.
fn is_quiet_io_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::NotConnected
    )
}

fn is_quiet_wire_error(e: &WireError) -> bool {
    matches!(e, WireError::Io(io) if is_quiet_io_error(io))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

struct PeerInner {
    conn_id: u64,
    outgoing: bool,
    local_node_id: NodeId,
    id: Mutex<Option<NodeId>>,
    addr: Mutex<Option<(String, u16)>>,
    compression: Mutex<Vec<CompressionMethod>>,
    last_activity: AtomicI64,
    last_sent: Mutex<Option<InternalMessage>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// A cheap, cloneable reference to one peer connection's live state. Does
/// *not* own the stream — the two I/O tasks spawned by [`PeerHandle::spawn`]
/// do — so dropping every handle without also dropping the channel sender
/// does not close the connection. The mesh socket is the only true owner;
/// peers observe it, never the reverse, per `SPEC_FULL.md` §9.
#[derive(Clone)]
pub struct PeerHandle(Arc<PeerInner>);

impl PeerHandle {
    pub fn conn_id(&self) -> u64 {
        self.0.conn_id
    }

    pub fn outgoing(&self) -> bool {
        self.0.outgoing
    }

    pub fn id(&self) -> Option<NodeId> {
        self.0.id.lock().unwrap().clone()
    }

    pub fn addr(&self) -> Option<(String, u16)> {
        self.0.addr.lock().unwrap().clone()
    }

    pub fn is_stale(&self, stale_secs: u64) -> bool {
        let last = self.0.last_activity.load(Ordering::Relaxed);
        now_unix() - last > stale_secs as i64
    }

    /// Aborts this peer's reader and writer tasks, dropping the stream
    /// halves they own and closing the underlying socket. Idempotent —
    /// a second call finds the task list already drained.
    pub fn shutdown(&self) {
        let mut tasks = self.0.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    /// Called once the handshake from this peer has been accepted: records
    /// its node id, claimed outward address, and advertised compression
    /// support.
    pub fn set_routed(&self, id: NodeId, addr: (String, u16), compression: Vec<CompressionMethod>) {
        *self.0.id.lock().unwrap() = Some(id);
        *self.0.addr.lock().unwrap() = Some(addr);
        *self.0.compression.lock().unwrap() = compression;
    }

    /// Encode and queue `msg` for writing. Stores it as `last_sent` when its
    /// outer type is `broadcast` or `whisper`, so a `resend` renegotiation
    /// can replay it later.
    pub fn send(&self, msg: &InternalMessage) -> Result<(), crate::error::MeshError> {
        if msg.msg_type == Flag::BROADCAST || msg.msg_type == Flag::WHISPER {
            *self.0.last_sent.lock().unwrap() = Some(msg.clone());
        }
        let compression = self.0.compression.lock().unwrap().clone();
        let method = LOCAL_SUPPORTED.iter().find(|m| compression.contains(m)).copied();
        let compressor = method.map(crate::compression::by_method);
        let framed = waterfall_core::protocol::encode(msg, compressor.as_deref());
        self.0
            .out_tx
            .send(framed)
            .map_err(|_| crate::error::MeshError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer connection closed",
            )))
    }

    /// Spawns the writer and reader tasks for a freshly accepted or dialed
    /// stream and returns a handle to the shared state they maintain.
    pub fn spawn(
        conn_id: u64,
        outgoing: bool,
        local_node_id: NodeId,
        stream: Box<dyn Stream>,
        stale_secs: u64,
        event_tx: mpsc::UnboundedSender<DaemonEvent>,
    ) -> Self {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let inner = Arc::new(PeerInner {
            conn_id,
            outgoing,
            local_node_id,
            id: Mutex::new(None),
            addr: Mutex::new(None),
            compression: Mutex::new(Vec::new()),
            last_activity: AtomicI64::new(now_unix()),
            last_sent: Mutex::new(None),
            out_tx,
            tasks: Mutex::new(Vec::new()),
        });
        let handle = PeerHandle(inner.clone());

        let writer_event_tx = event_tx.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                let result = match writer.write_all(&bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    let fault = if is_quiet_io_error(&e) {
                        debug!(conn_id, "peer closed connection, disconnecting");
                        None
                    } else {
                        debug!(conn_id, error = %e, "peer write failed, disconnecting");
                        Some(format!("write failed: {e}"))
                    };
                    let _ = writer_event_tx.send(DaemonEvent::Disconnected { conn_id, fault });
                    break;
                }
            }
        });

        let reader_inner = inner.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                // Not yet mid-frame (`active = false`): wait for the next
                // frame's length header with no timeout. A peer that
                // simply has nothing new to send is healthy, not stale —
                // `SPEC_FULL.md` §4.3's staleness check only ever applies
                // to a connection stuck mid-message.
                let len = match waterfall_core::protocol::read_frame_len(&mut reader).await {
                    Ok(len) => len,
                    Err(e) if is_quiet_wire_error(&e) => {
                        debug!(conn_id, "peer closed connection");
                        let _ = event_tx.send(DaemonEvent::Disconnected { conn_id, fault: None });
                        break;
                    }
                    Err(e) => {
                        debug!(conn_id, error = %e, "peer read failed, disconnecting");
                        let _ = event_tx.send(DaemonEvent::Disconnected {
                            conn_id,
                            fault: Some(format!("read failed: {e}")),
                        });
                        break;
                    }
                };

                reader_inner
                    .last_activity
                    .store(now_unix(), Ordering::Relaxed);

                // Mid-frame (`active = true`): a peer that goes quiet here
                // has started a message it never finishes, which is what
                // the stale-peer timeout exists to catch.
                let body = match tokio::time::timeout(
                    Duration::from_secs(stale_secs),
                    waterfall_core::protocol::read_frame_body(&mut reader, len),
                )
                .await
                {
                    Err(_elapsed) => {
                        debug!(conn_id, "peer went stale mid-frame, disconnecting");
                        let _ = event_tx.send(DaemonEvent::Disconnected {
                            conn_id,
                            fault: Some(format!(
                                "stale connection: no activity for {stale_secs}s mid-frame"
                            )),
                        });
                        break;
                    }
                    Ok(Err(e)) if is_quiet_wire_error(&e) => {
                        debug!(conn_id, "peer closed connection mid-frame");
                        let _ = event_tx.send(DaemonEvent::Disconnected { conn_id, fault: None });
                        break;
                    }
                    Ok(Err(e)) => {
                        debug!(conn_id, error = %e, "peer read failed, disconnecting");
                        let _ = event_tx.send(DaemonEvent::Disconnected {
                            conn_id,
                            fault: Some(format!("read failed: {e}")),
                        });
                        break;
                    }
                    Ok(Ok(body)) => body,
                };

                reader_inner
                    .last_activity
                    .store(now_unix(), Ordering::Relaxed);

                let compressors = all_supported();
                let refs: Vec<&dyn waterfall_core::protocol::Compressor> =
                    compressors.iter().map(|c| c.as_ref()).collect();

                match waterfall_core::protocol::decode(&body, &refs) {
                    Ok(msg) if msg.msg_type == Flag::RENEGOTIATE => {
                        let handle = PeerHandle(reader_inner.clone());
                        handle.handle_renegotiate(&msg);
                    }
                    Ok(msg) => {
                        trace!(conn_id, msg_type = %msg.msg_type, "frame decoded");
                        if event_tx.send(DaemonEvent::Frame { conn_id, msg }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn_id, error = %e, "frame decode failed, disconnecting");
                        let _ = event_tx.send(DaemonEvent::Disconnected {
                            conn_id,
                            fault: Some(format!("decode failed: {e}")),
                        });
                        break;
                    }
                }
            }
        });

        inner.tasks.lock().unwrap().extend([writer_task, reader_task]);
        handle
    }

    /// Handle an inbound `renegotiate` frame without involving the
    /// dispatcher: a `compression` subject updates our view of this peer's
    /// advertised compression list and, if it actually changed, replies
    /// with the intersection against our own support (this asymmetry is
    /// what prevents a renegotiation ping-pong). A `resend` subject just
    /// replays `last_sent`.
    fn handle_renegotiate(&self, msg: &InternalMessage) {
        let Some(subflag) = msg.payload.first().and_then(|p| p.first()).copied() else {
            return;
        };

        if subflag == Flag::COMPRESSION.0 {
            let Some(list_bytes) = msg.payload.get(1) else {
                return;
            };
            let Ok(raw) = serde_json::from_slice::<Vec<u8>>(list_bytes) else {
                return;
            };
            let new_list: Vec<CompressionMethod> = raw
                .into_iter()
                .filter_map(|b| CompressionMethod::from_flag(Flag(b)))
                .collect();

            let changed = {
                let mut current = self.0.compression.lock().unwrap();
                if *current != new_list {
                    *current = new_list.clone();
                    true
                } else {
                    false
                }
            };

            if changed {
                let intersection: Vec<u8> = new_list
                    .into_iter()
                    .filter(|m| LOCAL_SUPPORTED.contains(m))
                    .map(|m| m.flag().0)
                    .collect();
                let reply_payload = vec![
                    vec![Flag::COMPRESSION.0],
                    serde_json::to_vec(&intersection).unwrap_or_default(),
                ];
                let reply = InternalMessage::new(
                    Flag::RENEGOTIATE,
                    self.0.local_node_id.clone(),
                    reply_payload,
                    now_unix(),
                    LOCAL_SUPPORTED.to_vec(),
                );
                let _ = self.send(&reply);
            }
        } else if subflag == Flag::RESEND.0 {
            let last = self.0.last_sent.lock().unwrap().clone();
            if let Some(last) = last {
                let _ = self.send(&last);
            }
        }
    }
}
