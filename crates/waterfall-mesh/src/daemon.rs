//! The daemon: the accept loop and the event type peer tasks use to hand
//! decoded frames (and disconnect notices) back to the mesh socket's
//! single dispatcher (`SPEC_FULL.md` §4.3).
//!
//! The reference design polls every peer from one thread; this crate
//! substitutes one tokio task per peer (`peer::PeerHandle::spawn`) feeding
//! a single dispatcher loop (`socket::Inner::run_dispatcher`), which is
//! the only place routing-table/seen-set/request-table/queue mutations
//! happen — preserving the "single supervisory loop drives shared state"
//! property even though peer I/O itself is concurrent.

use crate::transport::Listener;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use waterfall_core::protocol::InternalMessage;

/// An event a peer task (or the accept loop) hands to the dispatcher.
pub enum DaemonEvent {
    /// A fully decoded, non-`renegotiate` frame arrived from `conn_id`.
    Frame { conn_id: u64, msg: InternalMessage },
    /// `conn_id`'s read or write loop ended. `fault` is `Some(reason)` for
    /// faults `SPEC_FULL.md` §7 records to the exceptions queue (stale
    /// timeouts, decode errors, write failures, and other I/O errors) and
    /// `None` for the quiet cases it calls out explicitly (a clean EOF, or
    /// a peer-reset/bad-descriptor socket error).
    Disconnected {
        conn_id: u64,
        fault: Option<String>,
    },
}

/// Runs forever, accepting inbound connections and registering each as an
/// awaiting (incoming) peer. Accept errors are logged and treated as
/// transient — a single failed accept never ends the loop.
pub(crate) async fn run_accept_loop(inner: Arc<crate::socket::Inner>, listener: Box<dyn Listener>) {
    info!("accept loop started");
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer = %peer_addr, "accepted inbound connection");
                inner.clone().accept_peer(stream).await;
            }
            Err(e) => {
                error!(error = %e, "failed to accept inbound connection");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Runs forever, draining daemon events one at a time so every mutation of
/// shared mesh-socket state is serialized through this single task.
pub(crate) async fn run_dispatcher(
    inner: Arc<crate::socket::Inner>,
    mut event_rx: mpsc::UnboundedReceiver<DaemonEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        inner.dispatch(event).await;
    }
}
