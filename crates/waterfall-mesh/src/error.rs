//! Errors raised by the transport, peer, and mesh-socket layers.
//!
//! Mirrors the split in the teacher crate between protocol-level errors
//! (here, re-exported from `waterfall_core::error::WireError`) and
//! transport/connection-level errors layered on top.

use thiserror::Error;
use waterfall_core::error::WireError;

/// Failures that can occur anywhere in the mesh socket's lifetime.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("peer rejected handshake: protocol identifier mismatch")]
    HandshakeRejected,

    #[error("peer {0} timed out with no activity")]
    StaleConnection(String),

    #[error("socket is already closed")]
    AlreadyClosed,
}
