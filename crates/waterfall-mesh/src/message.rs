//! The user-facing `Message` wrapper and the exceptions-queue record type
//! (`SPEC_FULL.md` §3's "Inbound user queue" and §4.4's `status()`).

use waterfall_core::flags::Flag;
use waterfall_core::ids::{MessageId, NodeId};

/// A message surfaced to the application via `MeshSocket::recv`, or passed
/// to a registered handler. `payload` is the full wire payload, first
/// packet included — so for a `whisper/whisper` send of `b"hello"`,
/// `payload == [vec![Flag::WHISPER.0], b"hello".to_vec()]`.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: NodeId,
    pub id: MessageId,
    pub timestamp: i64,
    pub payload: Vec<Vec<u8>>,
}

impl Message {
    /// The user-level subtype tag carried as the first payload packet.
    pub fn subtype(&self) -> Flag {
        Flag(self.payload.first().and_then(|p| p.first()).copied().unwrap_or(0))
    }

    /// The payload packets after the subtype tag — what the application
    /// actually sent.
    pub fn body(&self) -> &[Vec<u8>] {
        if self.payload.is_empty() {
            &[]
        } else {
            &self.payload[1..]
        }
    }
}

/// A non-fatal fault recorded for observability, mirroring the Python
/// socket's `status` property (`SPEC_FULL.md` §4.4). Never causes the
/// daemon loop to stop; a single bad peer is disconnected and its fault is
/// appended here instead.
#[derive(Debug, Clone)]
pub struct ExceptionRecord {
    pub at: i64,
    pub message: String,
}
