//! # waterfall-mesh
//!
//! The runtime half of the mesh: transport, per-peer connection tasks, the
//! daemon event loop, and the [`MeshSocket`] public API built on top of
//! `waterfall-core`'s wire codec and identifiers.

pub mod compression;
pub mod daemon;
pub mod error;
pub mod message;
pub mod peer;
pub mod socket;
pub mod transport;

pub use error::MeshError;
pub use message::{ExceptionRecord, Message};
pub use socket::{MeshSocket, MessageHandler};
pub use transport::{Listener, PlaintextTransport, Stream, StreamFactory};
