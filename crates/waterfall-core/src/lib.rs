//! # waterfall-core
//!
//! Shared library for the waterfall mesh socket. Contains the wire codec
//! (framing, message identity, protocol compatibility), the flag-byte
//! registry, base-58 identifiers, node configuration, and the error types
//! both the codec and the configuration layer can raise.
//!
//! This crate is used by the daemon/demonstration binary in
//! `waterfall-mesh`, which adds the transport, peer state machine, and
//! mesh socket on top of it.

pub mod config;
pub mod error;
pub mod flags;
pub mod ids;
pub mod protocol;
