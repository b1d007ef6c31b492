//! The transport capability the mesh code dials and listens through.
//!
//! `waterfall-mesh` never touches `TcpListener`/`TcpStream` directly outside
//! this module — every other module sees only [`Stream`], [`Listener`], and
//! [`StreamFactory`]. Per `SPEC_FULL.md` §9 ("polymorphic encryption"), this
//! is where a future secure-stream implementation would plug in; today only
//! [`PlaintextTransport`] exists, matching the spec's explicit non-goal of
//! implementing transport encryption.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// A bidirectional byte stream to a single peer.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A bound listening endpoint capable of accepting inbound streams.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> std::io::Result<(Box<dyn Stream>, SocketAddr)>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

/// The capability a `MeshSocket` uses to open and accept connections,
/// blind to whether the concrete transport is plaintext or secure.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn listen(&self, addr: &str, port: u16) -> std::io::Result<Box<dyn Listener>>;
    async fn dial(&self, addr: &str, port: u16) -> std::io::Result<Box<dyn Stream>>;
}

/// The only `StreamFactory` this crate implements: a plain, unencrypted
/// TCP socket. Encryption is out of scope (`SPEC_FULL.md` §1) — a secure
/// variant would implement the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextTransport;

struct TcpListenerHandle(TcpListener);

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> std::io::Result<(Box<dyn Stream>, SocketAddr)> {
        let (stream, addr) = self.0.accept().await?;
        Ok((Box::new(stream), addr))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.0.local_addr()
    }
}

#[async_trait]
impl StreamFactory for PlaintextTransport {
    async fn listen(&self, addr: &str, port: u16) -> std::io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind((addr, port)).await?;
        Ok(Box::new(TcpListenerHandle(listener)))
    }

    async fn dial(&self, addr: &str, port: u16) -> std::io::Result<Box<dyn Stream>> {
        let stream = TcpStream::connect((addr, port)).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}
