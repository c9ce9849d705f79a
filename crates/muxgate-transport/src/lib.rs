//! Transport layer for gateway links
//!
//! This crate provides the ordered message transport that carries gateway
//! frames between processes, plus the two traits that let server code stay
//! agnostic of whether it talks to a real socket or to a multiplexed
//! virtual connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Application / gateway code                  │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │  Connection (recv / send / close / addresses)            │
//! │  Acceptor   (accept / local_addr / close)                │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌────────────────────────────┬────────────────────────────┐
//! │ Link / TcpLinkListener     │ VirtualConn /              │
//! │ (this crate)               │ BackendListener            │
//! │                            │ (muxgate-backend)          │
//! └────────────────────────────┴────────────────────────────┘
//! ```

pub mod config;
pub mod link;
pub mod tcp;

pub use config::{LinkConfig, MuxConfig};
pub use link::{CloseCallback, Link, LinkId};
pub use tcp::TcpLinkListener;

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Send queue overflow")]
    Overflow,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A message-oriented, bidirectional connection
///
/// Implemented by physical links and by virtual connections, so server code
/// written against this trait runs unchanged over either.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Receive the next message
    ///
    /// Returns `None` once the connection is closed, and keeps returning
    /// `None` on every later call.
    async fn recv(&self) -> TransportResult<Option<Bytes>>;

    /// Send one message
    async fn send(&self, msg: Bytes) -> TransportResult<()>;

    /// Close the connection. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Identifier, unique among connections of the same kind in this process
    fn id(&self) -> u64;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;
}

/// Server side: yields connections
#[async_trait]
pub trait Acceptor: Send + Sync + 'static {
    /// The connection type accepted by this acceptor
    type Conn: Connection;

    /// Accept the next connection
    ///
    /// Returns `None` once the acceptor has been closed.
    async fn accept(&self) -> TransportResult<Option<Self::Conn>>;

    /// Get the local address this acceptor is bound to
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop accepting. Idempotent.
    fn close(&self);
}
