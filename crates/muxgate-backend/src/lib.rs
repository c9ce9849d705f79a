//! Backend side of the gateway
//!
//! A [`BackendListener`] accepts physical links from frontends and runs one
//! [`BackendMux`] per link. Each multiplexer turns the client streams carried
//! by its link into [`VirtualConn`]s, which the listener hands out through
//! `accept()` exactly like an ordinary listener hands out sockets.
//!
//! ```ignore
//! use muxgate_backend::BackendListener;
//! use muxgate_transport::{MuxConfig, TcpLinkListener};
//!
//! let config = MuxConfig::default();
//! let server = TcpLinkListener::bind("0.0.0.0:7000", config.link.clone()).await?;
//! let listener = BackendListener::new(server, config);
//!
//! while let Some(conn) = listener.accept().await? {
//!     tokio::spawn(async move {
//!         while let Ok(Some(msg)) = conn.recv().await {
//!             let _ = conn.send(msg).await;
//!         }
//!     });
//! }
//! ```

pub mod conn;
pub mod listener;
pub mod mux;

pub use conn::VirtualConn;
pub use listener::BackendListener;
pub use mux::BackendMux;
pub use muxgate_proto::ClientId;
