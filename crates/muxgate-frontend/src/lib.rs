//! Frontend side of the gateway
//!
//! A [`Frontend`] accepts client links, asks a [`Router`] which backend should
//! serve each one, and hands the client to that backend's [`FrontendMux`].
//! Every multiplexer owns one physical link and carries any number of clients
//! over it.

pub mod frontend;
pub mod mux;

pub use frontend::Frontend;
pub use mux::FrontendMux;

use muxgate_proto::ProtoError;
use muxgate_transport::{Link, LinkId, TransportError};
use thiserror::Error;

/// Frontend errors
#[derive(Debug, Error)]
pub enum FrontendError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Client rejected by router")]
    Rejected,

    #[error("Unknown backend: {0}")]
    UnknownBackend(LinkId),

    #[error("Frontend stopped")]
    Stopped,
}

impl From<ProtoError> for FrontendError {
    fn from(e: ProtoError) -> Self {
        FrontendError::Transport(TransportError::ProtocolError(e.to_string()))
    }
}

pub type FrontendResult<T> = Result<T, FrontendError>;

/// Picks the backend link for a newly accepted client
///
/// `backends` lists the ids of every live backend link in ascending order.
/// Returning `None`, or an id that is not in the list, rejects the client.
pub trait Router: Send + Sync + 'static {
    fn route(&self, client: &Link, backends: &[LinkId]) -> Option<LinkId>;
}

impl<F> Router for F
where
    F: Fn(&Link, &[LinkId]) -> Option<LinkId> + Send + Sync + 'static,
{
    fn route(&self, client: &Link, backends: &[LinkId]) -> Option<LinkId> {
        self(client, backends)
    }
}
