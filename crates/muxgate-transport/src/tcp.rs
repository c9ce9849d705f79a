//! TCP listener producing links

use crate::{Acceptor, Link, LinkConfig, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accepts TCP connections and wraps each one in a [`Link`]
#[derive(Debug)]
pub struct TcpLinkListener {
    listener: TcpListener,
    config: LinkConfig,
    shutdown: CancellationToken,
}

impl TcpLinkListener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: LinkConfig) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Link listener bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            config,
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Acceptor for TcpLinkListener {
    type Conn = Link;

    async fn accept(&self) -> TransportResult<Option<Link>> {
        let (stream, remote_addr) = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            accepted = self.listener.accept() => accepted?,
        };

        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        debug!("Accepted link from {}", remote_addr);

        Ok(Some(Link::from_stream(
            stream,
            local_addr,
            remote_addr,
            &self.config,
        )))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}
