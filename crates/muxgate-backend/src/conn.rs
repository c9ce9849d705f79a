//! Virtual connections

use crate::mux::MuxShared;
use async_trait::async_trait;
use bytes::Bytes;
use muxgate_proto::{ClientId, Command};
use muxgate_transport::{Connection, LinkId, TransportError, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One client, as seen by backend application code
///
/// Behaves like an ordinary connection: blocking `recv`, ordered `send`,
/// idempotent `close`. Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct VirtualConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    id: ClientId,
    remote_addr: SocketAddr,
    mux: Arc<MuxShared>,
    // Dropped on close, so `recv` sees the end of the queue
    inbound_tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for VirtualConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConn")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl VirtualConn {
    pub(crate) fn new(
        id: ClientId,
        remote_addr: SocketAddr,
        mux: Arc<MuxShared>,
        queue: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(queue.max(1));
        Self {
            inner: Arc::new(ConnInner {
                id,
                remote_addr,
                mux,
                inbound_tx: std::sync::Mutex::new(Some(inbound_tx)),
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Id of the physical link carrying this connection
    pub fn link_id(&self) -> LinkId {
        self.inner.mux.link.id()
    }

    /// Address of the client as observed by the frontend
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.mux.link.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Receive the next payload from the client
    ///
    /// After a local `close` this returns `None` straight away. When the
    /// client or the physical link went away, payloads that had already
    /// arrived are still returned first.
    pub async fn recv(&self) -> TransportResult<Option<Bytes>> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(None);
        }

        let mut rx = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Ok(None),
            rx = self.inner.inbound_rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Ok(None),
            msg = rx.recv() => Ok(msg),
        }
    }

    /// Send a payload to the client
    pub async fn send(&self, payload: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let frame = Command::Data {
            client_id: self.inner.id,
            payload,
        }
        .encode()
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.inner.mux.link.send(frame).await
    }

    /// Send one payload to many connections
    ///
    /// Connections are grouped by physical link and each link carries a single
    /// BROADCAST frame. Closed connections are skipped.
    pub async fn broadcast(conns: &[VirtualConn], payload: Bytes) -> TransportResult<()> {
        let mut by_link: HashMap<LinkId, (Arc<MuxShared>, Vec<ClientId>)> = HashMap::new();
        for conn in conns.iter().filter(|c| !c.is_closed()) {
            by_link
                .entry(conn.link_id())
                .or_insert_with(|| (conn.inner.mux.clone(), Vec::new()))
                .1
                .push(conn.id());
        }

        for (mux, client_ids) in by_link.into_values() {
            mux.broadcast(client_ids, payload.clone()).await?;
        }
        Ok(())
    }

    /// Close the connection and tell the frontend. Idempotent.
    pub fn close(&self) {
        self.close_with(true);
    }

    /// Single teardown path for every close trigger
    ///
    /// `notify` is false when the close was caused by the peer (DELETE) or
    /// by the physical link going away. Only a notifying close discards
    /// payloads that are queued but not yet received.
    pub(crate) fn close_with(&self, notify: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(client_id = self.inner.id, notify, "Closing virtual connection");
        self.inner
            .inbound_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if notify {
            self.inner.shutdown.cancel();
        }
        self.inner.mux.forget(self.inner.id);

        if notify {
            self.inner.mux.send_control(Command::Delete {
                client_id: self.inner.id,
            });
        }
    }

    /// Queue an inbound payload without waiting
    pub(crate) fn deliver(&self, payload: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        trace!(client_id = self.inner.id, len = payload.len(), "Delivering payload");
        let inbound = self.inner.inbound_tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = inbound.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Overflow,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[async_trait]
impl Connection for VirtualConn {
    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        VirtualConn::recv(self).await
    }

    async fn send(&self, msg: Bytes) -> TransportResult<()> {
        VirtualConn::send(self, msg).await
    }

    fn close(&self) {
        VirtualConn::close(self)
    }

    fn is_closed(&self) -> bool {
        VirtualConn::is_closed(self)
    }

    fn id(&self) -> u64 {
        VirtualConn::id(self)
    }

    fn local_addr(&self) -> SocketAddr {
        VirtualConn::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        VirtualConn::remote_addr(self)
    }
}
