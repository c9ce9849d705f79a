//! Backend listener: accept virtual connections as if they were sockets

use crate::conn::VirtualConn;
use crate::mux::BackendMux;
use async_trait::async_trait;
use muxgate_transport::{Acceptor, Link, LinkId, MuxConfig, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Aggregates every backend multiplexer behind one `accept()`
///
/// Cloning yields another handle to the same listener.
#[derive(Clone)]
pub struct BackendListener {
    shared: Arc<ListenerShared>,
}

pub(crate) struct ListenerShared {
    server: Arc<dyn Acceptor<Conn = Link>>,
    muxes: Mutex<HashMap<LinkId, BackendMux>>,
    ready_tx: mpsc::Sender<VirtualConn>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<VirtualConn>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl BackendListener {
    /// Wrap a physical-link server and start accepting links from it
    pub fn new<A>(server: A, config: MuxConfig) -> Self
    where
        A: Acceptor<Conn = Link>,
    {
        let (ready_tx, ready_rx) = mpsc::channel(config.ready_backlog.max(1));
        let shared = Arc::new(ListenerShared {
            server: Arc::new(server),
            muxes: Mutex::new(HashMap::new()),
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(shared.clone(), config));

        Self { shared }
    }

    /// Wait for the next admitted virtual connection
    ///
    /// Returns `None` once the listener is closed.
    pub async fn accept(&self) -> TransportResult<Option<VirtualConn>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut ready = tokio::select! {
            _ = self.shared.shutdown.cancelled() => return Ok(None),
            ready = self.shared.ready_rx.lock() => ready,
        };

        tokio::select! {
            biased;
            _ = self.shared.shutdown.cancelled() => Ok(None),
            conn = ready.recv() => Ok(conn),
        }
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.shared.server.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting links and close every multiplexer. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Number of live physical links
    pub fn mux_count(&self) -> usize {
        self.shared.muxes().len()
    }

    /// Virtual connections across every link, admitted or still pending
    pub fn connection_count(&self) -> usize {
        let muxes: Vec<BackendMux> = self.shared.muxes().values().cloned().collect();
        muxes
            .iter()
            .map(|mux| mux.admitted_count() + mux.provisional_count())
            .sum()
    }

    pub fn mux(&self, id: LinkId) -> Option<BackendMux> {
        self.shared.muxes().get(&id).cloned()
    }
}

impl ListenerShared {
    fn muxes(&self) -> MutexGuard<'_, HashMap<LinkId, BackendMux>> {
        self.muxes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register(&self, mux: BackendMux) {
        {
            let mut muxes = self.muxes();
            if !self.is_closed() {
                muxes.insert(mux.id(), mux.clone());
            }
        }

        // The link may have died (and unregistered) before the insert above
        if self.is_closed() || mux.is_closed() {
            self.unregister(mux.id());
            mux.close();
        }
    }

    pub(crate) fn unregister(&self, id: LinkId) {
        if self.muxes().remove(&id).is_some() {
            debug!(link_id = id, "Backend multiplexer unregistered");
        }
    }

    /// Hand an admitted connection to `accept()` without waiting
    pub(crate) fn publish(&self, conn: VirtualConn) -> bool {
        if self.is_closed() {
            return false;
        }
        self.ready_tx.try_send(conn).is_ok()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Closing backend listener");
        self.shutdown.cancel();
        self.server.close();

        let muxes: Vec<BackendMux> = self.muxes().drain().map(|(_, mux)| mux).collect();
        for mux in muxes {
            mux.close();
        }

        // Release connections that were admitted but never accepted
        if let Ok(mut ready) = self.ready_rx.try_lock() {
            while let Ok(conn) = ready.try_recv() {
                conn.close_with(false);
            }
        }
    }
}

async fn accept_loop(shared: Arc<ListenerShared>, config: MuxConfig) {
    debug!("Backend accept loop started");

    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = shared.server.accept() => accepted,
        };

        match accepted {
            Ok(Some(link)) => {
                info!(link_id = link.id(), "Frontend link from {}", link.remote_addr());
                let mux = BackendMux::spawn(link, &config, Arc::downgrade(&shared));
                shared.register(mux);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to accept link: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Backend accept loop ended");
}

#[async_trait]
impl Acceptor for BackendListener {
    type Conn = VirtualConn;

    async fn accept(&self) -> TransportResult<Option<VirtualConn>> {
        BackendListener::accept(self).await
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        BackendListener::local_addr(self)
    }

    fn close(&self) {
        BackendListener::close(self)
    }
}
