//! Client-facing gateway: accept clients and route them to backends

use crate::mux::FrontendMux;
use crate::{FrontendError, FrontendResult, Router};
use muxgate_transport::{Acceptor, Link, LinkId, MuxConfig, TransportError, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::ToSocketAddrs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts client links and spreads them over backend links
///
/// Cloning yields another handle to the same frontend.
#[derive(Clone)]
pub struct Frontend {
    shared: Arc<FrontendShared>,
}

pub(crate) struct FrontendShared {
    listener: Arc<dyn Acceptor<Conn = Link>>,
    router: Arc<dyn Router>,
    config: MuxConfig,
    backends: Mutex<HashMap<LinkId, FrontendMux>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Frontend {
    /// Start accepting clients from `listener`
    pub fn new<A, R>(listener: A, router: R, config: MuxConfig) -> Self
    where
        A: Acceptor<Conn = Link>,
        R: Router,
    {
        let shared = Arc::new(FrontendShared {
            listener: Arc::new(listener),
            router: Arc::new(router),
            config,
            backends: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(shared.clone()));

        Self { shared }
    }

    /// Dial a backend and start multiplexing clients over the new link
    pub async fn add_backend<A: ToSocketAddrs>(&self, addr: A) -> FrontendResult<LinkId> {
        if self.is_stopped() {
            return Err(FrontendError::Stopped);
        }

        let link = Link::connect(addr, &self.shared.config.link).await?;
        info!(link_id = link.id(), "Connected to backend {}", link.remote_addr());
        self.attach_backend(link)
    }

    /// Adopt an already established backend link
    pub fn attach_backend(&self, link: Link) -> FrontendResult<LinkId> {
        let mux = FrontendMux::spawn(link, &self.shared.config, Arc::downgrade(&self.shared));
        self.shared.register(mux)
    }

    /// Stop accepting clients and close every backend link. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Ids of the live backend links, ascending
    pub fn backends(&self) -> Vec<LinkId> {
        self.shared.backend_ids()
    }

    pub fn backend(&self, id: LinkId) -> Option<FrontendMux> {
        self.shared.backends().get(&id).cloned()
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.shared.listener.local_addr()
    }
}

impl FrontendShared {
    fn backends(&self) -> MutexGuard<'_, HashMap<LinkId, FrontendMux>> {
        self.backends.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn backend_ids(&self) -> Vec<LinkId> {
        let mut ids: Vec<LinkId> = self.backends().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register(&self, mux: FrontendMux) -> FrontendResult<LinkId> {
        let id = mux.id();
        {
            let mut backends = self.backends();
            if !self.is_stopped() {
                backends.insert(id, mux.clone());
            }
        }

        if self.is_stopped() {
            self.unregister(id);
            mux.close();
            return Err(FrontendError::Stopped);
        }
        // The link may have died (and unregistered) before the insert above
        if mux.is_closed() {
            self.unregister(id);
            return Err(TransportError::Closed.into());
        }

        debug!(link_id = id, "Backend multiplexer registered");
        Ok(id)
    }

    pub(crate) fn unregister(&self, id: LinkId) {
        if self.backends().remove(&id).is_some() {
            debug!(link_id = id, "Backend multiplexer unregistered");
        }
    }

    fn route(&self, client: &Link) -> FrontendResult<FrontendMux> {
        let ids = self.backend_ids();
        let id = self
            .router
            .route(client, &ids)
            .ok_or(FrontendError::Rejected)?;
        self.backends()
            .get(&id)
            .cloned()
            .ok_or(FrontendError::UnknownBackend(id))
    }

    async fn admit(self: Arc<Self>, client: Link) {
        let client_link = client.id();

        let mux = match self.route(&client) {
            Ok(mux) => mux,
            Err(e) => {
                warn!(link_id = client_link, "Dropping client {}: {}", client.remote_addr(), e);
                client.close();
                return;
            }
        };

        if let Err(e) = mux.add_client(client).await {
            warn!(link_id = client_link, backend = mux.id(), "Failed to hand over client: {}", e);
        }
    }

    fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Stopping frontend");
        self.shutdown.cancel();
        self.listener.close();

        let muxes: Vec<FrontendMux> = self.backends().drain().map(|(_, mux)| mux).collect();
        for mux in muxes {
            mux.close();
        }
    }
}

async fn accept_loop(shared: Arc<FrontendShared>) {
    debug!("Frontend accept loop started");

    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = shared.listener.accept() => accepted,
        };

        match accepted {
            Ok(Some(client)) => {
                debug!(link_id = client.id(), "Client from {}", client.remote_addr());
                tokio::spawn(shared.clone().admit(client));
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to accept client: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    debug!("Frontend accept loop ended");
}
