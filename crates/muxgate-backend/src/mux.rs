//! Backend multiplexer: one physical link, many virtual connections

use crate::conn::VirtualConn;
use crate::listener::ListenerShared;
use bytes::Bytes;
use muxgate_proto::{ClientId, Command, WaitId};
use muxgate_transport::{Link, LinkId, MuxConfig, TransportError, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, trace, warn};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a client id. Ids are never reused within a process.
pub fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Demultiplexes one physical link into virtual connections
#[derive(Clone)]
pub struct BackendMux {
    shared: Arc<MuxShared>,
}

pub(crate) struct MuxShared {
    pub(crate) link: Link,
    conn_queue: usize,
    state: Mutex<MuxState>,
    closed: AtomicBool,
    listener: Weak<ListenerShared>,
}

#[derive(Default)]
struct MuxState {
    admitted: HashMap<ClientId, VirtualConn>,
    // Waiting for ACCEPT; keyed by the freshly allocated client id
    provisional: HashMap<ClientId, VirtualConn>,
}

impl std::fmt::Debug for BackendMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendMux")
            .field("link", &self.shared.link)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BackendMux {
    /// Take ownership of a link and start its receive loop
    pub(crate) fn spawn(link: Link, config: &MuxConfig, listener: Weak<ListenerShared>) -> Self {
        let shared = Arc::new(MuxShared {
            link: link.clone(),
            conn_queue: config.conn_queue,
            state: Mutex::new(MuxState::default()),
            closed: AtomicBool::new(false),
            listener,
        });

        let weak = Arc::downgrade(&shared);
        link.add_close_callback(link.id(), move || {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        });

        tokio::spawn(shared.clone().receive_loop());

        Self { shared }
    }

    /// Same as the id of the physical link
    pub fn id(&self) -> LinkId {
        self.shared.link.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.link.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn admitted_count(&self) -> usize {
        self.shared.state().admitted.len()
    }

    pub fn provisional_count(&self) -> usize {
        self.shared.state().provisional.len()
    }

    /// Send one payload to several clients of this link in a single frame
    pub async fn broadcast(&self, client_ids: Vec<ClientId>, payload: Bytes) -> TransportResult<()> {
        self.shared.broadcast(client_ids, payload).await
    }

    /// Close the link and every connection it carries. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl MuxShared {
    fn state(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn receive_loop(self: Arc<Self>) {
        let link_id = self.link.id();
        debug!(link_id, "Backend receive loop started");

        loop {
            let msg = match self.link.recv().await {
                Ok(Some(msg)) => msg,
                Ok(None) => break,
                Err(e) => {
                    warn!(link_id, "Backend link failed: {}", e);
                    break;
                }
            };

            match Command::decode(msg) {
                Ok(cmd) => Self::dispatch(&self, cmd),
                Err(e) => debug!(link_id, "Ignoring frame: {}", e),
            }
        }

        self.close();
        debug!(link_id, "Backend receive loop ended");
    }

    fn dispatch(me: &Arc<Self>, cmd: Command) {
        trace!(link_id = me.link.id(), command = cmd.name(), "Processing command");

        match cmd {
            Command::New { wait_id, peer_addr } => Self::handle_new(me, wait_id, &peer_addr),
            Command::Accept { client_id } => me.handle_accept(client_id),
            Command::Data { client_id, payload } => {
                let conn = me.state().admitted.get(&client_id).cloned();
                match conn {
                    Some(conn) => me.deliver(&conn, payload),
                    None => trace!(client_id, "Data for unknown client"),
                }
            }
            Command::Broadcast {
                client_ids,
                payload,
            } => {
                let targets: Vec<VirtualConn> = {
                    let state = me.state();
                    client_ids
                        .iter()
                        .filter_map(|id| state.admitted.get(id).cloned())
                        .collect()
                };
                for conn in &targets {
                    me.deliver(conn, payload.clone());
                }
            }
            Command::Delete { client_id } => {
                let conn = {
                    let state = me.state();
                    state
                        .admitted
                        .get(&client_id)
                        .or_else(|| state.provisional.get(&client_id))
                        .cloned()
                };
                if let Some(conn) = conn {
                    conn.close_with(false);
                }
            }
            Command::Ping { timestamp } => me.reply_pong(timestamp),
            other => debug!(command = other.name(), "Ignoring unexpected command"),
        }
    }

    fn handle_new(me: &Arc<Self>, wait_id: WaitId, peer_addr: &str) {
        let remote_addr = peer_addr.parse().unwrap_or_else(|_| {
            debug!(peer_addr, "Unparsable peer address, using link address");
            me.link.remote_addr()
        });

        let client_id = next_client_id();
        let conn = VirtualConn::new(client_id, remote_addr, me.clone(), me.conn_queue);

        {
            let mut state = me.state();
            if me.is_closed() {
                return;
            }
            state.provisional.insert(client_id, conn);
        }

        debug!(link_id = me.link.id(), wait_id, client_id, "New virtual connection");
        me.send_control(Command::Confirm { wait_id, client_id });
    }

    fn handle_accept(&self, client_id: ClientId) {
        let conn = {
            let mut state = self.state();
            match state.provisional.remove(&client_id) {
                Some(conn) => {
                    state.admitted.insert(client_id, conn.clone());
                    conn
                }
                None => {
                    debug!(client_id, "Accept for unknown client");
                    return;
                }
            }
        };

        let published = match self.listener.upgrade() {
            Some(listener) => listener.publish(conn.clone()),
            None => false,
        };
        if !published {
            warn!(client_id, "Ready queue unavailable, dropping connection");
            conn.close_with(true);
        }
    }

    fn deliver(&self, conn: &VirtualConn, payload: Bytes) {
        match conn.deliver(payload) {
            Ok(()) => {}
            Err(TransportError::Overflow) => {
                warn!(client_id = conn.id(), "Inbound queue overflow, disconnecting client");
                conn.close_with(true);
            }
            Err(_) => {}
        }
    }

    pub(crate) async fn broadcast(
        &self,
        client_ids: Vec<ClientId>,
        payload: Bytes,
    ) -> TransportResult<()> {
        if client_ids.is_empty() {
            return Ok(());
        }

        trace!(link_id = self.link.id(), targets = client_ids.len(), "Broadcasting");
        let frame = Command::Broadcast {
            client_ids,
            payload,
        }
        .encode()
        .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.link.send(frame).await
    }

    /// Send a control frame without blocking the receive loop
    pub(crate) fn send_control(&self, cmd: Command) {
        let sent = cmd
            .encode()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))
            .and_then(|frame| self.link.send_detached(frame));

        if let Err(e) = sent {
            debug!(link_id = self.link.id(), "{} not sent: {}", cmd.name(), e);
        }
    }

    /// A PONG is dropped rather than queued when the link is backed up
    fn reply_pong(&self, timestamp: u64) {
        let sent = Command::Pong { timestamp }
            .encode()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))
            .and_then(|frame| self.link.async_send(frame));

        if let Err(e) = sent {
            trace!(link_id = self.link.id(), "PONG dropped: {}", e);
        }
    }

    /// Drop a connection from both maps
    pub(crate) fn forget(&self, client_id: ClientId) {
        let mut state = self.state();
        state.admitted.remove(&client_id);
        state.provisional.remove(&client_id);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let link_id = self.link.id();
        debug!(link_id, "Closing backend multiplexer");
        self.link.close();

        let conns: Vec<VirtualConn> = {
            let mut state = self.state();
            let admitted = std::mem::take(&mut state.admitted);
            let provisional = std::mem::take(&mut state.provisional);
            admitted.into_values().chain(provisional.into_values()).collect()
        };
        for conn in conns {
            conn.close_with(false);
        }

        if let Some(listener) = self.listener.upgrade() {
            listener.unregister(link_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_increase() {
        let a = next_client_id();
        let b = next_client_id();
        assert!(b > a);
    }
}
