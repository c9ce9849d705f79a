//! Frontend multiplexer: many client links over one physical link

use crate::frontend::FrontendShared;
use crate::FrontendResult;
use bytes::Bytes;
use muxgate_proto::{ClientId, Command, WaitId};
use muxgate_transport::{Link, LinkId, MuxConfig, TransportError, TransportResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Carries client links to one backend over a single physical link
#[derive(Clone)]
pub struct FrontendMux {
    shared: Arc<MuxShared>,
}

struct MuxShared {
    link: Link,
    state: Mutex<MuxState>,
    closed: AtomicBool,
    frontend: Weak<FrontendShared>,
    last_pong: Mutex<Instant>,
    // Stops the heartbeat task
    shutdown: CancellationToken,
}

struct MuxState {
    admitted: HashMap<ClientId, Link>,
    // Waiting for CONFIRM; keyed by our own wait id
    provisional: HashMap<WaitId, Link>,
    next_wait_id: WaitId,
}

impl std::fmt::Debug for FrontendMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendMux")
            .field("link", &self.shared.link)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FrontendMux {
    /// Run a multiplexer over an established link, outside of any [`Frontend`]
    ///
    /// [`Frontend`]: crate::Frontend
    pub fn new(link: Link, config: &MuxConfig) -> Self {
        Self::spawn(link, config, Weak::new())
    }

    pub(crate) fn spawn(link: Link, config: &MuxConfig, frontend: Weak<FrontendShared>) -> Self {
        let shared = Arc::new(MuxShared {
            link: link.clone(),
            state: Mutex::new(MuxState {
                admitted: HashMap::new(),
                provisional: HashMap::new(),
                next_wait_id: 1,
            }),
            closed: AtomicBool::new(false),
            frontend,
            last_pong: Mutex::new(Instant::now()),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&shared);
        link.add_close_callback(link.id(), move || {
            if let Some(shared) = weak.upgrade() {
                shared.close();
            }
        });

        tokio::spawn(shared.clone().receive_loop());

        if let Some(interval) = config.heartbeat_interval() {
            tokio::spawn(shared.clone().heartbeat(interval, config.heartbeat_timeout()));
        }

        Self { shared }
    }

    /// Hand a client to the backend
    ///
    /// The client waits in the provisional set until the backend confirms
    /// it; forwarding starts after that. Returns the wait id.
    pub async fn add_client(&self, client: Link) -> FrontendResult<WaitId> {
        let peer_addr = client.remote_addr().to_string();

        let wait_id = {
            let mut state = self.shared.state();
            if self.shared.is_closed() {
                None
            } else {
                let wait_id = state.next_wait_id;
                state.next_wait_id += 1;
                state.provisional.insert(wait_id, client.clone());
                Some(wait_id)
            }
        };

        let Some(wait_id) = wait_id else {
            client.close();
            return Err(TransportError::Closed.into());
        };

        debug!(link_id = self.id(), wait_id, %peer_addr, "Client waiting for confirmation");

        if let Err(e) = self
            .shared
            .send_command(Command::New { wait_id, peer_addr })
            .await
        {
            self.shared.state().provisional.remove(&wait_id);
            client.close();
            return Err(e.into());
        }

        Ok(wait_id)
    }

    /// Same as the id of the physical link
    pub fn id(&self) -> LinkId {
        self.shared.link.id()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.link.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn admitted_count(&self) -> usize {
        self.shared.state().admitted.len()
    }

    pub fn provisional_count(&self) -> usize {
        self.shared.state().provisional.len()
    }

    /// Close the link and every client it carries. Idempotent.
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
        debug!(link_id, "Frontend receive loop started");

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
        debug!(link_id, "Frontend receive loop ended");
    }

    fn dispatch(me: &Arc<Self>, cmd: Command) {
        trace!(link_id = me.link.id(), command = cmd.name(), "Processing command");

        match cmd {
            Command::Confirm { wait_id, client_id } => Self::handle_confirm(me, wait_id, client_id),
            Command::Data { client_id, payload } => {
                let client = me.state().admitted.get(&client_id).cloned();
                match client {
                    Some(client) => forward(client_id, &client, payload),
                    None => trace!(client_id, "Data for unknown client"),
                }
            }
            Command::Broadcast {
                client_ids,
                payload,
            } => {
                let targets: Vec<(ClientId, Link)> = {
                    let state = me.state();
                    client_ids
                        .iter()
                        .filter_map(|id| state.admitted.get(id).map(|c| (*id, c.clone())))
                        .collect()
                };
                for (client_id, client) in &targets {
                    forward(*client_id, client, payload.clone());
                }
            }
            Command::Delete { client_id } => {
                let client = me.state().admitted.remove(&client_id);
                if let Some(client) = client {
                    debug!(client_id, "Backend closed client");
                    client.close();
                }
            }
            Command::Pong { timestamp } => {
                *me.last_pong() = Instant::now();
                trace!(
                    link_id = me.link.id(),
                    rtt_ms = unix_millis().saturating_sub(timestamp),
                    "Heartbeat reply"
                );
            }
            other => debug!(command = other.name(), "Ignoring unexpected command"),
        }
    }

    fn handle_confirm(me: &Arc<Self>, wait_id: WaitId, client_id: ClientId) {
        let client = {
            let mut state = me.state();
            let client = state.provisional.remove(&wait_id);
            if let Some(client) = &client {
                state.admitted.insert(client_id, client.clone());
            }
            client
        };

        match client {
            Some(client) => {
                debug!(link_id = me.link.id(), wait_id, client_id, "Client admitted");
                tokio::spawn(me.clone().pump(client_id, client));
            }
            None => {
                // The client left while waiting; release the backend's entry
                debug!(wait_id, client_id, "Confirm for unknown wait id");
                me.send_control(Command::Delete { client_id });
            }
        }
    }

    /// Forward everything the client sends until it goes away
    async fn pump(self: Arc<Self>, client_id: ClientId, client: Link) {
        match self.send_command(Command::Accept { client_id }).await {
            Ok(()) => loop {
                let payload = match client.recv().await {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(client_id, "Client read failed: {}", e);
                        break;
                    }
                };

                if let Err(e) = self.send_command(Command::Data { client_id, payload }).await {
                    debug!(client_id, "Forwarding to backend failed: {}", e);
                    break;
                }
            },
            Err(e) => debug!(client_id, "Accept not sent: {}", e),
        }

        client.close();

        // Absent when the backend or a link close already took the entry
        let owned = self.state().admitted.remove(&client_id).is_some();
        if owned {
            debug!(client_id, "Client disconnected");
            if let Err(e) = self.send_command(Command::Delete { client_id }).await {
                debug!(client_id, "Delete not sent: {}", e);
            }
        }
    }

    async fn heartbeat(self: Arc<Self>, interval: Duration, timeout: Duration) {
        let link_id = self.link.id();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let silent = self.last_pong().elapsed();
            if silent > timeout {
                warn!(link_id, "No heartbeat reply for {:?}, closing link", silent);
                self.close();
                break;
            }

            self.send_control(Command::Ping {
                timestamp: unix_millis(),
            });
        }
    }

    fn last_pong(&self) -> MutexGuard<'_, Instant> {
        self.last_pong.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_command(&self, cmd: Command) -> TransportResult<()> {
        let frame = cmd
            .encode()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.link.send(frame).await
    }

    /// Send a control frame without blocking the receive loop
    fn send_control(&self, cmd: Command) {
        let sent = cmd
            .encode()
            .map_err(|e| TransportError::ProtocolError(e.to_string()))
            .and_then(|frame| self.link.send_detached(frame));

        if let Err(e) = sent {
            debug!(link_id = self.link.id(), "{} not sent: {}", cmd.name(), e);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let link_id = self.link.id();
        info!(link_id, "Closing frontend multiplexer");
        self.shutdown.cancel();
        self.link.close();

        let clients: Vec<Link> = {
            let mut state = self.state();
            let admitted = std::mem::take(&mut state.admitted);
            let provisional = std::mem::take(&mut state.provisional);
            admitted.into_values().chain(provisional.into_values()).collect()
        };
        for client in clients {
            client.close();
        }

        if let Some(frontend) = self.frontend.upgrade() {
            frontend.unregister(link_id);
        }
    }
}

/// Queue a payload for a client without waiting; a client that cannot keep
/// up is severed and its pump reports the disconnect upstream
fn forward(client_id: ClientId, client: &Link, payload: Bytes) {
    match client.async_send(payload) {
        Ok(()) => {}
        Err(TransportError::Overflow) => {
            warn!(client_id, "Client send queue overflow, disconnecting client");
            client.close();
        }
        Err(e) => {
            debug!(client_id, "Client send failed: {}", e);
            client.close();
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
