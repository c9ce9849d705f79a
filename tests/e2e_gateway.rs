//! End-to-end gateway tests over real TCP
//!
//! Topology for every test:
//! client links -> Frontend -> physical links -> BackendListener -> app code

use bytes::Bytes;
use muxgate_backend::{BackendListener, VirtualConn};
use muxgate_frontend::{Frontend, Router};
use muxgate_transport::{Acceptor, Link, LinkConfig, LinkId, MuxConfig, TcpLinkListener};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_test_writer()
        .try_init();
}

fn round_robin() -> impl Router {
    let next = AtomicUsize::new(0);
    move |_: &Link, backends: &[LinkId]| {
        if backends.is_empty() {
            return None;
        }
        Some(backends[next.fetch_add(1, Ordering::Relaxed) % backends.len()])
    }
}

struct Gateway {
    backend: BackendListener,
    frontend: Frontend,
    client_addr: SocketAddr,
    links: Vec<LinkId>,
}

impl Gateway {
    async fn start<R: Router>(backend_links: usize, router: R, config: MuxConfig) -> Self {
        init_tracing();

        let server = TcpLinkListener::bind("127.0.0.1:0", config.link.clone())
            .await
            .unwrap();
        let backend = BackendListener::new(server, config.clone());
        let backend_addr = backend.local_addr().unwrap();

        let clients = TcpLinkListener::bind("127.0.0.1:0", config.link.clone())
            .await
            .unwrap();
        let client_addr = clients.local_addr().unwrap();
        let frontend = Frontend::new(clients, router, config);

        let mut links = Vec::new();
        for _ in 0..backend_links {
            links.push(frontend.add_backend(backend_addr).await.unwrap());
        }
        assert!(eventually(|| backend.mux_count() == backend_links).await);
        info!("✓ Gateway up: {} backend link(s), clients on {}", backend_links, client_addr);

        Self {
            backend,
            frontend,
            client_addr,
            links,
        }
    }

    /// Echo every accepted connection until the listener closes
    fn serve_echo(&self) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            while let Ok(Some(conn)) = backend.accept().await {
                tokio::spawn(echo(conn));
            }
        });
    }

    async fn connect(&self) -> Link {
        Link::connect(self.client_addr, &LinkConfig::default())
            .await
            .unwrap()
    }

    async fn accept(&self) -> VirtualConn {
        tokio::time::timeout(WAIT, self.backend.accept())
            .await
            .expect("timed out waiting for a virtual connection")
            .unwrap()
            .expect("backend listener closed")
    }

    fn frontend_admitted(&self) -> usize {
        self.links
            .iter()
            .filter_map(|id| self.frontend.backend(*id))
            .map(|mux| mux.admitted_count() + mux.provisional_count())
            .sum()
    }
}

async fn echo(conn: VirtualConn) {
    while let Ok(Some(msg)) = conn.recv().await {
        if conn.send(msg).await.is_err() {
            break;
        }
    }
    conn.close();
}

async fn recv(link: &Link) -> Option<Bytes> {
    tokio::time::timeout(WAIT, link.recv())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn random_payloads(count: usize) -> Vec<Bytes> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut buf = vec![0u8; rng.gen_range(1..=1024)];
            rng.fill(&mut buf[..]);
            Bytes::from(buf)
        })
        .collect()
}

// ============================================================================
// END-TO-END TESTS
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn e2e_many_clients_echo_in_order() {
    const CLIENTS: usize = 20;
    const PAYLOADS: usize = 500;

    let gw = Gateway::start(2, round_robin(), MuxConfig::default()).await;
    gw.serve_echo();

    let mut tasks = Vec::new();
    for n in 0..CLIENTS {
        let client = gw.connect().await;
        tasks.push(tokio::spawn(async move {
            let payloads = random_payloads(PAYLOADS);

            let sender = {
                let client = client.clone();
                let payloads = payloads.clone();
                async move {
                    for payload in payloads {
                        client.send(payload).await.unwrap();
                    }
                }
            };
            let receiver = async {
                for (i, expected) in payloads.iter().enumerate() {
                    let got = recv(&client).await.expect("client closed early");
                    assert_eq!(&got, expected, "client {} payload {} out of order", n, i);
                }
            };
            tokio::join!(sender, receiver);

            client.close();
        }));
    }

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }
    info!("✓ {} clients x {} payloads echoed in order", CLIENTS, PAYLOADS);

    // Every client left, so nothing may linger on either side
    assert!(eventually(|| gw.frontend_admitted() == 0).await);
    assert!(eventually(|| gw.backend.connection_count() == 0).await);

    gw.frontend.stop();
    gw.backend.close();

    assert!(gw.frontend.backends().is_empty());
    assert!(eventually(|| gw.backend.mux_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_client_close_releases_backend_connection() {
    let gw = Gateway::start(1, round_robin(), MuxConfig::default()).await;

    let client = gw.connect().await;
    let conn = gw.accept().await;
    assert_eq!(conn.remote_addr(), client.local_addr());

    client.send(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"hello")));

    client.close();

    let eof = tokio::time::timeout(WAIT, conn.recv()).await.unwrap().unwrap();
    assert!(eof.is_none());
    assert!(eventually(|| gw.frontend_admitted() == 0).await);
    assert!(eventually(|| gw.backend.connection_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_send_then_close_is_not_lost() {
    let gw = Gateway::start(1, round_robin(), MuxConfig::default()).await;

    let client = gw.connect().await;
    let conn = gw.accept().await;

    client.send(Bytes::from_static(b"request")).await.unwrap();
    client.send(Bytes::from_static(b"and more")).await.unwrap();
    client.close();

    assert!(eventually(|| conn.is_closed()).await);
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"request")));
    assert_eq!(conn.recv().await.unwrap(), Some(Bytes::from_static(b"and more")));
    assert_eq!(conn.recv().await.unwrap(), None);
    assert!(eventually(|| gw.backend.connection_count() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_backend_close_reaches_client() {
    let gw = Gateway::start(1, round_robin(), MuxConfig::default()).await;

    let client = gw.connect().await;
    let conn = gw.accept().await;

    conn.send(Bytes::from_static(b"bye")).await.unwrap();
    conn.close();

    assert_eq!(recv(&client).await, Some(Bytes::from_static(b"bye")));
    assert_eq!(recv(&client).await, None);
    assert!(eventually(|| gw.frontend_admitted() == 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_frontend_stop_cascades() {
    let gw = Gateway::start(2, round_robin(), MuxConfig::default()).await;
    gw.serve_echo();

    let clients = vec![gw.connect().await, gw.connect().await, gw.connect().await];
    for client in &clients {
        client.send(Bytes::from_static(b"up?")).await.unwrap();
        assert_eq!(recv(client).await, Some(Bytes::from_static(b"up?")));
    }

    gw.frontend.stop();

    for client in &clients {
        assert_eq!(recv(client).await, None);
    }
    assert!(gw.frontend.backends().is_empty());
    assert!(eventually(|| gw.backend.mux_count() == 0).await);
    assert_eq!(gw.backend.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_backend_listener_close_cascades() {
    let gw = Gateway::start(2, round_robin(), MuxConfig::default()).await;
    gw.serve_echo();

    let clients = vec![gw.connect().await, gw.connect().await];
    for client in &clients {
        client.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(recv(client).await, Some(Bytes::from_static(b"ping")));
    }

    gw.backend.close();

    for client in &clients {
        assert_eq!(recv(client).await, None);
    }
    assert!(eventually(|| gw.frontend.backends().is_empty()).await);
    assert_eq!(gw.backend.mux_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_broadcast_reaches_every_target() {
    let gw = Gateway::start(2, round_robin(), MuxConfig::default()).await;

    let mut clients = Vec::new();
    let mut conns = Vec::new();
    for _ in 0..4 {
        clients.push(gw.connect().await);
        conns.push(gw.accept().await);
    }
    // Spread over both physical links
    assert!(conns.iter().any(|c| c.link_id() != conns[0].link_id()));

    let bystander = gw.connect().await;
    let bystander_conn = gw.accept().await;

    VirtualConn::broadcast(&conns, Bytes::from_static(b"to everyone"))
        .await
        .unwrap();
    bystander_conn
        .send(Bytes::from_static(b"just you"))
        .await
        .unwrap();

    for client in &clients {
        assert_eq!(recv(client).await, Some(Bytes::from_static(b"to everyone")));
    }
    assert_eq!(recv(&bystander).await, Some(Bytes::from_static(b"just you")));
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_slow_consumer_is_isolated() {
    let config = MuxConfig {
        conn_queue: 4,
        ..MuxConfig::default()
    };
    let gw = Gateway::start(1, round_robin(), config).await;

    // Accepted but never read from
    let flooder = gw.connect().await;
    let stalled = gw.accept().await;

    let healthy = gw.connect().await;
    tokio::spawn(echo(gw.accept().await));

    for _ in 0..64 {
        if flooder.send(Bytes::from_static(b"flood")).await.is_err() {
            break;
        }
    }

    // Drain whatever arrives until the gateway cuts the flooder off
    let cut_off = tokio::time::timeout(WAIT, async {
        while let Ok(Some(_)) = flooder.recv().await {}
    })
    .await;
    assert!(cut_off.is_ok(), "flooding client was never disconnected");
    assert!(eventually(|| stalled.is_closed()).await);

    healthy.send(Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(recv(&healthy).await, Some(Bytes::from_static(b"still here")));
    assert_eq!(gw.backend.mux_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn e2e_rejected_client_never_reaches_backend() {
    let gw = Gateway::start(1, |_: &Link, _: &[LinkId]| None::<LinkId>, MuxConfig::default()).await;

    let client = gw.connect().await;

    assert_eq!(recv(&client).await, None);
    assert_eq!(gw.frontend_admitted(), 0);
    assert_eq!(gw.backend.connection_count(), 0);
}
