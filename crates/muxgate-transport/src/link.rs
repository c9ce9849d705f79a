//! Physical link: ordered, length-delimited messages over a byte stream

use crate::{Connection, LinkConfig, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Link identifier, unique for the lifetime of the process
pub type LinkId = u64;

/// Callback fired once when a link closes
pub type CloseCallback = Box<dyn FnOnce() + Send>;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

const DUPLEX_BUFFER: usize = 64 * 1024;

const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// One end of an ordered message transport
///
/// Cloning a `Link` yields another handle to the same underlying connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: LinkId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    max_frame_len: usize,
    outbound: mpsc::Sender<Bytes>,
    // Overflowed detached sends, fed into `outbound` by one task per link
    detached: mpsc::UnboundedSender<Bytes>,
    detached_pending: AtomicUsize,
    reader: tokio::sync::Mutex<FramedRead<BoxedReader, LengthDelimitedCodec>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    // `None` once the close callbacks have been taken
    callbacks: Mutex<Option<HashMap<u64, CloseCallback>>>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Link {
    /// Dial a TCP link
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: &LinkConfig) -> TransportResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        Ok(Self::from_stream(stream, local_addr, remote_addr, config))
    }

    /// Wrap an established byte stream
    ///
    /// Spawns the writer task, so this must be called within a Tokio runtime.
    pub fn from_stream<S>(
        io: S,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        config: &LinkConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(config.max_frame_len)
            .new_codec();
        let (read_half, write_half) = tokio::io::split(io);
        let reader = FramedRead::new(Box::new(read_half) as BoxedReader, codec.clone());
        let writer = FramedWrite::new(write_half, codec);
        let (outbound, outbound_rx) = mpsc::channel(config.send_queue.max(1));
        let (detached, detached_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(LinkInner {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
            max_frame_len: config.max_frame_len,
            outbound,
            detached,
            detached_pending: AtomicUsize::new(0),
            reader: tokio::sync::Mutex::new(reader),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            callbacks: Mutex::new(Some(HashMap::new())),
        });

        debug!(link_id = inner.id, %remote_addr, "Link established");

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            inner.shutdown.clone(),
            Arc::downgrade(&inner),
        ));
        tokio::spawn(detached_loop(
            detached_rx,
            inner.shutdown.clone(),
            Arc::downgrade(&inner),
        ));

        Self { inner }
    }

    /// Two links connected to each other through an in-memory pipe
    pub fn pair(config: &LinkConfig) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
        let addr_a = SocketAddr::from(([127, 0, 0, 1], 1));
        let addr_b = SocketAddr::from(([127, 0, 0, 1], 2));
        (
            Self::from_stream(a, addr_a, addr_b, config),
            Self::from_stream(b, addr_b, addr_a, config),
        )
    }

    pub fn id(&self) -> LinkId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send a message, waiting for room in the outbound queue
    pub async fn send(&self, msg: Bytes) -> TransportResult<()> {
        self.check_sendable(&msg)?;

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(TransportError::Closed),
            sent = self.inner.outbound.send(msg) => sent.map_err(|_| TransportError::Closed),
        }
    }

    /// Queue a message without waiting
    ///
    /// Fails with [`TransportError::Overflow`] when the outbound queue is full.
    pub fn async_send(&self, msg: Bytes) -> TransportResult<()> {
        self.check_sendable(&msg)?;

        self.inner.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Overflow,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    /// Queue a message without blocking the caller, even when the queue is full
    ///
    /// Messages that do not fit wait in a per-link backlog that a single task
    /// moves into the outbound queue. Detached messages keep their relative
    /// order, but may be overtaken by later `send` calls.
    pub fn send_detached(&self, msg: Bytes) -> TransportResult<()> {
        if self.inner.detached_pending.load(Ordering::Acquire) == 0 {
            match self.async_send(msg.clone()) {
                Err(TransportError::Overflow) => {}
                other => return other,
            }
        }

        self.check_sendable(&msg)?;
        self.inner.detached_pending.fetch_add(1, Ordering::AcqRel);
        self.inner.detached.send(msg).map_err(|_| {
            self.inner.detached_pending.fetch_sub(1, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    fn check_sendable(&self, msg: &Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if msg.len() > self.inner.max_frame_len {
            return Err(TransportError::FrameTooLarge(msg.len()));
        }
        Ok(())
    }

    /// Receive the next message
    ///
    /// End of stream or a read error closes the link.
    pub async fn recv(&self) -> TransportResult<Option<Bytes>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut reader = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Ok(None),
            reader = self.inner.reader.lock() => reader,
        };

        let next = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Ok(None),
            next = reader.next() => next,
        };
        drop(reader);

        match next {
            Some(Ok(frame)) => {
                trace!(link_id = self.inner.id, len = frame.len(), "Received message");
                Ok(Some(frame.freeze()))
            }
            Some(Err(e)) => {
                debug!(link_id = self.inner.id, "Link read error: {}", e);
                self.close();
                Err(TransportError::IoError(e))
            }
            None => {
                debug!(link_id = self.inner.id, "Link closed by peer");
                self.close();
                Ok(None)
            }
        }
    }

    /// Close the link and fire its close callbacks. Idempotent.
    ///
    /// Messages already queued are still written, after which the peer sees
    /// end of stream.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Register a callback to run when the link closes
    ///
    /// At most one callback is kept per `owner`. If the link is already
    /// closed the callback runs immediately.
    pub fn add_close_callback<F>(&self, owner: u64, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(map) = callbacks.as_mut() {
            map.insert(owner, Box::new(callback));
            return;
        }
        drop(callbacks);
        callback();
    }

    /// Drop a previously registered close callback without running it
    pub fn remove_close_callback(&self, owner: u64) {
        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(map) = callbacks.as_mut() {
            map.remove(&owner);
        }
    }
}

impl LinkInner {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(link_id = self.id, "Closing link");
        self.shutdown.cancel();

        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_default();

        for (_, callback) in callbacks {
            callback();
        }
    }
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    link: Weak<LinkInner>,
) where
    W: AsyncWrite + Send + Unpin,
{
    // Messages queued before close still go out, for at most CLOSE_LINGER
    let linger = async {
        shutdown.cancelled().await;
        tokio::time::sleep(CLOSE_LINGER).await;
    };

    let written = tokio::select! {
        written = drain_outbound(&mut writer, &mut outbound, &shutdown) => written,
        _ = linger => {
            debug!("Dropping unsent messages after close");
            Ok(())
        }
    };

    if let Err(e) = written {
        debug!("Link write error: {}", e);
    }

    let _ = writer.get_mut().shutdown().await;

    if let Some(inner) = link.upgrade() {
        inner.close();
    }
}

/// Write queued messages until the queue is empty and the link is closing
async fn drain_outbound<W>(
    writer: &mut FramedWrite<W, LengthDelimitedCodec>,
    outbound: &mut mpsc::Receiver<Bytes>,
    shutdown: &CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = outbound.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        write_batch(writer, msg, outbound).await?;
    }
}

/// Write `first` plus whatever else is already queued, then flush once
async fn write_batch<W>(
    writer: &mut FramedWrite<W, LengthDelimitedCodec>,
    first: Bytes,
    outbound: &mut mpsc::Receiver<Bytes>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    writer.feed(first).await?;
    while let Ok(msg) = outbound.try_recv() {
        writer.feed(msg).await?;
    }
    SinkExt::<Bytes>::flush(writer).await
}

/// Move backlogged detached messages into the outbound queue, in order
async fn detached_loop(
    mut backlog: mpsc::UnboundedReceiver<Bytes>,
    shutdown: CancellationToken,
    link: Weak<LinkInner>,
) {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = backlog.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let Some(inner) = link.upgrade() else {
            break;
        };
        let sent = tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = inner.outbound.send(msg) => sent,
        };
        inner.detached_pending.fetch_sub(1, Ordering::AcqRel);
        if sent.is_err() {
            break;
        }
    }
}

#[async_trait]
impl Connection for Link {
    async fn recv(&self) -> TransportResult<Option<Bytes>> {
        Link::recv(self).await
    }

    async fn send(&self, msg: Bytes) -> TransportResult<()> {
        Link::send(self, msg).await
    }

    fn close(&self) {
        Link::close(self)
    }

    fn is_closed(&self) -> bool {
        Link::is_closed(self)
    }

    fn id(&self) -> u64 {
        Link::id(self)
    }

    fn local_addr(&self) -> SocketAddr {
        Link::local_addr(self)
    }

    fn remote_addr(&self) -> SocketAddr {
        Link::remote_addr(self)
    }
}
