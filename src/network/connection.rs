use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Identity of a connection: a random v4 UUID, fixed for the connection's
/// whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Callbacks driven by the network layer.
///
/// For one connection, `on_connect` runs exactly once and before any
/// `on_receive`; `on_receive` calls arrive in the order the bytes did, and
/// `on_disconnect` runs exactly once after the last of them. Calls for
/// different connections may run concurrently.
///
/// A chunk handed to `on_receive` is whatever one socket read returned, so a
/// message can be split over several chunks or several messages can share
/// one.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, connection: Connection);

    fn on_receive(&self, connection: &Connection, data: Bytes);

    fn on_disconnect(&self, _connection: &Connection) {}
}

#[derive(Debug)]
struct Inner {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    closed: AtomicBool,
    outbound: async_channel::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Handle to one live byte stream.
///
/// Cloning is cheap and every clone refers to the same connection. Sends are
/// queued to a writer task, so `send` never blocks the caller; a full queue
/// or a closed connection is reported as [`AppError::TransportWrite`].
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    fn new(peer_addr: Option<SocketAddr>, outbound: async_channel::Sender<Bytes>) -> Connection {
        Connection {
            inner: Arc::new(Inner {
                id: ConnectionId::new(),
                peer_addr,
                closed: AtomicBool::new(false),
                outbound,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Wraps an established stream and starts its writer task. The reader is
    /// started separately with [`Connection::spawn_reader`] so the owner can
    /// run `on_connect` first.
    ///
    /// After `close`, the writer gets `close_grace` to flush what is queued.
    /// Past that the write half and the unsent chunks are dropped, so a peer
    /// that stops reading cannot keep the socket alive.
    pub(crate) fn from_stream(
        stream: TcpStream,
        queue_capacity: usize,
        close_grace: Duration,
    ) -> (Connection, OwnedReadHalf) {
        let peer_addr = stream.peer_addr().ok();
        if let Err(err) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {}", err);
        }
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = async_channel::bounded(queue_capacity);
        let connection = Connection::new(peer_addr, outbound_tx);

        let writer_connection = connection.clone();
        tokio::spawn(async move {
            let cancel = writer_connection.inner.cancel.clone();
            tokio::select! {
                _ = writer_connection.write_loop(BufWriter::new(writer), outbound_rx) => {}
                _ = async {
                    cancel.cancelled().await;
                    time::sleep(close_grace).await;
                } => {
                    debug!(
                        connection = %writer_connection.inner.id,
                        "peer did not drain within {:?}, dropping unsent data", close_grace
                    );
                }
            }
        });

        (connection, reader)
    }

    pub fn uuid(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Whether both handles refer to the same connection, not just the same
    /// id.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, data: impl Into<Bytes>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::TransportWrite(
                self.inner.id,
                "connection closed".into(),
            ));
        }
        match self.inner.outbound.try_send(data.into()) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => Err(AppError::TransportWrite(
                self.inner.id,
                "outbound queue full".into(),
            )),
            Err(async_channel::TrySendError::Closed(_)) => {
                self.close();
                Err(AppError::TransportWrite(
                    self.inner.id,
                    "writer has exited".into(),
                ))
            }
        }
    }

    /// Idempotent. Data queued before the call is still written, within the
    /// close grace period, then the write half is shut down; the reader stops
    /// right away.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = %self.inner.id, "closing connection");
        self.inner.outbound.close();
        self.inner.cancel.cancel();
    }

    async fn write_loop(
        &self,
        mut writer: BufWriter<OwnedWriteHalf>,
        outbound: async_channel::Receiver<Bytes>,
    ) {
        // recv keeps yielding queued chunks after the channel is closed
        while let Ok(chunk) = outbound.recv().await {
            if let Err(err) = writer.write_all(&chunk).await {
                let err = AppError::TransportWrite(self.inner.id, err.to_string());
                warn!(cause = %err, "write failed, closing connection");
                self.close();
                return;
            }
            if outbound.is_empty() {
                if let Err(err) = writer.flush().await {
                    let err = AppError::TransportWrite(self.inner.id, err.to_string());
                    warn!(cause = %err, "flush failed, closing connection");
                    self.close();
                    return;
                }
            }
        }
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
        trace!(connection = %self.inner.id, "writer exited");
    }

    /// Spawns the read loop. Each socket read becomes one `on_receive`; when
    /// the peer goes away or the connection is closed locally the connection
    /// is marked closed and `on_disconnect` runs. `permit` is held for the
    /// life of the loop.
    pub(crate) fn spawn_reader(
        &self,
        mut reader: OwnedReadHalf,
        handler: Arc<dyn ConnectionHandler>,
        buffer_size: usize,
        permit: Option<OwnedSemaphorePermit>,
    ) -> JoinHandle<()> {
        let connection = self.clone();
        tokio::spawn(async move {
            let mut buffer = BytesMut::with_capacity(buffer_size);
            loop {
                buffer.reserve(buffer_size);
                let read = tokio::select! {
                    res = reader.read_buf(&mut buffer) => res,
                    _ = connection.inner.cancel.cancelled() => {
                        debug!(connection = %connection.inner.id, "reader cancelled");
                        break;
                    }
                };
                match read {
                    Ok(0) => {
                        debug!(connection = %connection.inner.id, "peer closed the connection");
                        break;
                    }
                    Ok(n) => {
                        trace!(connection = %connection.inner.id, bytes = n, "received chunk");
                        let chunk = buffer.split().freeze();
                        handler.on_receive(&connection, chunk);
                    }
                    Err(err) => {
                        let err = AppError::TransportRead(connection.inner.id, err.to_string());
                        warn!(cause = %err, "read failed, closing connection");
                        break;
                    }
                }
            }
            connection.close();
            handler.on_disconnect(&connection);
            drop(permit);
        })
    }

    /// A connection with no socket behind it; the receiver sees what would
    /// have been written.
    #[cfg(test)]
    pub(crate) fn detached(queue_capacity: usize) -> (Connection, async_channel::Receiver<Bytes>) {
        let (tx, rx) = async_channel::bounded(queue_capacity);
        (Connection::new(None, tx), rx)
    }

    /// Like [`Connection::detached`], reusing the id of `other`.
    #[cfg(test)]
    pub(crate) fn detached_twin(
        other: &Connection,
        queue_capacity: usize,
    ) -> (Connection, async_channel::Receiver<Bytes>) {
        let (connection, rx) = Connection::detached(queue_capacity);
        let inner = Inner {
            id: other.uuid(),
            peer_addr: None,
            closed: AtomicBool::new(false),
            outbound: connection.inner.outbound.clone(),
            cancel: CancellationToken::new(),
        };
        (
            Connection {
                inner: Arc::new(inner),
            },
            rx,
        )
    }
}
