//! One accepted TCP connection and its background receive loop
//!
//! The accept side hands over an already-connected stream; from then on the
//! [`Connection`] owns the socket. `start_listen` spawns the receive loop,
//! which reads until the peer closes, a read fails, or `close` signals it to
//! stop. Incoming data and disconnection reach the observer through the
//! event callback, on the receive task itself.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::{ConnectionEvent, EventCallback};

/// Disconnect reason reported when the peer performs an orderly close
const PEER_CLOSED: &str = "connection closed by peer";

/// Identity snapshot for one connection: the raw socket handle and the
/// IP label assigned by the accept side. Used for lookup and display only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub handle: u64,
    pub ip: IpAddr,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ip, self.handle)
    }
}

/// Tuning options for a connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Receive buffer size; each incoming event carries at most this many bytes
    pub read_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: crate::MAX_CHUNK_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the receive chunk size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }
}

/// One accepted TCP connection.
///
/// Owns the socket and the receive loop spawned by
/// [`start_listen`](Self::start_listen). [`send`](Self::send) and
/// [`close`](Self::close) may be called while the loop runs. Dropping the
/// connection aborts a loop that is still running and releases the socket.
pub struct Connection {
    id: PeerId,
    config: ConnectionConfig,
    established_at: DateTime<Utc>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<OwnedWriteHalf>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    callback: EventCallback,
}

impl Connection {
    /// Wrap an accepted stream.
    ///
    /// The stream is assumed to be connected; that is the accept side's
    /// responsibility. The receive loop does not run until
    /// [`start_listen`](Self::start_listen).
    pub fn new(stream: TcpStream, ip: IpAddr, callback: EventCallback) -> Self {
        Self::with_config(stream, ip, callback, ConnectionConfig::default())
    }

    /// Wrap an accepted stream with explicit tuning options
    pub fn with_config(
        stream: TcpStream,
        ip: IpAddr,
        callback: EventCallback,
        config: ConnectionConfig,
    ) -> Self {
        let id = PeerId {
            handle: raw_handle(&stream),
            ip,
        };
        let (reader, writer) = stream.into_split();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id,
            config,
            established_at: Utc::now(),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(Some(reader)),
            writer: AsyncMutex::new(writer),
            recv_task: Mutex::new(None),
            shutdown_tx,
            callback,
        }
    }

    /// Whether the receive loop is meant to keep running
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Identity handed to the event callback
    pub fn peer_id(&self) -> &PeerId {
        &self.id
    }

    /// IP label assigned by the accept side
    pub fn ip(&self) -> IpAddr {
        self.id.ip
    }

    /// Raw OS socket handle, for display and lookup only
    pub fn handle(&self) -> u64 {
        self.id.handle
    }

    /// When the accept side handed this connection over
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Human-readable snapshot for diagnostics
    pub fn describe(&self) -> String {
        format!(
            "ip={} connected={} handle={} established_at={}",
            self.id.ip,
            self.is_connected(),
            self.id.handle,
            self.established_at.to_rfc3339(),
        )
    }

    /// Spawn the receive loop for this connection.
    ///
    /// Single-use: a connection listens at most once, and a second call
    /// (including after [`close`](Self::close)) returns
    /// [`Error::AlreadyListening`]. Must be called from within a tokio
    /// runtime.
    pub fn start_listen(&self) -> Result<()> {
        let reader = self.reader.lock().take().ok_or(Error::AlreadyListening)?;

        self.connected.store(true, Ordering::SeqCst);
        info!(peer = %self.id, "listening for incoming data");

        let handle = tokio::spawn(receive_loop(
            reader,
            self.id.clone(),
            self.connected.clone(),
            self.callback.clone(),
            self.shutdown_tx.subscribe(),
            self.config.read_chunk_size,
        ));
        *self.recv_task.lock() = Some(handle);

        Ok(())
    }

    /// Send a buffer to the peer as a single write.
    ///
    /// Concurrent callers are serialized internally. A short write is
    /// reported as [`Error::PartialSend`] with the exact counts; the
    /// remainder is not retried.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_chunk(&mut *writer, msg).await
    }

    /// Tear the connection down.
    ///
    /// Returns immediately if already disconnected, so it is safe to call
    /// after a peer-initiated exit or a second time. Otherwise flags the
    /// state, wakes the receive loop out of a pending read, waits for it to
    /// finish, and shuts the socket down. The descriptor itself is released
    /// when the connection is dropped.
    pub async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        // Wake a read that is still pending before joining.
        let _ = self.shutdown_tx.send(());

        let task = self.recv_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(peer = %self.id, error = %e, "receive loop did not exit cleanly");
            }
        }

        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(Error::Close)?;

        info!(peer = %self.id, "connection closed");
        Ok(())
    }
}

/// Connections are equal iff both the handle and the IP label match
impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("ip", &self.id.ip)
            .field("handle", &self.id.handle)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        // Joining is not possible here; abort a loop that is still running.
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(unix)]
fn raw_handle(stream: &TcpStream) -> u64 {
    use std::os::fd::AsRawFd;
    stream.as_raw_fd() as u64
}

#[cfg(windows)]
fn raw_handle(stream: &TcpStream) -> u64 {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket()
}

/// Write `msg` as a single chunk, reporting a short write instead of
/// continuing it
async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, msg: &[u8]) -> Result<()> {
    let sent = writer.write(msg).await.map_err(Error::Transmission)?;

    if sent < msg.len() {
        return Err(Error::PartialSend {
            requested: msg.len(),
            sent,
        });
    }

    writer.flush().await.map_err(Error::Transmission)?;
    Ok(())
}

/// Receive loop: reads until data arrives, the peer closes, a read fails,
/// or the shutdown signal fires.
///
/// Every event is delivered by invoking the callback right here, so
/// publication order is arrival order and the terminal disconnect event is
/// last. A locally requested shutdown publishes nothing.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    peer: PeerId,
    connected: Arc<AtomicBool>,
    callback: EventCallback,
    mut shutdown_rx: broadcast::Receiver<()>,
    chunk_size: usize,
) {
    let mut buf = vec![0u8; chunk_size];

    while connected.load(Ordering::SeqCst) {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(peer = %peer, "receive loop shutting down");
                break;
            }

            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    connected.store(false, Ordering::SeqCst);
                    debug!(peer = %peer, "peer closed connection");
                    callback(&peer, ConnectionEvent::Disconnected(PEER_CLOSED.to_string()));
                    break;
                }
                Ok(n) => {
                    trace!(peer = %peer, bytes = n, "received chunk");
                    callback(&peer, ConnectionEvent::IncomingMessage(buf[..n].to_vec()));
                }
                Err(e) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!(peer = %peer, error = %e, "read failed");
                    callback(&peer, ConnectionEvent::Disconnected(e.to_string()));
                    break;
                }
            }
        }
    }
}
