//! A TCP connection driven by three background tasks.
//!
//! Every [`Connection`] owns:
//!
//! - a **reader task** that receives bytes from the socket into the inbound
//!   queue,
//! - a **writer task** that sends whatever write transactions committed to
//!   the outbound queue,
//! - a **notifier task** that reports new data and closure to the registered
//!   data-available callback.
//!
//! The owner consumes data through [`wait_for_readable()`](Connection::wait_for_readable)
//! and the typed `read_*` accessors, and produces data through
//! [`begin_write()`](Connection::begin_write) transactions.
//!
//! # Closing
//!
//! A connection closes either locally through [`close()`](Connection::close)
//! (or dropping the handle), or because the peer went away. In both cases the
//! three tasks stop promptly and the connection is handed to its
//! [`ConnectionManager`](crate::ConnectionManager), whose reaper thread waits
//! for the tasks and releases the socket.
//!
//! # Examples
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = tcpline::Connection::dial("127.0.0.1", 7000).await?;
//!
//! let mut tx = connection.begin_write()?;
//! tx.write_string("PING");
//! tx.end()?;
//!
//! if connection.wait_for_readable(4).await {
//!     let reply = connection.read_string(4)?;
//!     println!("{reply}");
//! }
//! connection.close();
//! # Ok(())
//! # }
//! ```
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{net::TcpStream, select, time::Instant};
use tracing::debug;

use crate::{
    codec::{self, RCodec, WireCodecLen},
    manager::{ConnectionManager, ManagerError},
    sync::lock,
};

mod builder;
pub(crate) mod shared;
mod tasks;
mod write;

pub use builder::{ConnectionBuilder, builder};
pub use write::PendingWrite;

use shared::Shared;

/// Process-unique identifier of a [`Connection`]. Identifiers are never
/// reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// The socket is connected but the background tasks are not running yet.
    Connecting,
    /// The background tasks are running.
    Connected,
    /// A close was requested or detected; the tasks are winding down.
    Closing,
    /// Every background task has exited.
    Closed,
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The owner called [`Connection::close()`] or dropped the handle.
    Local,
    /// The peer closed or reset the connection.
    Remote,
    /// A socket operation failed in an unexpected way.
    Fatal(io::ErrorKind),
}

/// Event delivered to the data-available callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataEvent {
    /// A new batch of bytes was received.
    Readable,
    /// The connection closed. Delivered at most once, and only when the
    /// close came from the peer or an error, or when unread bytes remain.
    Closed(CloseReason),
}

/// Errors that can occur when establishing a connection.
#[derive(Debug, Error)]
pub enum DialError {
    /// Host name resolution failed or produced no address.
    #[error("Failed to resolve {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: io::Error,
    },
    /// Every resolved address refused the connection.
    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The connect timeout elapsed.
    #[error("Timed out after {timeout:?} connecting to {host}:{port}")]
    Timeout { host: String, port: u16, timeout: Duration },
    /// The connection manager refused the new connection.
    #[error("Connection manager rejected the connection: {0}")]
    Registry(#[from] ManagerError),
}

/// Errors returned by the typed read accessors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Fewer bytes are staged than the read requires. Nothing is consumed.
    #[error("Requested {requested} bytes but only {staged} are staged")]
    NotEnoughData { requested: usize, staged: usize },
    /// The bytes read are not valid UTF-8. They are consumed anyway.
    #[error("Received bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Errors returned by write transactions.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Another write transaction is still open on this connection.
    #[error("A write transaction is already in progress")]
    WriteInProgress,
    /// The connection is closing; the transaction's bytes were discarded.
    #[error("The connection is closed")]
    Closed,
}

/// Snapshot of connection traffic counters (only available with the `stats`
/// feature).
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// Total bytes received from the socket.
    pub bytes_received: usize,
    /// Number of receive batches.
    pub batches_received: usize,
    /// Total bytes handed to the socket.
    pub bytes_sent: usize,
    /// Number of completed sends.
    pub batches_sent: usize,
}

/// Owner handle of an established TCP connection.
///
/// Dropping the handle closes the connection.
pub struct Connection {
    shared: Arc<Shared>,
    manager: Option<ConnectionManager>,
}

macro_rules! read_impl {
    ($(#[$meta:meta])* $name:ident, $t:ty) => {
        $(#[$meta])*
        pub fn $name(&self) -> Result<$t, ReadError> {
            const LEN: usize = size_of::<$t>();
            let mut staging = lock(&self.shared.staging);
            codec::decode::<$t, _>(&mut *staging).map_err(|_| ReadError::NotEnoughData {
                requested: LEN,
                staged: staging.len(),
            })
        }
    };
}

impl Connection {
    /// Connects to `host:port` with the default configuration.
    ///
    /// See [`ConnectionBuilder::dial()`].
    pub async fn dial(host: &str, port: u16) -> Result<Self, DialError> {
        builder().dial(host, port).await
    }

    /// Wraps a stream accepted on the local `port` with the default
    /// configuration.
    ///
    /// See [`ConnectionBuilder::accepted_from()`].
    pub fn accepted_from(stream: TcpStream, port: u16) -> Self {
        builder().accepted_from(stream, port)
    }

    pub(crate) fn from_parts(shared: Arc<Shared>, manager: Option<ConnectionManager>) -> Self {
        Self { shared, manager }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// The host this connection was dialed to, or the peer IP address for
    /// accepted connections.
    pub fn host(&self) -> &str {
        &self.shared.host
    }

    /// The remote port for dialed connections, the local listening port for
    /// accepted ones.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns why the connection closed, or `None` while it is open.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Returns `true` once the connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closing()
    }

    /// Closes the connection and hands it over to the connection manager.
    ///
    /// This is idempotent and safe to race with a close detected by the
    /// background tasks. Bytes already staged stay readable.
    pub fn close(&self) {
        if self.shared.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.close(CloseReason::Local);

        let Some(manager) = &self.manager else {
            return;
        };
        if let Err(e) = manager.mark_for_removal(self.shared.id) {
            debug!(id = %self.shared.id, error = %e, "connection already removed");
        }
    }

    /// Waits until at least `n` bytes are staged for reading.
    ///
    /// Returns `true` when they are, `false` once the connection is closing
    /// and fewer than `n` bytes will ever be available. Bytes received before
    /// the peer closed remain readable.
    ///
    /// With lag emulation enabled, received bytes become readable only once
    /// their delay has elapsed; that delay is ignored once the connection
    /// closes.
    pub async fn wait_for_readable(&self, n: usize) -> bool {
        enum Readiness {
            Ready,
            Closed,
            Until(Instant),
        }

        let shared = &self.shared;
        loop {
            let readiness = shared
                .inbound_ready
                .wait_until(|| {
                    let promotion = shared.promote();
                    if promotion.staged >= n {
                        Some(Readiness::Ready)
                    } else if promotion.closing {
                        Some(Readiness::Closed)
                    } else {
                        promotion.next_release.map(Readiness::Until)
                    }
                })
                .await;

            match readiness {
                Readiness::Ready => return true,
                Readiness::Closed => return false,
                // Later bytes queue behind the held ones, so only time or a
                // close can make progress
                Readiness::Until(release) => select! {
                    _ = tokio::time::sleep_until(release) => {}
                    _ = shared.token.cancelled() => {}
                },
            }
        }
    }

    /// Number of bytes staged and readable without waiting.
    pub fn staged_len(&self) -> usize {
        lock(&self.shared.staging).len()
    }

    read_impl!(read_u8, u8);
    read_impl!(
        /// Reads a little-endian `u16`.
        read_u16,
        u16
    );
    read_impl!(
        /// Reads a little-endian `u32`.
        read_u32,
        u32
    );
    read_impl!(
        /// Reads a little-endian `u64`.
        read_u64,
        u64
    );
    read_impl!(read_i8, i8);
    read_impl!(read_i16, i16);
    read_impl!(read_i32, i32);
    read_impl!(read_i64, i64);
    read_impl!(
        /// Reads a little-endian IEEE 754 single-precision float.
        read_f32,
        f32
    );

    /// Reads exactly `n` staged bytes.
    pub fn read_bytes(&self, n: usize) -> Result<Vec<u8>, ReadError> {
        let mut staging = lock(&self.shared.staging);
        WireCodecLen { len: n }
            .read(&mut *staging)
            .map_err(|_| ReadError::NotEnoughData {
                requested: n,
                staged: staging.len(),
            })
    }

    /// Reads exactly `n` staged bytes as a UTF-8 string.
    pub fn read_string(&self, n: usize) -> Result<String, ReadError> {
        let bytes = self.read_bytes(n)?;
        String::from_utf8(bytes).map_err(|_| ReadError::InvalidUtf8)
    }

    /// Opens a write transaction.
    ///
    /// Only one transaction can be open at a time. Its bytes reach the wire
    /// contiguously and in commit order.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::WriteInProgress`] while another transaction is
    /// open.
    pub fn begin_write(&self) -> Result<PendingWrite<'_>, WriteError> {
        PendingWrite::begin(&self.shared)
    }

    /// Waits until every committed byte was handed to the socket, or the
    /// connection is closing.
    pub async fn wait_until_flushed(&self) {
        let shared = &self.shared;
        shared
            .flushed
            .wait_until(|| (shared.is_closing() || shared.is_flushed()).then_some(()))
            .await;
    }

    /// Holds back every byte received from now on for `delay` before it
    /// becomes readable.
    pub fn enable_lag_emulation(&self, delay: Duration) {
        self.shared.set_lag_delay(Some(delay));
    }

    /// Stops delaying newly received bytes. Bytes already held back keep
    /// their release time.
    pub fn disable_lag_emulation(&self) {
        self.shared.set_lag_delay(None);
    }

    /// Registers the callback invoked by the notifier task.
    ///
    /// The callback receives [`DataEvent::Readable`] once per received batch
    /// and [`DataEvent::Closed`] at most once. It runs on the runtime and
    /// should not block. Notifications that arrived while no callback was
    /// registered are delivered as soon as one is set.
    pub fn set_data_available_callback<F>(&self, callback: F)
    where
        F: Fn(DataEvent) + Send + Sync + 'static,
    {
        self.shared.set_callback(Some(Arc::new(callback)));
    }

    pub fn clear_data_available_callback(&self) {
        self.shared.set_callback(None);
    }

    /// Retrieves current traffic counters.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> ConnectionStats {
        let stats = &self.shared.stats;
        ConnectionStats {
            bytes_received: stats.bytes_received.load(Ordering::Relaxed),
            batches_received: stats.batches_received.load(Ordering::Relaxed),
            bytes_sent: stats.bytes_sent.load(Ordering::Relaxed),
            batches_sent: stats.batches_sent.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
