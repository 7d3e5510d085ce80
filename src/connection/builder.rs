use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::{TcpStream, lookup_host};
use tracing::{debug, warn};

use super::{
    Connection, DialError,
    shared::Shared,
    tasks::{notify_task, read_task, write_task},
};
use crate::manager::{ConnectionManager, Entry, Tasks};

/// Builder for configuring and creating a [`Connection`].
///
/// The same builder can create any number of connections. Use
/// [`builder()`] to get one with the default settings.
#[derive(Clone, Debug)]
pub struct ConnectionBuilder {
    recv_buffer_size: usize,
    nodelay: bool,
    lag_emulation: Option<Duration>,
    connect_timeout: Option<Duration>,
    manager: Option<ConnectionManager>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self {
            recv_buffer_size: 512,
            nodelay: true,
            lag_emulation: None,
            connect_timeout: None,
            manager: None,
        }
    }
}

impl ConnectionBuilder {
    /// Sets the size of the buffer used for every socket receive.
    ///
    /// This bounds how many bytes a single receive batch can carry.
    ///
    /// Default: 512 bytes
    #[must_use]
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Sets `TCP_NODELAY` on the socket.
    ///
    /// Default: `true`
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Starts the connection with lag emulation enabled.
    ///
    /// See [`Connection::enable_lag_emulation()`].
    ///
    /// Default: disabled
    #[must_use]
    pub fn lag_emulation(mut self, delay: Duration) -> Self {
        self.lag_emulation = Some(delay);
        self
    }

    /// Bounds the time [`dial()`](Self::dial) spends connecting.
    ///
    /// Default: no timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Registers the connections with `manager` instead of the
    /// [global](ConnectionManager::global) one.
    #[must_use]
    pub fn manager(mut self, manager: ConnectionManager) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Resolves `host`, connects to the first address that accepts and
    /// starts the connection tasks.
    ///
    /// Connection attempts are never retried.
    ///
    /// # Errors
    ///
    /// - [`DialError::Resolution`]: `host` could not be resolved
    /// - [`DialError::Connect`]: every resolved address refused the connection
    /// - [`DialError::Timeout`]: the [connect timeout](Self::connect_timeout) elapsed
    /// - [`DialError::Registry`]: the connection manager was shut down
    pub async fn dial(&self, host: &str, port: u16) -> Result<Connection, DialError> {
        let stream = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect(host, port))
                .await
                .map_err(|_| DialError::Timeout {
                    host: host.to_string(),
                    port,
                    timeout,
                })??,
            None => connect(host, port).await?,
        };

        let manager = self.target_manager();
        let (shared, entry) = self.start(stream, host.to_string(), port);
        if let Err(e) = manager.register(entry) {
            shared.close(super::CloseReason::Local);
            return Err(e.into());
        }
        Ok(Connection::from_parts(shared, Some(manager)))
    }

    /// Wraps a stream accepted on the local `port` and starts the connection
    /// tasks.
    ///
    /// This never fails: if the connection manager was shut down the
    /// connection runs untracked.
    pub fn accepted_from(&self, stream: TcpStream, port: u16) -> Connection {
        let host = stream.peer_addr().map(|addr| addr.ip().to_string()).unwrap_or_default();
        let manager = self.target_manager();
        let (shared, entry) = self.start(stream, host, port);
        match manager.register(entry) {
            Ok(()) => Connection::from_parts(shared, Some(manager)),
            Err(e) => {
                warn!(id = %shared.id, error = %e, "running accepted connection untracked");
                Connection::from_parts(shared, None)
            }
        }
    }

    fn target_manager(&self) -> ConnectionManager {
        self.manager.clone().unwrap_or_else(ConnectionManager::global)
    }

    fn start(&self, stream: TcpStream, host: String, port: u16) -> (Arc<Shared>, Entry) {
        if let Err(e) = stream.set_nodelay(self.nodelay) {
            warn!(%host, port, error = %e, "failed to configure TCP_NODELAY");
        }
        let peer_addr = stream.peer_addr().ok();
        let shared = Arc::new(Shared::new(
            super::ConnectionId::next(),
            host,
            port,
            peer_addr,
            self.lag_emulation,
        ));

        let (reader, writer) = stream.into_split();
        let tasks = Tasks {
            reader: tokio::spawn(read_task(shared.clone(), reader, self.recv_buffer_size)),
            writer: tokio::spawn(write_task(shared.clone(), writer)),
            notifier: tokio::spawn(notify_task(shared.clone())),
        };
        shared.mark_connected();
        debug!(id = %shared.id, host = %shared.host, port, peer = ?peer_addr, "connection established");

        let entry = Entry::new(shared.clone(), tasks);
        (shared, entry)
    }
}

async fn connect(host: &str, port: u16) -> Result<TcpStream, DialError> {
    let resolution = |source| DialError::Resolution {
        host: host.to_string(),
        source,
    };
    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await.map_err(resolution)?.collect();
    if addrs.is_empty() {
        return Err(resolution(io::Error::new(io::ErrorKind::NotFound, "no address found")));
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "connect attempt failed");
                last_error = Some(e);
            }
        }
    }
    Err(DialError::Connect {
        host: host.to_string(),
        port,
        source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
    })
}

/// Creates a new [`ConnectionBuilder`] with the default settings.
///
/// ```no_run
/// # use std::time::Duration;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let connection = tcpline::builder()
///     .connect_timeout(Duration::from_secs(3))
///     .recv_buffer_size(4096)
///     .dial("example.com", 80)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub fn builder() -> ConnectionBuilder {
    ConnectionBuilder::default()
}
