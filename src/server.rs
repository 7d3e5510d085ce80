//! Accepting connections on local ports.
use std::{
    collections::HashMap,
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
    sync::Mutex,
    time::Duration,
};

use thiserror::Error;
use tokio::{net::TcpListener, select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionBuilder},
    sync::lock,
};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors returned by [`TcpServer`] operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Already listening on port {0}")]
    AlreadyListening(u16),
    #[error("Not listening on port {0}")]
    NotListening(u16),
    #[error("Failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}

struct Listener {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Accepts TCP connections on any number of local ports.
///
/// Every accepted stream is wrapped into a [`Connection`] and handed to the
/// handler registered for its port, together with that port.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = tcpline::TcpServer::new();
/// let addr = server
///     .start_listening(0, |connection, port| {
///         println!("{} connected on port {port}", connection.host());
///     })
///     .await?;
///
/// server.stop_listening(addr.port()).await?;
/// # Ok(())
/// # }
/// ```
pub struct TcpServer {
    builder: ConnectionBuilder,
    listeners: Mutex<HashMap<u16, Listener>>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self::with_builder(ConnectionBuilder::default())
    }

    /// Creates a server configuring accepted connections with `builder`.
    pub fn with_builder(builder: ConnectionBuilder) -> Self {
        Self {
            builder,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Starts accepting connections on `port` of every local interface.
    ///
    /// Port `0` picks a free port; the returned address tells which one, and
    /// that port is the one to pass to [`stop_listening()`](Self::stop_listening).
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyListening`]: this server already listens on `port`
    /// - [`ServerError::Bind`]: the port could not be bound
    pub async fn start_listening<F>(&self, port: u16, handler: F) -> Result<SocketAddr, ServerError>
    where
        F: Fn(Connection, u16) + Send + Sync + 'static,
    {
        if port != 0 && self.is_listening(port) {
            return Err(ServerError::AlreadyListening(port));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind { port, source })?;
        let port = addr.port();

        let mut listeners = lock(&self.listeners);
        if listeners.contains_key(&port) {
            return Err(ServerError::AlreadyListening(port));
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(accept_task(
            listener,
            port,
            self.builder.clone(),
            handler,
            token.clone(),
        ));
        listeners.insert(port, Listener { token, handle });

        info!(%addr, "listening");
        Ok(addr)
    }

    /// Stops accepting connections on `port` and waits for the accept loop
    /// to exit. Connections already accepted are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotListening`] if this server does not listen
    /// on `port`.
    pub async fn stop_listening(&self, port: u16) -> Result<(), ServerError> {
        let listener = lock(&self.listeners)
            .remove(&port)
            .ok_or(ServerError::NotListening(port))?;
        listener.token.cancel();
        let _ = listener.handle.await;
        info!(port, "stopped listening");
        Ok(())
    }

    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.listeners).contains_key(&port)
    }

    /// Ports this server currently listens on, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = lock(&self.listeners).keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer").field("ports", &self.ports()).finish()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, listener) in lock(&self.listeners).drain() {
            listener.token.cancel();
        }
    }
}

async fn accept_task<F>(
    listener: TcpListener,
    port: u16,
    builder: ConnectionBuilder,
    handler: F,
    token: CancellationToken,
) where
    F: Fn(Connection, u16) + Send + Sync + 'static,
{
    loop {
        let res = select! {
            res = listener.accept() => res,
            _ = token.cancelled() => break,
        };

        match res {
            Ok((stream, addr)) => {
                debug!(port, %addr, "accepted connection");
                let connection = builder.accepted_from(stream, port);
                handler(connection, port);
            }
            Err(e) => {
                warn!(port, error = %e, "accept failed");
                select! {
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
    }
}
