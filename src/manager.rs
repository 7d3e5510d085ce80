//! Deferred destruction of closed connections.
//!
//! A [`Connection`](crate::Connection) cannot tear itself down: its three
//! tasks may still be running when the owner closes it, and the close may be
//! triggered from `Drop` where nothing can be awaited. Instead every
//! connection registers with a [`ConnectionManager`]. Closing moves its
//! registry entry into a channel consumed by the manager's **reaper**, a
//! dedicated thread that waits for the tasks to finish and then drops the
//! entry, releasing the socket.
//!
//! Most programs use the process-wide [`ConnectionManager::global()`]
//! instance, which is what connections register with unless the
//! [builder](crate::ConnectionBuilder::manager) says otherwise.
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, LazyLock, Mutex},
    thread,
};

use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::SendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    connection::{CloseReason, ConnectionId, shared::Shared},
    sync::lock,
};

/// Maximum number of entries the reaper takes from the channel at once.
const REAP_BATCH: usize = 64;

/// Errors reported by [`ConnectionManager`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ManagerError {
    /// A connection with the same id is already registered.
    #[error("Connection {0} is already registered")]
    DuplicateRegistration(ConnectionId),
    /// The connection is not live: it was never registered or was already
    /// marked for removal.
    #[error("Connection {0} is not registered or was already removed")]
    DoubleRemoval(ConnectionId),
    /// The manager was shut down.
    #[error("The connection manager has been shut down")]
    ShutDown,
}

/// Background tasks of one connection.
pub(crate) struct Tasks {
    pub(crate) reader: JoinHandle<()>,
    pub(crate) writer: JoinHandle<()>,
    pub(crate) notifier: JoinHandle<()>,
}

/// Registry entry of a connection: everything the reaper has to wait for
/// before the connection is gone.
pub(crate) struct Entry {
    shared: Arc<Shared>,
    tasks: Tasks,
}

impl Entry {
    pub(crate) fn new(shared: Arc<Shared>, tasks: Tasks) -> Self {
        Self { shared, tasks }
    }

    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Closes the connection and waits for its tasks to exit.
    async fn destroy(self) {
        let Self { shared, tasks } = self;
        shared.close(CloseReason::Local);
        for handle in [tasks.reader, tasks.writer, tasks.notifier] {
            match handle.await {
                Err(e) if e.is_panic() => warn!(id = %shared.id, "connection task panicked"),
                _ => {}
            }
        }
        debug!(id = %shared.id, "connection reaped");
    }

    /// Closes the connection and aborts its tasks without waiting.
    fn force_destroy(self) {
        let Self { shared, tasks } = self;
        shared.close(CloseReason::Local);
        tasks.reader.abort();
        tasks.writer.abort();
        tasks.notifier.abort();
    }
}

#[derive(Default)]
struct Registry {
    live: HashMap<ConnectionId, Entry>,
    removing: HashSet<ConnectionId>,
    shut_down: bool,
}

struct ManagerInner {
    registry: Arc<Mutex<Registry>>,
    sender: UnboundedSender<Entry>,
    token: CancellationToken,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ManagerInner {
    /// Refuses further registrations. Returns `false` if that already
    /// happened.
    fn close_registry(&self) -> bool {
        let mut registry = lock(&self.registry);
        !std::mem::replace(&mut registry.shut_down, true)
    }

    fn destroy_leaked(&self) {
        let leaked: Vec<Entry> = lock(&self.registry).live.drain().map(|(_, entry)| entry).collect();
        for entry in leaked {
            warn!(id = %entry.id(), "connection still open at manager shutdown");
            entry.force_destroy();
        }
    }

    fn shutdown(&self) {
        if !self.close_registry() {
            return;
        }

        // Let the reaper finish what is already queued
        self.token.cancel();
        let reaper = lock(&self.reaper).take();
        if reaper.is_some_and(|handle| handle.join().is_err()) {
            error!("connection reaper panicked");
        }

        self.destroy_leaked();
        debug!("connection manager shut down");
    }
}

impl Drop for ManagerInner {
    // The last handle may go away inside a connection's `Drop`, on the very
    // runtime whose tasks the reaper is awaiting: never wait for it here.
    fn drop(&mut self) {
        if !self.close_registry() {
            return;
        }
        self.token.cancel();
        // Detached: it drains the queue and exits on its own
        drop(lock(&self.reaper).take());
        self.destroy_leaked();
        debug!("connection manager dropped");
    }
}

/// Registry of live connections and owner of the reaper thread.
///
/// Handles are cheap to clone and all refer to the same manager. A manager
/// created with [`new()`](Self::new) shuts down once its last handle and the
/// last connection registered with it are dropped. Unlike
/// [`shutdown()`](Self::shutdown), that implicit shutdown does not wait for
/// the reaper: connections already handed over are reaped in the background.
///
/// # Examples
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = tcpline::ConnectionManager::new();
/// let connection = tcpline::builder()
///     .manager(manager.clone())
///     .dial("127.0.0.1", 7000)
///     .await?;
/// assert_eq!(manager.live_count(), 1);
///
/// connection.close();
/// assert_eq!(manager.live_count(), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

static GLOBAL: LazyLock<ConnectionManager> = LazyLock::new(ConnectionManager::new);

impl ConnectionManager {
    /// Creates a manager and starts its reaper thread.
    ///
    /// If the reaper cannot be started, the error is logged and closed
    /// connections are destroyed inline instead.
    pub fn new() -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let reaper = spawn_reaper(registry.clone(), receiver, token.clone());

        Self {
            inner: Arc::new(ManagerInner {
                registry,
                sender,
                token,
                reaper: Mutex::new(reaper),
            }),
        }
    }

    /// Returns the process-wide manager, creating it on first use.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    pub(crate) fn register(&self, entry: Entry) -> Result<(), ManagerError> {
        let mut registry = lock(&self.inner.registry);
        if registry.shut_down {
            return Err(ManagerError::ShutDown);
        }
        let id = entry.id();
        if registry.live.contains_key(&id) || registry.removing.contains(&id) {
            return Err(ManagerError::DuplicateRegistration(id));
        }
        registry.live.insert(id, entry);
        Ok(())
    }

    /// Hands the connection `id` over to the reaper.
    pub(crate) fn mark_for_removal(&self, id: ConnectionId) -> Result<(), ManagerError> {
        let mut registry = lock(&self.inner.registry);
        let entry = registry.live.remove(&id).ok_or(ManagerError::DoubleRemoval(id))?;
        registry.removing.insert(id);

        if let Err(SendError(entry)) = self.inner.sender.send(entry) {
            // No reaper to hand it to
            registry.removing.remove(&id);
            drop(registry);
            entry.force_destroy();
        }
        Ok(())
    }

    /// Number of registered connections not yet marked for removal.
    pub fn live_count(&self) -> usize {
        lock(&self.inner.registry).live.len()
    }

    /// Number of connections marked for removal and not yet reaped.
    pub fn pending_removal_count(&self) -> usize {
        lock(&self.inner.registry).removing.len()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.inner.registry).shut_down
    }

    /// Stops the reaper and destroys every connection still registered.
    ///
    /// Connections already marked for removal are reaped first. Connections
    /// still live are closed, their tasks aborted, and a warning is logged
    /// for each of them. Later registrations fail with
    /// [`ManagerError::ShutDown`].
    ///
    /// This blocks the calling thread until the reaper has exited, and the
    /// reaper waits for connection tasks. Call it outside of a
    /// current-thread runtime.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.inner.registry);
        f.debug_struct("ConnectionManager")
            .field("live", &registry.live.len())
            .field("removing", &registry.removing.len())
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}

fn spawn_reaper(
    registry: Arc<Mutex<Registry>>,
    receiver: UnboundedReceiver<Entry>,
    token: CancellationToken,
) -> Option<thread::JoinHandle<()>> {
    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build the connection reaper runtime");
            return None;
        }
    };

    thread::Builder::new()
        .name("tcpline-reaper".to_string())
        .spawn(move || runtime.block_on(reap(registry, receiver, token)))
        .inspect_err(|e| error!(error = %e, "failed to spawn the connection reaper"))
        .ok()
}

async fn reap(registry: Arc<Mutex<Registry>>, mut receiver: UnboundedReceiver<Entry>, token: CancellationToken) {
    let mut batch = Vec::with_capacity(REAP_BATCH);
    loop {
        let received = select! {
            biased;
            received = receiver.recv_many(&mut batch, REAP_BATCH) => received,
            _ = token.cancelled() => 0,
        };

        if received == 0 {
            // Shutting down: reap whatever is still queued and leave
            while let Ok(entry) = receiver.try_recv() {
                batch.push(entry);
            }
            reap_batch(&registry, &mut batch).await;
            break;
        }
        reap_batch(&registry, &mut batch).await;
    }
}

async fn reap_batch(registry: &Mutex<Registry>, batch: &mut Vec<Entry>) {
    if batch.is_empty() {
        return;
    }
    let ids: Vec<ConnectionId> = batch.iter().map(Entry::id).collect();
    for entry in batch.drain(..) {
        entry.destroy().await;
    }

    let mut registry = lock(registry);
    for id in &ids {
        registry.removing.remove(id);
    }
    debug!(count = ids.len(), "reaped connections");
}
