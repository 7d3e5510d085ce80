//! State shared between a [`Connection`](super::Connection) handle and its
//! background tasks.
//!
//! Every queue sits behind its own cache-padded mutex. When two of them are
//! needed at once the inbound lock is always taken before the staging lock.
use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crossbeam_utils::CachePadded;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CloseReason, ConnectionId, ConnectionState, DataEvent};
use crate::{
    buffers::ByteQueue,
    sync::{Event, lock},
};

pub(crate) type Callback = Arc<dyn Fn(DataEvent) + Send + Sync>;

/// Number of background tasks attached to every connection.
pub(crate) const TASKS: usize = 3;

/// A run of received bytes that must not be promoted before `release`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LagEntry {
    pub(crate) release: Instant,
    pub(crate) len: usize,
}

/// Bytes received from the socket and not yet promoted to staging.
#[derive(Default)]
pub(crate) struct Inbound {
    pub(crate) queue: ByteQueue,
    lag: VecDeque<LagEntry>,
    // Bytes at the back of `queue` covered by `lag`
    lagged: usize,
    lag_delay: Option<Duration>,
    pub(crate) batches: u64,
}

impl Inbound {
    fn push(&mut self, bytes: &[u8], now: Instant) {
        self.queue.push(bytes);
        self.batches += 1;

        // Once some bytes are held back, every later byte queues behind them
        let release = match (self.lag_delay, self.lag.back()) {
            (Some(delay), _) => Some(now + delay),
            (None, Some(last)) => Some(last.release.max(now)),
            (None, None) => None,
        };
        if let Some(release) = release {
            self.lag.push_back(LagEntry { release, len: bytes.len() });
            self.lagged += bytes.len();
        }
    }

    /// Moves every promotable byte into `staging`.
    ///
    /// Returns the release time of the next held-back run, if any.
    pub(crate) fn promote(&mut self, staging: &mut ByteQueue, now: Instant, closing: bool) -> Option<Instant> {
        if closing {
            self.lag.clear();
            self.lagged = 0;
        }

        let uncovered = self.queue.len() - self.lagged;
        self.queue.transfer(staging, uncovered);

        while let Some(entry) = self.lag.front().copied() {
            if entry.release > now {
                return Some(entry.release);
            }
            self.lag.pop_front();
            self.queue.transfer(staging, entry.len);
            self.lagged -= entry.len;
        }
        None
    }
}

/// Bytes committed by write transactions and not yet handed to the socket.
#[derive(Default)]
pub(crate) struct Outbound {
    pub(crate) queue: ByteQueue,
    pub(crate) in_flight: bool,
}

struct Lifecycle {
    state: ConnectionState,
    reason: Option<CloseReason>,
}

/// Outcome of one promotion pass.
pub(crate) struct Promotion {
    pub(crate) staged: usize,
    pub(crate) next_release: Option<Instant>,
    pub(crate) closing: bool,
}

#[cfg(feature = "stats")]
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) bytes_received: AtomicUsize,
    pub(crate) batches_received: AtomicUsize,
    pub(crate) bytes_sent: AtomicUsize,
    pub(crate) batches_sent: AtomicUsize,
}

pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) peer_addr: Option<SocketAddr>,

    lifecycle: CachePadded<Mutex<Lifecycle>>,
    pub(crate) inbound: CachePadded<Mutex<Inbound>>,
    pub(crate) staging: CachePadded<Mutex<ByteQueue>>,
    pub(crate) outbound: CachePadded<Mutex<Outbound>>,
    callback: Mutex<Option<Callback>>,

    /// Fired once per received batch.
    pub(crate) inbound_ready: Event,
    /// Fired when a transaction commits bytes.
    pub(crate) outbound_ready: Event,
    /// Fired after every completed send.
    pub(crate) flushed: Event,
    pub(crate) callback_set: Event,

    /// Cancelled on the first close; wakes every pending socket operation.
    pub(crate) token: CancellationToken,
    live_tasks: AtomicUsize,
    /// Set while a write transaction is open.
    pub(crate) writing: AtomicBool,
    /// Set once the owner released the connection.
    pub(crate) released: AtomicBool,

    #[cfg(feature = "stats")]
    pub(crate) stats: Stats,
}

impl Shared {
    pub(crate) fn new(
        id: ConnectionId,
        host: String,
        port: u16,
        peer_addr: Option<SocketAddr>,
        lag_delay: Option<Duration>,
    ) -> Self {
        Self {
            id,
            host,
            port,
            peer_addr,
            lifecycle: CachePadded::new(Mutex::new(Lifecycle {
                state: ConnectionState::Connecting,
                reason: None,
            })),
            inbound: CachePadded::new(Mutex::new(Inbound {
                lag_delay,
                ..Inbound::default()
            })),
            staging: CachePadded::new(Mutex::new(ByteQueue::new())),
            outbound: CachePadded::new(Mutex::new(Outbound::default())),
            callback: Mutex::new(None),
            inbound_ready: Event::new(),
            outbound_ready: Event::new(),
            flushed: Event::new(),
            callback_set: Event::new(),
            token: CancellationToken::new(),
            live_tasks: AtomicUsize::new(TASKS),
            writing: AtomicBool::new(false),
            released: AtomicBool::new(false),
            #[cfg(feature = "stats")]
            stats: Stats::default(),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        lock(&self.lifecycle).state
    }

    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.lifecycle).reason
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn mark_connected(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.state == ConnectionState::Connecting {
            lifecycle.state = ConnectionState::Connected;
        }
    }

    /// Moves the connection to [`ConnectionState::Closing`].
    ///
    /// Only the first call records its reason. Returns `true` for that call.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        {
            let mut lifecycle = lock(&self.lifecycle);
            if lifecycle.state >= ConnectionState::Closing {
                return false;
            }
            lifecycle.state = ConnectionState::Closing;
            lifecycle.reason = Some(reason);
        }
        debug!(id = %self.id, ?reason, "connection closing");

        self.token.cancel();
        self.inbound_ready.notify_all();
        self.outbound_ready.notify_all();
        self.flushed.notify_all();
        self.callback_set.notify_all();
        true
    }

    /// Registers the exit of one background task. The last one to leave
    /// moves the connection to [`ConnectionState::Closed`].
    fn task_exited(&self) {
        // Any task leaving takes the whole connection down with it
        self.close(CloseReason::Local);
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            lock(&self.lifecycle).state = ConnectionState::Closed;
            debug!(id = %self.id, "connection closed");
        }
    }

    pub(crate) fn task_guard(&self) -> TaskGuard<'_> {
        TaskGuard(self)
    }

    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        lock(&self.inbound).push(bytes, Instant::now());
        #[cfg(feature = "stats")]
        {
            self.stats.bytes_received.fetch_add(bytes.len(), Ordering::Relaxed);
            self.stats.batches_received.fetch_add(1, Ordering::Relaxed);
        }
        self.inbound_ready.notify_all();
    }

    pub(crate) fn set_lag_delay(&self, delay: Option<Duration>) {
        lock(&self.inbound).lag_delay = delay;
    }

    pub(crate) fn promote(&self) -> Promotion {
        let closing = self.is_closing();
        let mut inbound = lock(&self.inbound);
        let mut staging = lock(&self.staging);
        let next_release = inbound.promote(&mut staging, Instant::now(), closing);
        Promotion {
            staged: staging.len(),
            next_release,
            closing,
        }
    }

    /// Returns the batch counter when a batch newer than `seen` arrived and
    /// bytes are still waiting to be read.
    pub(crate) fn pending_batch(&self, seen: u64) -> Option<u64> {
        let inbound = lock(&self.inbound);
        if inbound.batches <= seen {
            return None;
        }
        let pending = !inbound.queue.is_empty() || !lock(&self.staging).is_empty();
        pending.then_some(inbound.batches)
    }

    pub(crate) fn has_pending_bytes(&self) -> bool {
        let inbound = lock(&self.inbound);
        !inbound.queue.is_empty() || !lock(&self.staging).is_empty()
    }

    pub(crate) fn callback(&self) -> Option<Callback> {
        lock(&self.callback).clone()
    }

    pub(crate) fn set_callback(&self, callback: Option<Callback>) {
        let is_set = callback.is_some();
        *lock(&self.callback) = callback;
        if is_set {
            self.callback_set.notify_all();
        }
    }

    pub(crate) fn is_flushed(&self) -> bool {
        let outbound = lock(&self.outbound);
        outbound.queue.is_empty() && !outbound.in_flight
    }
}

/// Keeps the live task count of a connection up to date, including when a
/// task unwinds.
pub(crate) struct TaskGuard<'a>(&'a Shared);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.0.task_exited();
    }
}
