//! The reader, writer and notifier tasks of a connection.
//!
//! The tasks only talk to each other through [`Shared`]: the queues, the
//! events and the cancellation token that fires on the first close.
#[cfg(feature = "stats")]
use std::sync::atomic::Ordering;
use std::{io, sync::Arc};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    select,
};
use tracing::{debug, error, trace, warn};

use super::{CloseReason, DataEvent, shared::Shared};
use crate::sync::lock;

/// Error kinds that mean the peer went away rather than that something broke.
fn is_remote_close(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

pub(crate) async fn read_task(shared: Arc<Shared>, mut reader: OwnedReadHalf, recv_buffer_size: usize) {
    let _guard = shared.task_guard();
    let mut buf = vec![0u8; recv_buffer_size.max(1)];

    loop {
        let res = select! {
            res = reader.read(&mut buf) => res,
            _ = shared.token.cancelled() => break,
        };

        match res {
            // EOF - the peer closed its side
            Ok(0) => {
                shared.close(CloseReason::Remote);
                break;
            }
            Ok(read) => {
                trace!(id = %shared.id, bytes = read, "received batch");
                shared.push_inbound(&buf[..read]);
            }
            Err(e) if is_remote_close(e.kind()) => {
                shared.close(CloseReason::Remote);
                break;
            }
            Err(e) => {
                error!(id = %shared.id, error = %e, "receive failed");
                shared.close(CloseReason::Fatal(e.kind()));
                break;
            }
        }
    }
}

/// Sends committed transactions.
///
/// Every wake drains the whole outbound queue into one buffer handed to a
/// single `write_all`. `write_all` loops over short writes internally, but
/// the buffer as a whole is all-or-nothing from this task's point of view:
/// once it fails, the bytes it did not send are dropped and the connection
/// closes.
pub(crate) async fn write_task(shared: Arc<Shared>, mut writer: OwnedWriteHalf) {
    let _guard = shared.task_guard();
    let mut buf = Vec::new();

    loop {
        // Take the whole outbound queue, or stop once closing
        let ready = shared
            .outbound_ready
            .wait_until(|| {
                if shared.is_closing() {
                    return Some(false);
                }
                let mut outbound = lock(&shared.outbound);
                if outbound.queue.is_empty() {
                    return None;
                }
                buf.clear();
                outbound.queue.drain_into(&mut buf);
                outbound.in_flight = true;
                Some(true)
            })
            .await;
        if !ready {
            break;
        }

        // One send per drained buffer, a failure is never retried
        let res = select! {
            res = writer.write_all(&buf) => Some(res),
            _ = shared.token.cancelled() => None,
        };
        lock(&shared.outbound).in_flight = false;
        shared.flushed.notify_all();

        match res {
            None => break,
            Some(Ok(())) => {
                trace!(id = %shared.id, bytes = buf.len(), "sent batch");
                #[cfg(feature = "stats")]
                {
                    shared.stats.bytes_sent.fetch_add(buf.len(), Ordering::Relaxed);
                    shared.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Some(Err(e)) if is_remote_close(e.kind()) => {
                shared.close(CloseReason::Remote);
                break;
            }
            Some(Err(e)) => {
                warn!(id = %shared.id, error = %e, "send failed");
                shared.close(CloseReason::Fatal(e.kind()));
                break;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(id = %shared.id, error = %e, "socket shutdown failed");
    }
}

pub(crate) async fn notify_task(shared: Arc<Shared>) {
    enum Wake {
        Data(u64),
        Closed,
    }

    let _guard = shared.task_guard();
    let mut seen = 0;

    loop {
        let wake = shared
            .inbound_ready
            .wait_until(|| {
                if shared.is_closing() {
                    return Some(Wake::Closed);
                }
                shared.pending_batch(seen).map(Wake::Data)
            })
            .await;

        match wake {
            Wake::Data(batches) => {
                seen = batches;
                // Hold the notification until someone listens for it
                let callback = shared
                    .callback_set
                    .wait_until(|| {
                        if shared.is_closing() {
                            return Some(None);
                        }
                        shared.callback().map(Some)
                    })
                    .await;
                if let Some(callback) = callback {
                    callback(DataEvent::Readable);
                }
            }
            Wake::Closed => {
                let Some(reason) = shared.close_reason() else {
                    break;
                };
                let report = reason != CloseReason::Local || shared.has_pending_bytes();
                if let Some(callback) = shared.callback().filter(|_| report) {
                    callback(DataEvent::Closed(reason));
                }
                break;
            }
        }
    }
}
