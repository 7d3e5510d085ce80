mod common;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use common::{dial_raw, eventually, init_logging, pair};
use rand::Rng;
use tcpline::{
    CloseReason, ConnectionManager, ConnectionState, DataEvent, DialError, ManagerError, ReadError, WriteError,
    builder,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preserves_byte_order_across_transactions() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    // Transactions of random sizes, each tagged with its sequence number
    const N: u32 = 10_000;
    let mut rng = rand::rng();
    let mut expected = Vec::new();
    for i in 0..N {
        let filler = vec![i as u8; rng.random_range(0..64)];
        let mut tx = connection.begin_write().unwrap();
        tx.write_u32(i).write_bytes(&filler);
        expected.extend_from_slice(&tx_bytes(i, &filler));
        tx.end().unwrap();
    }

    let mut received = vec![0u8; expected.len()];
    timeout(TIMEOUT, peer.read_exact(&mut received)).await.unwrap().unwrap();
    assert_eq!(received, expected);
}

fn tx_bytes(i: u32, filler: &[u8]) -> Vec<u8> {
    let mut bytes = i.to_le_bytes().to_vec();
    bytes.extend_from_slice(filler);
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn preserves_byte_order_on_receive() {
    init_logging();
    // A small receive buffer splits the stream into many batches
    let (connection, mut peer) = dial_raw(builder().recv_buffer_size(7)).await;

    let payload: Vec<u8> = (0..100_000).map(|_| rand::random()).collect();
    peer.write_all(&payload).await.unwrap();

    assert!(timeout(TIMEOUT, connection.wait_for_readable(payload.len())).await.unwrap());
    assert_eq!(connection.read_bytes(payload.len()).unwrap(), payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typed_values_are_little_endian() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    let mut tx = connection.begin_write().unwrap();
    tx.write_u8(0x01)
        .write_u16(0x0302)
        .write_u32(0x0706_0504)
        .write_i64(-2)
        .write_f32(1.0)
        .write_string("ok");
    tx.end().unwrap();

    let mut received = [0u8; 1 + 2 + 4 + 8 + 4 + 2];
    timeout(TIMEOUT, peer.read_exact(&mut received)).await.unwrap().unwrap();
    assert_eq!(&received[..7], &[1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(&received[7..15], &(-2i64).to_le_bytes());
    assert_eq!(&received[15..19], &[0x00, 0x00, 0x80, 0x3F]);
    assert_eq!(&received[19..], b"ok");

    // And back
    peer.write_all(&received).await.unwrap();
    assert!(connection.wait_for_readable(received.len()).await);
    assert_eq!(connection.read_u8().unwrap(), 0x01);
    assert_eq!(connection.read_u16().unwrap(), 0x0302);
    assert_eq!(connection.read_u32().unwrap(), 0x0706_0504);
    assert_eq!(connection.read_i64().unwrap(), -2);
    assert_eq!(connection.read_f32().unwrap(), 1.0);
    assert_eq!(connection.read_string(2).unwrap(), "ok");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_errors() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    assert_eq!(
        connection.read_u32(),
        Err(ReadError::NotEnoughData {
            requested: 4,
            staged: 0
        })
    );

    peer.write_all(&[0xFF, 0xFE, 0x41]).await.unwrap();
    assert!(connection.wait_for_readable(3).await);
    assert_eq!(
        connection.read_u64(),
        Err(ReadError::NotEnoughData {
            requested: 8,
            staged: 3
        })
    );
    assert_eq!(connection.staged_len(), 3, "a failed read consumes nothing");

    // Malformed UTF-8 is consumed anyway
    assert_eq!(connection.read_string(2), Err(ReadError::InvalidUtf8));
    assert_eq!(connection.read_i8().unwrap(), 0x41);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_write_transaction() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;
    let connection = Arc::new(connection);

    let mut tx = connection.begin_write().unwrap();
    tx.write_string("first");

    // Any other writer is turned away while the transaction is open
    let other = std::thread::spawn({
        let connection = connection.clone();
        move || connection.begin_write().err()
    });
    assert_eq!(other.join().unwrap(), Some(WriteError::WriteInProgress));
    assert!(matches!(connection.begin_write(), Err(WriteError::WriteInProgress)));

    tx.end().unwrap();

    let mut tx = connection.begin_write().unwrap();
    tx.write_string("second");
    tx.end().unwrap();

    let mut received = [0u8; 11];
    timeout(TIMEOUT, peer.read_exact(&mut received)).await.unwrap().unwrap();
    assert_eq!(&received, b"firstsecond");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abandoned_transaction_sends_nothing() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    {
        let mut tx = connection.begin_write().unwrap();
        tx.write_string("dropped");
    }
    let mut tx = connection.begin_write().unwrap();
    tx.write_string("kept");
    tx.end().unwrap();
    connection.wait_until_flushed().await;
    connection.close();

    let mut received = Vec::new();
    timeout(TIMEOUT, peer.read_to_end(&mut received)).await.unwrap().unwrap();
    assert_eq!(received, b"kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_until_flushed() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    let payload = vec![0xA5u8; 4 * 1024 * 1024];
    let reader = tokio::spawn(async move {
        let mut received = vec![0u8; 4 * 1024 * 1024];
        peer.read_exact(&mut received).await.unwrap();
        received
    });

    let mut tx = connection.begin_write().unwrap();
    tx.write_bytes(&payload);
    tx.end().unwrap();

    timeout(TIMEOUT, connection.wait_until_flushed()).await.unwrap();
    assert_eq!(timeout(TIMEOUT, reader).await.unwrap().unwrap(), payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_close() {
    init_logging();
    let (connection, peer) = dial_raw(builder()).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    connection.set_data_available_callback({
        let events = events.clone();
        move |event| events.lock().unwrap().push(event)
    });

    drop(peer);

    assert!(!timeout(TIMEOUT, connection.wait_for_readable(1)).await.unwrap());
    assert!(connection.is_closed());
    assert_eq!(connection.close_reason(), Some(CloseReason::Remote));
    eventually("the closed event", || !events.lock().unwrap().is_empty()).await;

    // Only one close notification, ever
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*events.lock().unwrap(), [DataEvent::Closed(CloseReason::Remote)]);

    // Writing to a closed connection fails
    let mut tx = connection.begin_write().unwrap();
    tx.write_u8(1);
    assert_eq!(tx.end(), Err(WriteError::Closed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bytes_before_remote_close_stay_readable() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    peer.write_all(b"last words").await.unwrap();
    drop(peer);

    eventually("the remote close", || connection.is_closed()).await;
    assert!(connection.wait_for_readable(10).await);
    assert_eq!(connection.read_string(10).unwrap(), "last words");
    assert!(!connection.wait_for_readable(1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_close() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    let closed = Arc::new(AtomicUsize::new(0));
    connection.set_data_available_callback({
        let closed = closed.clone();
        move |event| {
            if let DataEvent::Closed(_) = event {
                closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    assert!(connection.wait_for_readable(0).await);
    connection.close();
    connection.close();
    assert_eq!(connection.close_reason(), Some(CloseReason::Local));
    assert!(!connection.wait_for_readable(1).await);

    // The peer sees an orderly shutdown
    let mut buf = [0u8; 1];
    assert_eq!(timeout(TIMEOUT, peer.read(&mut buf)).await.unwrap().unwrap(), 0);

    eventually("the tasks to exit", || connection.state() == ConnectionState::Closed).await;
    // A local close with nothing left to read is not reported
    assert_eq!(closed.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_close() {
    init_logging();
    let manager = ConnectionManager::new();
    let (connection, _peer) = dial_raw(builder().manager(manager.clone())).await;
    let connection = Arc::new(connection);
    assert_eq!(manager.live_count(), 1);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let connection = connection.clone();
            std::thread::spawn(move || connection.close())
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(manager.live_count(), 0);
    eventually("the reaper", || manager.pending_removal_count() == 0).await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    drop(connection);
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaper_destroys_every_connection() {
    init_logging();
    const N: usize = 50;
    let manager = ConnectionManager::new();

    let mut connections = Vec::new();
    for _ in 0..N {
        connections.push(pair(builder().manager(manager.clone())).await);
    }
    assert_eq!(manager.live_count(), 2 * N);

    for (client, server) in &connections {
        client.close();
        server.close();
    }
    assert_eq!(manager.live_count(), 0);
    eventually("the reaper", || manager.pending_removal_count() == 0).await;

    for (client, server) in &connections {
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(server.state(), ConnectionState::Closed);
    }
    drop(connections);
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn drop_closes() {
    init_logging();
    let manager = ConnectionManager::new();
    let (client, server) = pair(builder().manager(manager.clone())).await;

    drop(client);
    assert!(!timeout(TIMEOUT, server.wait_for_readable(1)).await.unwrap());
    assert_eq!(server.close_reason(), Some(CloseReason::Remote));

    drop(server);
    eventually("the reaper", || manager.pending_removal_count() == 0).await;
    assert_eq!(manager.live_count(), 0);
    manager.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lag_emulation_delays_reads() {
    init_logging();
    const LAG: Duration = Duration::from_millis(100);
    let (connection, mut peer) = dial_raw(builder()).await;
    connection.enable_lag_emulation(LAG);

    let start = Instant::now();
    peer.write_all(b"delayed").await.unwrap();
    assert!(timeout(TIMEOUT, connection.wait_for_readable(7)).await.unwrap());
    assert!(start.elapsed() >= LAG, "bytes were readable after {:?}", start.elapsed());
    assert_eq!(connection.read_string(7).unwrap(), "delayed");

    connection.disable_lag_emulation();
    let start = Instant::now();
    peer.write_all(b"now").await.unwrap();
    assert!(timeout(TIMEOUT, connection.wait_for_readable(3)).await.unwrap());
    assert!(start.elapsed() < LAG);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lag_is_ignored_once_closed() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder().lag_emulation(Duration::from_secs(60))).await;

    peer.write_all(b"held").await.unwrap();
    drop(peer);

    assert!(timeout(TIMEOUT, connection.wait_for_readable(4)).await.unwrap());
    assert_eq!(connection.read_string(4).unwrap(), "held");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readable_callback() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    connection.set_data_available_callback(move |event| {
        let _ = sender.send(event);
    });

    peer.write_all(b"x").await.unwrap();
    let event = timeout(TIMEOUT, receiver.recv()).await.unwrap();
    assert_eq!(event, Some(DataEvent::Readable));

    assert!(connection.wait_for_readable(1).await);
    assert_eq!(connection.read_u8().unwrap(), b'x');
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_callback_gets_pending_notification() {
    init_logging();
    let (connection, mut peer) = dial_raw(builder()).await;

    peer.write_all(b"early").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    connection.set_data_available_callback(move |event| {
        let _ = sender.send(event);
    });
    let event = timeout(TIMEOUT, receiver.recv()).await.unwrap();
    assert_eq!(event, Some(DataEvent::Readable));

    connection.clear_data_available_callback();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dial_errors() {
    init_logging();

    // Nothing listens on a port that was just released
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let res = tcpline::Connection::dial("127.0.0.1", port).await;
    assert!(matches!(res, Err(DialError::Connect { .. })), "{res:?}");

    let res = tcpline::Connection::dial("host.invalid", 80).await;
    assert!(matches!(res, Err(DialError::Resolution { .. })), "{res:?}");

    let manager = ConnectionManager::new();
    manager.shutdown();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let res = builder().manager(manager).dial("127.0.0.1", port).await;
    assert!(
        matches!(res, Err(DialError::Registry(ManagerError::ShutDown))),
        "{res:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identity() {
    init_logging();
    let (client, server) = pair(builder()).await;

    assert_ne!(client.id(), server.id());
    assert_eq!(client.host(), "127.0.0.1");
    assert_eq!(server.host(), "127.0.0.1");
    assert_eq!(client.port(), server.port());
    assert_eq!(client.peer_addr().map(|addr| addr.port()), Some(client.port()));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.close_reason(), None);
}

#[cfg(feature = "stats")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stats() {
    init_logging();
    let (client, server) = pair(builder()).await;

    let mut tx = client.begin_write().unwrap();
    tx.write_bytes(&[0u8; 100]);
    tx.end().unwrap();
    client.wait_until_flushed().await;

    assert!(server.wait_for_readable(100).await);
    assert_eq!(client.stats().bytes_sent, 100);
    assert_eq!(client.stats().batches_sent, 1);
    assert_eq!(server.stats().bytes_received, 100);
    assert!(server.stats().batches_received >= 1);
}

#[test]
fn dropping_last_manager_handle_does_not_block() {
    init_logging();
    let (done, finished) = std::sync::mpsc::channel();

    // The connection holds the last handle of its manager and is dropped on
    // a single-threaded runtime, the one running its tasks
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();

            let manager = ConnectionManager::new();
            let connection = builder().manager(manager.clone()).dial("127.0.0.1", port).await.unwrap();
            let (mut peer, _) = listener.accept().await.unwrap();

            drop(manager);
            drop(connection);

            // The runtime keeps going and the socket gets released
            let mut buf = [0u8; 1];
            let read = timeout(TIMEOUT, peer.read(&mut buf)).await.unwrap().unwrap();
            assert_eq!(read, 0);
        });
        let _ = done.send(());
    });

    finished
        .recv_timeout(Duration::from_secs(10))
        .expect("dropping the connection blocked its runtime");
}
