#![allow(dead_code)]

use std::{sync::Once, time::Duration};

use tcpline::{Connection, ConnectionBuilder};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber once per test binary. Set `RUST_LOG` to see
/// the library logs.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Dials a plain tokio listener and returns the connection together with
/// the raw peer socket.
pub async fn dial_raw(builder: ConnectionBuilder) -> (Connection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let connection = builder.dial("127.0.0.1", port).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();
    (connection, peer)
}

/// Returns two connections talking to each other: the dialing side and the
/// accepted side.
pub async fn pair(builder: ConnectionBuilder) -> (Connection, Connection) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = builder.dial("127.0.0.1", port).await.unwrap();
    let (stream, _) = listener.accept().await.unwrap();
    let server = builder.accepted_from(stream, port);
    (client, server)
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
