//! Tcpline: an asynchronous TCP connection engine with per-connection
//! reader, writer and notifier tasks and deferred destruction.
//!
//! Every [`Connection`] runs three background tasks on the tokio runtime and
//! exposes a small, transaction-oriented API on top of them. Reading never
//! touches the socket directly: the reader task receives bytes into an
//! inbound queue, [`wait_for_readable()`](Connection::wait_for_readable)
//! promotes them into a staging queue, and the typed `read_*` accessors
//! consume the staging queue. Writing works the other way around: a
//! [`PendingWrite`] transaction collects bytes, commits them in one piece to
//! an outbound queue, and the writer task sends them.
//!
//! # Overview
//!
//! ```text
//!                    APPLICATION
//!   begin_write()/end()         wait_for_readable()/read_*()     callback
//!          │                              ▲                         ▲
//!          ▼                              │                         │
//!   ┌────────────┐               ┌──────────────┐                   │
//!   │  outbound  │               │   staging    │                   │
//!   └─────┬──────┘               └──────▲───────┘                   │
//!         │                             │ promotion (lag aware)     │
//!         │                      ┌──────┴───────┐            ┌──────┴─────┐
//!         │                      │   inbound    ├───────────►│  notifier  │
//!         │                      └──────▲───────┘  batches   └────────────┘
//!   ┌─────▼──────┐               ┌──────┴───────┐
//!   │   writer   │               │    reader    │
//!   └─────┬──────┘               └──────▲───────┘
//!         ▼                             │
//!   ~~~~~~~~~~~~~~~~~~~~~~~~~~ SOCKET ~~~~~~~~~~~~~~~~~~~~~~~~~~
//! ```
//!
//! # Features
//!
//! - **Write transactions**: bytes of one transaction reach the wire
//!   contiguously, transactions in commit order (see [`PendingWrite`])
//! - **Typed accessors**: fixed-width little-endian integers and floats, raw
//!   bytes and UTF-8 strings, with no framing on the wire
//! - **Data-available callback**: one [`DataEvent::Readable`] per received
//!   batch and at most one [`DataEvent::Closed`]
//! - **Lag emulation**: hold received bytes back for a configurable delay to
//!   test latency-sensitive code (see [`Connection::enable_lag_emulation()`])
//! - **Deferred destruction**: closed connections are torn down by the
//!   [`ConnectionManager`] reaper thread, never by the code closing them
//! - **Server side**: [`TcpServer`] accepts connections on any number of ports
//!
//! # Quick Start
//!
//! ```no_run
//! use tcpline::{Connection, DataEvent, TcpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Echo "PING" back as "PONG"
//!     let server = TcpServer::new();
//!     let addr = server
//!         .start_listening(0, |connection, _port| {
//!             tokio::spawn(async move {
//!                 while connection.wait_for_readable(4).await {
//!                     let _ping = connection.read_string(4);
//!                     let Ok(mut tx) = connection.begin_write() else { break };
//!                     tx.write_string("PONG");
//!                     if tx.end().is_err() {
//!                         break;
//!                     }
//!                 }
//!             });
//!         })
//!         .await?;
//!
//!     let connection = Connection::dial("127.0.0.1", addr.port()).await?;
//!     connection.set_data_available_callback(|event| {
//!         if let DataEvent::Closed(reason) = event {
//!             println!("closed: {reason:?}");
//!         }
//!     });
//!
//!     let mut tx = connection.begin_write()?;
//!     tx.write_string("PING");
//!     tx.end()?;
//!
//!     if connection.wait_for_readable(4).await {
//!         assert_eq!(connection.read_string(4)?, "PONG");
//!     }
//!     connection.close();
//!     Ok(())
//! }
//! ```
//!
//! # Closing and destruction
//!
//! [`Connection::close()`] is synchronous and idempotent, and is also what
//! dropping a connection does. It stops the three tasks promptly and moves
//! the connection to its manager's removal queue; the reaper thread then
//! waits for the tasks to exit and releases the socket. A connection closed
//! by the peer stays readable until its owner closes it.
//!
//! # Feature flags
//!
//! - `stats`: per-connection traffic counters, see `Connection::stats()`
mod buffers;
mod codec;
mod connection;
mod manager;
mod server;
mod sync;

pub use buffers::{ByteQueue, StreamBuffer, StreamError, StreamReader, StreamWriter, stream::Producer};
#[cfg(feature = "stats")]
pub use connection::ConnectionStats;
pub use connection::{
    CloseReason, Connection, ConnectionBuilder, ConnectionId, ConnectionState, DataEvent, DialError, PendingWrite,
    ReadError, WriteError, builder,
};
pub use manager::{ConnectionManager, ManagerError};
pub use server::{ServerError, TcpServer};
