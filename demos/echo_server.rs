use clap::Parser;
use tcpline::{Connection, TcpServer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let Args { port, lag_ms } = Args::parse();

    let mut builder = tcpline::builder();
    if lag_ms > 0 {
        builder = builder.lag_emulation(std::time::Duration::from_millis(lag_ms));
    }
    let server = TcpServer::with_builder(builder);
    let addr = server.start_listening(port, echo).await.unwrap();
    println!("Echoing on {addr}, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.unwrap();
    server.stop_listening(addr.port()).await.unwrap();
}

fn echo(connection: Connection, port: u16) {
    println!("[{}] {}:{port} connected", connection.id(), connection.host());
    tokio::spawn(async move {
        while connection.wait_for_readable(1).await {
            let bytes = connection.read_bytes(connection.staged_len()).unwrap();
            let mut tx = connection.begin_write().unwrap();
            tx.write_bytes(&bytes);
            if tx.end().is_err() {
                break;
            }
        }
        println!("[{}] closed: {:?}", connection.id(), connection.close_reason());
    });
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(short, long, default_value = "9999")]
    port: u16,
    /// Delay applied to every received byte, in milliseconds.
    #[arg(short, long, default_value = "0")]
    lag_ms: u64,
}
