use std::time::{Duration, Instant};

use clap::Parser;
use tcpline::DataEvent;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let Args { host, port, interval } = Args::parse();

    let connection = tcpline::builder()
        .connect_timeout(Duration::from_secs(5))
        .dial(&host, port)
        .await
        .unwrap();
    connection.set_data_available_callback(|event| {
        if let DataEvent::Closed(reason) = event {
            println!("Connection closed: {reason:?}");
        }
    });

    let mut interval = tokio::time::interval(Duration::from_secs_f32(interval));
    for counter in 0..=u32::MAX {
        interval.tick().await;

        let start = Instant::now();
        let mut tx = connection.begin_write().unwrap();
        tx.write_u32(counter).write_string("Hello, World!");
        let len = tx.len();
        if tx.end().is_err() {
            break;
        }

        if !connection.wait_for_readable(len).await {
            break;
        }
        let echoed = connection.read_u32().unwrap();
        let text = connection.read_string(len - 4).unwrap();
        println!("[{echoed:4}] {text} ({:?})", start.elapsed());
    }
}

#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value = "9999")]
    port: u16,
    #[arg(short, long, default_value = "1.0")]
    interval: f32,
}
