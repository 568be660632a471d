//! UDP throughput streamer, client side: paced sequenced datagrams.

use std::time::Duration;

use clap::Parser;
use netwire::UdpClient;
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "UDP throughput streamer (client)")]
struct Args {
    /// Server address
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Server port
    #[arg(long, default_value_t = 9900)]
    port: u16,

    /// Datagram payload size in bytes
    #[arg(long, default_value_t = 1200)]
    size: usize,

    /// Target send rate in megabits per second
    #[arg(long, default_value_t = 10)]
    mbps: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let size = args.size.max(4);

    let client = UdpClient::new(&args.ip, args.port);
    if !client.init() {
        error!("client init failed");
        std::process::exit(1);
    }

    let packets_per_sec = (args.mbps * 1024 * 1024 / 8) / size as u64;
    let interval = Duration::from_secs(1) / packets_per_sec.max(1) as u32;
    info!(
        ip = %args.ip,
        port = args.port,
        size,
        mbps = args.mbps,
        "streaming"
    );

    let mut payload = vec![0u8; size];
    let mut seq: u32 = 1;
    loop {
        payload[..4].copy_from_slice(&seq.to_be_bytes());
        if !client.send(&payload) {
            error!(seq, "send failed");
        }
        seq = seq.wrapping_add(1);
        std::thread::sleep(interval);
    }
}
