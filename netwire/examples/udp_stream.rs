//! UDP throughput streamer, server side.
//!
//! Counts sequenced datagrams from `udp_stream_client` and reports
//! bandwidth, loss, and reordering once per second from a periodic task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::Parser;
use netwire::{DataBuffer, ServerListener, Session, Task, TaskQueue, UdpServer};
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "UDP throughput streamer (server)")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Listen port
    #[arg(long, default_value_t = 9900)]
    port: u16,
}

#[derive(Default)]
struct StreamStats {
    bytes: AtomicU64,
    packets: AtomicU64,
    lost: AtomicU64,
    out_of_order: AtomicU64,
    last_seq: AtomicU64,
}

struct StreamListener {
    stats: Arc<StreamStats>,
}

impl ServerListener for StreamListener {
    fn on_accept(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "accepted");
    }

    fn on_receive(&self, _session: Arc<dyn Session>, buffer: DataBuffer) {
        let stats = &self.stats;
        stats.bytes.fetch_add(buffer.size() as u64, Ordering::Relaxed);
        stats.packets.fetch_add(1, Ordering::Relaxed);

        if buffer.size() >= 4 {
            let mut seq_bytes = [0u8; 4];
            seq_bytes.copy_from_slice(&buffer.data()[..4]);
            let seq = u32::from_be_bytes(seq_bytes) as u64;
            let last = stats.last_seq.swap(seq, Ordering::Relaxed);
            if last != 0 && seq != last + 1 {
                if seq > last + 1 {
                    stats.lost.fetch_add(seq - last - 1, Ordering::Relaxed);
                } else {
                    stats.out_of_order.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn on_close(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "closed");
    }

    fn on_error(&self, session: Arc<dyn Session>, reason: &str) {
        error!(peer = %session.client_info(), reason, "error");
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let stats = Arc::new(StreamStats::default());

    let server = UdpServer::with_addr(&args.ip, args.port);
    let listener: Arc<dyn ServerListener> = Arc::new(StreamListener {
        stats: stats.clone(),
    });
    server.set_listener(listener.clone());

    if !server.init() || !server.start() {
        error!("server startup failed");
        std::process::exit(1);
    }
    info!(ip = %args.ip, port = args.port, "stream server running");

    // Periodic report off the hot path.
    let reporter_queue = TaskQueue::new("StreamReport");
    reporter_queue.start().expect("failed to start report queue");
    let report = Arc::new(Task::periodic(
        move || {
            let bytes = stats.bytes.swap(0, Ordering::Relaxed);
            let packets = stats.packets.swap(0, Ordering::Relaxed);
            let lost = stats.lost.swap(0, Ordering::Relaxed);
            let out_of_order = stats.out_of_order.swap(0, Ordering::Relaxed);
            let mbps = bytes as f64 * 8.0 / 1024.0 / 1024.0;
            let loss_rate = if packets + lost > 0 {
                lost as f64 / (packets + lost) as f64 * 100.0
            } else {
                0.0
            };
            info!(
                "bandwidth: {mbps:.2} Mbps, packets: {packets}, loss: {loss_rate:.2}%, \
                 out-of-order: {out_of_order}"
            );
        },
        Duration::from_secs(1),
    ));
    reporter_queue
        .enqueue(report, false, Duration::from_secs(1))
        .expect("failed to schedule report task");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
