//! TCP echo server: mirrors every received chunk back to its session.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use netwire::{DataBuffer, ServerListener, Session, TcpServer};
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "TCP echo server")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    ip: String,

    /// Listen port
    #[arg(long, default_value_t = 7777)]
    port: u16,
}

struct EchoListener;

impl ServerListener for EchoListener {
    fn on_accept(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "accepted");
    }

    fn on_receive(&self, session: Arc<dyn Session>, buffer: DataBuffer) {
        info!(peer = %session.client_info(), len = buffer.size(), "echoing");
        if !session.send_buffer(buffer) {
            error!(peer = %session.client_info(), "echo send failed");
        }
    }

    fn on_close(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "closed");
    }

    fn on_error(&self, session: Arc<dyn Session>, reason: &str) {
        error!(peer = %session.client_info(), reason, "connection error");
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

    let server = TcpServer::with_addr(&args.ip, args.port);
    let listener: Arc<dyn ServerListener> = Arc::new(EchoListener);
    server.set_listener(listener.clone());

    if !server.init() {
        error!("server init failed");
        std::process::exit(1);
    }
    if !server.start() {
        error!("server start failed");
        std::process::exit(1);
    }
    info!(ip = %args.ip, port = args.port, "echo server running");

    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
