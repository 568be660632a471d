//! Local-domain echo round trip: server and client in one process.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use netwire::{ClientListener, DataBuffer, ServerListener, Session, UnixClient, UnixServer};
use tracing::{error, info};

#[derive(Parser)]
#[command(about = "Unix-domain echo round trip")]
struct Args {
    /// Socket path
    #[arg(long, default_value = "/tmp/netwire_echo.sock")]
    path: String,

    /// Message to send
    #[arg(long, default_value = "hello unix")]
    message: String,
}

struct EchoServer;

impl ServerListener for EchoServer {
    fn on_accept(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "server: accepted");
    }

    fn on_receive(&self, session: Arc<dyn Session>, buffer: DataBuffer) {
        info!(len = buffer.size(), "server: echoing");
        session.send_buffer(buffer);
    }

    fn on_close(&self, session: Arc<dyn Session>) {
        info!(peer = %session.client_info(), "server: closed");
    }

    fn on_error(&self, _session: Arc<dyn Session>, reason: &str) {
        error!(reason, "server: error");
    }
}

struct EchoClient {
    done: mpsc::Sender<Vec<u8>>,
}

impl ClientListener for EchoClient {
    fn on_receive(&self, _fd: RawFd, buffer: DataBuffer) {
        let _ = self.done.send(buffer.data().to_vec());
    }

    fn on_close(&self, fd: RawFd) {
        info!(fd, "client: closed");
    }

    fn on_error(&self, fd: RawFd, reason: &str) {
        error!(fd, reason, "client: error");
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

    let server = UnixServer::new(&args.path);
    let server_listener: Arc<dyn ServerListener> = Arc::new(EchoServer);
    server.set_listener(server_listener.clone());
    if !server.init() || !server.start() {
        error!("server startup failed");
        std::process::exit(1);
    }

    let (done_tx, done_rx) = mpsc::channel();
    let client = UnixClient::new(&args.path);
    let client_listener: Arc<dyn ClientListener> = Arc::new(EchoClient { done: done_tx });
    client.set_listener(client_listener.clone());
    if !client.init() || !client.connect() {
        error!("client startup failed");
        std::process::exit(1);
    }

    client.send_str(&args.message);
    match done_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(echoed) => info!(echoed = %String::from_utf8_lossy(&echoed), "round trip complete"),
        Err(_) => error!("timed out waiting for echo"),
    }

    client.close();
    server.stop();
}
