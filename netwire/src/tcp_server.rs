//! TCP server endpoint: listener plus accepted-connection management.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::conn::{DrainOutcome, StreamConnectionHandler, StreamEndpoint, drain_stream};
use crate::listener::ServerListener;
use crate::reactor::{EventHandler, EventReactor};
use crate::session::{ServerSession, Session, SessionBackend};
use crate::socket::{self, INVALID_SOCKET};
use crate::task_queue::TaskQueue;

const TCP_BACKLOG: i32 = 10;

/// A TCP listening endpoint delivering [`ServerListener`] callbacks.
pub struct TcpServer {
    inner: Arc<TcpServerInner>,
}

impl TcpServer {
    /// Listen on all interfaces.
    pub fn new(local_port: u16) -> Self {
        Self::with_addr("0.0.0.0", local_port)
    }

    /// Listen on a specific numeric IPv4 address.
    pub fn with_addr(local_ip: &str, local_port: u16) -> Self {
        TcpServer {
            inner: Arc::new(TcpServerInner {
                local_ip: local_ip.to_string(),
                local_port,
                listen_socket: Mutex::new(None),
                accept_handler: Mutex::new(None),
                connections: Mutex::new(HashMap::default()),
                sessions: Mutex::new(HashMap::default()),
                recv_buffer: Mutex::new(DataBuffer::pool_alloc(POOL_BLOCK_SIZE)),
                task_queue: TaskQueue::new("TcpServerCb"),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Create the listening socket. The endpoint must be discarded if this
    /// fails.
    pub fn init(&self) -> bool {
        let inner = &self.inner;
        let ip = match socket::parse_ipv4(&inner.local_ip) {
            Ok(ip) => ip,
            Err(e) => {
                error!(error = %e, "tcp server init failed");
                return false;
            }
        };
        let addr = SocketAddrV4::new(ip, inner.local_port);

        match socket::tcp_listener(addr, TCP_BACKLOG) {
            Ok(listen_socket) => {
                debug!(fd = listen_socket.as_raw_fd(), %addr, "tcp server initialized");
                *inner.listen_socket.lock() = Some(listen_socket);
                true
            }
            Err(e) => {
                error!(error = %e, %addr, "failed to create tcp listener");
                false
            }
        }
    }

    /// Start the callback queue and register the accept handler.
    /// Idempotent.
    pub fn start(&self) -> bool {
        let fd = self.socket_fd();
        if fd == INVALID_SOCKET {
            warn!("socket not initialized");
            return false;
        }
        if self.inner.accept_handler.lock().is_some() {
            debug!("already started, ignoring");
            return true;
        }

        if self.inner.task_queue.start().is_err() {
            error!("failed to start callback queue");
            return false;
        }

        let handler = Arc::new(TcpAcceptHandler {
            fd,
            server: Arc::downgrade(&self.inner),
        });
        if !EventReactor::instance().register(handler.clone()) {
            error!(fd, "failed to register server handler");
            return false;
        }
        *self.inner.accept_handler.lock() = Some(handler);
        true
    }

    /// Tear down every connection, the listener, and the callback queue.
    pub fn stop(&self) -> bool {
        self.inner.stop();
        true
    }

    pub fn close(&self) {
        self.inner.stop();
    }

    pub fn set_listener(&self, listener: Arc<dyn ServerListener>) {
        *self.inner.listener.write() = Some(Arc::downgrade(&listener));
    }

    /// Queue bytes for transmission on one accepted connection.
    pub fn send(&self, fd: RawFd, data: &[u8]) -> bool {
        if data.is_empty() {
            debug!("rejecting empty send");
            return false;
        }
        let mut buffer = DataBuffer::pool_alloc(data.len());
        buffer.assign(data);
        self.send_buffer(fd, buffer)
    }

    pub fn send_buffer(&self, fd: RawFd, buffer: DataBuffer) -> bool {
        self.inner.queue_to_connection(fd, buffer)
    }

    pub fn socket_fd(&self) -> RawFd {
        self.inner
            .listen_socket
            .lock()
            .as_ref()
            .map(|s| s.as_raw_fd())
            .unwrap_or(INVALID_SOCKET)
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

struct TcpServerInner {
    local_ip: String,
    local_port: u16,
    listen_socket: Mutex<Option<Socket>>,
    accept_handler: Mutex<Option<Arc<TcpAcceptHandler>>>,
    connections: Mutex<HashMap<RawFd, Arc<StreamConnectionHandler<TcpServerInner>>, RandomState>>,
    sessions: Mutex<HashMap<RawFd, Arc<dyn Session>, RandomState>>,
    recv_buffer: Mutex<DataBuffer>,
    task_queue: TaskQueue,
    listener: RwLock<Option<Weak<dyn ServerListener>>>,
}

impl TcpServerInner {
    fn stop(&self) {
        let reactor = EventReactor::instance();

        let fds: Vec<RawFd> = self.sessions.lock().keys().copied().collect();
        for fd in fds {
            debug!(fd, "closing client connection");
            reactor.remove(fd);
            self.connections.lock().remove(&fd);
        }
        self.sessions.lock().clear();

        if let Some(handler) = self.accept_handler.lock().take() {
            debug!(fd = handler.fd, "closing listen socket");
            reactor.remove(handler.fd);
        }
        *self.listen_socket.lock() = None;

        self.task_queue.stop();
    }

    fn handle_accept(self: &Arc<Self>) {
        loop {
            let accepted = {
                let guard = self.listen_socket.lock();
                let Some(listen_socket) = guard.as_ref() else {
                    return;
                };
                listen_socket.accept()
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        error!(error = %e, "failed to set accepted socket non-blocking");
                        continue;
                    }
                    if let Err(e) = socket::enable_keepalive(&stream) {
                        debug!(error = %e, "keepalive setup failed");
                    }

                    let (host, port) = match peer.as_socket_ipv4() {
                        Some(addr) => (addr.ip().to_string(), addr.port()),
                        None => ("unknown".to_string(), 0),
                    };
                    let fd = stream.as_raw_fd();

                    let handler =
                        Arc::new(StreamConnectionHandler::new(stream, Arc::downgrade(self)));
                    if !EventReactor::instance().register(handler.clone()) {
                        error!(fd, "failed to register connection handler");
                        continue;
                    }
                    self.connections.lock().insert(fd, handler);

                    let session: Arc<dyn Session> = Arc::new(ServerSession::new(
                        fd,
                        host.clone(),
                        port,
                        Arc::downgrade(self),
                    ));
                    self.sessions.lock().insert(fd, session.clone());
                    debug!(fd, %host, port, "accepted connection");

                    self.notify_accept(session);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn notify_accept(&self, session: Arc<dyn Session>) {
        let Some(listener) = self.listener.read().clone() else {
            debug!("no listener set");
            return;
        };
        self.task_queue.post(move || {
            if let Some(listener) = listener.upgrade() {
                listener.on_accept(session);
            }
        });
    }

    fn deliver_receive(&self, fd: RawFd, buffer: DataBuffer) {
        let Some(listener) = self.listener.read().clone() else {
            return;
        };
        let Some(session) = self.sessions.lock().get(&fd).cloned() else {
            return;
        };
        self.task_queue.post(move || {
            if let Some(listener) = listener.upgrade() {
                listener.on_receive(session, buffer);
            }
        });
    }

    fn queue_to_connection(&self, fd: RawFd, buffer: DataBuffer) -> bool {
        if buffer.is_empty() {
            return false;
        }
        if !self.sessions.lock().contains_key(&fd) {
            debug!(fd, "no session for descriptor");
            return false;
        }
        match self.connections.lock().get(&fd).cloned() {
            Some(handler) => handler.queue_send(buffer),
            None => {
                error!(fd, "connection handler not found");
                false
            }
        }
    }

    /// Unified teardown for peer close and fatal errors.
    fn handle_connection_close(&self, fd: RawFd, is_error: bool, reason: &str) {
        let Some(session) = self.sessions.lock().remove(&fd) else {
            debug!(fd, "connection already cleaned up");
            return;
        };
        debug!(fd, reason, is_error, "closing connection");

        EventReactor::instance().remove(fd);
        // Dropping the handler closes the descriptor.
        self.connections.lock().remove(&fd);

        let Some(listener) = self.listener.read().clone() else {
            return;
        };
        let reason = reason.to_string();
        self.task_queue.post(move || {
            let Some(listener) = listener.upgrade() else {
                return;
            };
            if is_error {
                listener.on_error(session, &reason);
            } else {
                listener.on_close(session);
            }
        });
    }
}

impl StreamEndpoint for TcpServerInner {
    fn handle_receive(&self, fd: RawFd) {
        let outcome = {
            let mut recv_buffer = self.recv_buffer.lock();
            drain_stream(fd, &mut recv_buffer, |chunk| self.deliver_receive(fd, chunk))
        };
        match outcome {
            DrainOutcome::Drained => {}
            DrainOutcome::PeerClosed => debug!(fd, "peer closed, waiting for close event"),
            DrainOutcome::Failed(reason) => {
                error!(fd, %reason, "recv failed");
                self.handle_connection_close(fd, true, &reason);
            }
        }
    }

    fn handle_stream_close(&self, fd: RawFd, is_error: bool, reason: &str) {
        self.handle_connection_close(fd, is_error, reason);
    }
}

impl SessionBackend for TcpServerInner {
    fn session_send(&self, fd: RawFd, _host: &str, _port: u16, buffer: DataBuffer) -> bool {
        self.queue_to_connection(fd, buffer)
    }
}

struct TcpAcceptHandler {
    fd: RawFd,
    server: Weak<TcpServerInner>,
}

impl EventHandler for TcpAcceptHandler {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn on_read(&self, _fd: RawFd) {
        if let Some(server) = self.server.upgrade() {
            server.handle_accept();
        }
    }

    fn on_error(&self, fd: RawFd) {
        error!(fd, "listen socket error");
    }

    fn on_close(&self, fd: RawFd) {
        debug!(fd, "listen socket closed");
    }
}
