//! UDP server endpoint.
//!
//! Datagram peers have no connection lifetime, so a fresh session is
//! synthesized from the source address of each datagram and the listener is
//! invoked synchronously on the reactor thread. Sends are a single `sendto`;
//! there is no send queue to drain.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::listener::ServerListener;
use crate::reactor::{EventHandler, EventReactor};
use crate::session::{ServerSession, Session, SessionBackend};
use crate::socket::{self, INVALID_SOCKET};

/// A UDP server endpoint delivering [`ServerListener`] callbacks with
/// per-datagram sessions.
pub struct UdpServer {
    inner: Arc<UdpServerInner>,
}

impl UdpServer {
    /// Bind all interfaces.
    pub fn new(local_port: u16) -> Self {
        Self::with_addr("0.0.0.0", local_port)
    }

    pub fn with_addr(local_ip: &str, local_port: u16) -> Self {
        UdpServer {
            inner: Arc::new(UdpServerInner {
                local_ip: local_ip.to_string(),
                local_port,
                socket: Mutex::new(None),
                handler: Mutex::new(None),
                recv_buffer: Mutex::new(DataBuffer::pool_alloc(POOL_BLOCK_SIZE)),
                listener: RwLock::new(None),
            }),
        }
    }

    pub fn init(&self) -> bool {
        let inner = &self.inner;
        let ip = match socket::parse_ipv4(&inner.local_ip) {
            Ok(ip) => ip,
            Err(e) => {
                error!(error = %e, "udp server init failed");
                return false;
            }
        };
        let addr = SocketAddrV4::new(ip, inner.local_port);

        match socket::udp_socket(Some(addr)) {
            Ok(udp_socket) => {
                debug!(fd = udp_socket.as_raw_fd(), %addr, "udp server initialized");
                *inner.socket.lock() = Some(udp_socket);
                true
            }
            Err(e) => {
                error!(error = %e, %addr, "failed to create udp socket");
                false
            }
        }
    }

    /// Idempotent.
    pub fn start(&self) -> bool {
        let fd = self.socket_fd();
        if fd == INVALID_SOCKET {
            warn!("socket not initialized");
            return false;
        }
        if self.inner.handler.lock().is_some() {
            debug!("already started, ignoring");
            return true;
        }

        let handler = Arc::new(UdpServerHandler {
            fd,
            server: Arc::downgrade(&self.inner),
        });
        if !EventReactor::instance().register(handler.clone()) {
            error!(fd, "failed to register udp server handler");
            return false;
        }
        *self.inner.handler.lock() = Some(handler);
        true
    }

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

    /// Send one datagram to a peer address.
    pub fn send_to(&self, host: &str, port: u16, data: &[u8]) -> bool {
        if data.is_empty() {
            debug!("rejecting empty send");
            return false;
        }
        self.inner.send_datagram(host, port, data)
    }

    pub fn socket_fd(&self) -> RawFd {
        self.inner
            .socket
            .lock()
            .as_ref()
            .map(|s| s.as_raw_fd())
            .unwrap_or(INVALID_SOCKET)
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

struct UdpServerInner {
    local_ip: String,
    local_port: u16,
    socket: Mutex<Option<Socket>>,
    handler: Mutex<Option<Arc<UdpServerHandler>>>,
    recv_buffer: Mutex<DataBuffer>,
    listener: RwLock<Option<Weak<dyn ServerListener>>>,
}

impl UdpServerInner {
    fn stop(&self) {
        if let Some(handler) = self.handler.lock().take() {
            EventReactor::instance().remove(handler.fd);
        }
        *self.socket.lock() = None;
    }

    fn handle_receive(self: &Arc<Self>, fd: RawFd) {
        let listener = self.listener.read().clone();
        let mut recv_buffer = self.recv_buffer.lock();
        if recv_buffer.size() < POOL_BLOCK_SIZE {
            recv_buffer.set_size(POOL_BLOCK_SIZE);
        }

        loop {
            match socket::recv_from_nonblocking(fd, recv_buffer.data_mut()) {
                Ok((0, _)) => continue,
                Ok((n, peer)) => {
                    let Some(listener) = listener.as_ref().and_then(|weak| weak.upgrade()) else {
                        continue;
                    };
                    let session: Arc<dyn Session> = Arc::new(ServerSession::new(
                        fd,
                        peer.ip().to_string(),
                        peer.port(),
                        Arc::downgrade(self),
                    ));
                    let mut buffer = DataBuffer::pool_alloc(n);
                    buffer.assign(&recv_buffer.data()[..n]);
                    // Sessions are per-datagram, so the listener runs right
                    // here on the reactor thread.
                    listener.on_receive(session, buffer);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(fd, error = %e, "recvfrom failed");
                    break;
                }
            }
        }
    }

    fn send_datagram(&self, host: &str, port: u16, data: &[u8]) -> bool {
        let ip: Ipv4Addr = match host.parse() {
            Ok(ip) => ip,
            Err(_) => {
                error!(host, "invalid peer address");
                return false;
            }
        };

        let guard = self.socket.lock();
        let Some(udp_socket) = guard.as_ref() else {
            warn!("socket not initialized");
            return false;
        };

        match socket::send_to(udp_socket.as_raw_fd(), data, SocketAddrV4::new(ip, port)) {
            Ok(n) if n == data.len() => true,
            Ok(n) => {
                warn!(sent = n, len = data.len(), "partial datagram send");
                false
            }
            Err(e) => {
                error!(error = %e, "sendto failed");
                false
            }
        }
    }
}

impl SessionBackend for UdpServerInner {
    fn session_send(&self, _fd: RawFd, host: &str, port: u16, buffer: DataBuffer) -> bool {
        self.send_datagram(host, port, buffer.data())
    }
}

struct UdpServerHandler {
    fd: RawFd,
    server: Weak<UdpServerInner>,
}

impl EventHandler for UdpServerHandler {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn on_read(&self, fd: RawFd) {
        if let Some(server) = self.server.upgrade() {
            server.handle_receive(fd);
        }
    }

    fn on_error(&self, fd: RawFd) {
        error!(fd, "udp server socket error");
    }

    fn on_close(&self, fd: RawFd) {
        debug!(fd, "udp server socket closed");
    }
}
