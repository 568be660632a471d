//! UDP client endpoint.
//!
//! Datagram sends go straight to the kernel; receives drain on the reactor
//! thread and are marshalled through the client's task queue.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::error::Error;
use crate::listener::ClientListener;
use crate::reactor::{EventHandler, EventReactor};
use crate::socket::{self, INVALID_SOCKET};
use crate::task_queue::TaskQueue;

/// A UDP client endpoint bound to one remote address.
pub struct UdpClient {
    inner: Arc<UdpClientInner>,
}

impl UdpClient {
    pub fn new(remote_ip: &str, remote_port: u16) -> Self {
        Self::with_local(remote_ip, remote_port, "", 0)
    }

    pub fn with_local(remote_ip: &str, remote_port: u16, local_ip: &str, local_port: u16) -> Self {
        UdpClient {
            inner: Arc::new(UdpClientInner {
                remote_ip: remote_ip.to_string(),
                remote_port,
                local_ip: local_ip.to_string(),
                local_port,
                remote: Mutex::new(None),
                socket: Mutex::new(None),
                handler: Mutex::new(None),
                recv_buffer: Mutex::new(DataBuffer::pool_alloc(POOL_BLOCK_SIZE)),
                task_queue: TaskQueue::new("UdpClientCb"),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Create the socket, bind the optional local address, start the
    /// callback queue and register with the reactor.
    pub fn init(&self) -> bool {
        let inner = &self.inner;

        let remote_ip = if inner.remote_ip.is_empty() {
            "127.0.0.1"
        } else {
            &inner.remote_ip
        };
        let remote = match socket::parse_ipv4(remote_ip) {
            Ok(ip) => SocketAddrV4::new(ip, inner.remote_port),
            Err(e) => {
                error!(error = %e, "udp client init failed");
                return false;
            }
        };

        let local = match inner.local_addr() {
            Ok(local) => local,
            Err(e) => {
                error!(error = %e, "udp client init failed");
                return false;
            }
        };

        let udp_socket = match socket::udp_socket(local) {
            Ok(udp_socket) => udp_socket,
            Err(e) => {
                error!(error = %e, "failed to create udp socket");
                return false;
            }
        };
        let fd = udp_socket.as_raw_fd();

        if inner.task_queue.start().is_err() {
            error!("failed to start callback queue");
            return false;
        }

        *inner.remote.lock() = Some(remote);
        *inner.socket.lock() = Some(udp_socket);

        let handler = Arc::new(UdpClientHandler {
            fd,
            client: Arc::downgrade(inner),
        });
        if !EventReactor::instance().register(handler.clone()) {
            error!(fd, "failed to register udp client handler");
            *inner.socket.lock() = None;
            return false;
        }
        *inner.handler.lock() = Some(handler);

        debug!(fd, %remote, "udp client initialized");
        true
    }

    pub fn set_listener(&self, listener: Arc<dyn ClientListener>) {
        *self.inner.listener.write() = Some(Arc::downgrade(&listener));
    }

    /// Send one datagram to the configured remote address.
    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            warn!("rejecting empty send");
            return false;
        }
        self.inner.send_datagram(data)
    }

    pub fn send_str(&self, s: &str) -> bool {
        self.send(s.as_bytes())
    }

    pub fn send_buffer(&self, buffer: DataBuffer) -> bool {
        self.send(buffer.data())
    }

    /// Allow sends to broadcast addresses.
    pub fn enable_broadcast(&self) -> bool {
        let guard = self.inner.socket.lock();
        let Some(udp_socket) = guard.as_ref() else {
            error!("socket not initialized, call init() first");
            return false;
        };
        match udp_socket.set_broadcast(true) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to enable broadcast");
                false
            }
        }
    }

    pub fn close(&self) {
        self.inner.close();
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

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.inner.task_queue.stop();
        self.inner.close();
    }
}

struct UdpClientInner {
    remote_ip: String,
    remote_port: u16,
    local_ip: String,
    local_port: u16,
    remote: Mutex<Option<SocketAddrV4>>,
    socket: Mutex<Option<Socket>>,
    handler: Mutex<Option<Arc<UdpClientHandler>>>,
    recv_buffer: Mutex<DataBuffer>,
    task_queue: TaskQueue,
    listener: RwLock<Option<Weak<dyn ClientListener>>>,
}

impl UdpClientInner {
    fn local_addr(&self) -> Result<Option<SocketAddrV4>, Error> {
        if self.local_ip.is_empty() && self.local_port == 0 {
            return Ok(None);
        }
        let ip = if self.local_ip.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            socket::parse_ipv4(&self.local_ip)?
        };
        Ok(Some(SocketAddrV4::new(ip, self.local_port)))
    }

    fn close(&self) {
        if let Some(handler) = self.handler.lock().take() {
            EventReactor::instance().remove(handler.fd);
        }
        *self.socket.lock() = None;
    }

    fn send_datagram(&self, data: &[u8]) -> bool {
        let guard = self.socket.lock();
        let Some(udp_socket) = guard.as_ref() else {
            error!("socket not initialized");
            return false;
        };
        let Some(remote) = *self.remote.lock() else {
            error!("remote address not set");
            return false;
        };

        match socket::send_to(udp_socket.as_raw_fd(), data, remote) {
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

    fn handle_receive(&self, fd: RawFd) {
        let mut recv_buffer = self.recv_buffer.lock();
        if recv_buffer.size() < POOL_BLOCK_SIZE {
            recv_buffer.set_size(POOL_BLOCK_SIZE);
        }

        loop {
            match socket::recv_nonblocking(fd, recv_buffer.data_mut()) {
                Ok(0) => continue,
                Ok(n) => {
                    let Some(listener) = self.listener.read().clone() else {
                        continue;
                    };
                    let mut buffer = DataBuffer::pool_alloc(n);
                    buffer.assign(&recv_buffer.data()[..n]);
                    self.task_queue.post(move || {
                        if let Some(listener) = listener.upgrade() {
                            listener.on_receive(fd, buffer);
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(fd, error = %e, "recv failed");
                    break;
                }
            }
        }
    }
}

struct UdpClientHandler {
    fd: RawFd,
    client: Weak<UdpClientInner>,
}

impl EventHandler for UdpClientHandler {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn on_read(&self, fd: RawFd) {
        if let Some(client) = self.client.upgrade() {
            client.handle_receive(fd);
        }
    }

    fn on_error(&self, fd: RawFd) {
        error!(fd, "udp client socket error");
    }

    fn on_close(&self, fd: RawFd) {
        debug!(fd, "udp client socket closed");
    }
}
