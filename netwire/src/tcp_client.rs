//! TCP client endpoint with a bounded non-blocking connect.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::conn::{DrainOutcome, StreamConnectionHandler, StreamEndpoint, drain_stream};
use crate::error::Error;
use crate::listener::ClientListener;
use crate::reactor::EventReactor;
use crate::socket::{self, INVALID_SOCKET};
use crate::task_queue::TaskQueue;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A TCP client endpoint delivering [`ClientListener`] callbacks keyed by
/// descriptor.
pub struct TcpClient {
    inner: Arc<TcpClientInner>,
}

impl TcpClient {
    pub fn new(remote_ip: &str, remote_port: u16) -> Self {
        Self::with_local(remote_ip, remote_port, "", 0)
    }

    /// Bind to a specific local address before connecting.
    pub fn with_local(remote_ip: &str, remote_port: u16, local_ip: &str, local_port: u16) -> Self {
        TcpClient {
            inner: Arc::new(TcpClientInner {
                remote_ip: remote_ip.to_string(),
                remote_port,
                local_ip: local_ip.to_string(),
                local_port,
                socket: Mutex::new(None),
                handler: Mutex::new(None),
                recv_buffer: Mutex::new(DataBuffer::pool_alloc(POOL_BLOCK_SIZE)),
                task_queue: TaskQueue::new("TcpClientCb"),
                listener: RwLock::new(None),
            }),
        }
    }

    /// Create the socket and bind the optional local address.
    pub fn init(&self) -> bool {
        self.inner.create_socket()
    }

    /// Connect to the remote address, waiting up to one second for a
    /// non-blocking connect to complete. On failure the socket is re-created
    /// for a fresh attempt.
    pub fn connect(&self) -> bool {
        let inner = &self.inner;

        let remote_ip = if inner.remote_ip.is_empty() {
            "127.0.0.1"
        } else {
            &inner.remote_ip
        };
        let remote = match socket::parse_ipv4(remote_ip) {
            Ok(ip) => SocketAddrV4::new(ip, inner.remote_port),
            Err(e) => {
                error!(error = %e, "connect failed");
                return false;
            }
        };

        let Some(stream) = inner.socket.lock().take() else {
            error!("socket not initialized");
            return false;
        };

        if let Err(e) = stream.connect(&remote.into()) {
            let in_progress = e.raw_os_error() == Some(libc::EINPROGRESS);
            if !in_progress {
                error!(error = %e, %remote, "connect failed");
                inner.re_init();
                return false;
            }
        }

        let fd = stream.as_raw_fd();
        if let Err(e) = socket::wait_writable(fd, CONNECT_TIMEOUT) {
            error!(error = %e, %remote, "connect failed");
            inner.re_init();
            return false;
        }
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                error!(error = %e, %remote, "connect failed");
                inner.re_init();
                return false;
            }
            Err(e) => {
                error!(error = %e, "failed to query socket error");
                inner.re_init();
                return false;
            }
        }

        if inner.task_queue.start().is_err() {
            error!("failed to start callback queue");
            return false;
        }

        let handler = Arc::new(StreamConnectionHandler::new(stream, Arc::downgrade(inner)));
        if !EventReactor::instance().register(handler.clone()) {
            error!(fd, "failed to register client handler");
            return false;
        }
        *inner.handler.lock() = Some(handler);

        debug!(fd, %remote, "connected");
        true
    }

    pub fn set_listener(&self, listener: Arc<dyn ClientListener>) {
        *self.inner.listener.write() = Some(Arc::downgrade(&listener));
    }

    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            warn!("rejecting empty send");
            return false;
        }
        let mut buffer = DataBuffer::pool_alloc(data.len());
        buffer.assign(data);
        self.send_buffer(buffer)
    }

    pub fn send_str(&self, s: &str) -> bool {
        self.send(s.as_bytes())
    }

    pub fn send_buffer(&self, buffer: DataBuffer) -> bool {
        if buffer.is_empty() {
            return false;
        }
        match self.inner.handler.lock().clone() {
            Some(handler) => handler.queue_send(buffer),
            None => {
                error!("not connected");
                false
            }
        }
    }

    /// Remove the connection from the reactor and close the descriptor.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn socket_fd(&self) -> RawFd {
        let inner = &self.inner;
        if let Some(handler) = inner.handler.lock().as_ref() {
            return handler.fd();
        }
        inner
            .socket
            .lock()
            .as_ref()
            .map(|s| s.as_raw_fd())
            .unwrap_or(INVALID_SOCKET)
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.inner.task_queue.stop();
        self.inner.close();
    }
}

struct TcpClientInner {
    remote_ip: String,
    remote_port: u16,
    local_ip: String,
    local_port: u16,
    socket: Mutex<Option<Socket>>,
    handler: Mutex<Option<Arc<StreamConnectionHandler<TcpClientInner>>>>,
    recv_buffer: Mutex<DataBuffer>,
    task_queue: TaskQueue,
    listener: RwLock<Option<Weak<dyn ClientListener>>>,
}

impl TcpClientInner {
    fn create_socket(&self) -> bool {
        let local = match self.local_addr() {
            Ok(local) => local,
            Err(e) => {
                error!(error = %e, "tcp client init failed");
                return false;
            }
        };
        match socket::tcp_socket(local) {
            Ok(stream) => {
                *self.socket.lock() = Some(stream);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to create tcp socket");
                false
            }
        }
    }

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

    /// Recreate the socket after a failed connect so the next attempt starts
    /// clean.
    fn re_init(&self) {
        *self.socket.lock() = None;
        let _ = self.create_socket();
    }

    fn close(&self) {
        if let Some(handler) = self.handler.lock().take() {
            EventReactor::instance().remove(handler.fd());
        }
        *self.socket.lock() = None;
    }

    fn deliver_receive(&self, fd: RawFd, buffer: DataBuffer) {
        let Some(listener) = self.listener.read().clone() else {
            return;
        };
        self.task_queue.post(move || {
            if let Some(listener) = listener.upgrade() {
                listener.on_receive(fd, buffer);
            }
        });
    }
}

impl StreamEndpoint for TcpClientInner {
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
                self.handle_stream_close(fd, true, &reason);
            }
        }
    }

    fn handle_stream_close(&self, fd: RawFd, is_error: bool, reason: &str) {
        // Only tear down the live connection once; a second event for the
        // same descriptor finds the handler already gone.
        let removed = {
            let mut guard = self.handler.lock();
            match guard.as_ref() {
                Some(handler) if handler.fd() == fd => guard.take(),
                _ => None,
            }
        };
        if removed.is_none() {
            debug!(fd, "connection already cleaned up");
            return;
        }
        debug!(fd, reason, is_error, "closing connection");

        EventReactor::instance().remove(fd);
        drop(removed);

        let Some(listener) = self.listener.read().clone() else {
            return;
        };
        let reason = reason.to_string();
        self.task_queue.post(move || {
            let Some(listener) = listener.upgrade() else {
                return;
            };
            if is_error {
                listener.on_error(fd, &reason);
            } else {
                listener.on_close(fd);
            }
        });
    }
}
