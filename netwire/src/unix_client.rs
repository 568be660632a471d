//! Local-domain stream client endpoint.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::conn::{DrainOutcome, StreamConnectionHandler, StreamEndpoint, drain_stream};
use crate::listener::ClientListener;
use crate::reactor::EventReactor;
use crate::socket::{self, INVALID_SOCKET};
use crate::task_queue::TaskQueue;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A local-domain stream client delivering [`ClientListener`] callbacks.
pub struct UnixClient {
    inner: Arc<UnixClientInner>,
}

impl UnixClient {
    pub fn new(socket_path: &str) -> Self {
        UnixClient {
            inner: Arc::new(UnixClientInner {
                socket_path: socket::clamp_unix_path(socket_path).to_string(),
                socket: Mutex::new(None),
                handler: Mutex::new(None),
                recv_buffer: Mutex::new(DataBuffer::pool_alloc(POOL_BLOCK_SIZE)),
                task_queue: TaskQueue::new("UnixClientCb"),
                listener: RwLock::new(None),
            }),
        }
    }

    pub fn init(&self) -> bool {
        self.inner.create_socket()
    }

    /// Connect to the configured socket path, waiting up to one second for a
    /// non-blocking connect to complete.
    pub fn connect(&self) -> bool {
        let inner = &self.inner;

        let Some(stream) = inner.socket.lock().take() else {
            error!("socket not initialized");
            return false;
        };

        let addr = match socket2::SockAddr::unix(&inner.socket_path) {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, path = %inner.socket_path, "invalid socket path");
                return false;
            }
        };

        if let Err(e) = stream.connect(&addr) {
            let in_progress = matches!(
                e.raw_os_error(),
                Some(libc::EINPROGRESS) | Some(libc::EAGAIN)
            );
            if !in_progress {
                error!(error = %e, path = %inner.socket_path, "connect failed");
                inner.re_init();
                return false;
            }
        }

        let fd = stream.as_raw_fd();
        if let Err(e) = socket::wait_writable(fd, CONNECT_TIMEOUT) {
            error!(error = %e, path = %inner.socket_path, "connect failed");
            inner.re_init();
            return false;
        }
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) => {
                error!(error = %e, path = %inner.socket_path, "connect failed");
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

        debug!(fd, path = %inner.socket_path, "connected");
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

impl Drop for UnixClient {
    fn drop(&mut self) {
        self.inner.task_queue.stop();
        self.inner.close();
    }
}

struct UnixClientInner {
    socket_path: String,
    socket: Mutex<Option<Socket>>,
    handler: Mutex<Option<Arc<StreamConnectionHandler<UnixClientInner>>>>,
    recv_buffer: Mutex<DataBuffer>,
    task_queue: TaskQueue,
    listener: RwLock<Option<Weak<dyn ClientListener>>>,
}

impl UnixClientInner {
    fn create_socket(&self) -> bool {
        match socket::unix_socket() {
            Ok(stream) => {
                *self.socket.lock() = Some(stream);
                true
            }
            Err(e) => {
                error!(error = %e, "failed to create unix socket");
                false
            }
        }
    }

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

impl StreamEndpoint for UnixClientInner {
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
