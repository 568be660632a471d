//! Per-connection state machine shared by every stream endpoint: accepted
//! TCP connections, the TCP client, and both local-domain sides.
//!
//! The handler owns its descriptor and a FIFO send queue of pooled buffers.
//! Writability interest is armed when the first buffer is queued and
//! disarmed when the queue drains, so an idle connection only costs READ
//! interest in the poller.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Weak;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, warn};

use crate::buffer::{DataBuffer, POOL_BLOCK_SIZE};
use crate::reactor::{EventHandler, EventReactor, InterestSet};
use crate::socket;

/// Upper bound on queued send buffers per connection. A full queue fails the
/// send, signalling backpressure to the caller.
pub(crate) const SEND_QUEUE_MAX: usize = 1024;

/// The endpoint-specific half of the connection state machine.
pub(crate) trait StreamEndpoint: Send + Sync + 'static {
    fn handle_receive(&self, fd: RawFd);

    fn handle_stream_close(&self, fd: RawFd, is_error: bool, reason: &str);
}

struct SendState {
    queue: VecDeque<DataBuffer>,
    write_armed: bool,
}

/// Reactor handler for one established stream connection.
///
/// Owns the socket: dropping the last handler reference closes the
/// descriptor, which the close paths arrange to happen after the reactor
/// registration is removed.
pub(crate) struct StreamConnectionHandler<E: StreamEndpoint> {
    fd: RawFd,
    _socket: Socket,
    endpoint: Weak<E>,
    send: Mutex<SendState>,
}

impl<E: StreamEndpoint> StreamConnectionHandler<E> {
    pub(crate) fn new(socket: Socket, endpoint: Weak<E>) -> Self {
        let fd = socket.as_raw_fd();
        StreamConnectionHandler {
            fd,
            _socket: socket,
            endpoint,
            send: Mutex::new(SendState {
                queue: VecDeque::new(),
                write_armed: false,
            }),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Queue a buffer for transmission, arming writability if needed.
    /// Accepts sends from any thread.
    pub(crate) fn queue_send(&self, buffer: DataBuffer) -> bool {
        if buffer.is_empty() {
            return false;
        }

        let mut send = self.send.lock();
        if send.queue.len() >= SEND_QUEUE_MAX {
            warn!(fd = self.fd, "send queue full, rejecting buffer");
            return false;
        }
        send.queue.push_back(buffer);
        if !send.write_armed {
            send.write_armed = true;
            EventReactor::instance().modify(
                self.fd,
                InterestSet::READ | InterestSet::WRITE | InterestSet::ERROR | InterestSet::CLOSE,
            );
        }
        true
    }

    /// Drain the send queue with non-blocking writes. Partial writes replace
    /// the front buffer with a shortened copy of the unsent tail.
    fn process_send_queue(&self) {
        let mut send = self.send.lock();

        while let Some(front) = send.queue.front_mut() {
            match socket::send_nonblocking(self.fd, front.data()) {
                Ok(n) if n == front.size() => {
                    send.queue.pop_front();
                }
                Ok(n) => {
                    let mut remaining = DataBuffer::pool_alloc(front.size() - n);
                    remaining.assign(&front.data()[n..]);
                    *front = remaining;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // The error/close event completes teardown.
                    error!(fd = self.fd, error = %e, "send failed");
                    return;
                }
            }
        }

        if send.queue.is_empty() && send.write_armed {
            send.write_armed = false;
            EventReactor::instance().modify(
                self.fd,
                InterestSet::READ | InterestSet::ERROR | InterestSet::CLOSE,
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn write_armed(&self) -> bool {
        self.send.lock().write_armed
    }
}

impl<E: StreamEndpoint> EventHandler for StreamConnectionHandler<E> {
    fn handle(&self) -> RawFd {
        self.fd
    }

    fn interest(&self) -> InterestSet {
        let base = InterestSet::READ | InterestSet::ERROR | InterestSet::CLOSE;
        if self.send.lock().write_armed {
            base | InterestSet::WRITE
        } else {
            base
        }
    }

    fn on_read(&self, fd: RawFd) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.handle_receive(fd);
        }
    }

    fn on_write(&self, _fd: RawFd) {
        self.process_send_queue();
    }

    fn on_error(&self, fd: RawFd) {
        error!(fd, "connection error");
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.handle_stream_close(fd, true, "connection error");
        }
    }

    fn on_close(&self, fd: RawFd) {
        debug!(fd, "connection closed");
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.handle_stream_close(fd, false, "connection closed");
        }
    }
}

pub(crate) enum DrainOutcome {
    Drained,
    PeerClosed,
    Failed(String),
}

/// Drain a stream descriptor into `recv_buffer`, handing each chunk to
/// `deliver` as a privately-owned pooled buffer of exactly the received
/// length.
///
/// A zero-byte read reports `PeerClosed` without initiating teardown; the
/// close event drives the unified close path.
pub(crate) fn drain_stream(
    fd: RawFd,
    recv_buffer: &mut DataBuffer,
    mut deliver: impl FnMut(DataBuffer),
) -> DrainOutcome {
    if recv_buffer.size() < POOL_BLOCK_SIZE {
        recv_buffer.set_size(POOL_BLOCK_SIZE);
    }

    loop {
        match socket::recv_nonblocking(fd, recv_buffer.data_mut()) {
            Ok(0) => return DrainOutcome::PeerClosed,
            Ok(n) => {
                let mut chunk = DataBuffer::pool_alloc(n);
                chunk.assign(&recv_buffer.data()[..n]);
                deliver(chunk);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return DrainOutcome::Drained,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return DrainOutcome::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;

    struct NullEndpoint;

    impl StreamEndpoint for NullEndpoint {
        fn handle_receive(&self, _fd: RawFd) {}
        fn handle_stream_close(&self, _fd: RawFd, _is_error: bool, _reason: &str) {}
    }

    fn stream_pair() -> (Socket, UnixStream) {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        (Socket::from(local), remote)
    }

    #[test]
    fn test_queue_send_rejects_empty_buffer() {
        let (local, _remote) = stream_pair();
        let endpoint = Arc::new(NullEndpoint);
        let handler = StreamConnectionHandler::new(local, Arc::downgrade(&endpoint));
        assert!(!handler.queue_send(DataBuffer::default()));
        assert!(!handler.write_armed());
    }

    #[test]
    fn test_send_queue_drains_and_disarms() {
        let (local, mut remote) = stream_pair();
        let endpoint = Arc::new(NullEndpoint);
        let handler = StreamConnectionHandler::new(local, Arc::downgrade(&endpoint));

        let mut buffer = DataBuffer::pool_alloc(5);
        buffer.assign(b"hello");
        assert!(handler.queue_send(buffer));
        assert!(handler.write_armed());

        handler.process_send_queue();
        assert!(!handler.write_armed());

        let mut received = [0u8; 5];
        remote.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"hello");
    }

    #[test]
    fn test_send_queue_preserves_order() {
        let (local, mut remote) = stream_pair();
        let endpoint = Arc::new(NullEndpoint);
        let handler = StreamConnectionHandler::new(local, Arc::downgrade(&endpoint));

        for chunk in [&b"first "[..], b"second ", b"third"] {
            let mut buffer = DataBuffer::pool_alloc(chunk.len());
            buffer.assign(chunk);
            assert!(handler.queue_send(buffer));
        }
        handler.process_send_queue();

        let mut received = [0u8; 18];
        remote.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"first second third");
    }
}
