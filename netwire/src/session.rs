//! Server-side session handles passed to user callbacks.

use std::os::fd::RawFd;
use std::sync::Weak;

use crate::buffer::DataBuffer;

/// A handle to one active server-side peer.
///
/// Sessions are created on accept (or per datagram for UDP), handed to user
/// callbacks, and may be retained by the user beyond close: sends then fail
/// benignly with `false`.
pub trait Session: Send + Sync {
    fn fd(&self) -> RawFd;

    fn host(&self) -> &str;

    fn port(&self) -> u16;

    fn send(&self, data: &[u8]) -> bool;

    fn send_buffer(&self, buffer: DataBuffer) -> bool;

    fn send_str(&self, s: &str) -> bool {
        self.send(s.as_bytes())
    }

    fn client_info(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

/// The endpoint side of a session: routes a send back into the owning
/// endpoint (a connection send queue for streams, `sendto` for datagrams).
pub(crate) trait SessionBackend: Send + Sync {
    fn session_send(&self, fd: RawFd, host: &str, port: u16, buffer: DataBuffer) -> bool;
}

/// The one session implementation, parameterized over the owning endpoint.
///
/// Holds only a weak reference to the endpoint so that retained sessions do
/// not keep a stopped endpoint alive.
pub(crate) struct ServerSession<B: SessionBackend> {
    fd: RawFd,
    host: String,
    port: u16,
    backend: Weak<B>,
}

impl<B: SessionBackend> ServerSession<B> {
    pub(crate) fn new(fd: RawFd, host: String, port: u16, backend: Weak<B>) -> Self {
        ServerSession {
            fd,
            host,
            port,
            backend,
        }
    }
}

impl<B: SessionBackend + 'static> Session for ServerSession<B> {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut buffer = DataBuffer::pool_alloc(data.len());
        buffer.assign(data);
        self.send_buffer(buffer)
    }

    fn send_buffer(&self, buffer: DataBuffer) -> bool {
        if buffer.is_empty() {
            return false;
        }
        match self.backend.upgrade() {
            Some(backend) => backend.session_send(self.fd, &self.host, self.port, buffer),
            // Endpoint already dropped; the session outlived it.
            None => false,
        }
    }
}
