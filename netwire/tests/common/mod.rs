//! Shared recording listeners for the end-to-end tests.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::net::TcpListener;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use netwire::{ClientListener, DataBuffer, ServerListener, Session};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ServerEvent {
    Accept(RawFd),
    Receive(RawFd, Vec<u8>),
    Close(RawFd),
    Error(RawFd, String),
}

/// Records server callbacks and optionally replies to every receive.
pub struct RecordingServerListener {
    tx: Sender<ServerEvent>,
    reply: Option<Vec<u8>>,
}

impl RecordingServerListener {
    pub fn new() -> (Arc<Self>, Receiver<ServerEvent>) {
        Self::with_reply(None)
    }

    pub fn echoing(reply: &[u8]) -> (Arc<Self>, Receiver<ServerEvent>) {
        Self::with_reply(Some(reply.to_vec()))
    }

    fn with_reply(reply: Option<Vec<u8>>) -> (Arc<Self>, Receiver<ServerEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(RecordingServerListener { tx, reply }), rx)
    }
}

impl ServerListener for RecordingServerListener {
    fn on_accept(&self, session: Arc<dyn Session>) {
        let _ = self.tx.send(ServerEvent::Accept(session.fd()));
    }

    fn on_receive(&self, session: Arc<dyn Session>, buffer: DataBuffer) {
        if let Some(reply) = &self.reply {
            assert!(session.send(reply));
        }
        let _ = self
            .tx
            .send(ServerEvent::Receive(session.fd(), buffer.data().to_vec()));
    }

    fn on_close(&self, session: Arc<dyn Session>) {
        let _ = self.tx.send(ServerEvent::Close(session.fd()));
    }

    fn on_error(&self, session: Arc<dyn Session>, reason: &str) {
        let _ = self
            .tx
            .send(ServerEvent::Error(session.fd(), reason.to_string()));
    }
}

#[derive(Debug)]
pub enum ClientEvent {
    Receive(RawFd, Vec<u8>),
    Close(RawFd),
    Error(RawFd, String),
}

pub struct RecordingClientListener {
    tx: Sender<ClientEvent>,
}

impl RecordingClientListener {
    pub fn new() -> (Arc<Self>, Receiver<ClientEvent>) {
        let (tx, rx) = unbounded();
        (Arc::new(RecordingClientListener { tx }), rx)
    }
}

impl ClientListener for RecordingClientListener {
    fn on_receive(&self, fd: RawFd, buffer: DataBuffer) {
        let _ = self.tx.send(ClientEvent::Receive(fd, buffer.data().to_vec()));
    }

    fn on_close(&self, fd: RawFd) {
        let _ = self.tx.send(ClientEvent::Close(fd));
    }

    fn on_error(&self, fd: RawFd, reason: &str) {
        let _ = self.tx.send(ClientEvent::Error(fd, reason.to_string()));
    }
}

/// A TCP port that was free a moment ago.
pub fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe failed");
    listener.local_addr().expect("local_addr failed").port()
}

/// Collect `Receive` payloads until `total` bytes have arrived, preserving
/// delivery order. Panics on close/error or timeout.
pub fn collect_server_bytes(rx: &Receiver<ServerEvent>, total: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(total);
    while bytes.len() < total {
        match rx.recv_timeout(EVENT_TIMEOUT) {
            Ok(ServerEvent::Receive(_, chunk)) => bytes.extend_from_slice(&chunk),
            Ok(other) => panic!("unexpected event while collecting: {other:?}"),
            Err(e) => panic!("timed out after {} of {} bytes: {e}", bytes.len(), total),
        }
    }
    bytes
}
