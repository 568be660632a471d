//! User-facing callback contracts.
//!
//! Server callbacks are keyed by session, client callbacks by descriptor so
//! one listener can serve several clients. Buffers are passed by value: each
//! callback privately owns its buffer and later read iterations never touch
//! it.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::DataBuffer;
use crate::session::Session;

pub trait ServerListener: Send + Sync {
    fn on_accept(&self, session: Arc<dyn Session>);

    fn on_receive(&self, session: Arc<dyn Session>, buffer: DataBuffer);

    fn on_close(&self, session: Arc<dyn Session>);

    fn on_error(&self, session: Arc<dyn Session>, reason: &str);
}

pub trait ClientListener: Send + Sync {
    fn on_receive(&self, fd: RawFd, buffer: DataBuffer);

    fn on_close(&self, fd: RawFd);

    fn on_error(&self, fd: RawFd, reason: &str);
}
