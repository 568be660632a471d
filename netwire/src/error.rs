use std::io;

use thiserror::Error;

/// Errors returned by netwire operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket or thread operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Address string could not be parsed as a numeric IPv4 address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Task queue is stopped and not accepting work.
    #[error("task queue is stopped")]
    QueueStopped,
    /// Requested enqueue delay is at or beyond the 10 second maximum.
    #[error("task delay exceeds the maximum")]
    DelayTooLong,
}
