//! Error types for the client resilience layer

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the offline mutation queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is at capacity; the caller must handle this immediately,
    /// no retry is attempted by the queue itself.
    #[error("offline queue is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// Errors surfaced by the realtime transport client
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed before a reply arrived")]
    ConnectionClosed,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),
}
