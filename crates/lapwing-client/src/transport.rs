//! Transport contract
//!
//! The connection driver owns exactly one transport and is the only code
//! that touches it. Concrete transports (TCP, TLS, the in-memory pair used
//! by tests) live outside this crate; they deliver inbound bytes and
//! lifecycle events through an event channel and accept outbound buffers
//! via `write_and_flush`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Failures surfaced by a transport implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("transport write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("transport dropped: {reason}")]
    Dropped { reason: String },
}

// ----------------------------------------------------------------------------
// Endpoint and Events
// ----------------------------------------------------------------------------

/// A remote endpoint the transport can dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Events a transport pushes toward the connection driver.
#[derive(Debug)]
pub enum TransportEvent {
    /// An inbound chunk of stream bytes.
    Data(Bytes),
    /// The stream closed cleanly.
    Closed,
    /// The stream failed.
    Error(TransportError),
}

/// Receiving side of a transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

// ----------------------------------------------------------------------------
// Transport Contract
// ----------------------------------------------------------------------------

/// A bidirectional byte stream under exclusive driver ownership.
///
/// `connect` may be called again after the stream drops; the driver does
/// this when walking reconnect endpoints. Buffers passed to
/// `write_and_flush` are owned [`Bytes`], so implementations never need to
/// copy or extend lifetimes.
#[async_trait]
pub trait Transport: Send {
    /// Establish the stream to `endpoint` and return its event channel.
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<TransportEvents, TransportError>;

    /// Write a buffer and flush it to the wire.
    async fn write_and_flush(&mut self, bytes: Bytes) -> Result<(), TransportError>;

    /// Shut the stream down. Idempotent.
    async fn close(&mut self);
}
