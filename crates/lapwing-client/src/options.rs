//! Client configuration
//!
//! Plain option records with sensible defaults, mirrored at each level of
//! the stack: connection, session, sender and receiver. Session and link
//! records can override the connection's four timeouts; unset fields fall
//! back to the owning connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lapwing_types::definitions::Fields;
use lapwing_types::{DeliveryState, ExpiryPolicy, Symbol, TerminusDurability};

use crate::error::ClientError;

// ----------------------------------------------------------------------------
// Delivery Mode
// ----------------------------------------------------------------------------

/// Delivery guarantee requested for a sender link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Fire and forget: deliveries are sent pre-settled.
    AtMostOnce,
    /// Deliveries stay unsettled until the peer settles them.
    #[default]
    AtLeastOnce,
}

// ----------------------------------------------------------------------------
// Event Handlers
// ----------------------------------------------------------------------------

/// Lifecycle notifications delivered to application handlers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A transport was (re-)established and the remote Open arrived.
    Connected { host: String },
    /// Reconnection was exhausted or disabled and the connection failed.
    Failed { error: ClientError },
}

/// Application callback invoked on the dispatch executor, never on the
/// protocol loop.
pub type EventHandler = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

// ----------------------------------------------------------------------------
// Connection Options
// ----------------------------------------------------------------------------

/// SASL layer configuration.
#[derive(Debug, Clone)]
pub struct SaslOptions {
    pub enabled: bool,
    /// Mechanisms the client will consider, in preference order. Empty
    /// means any mechanism the peer offers.
    pub allowed_mechanisms: Vec<String>,
}

impl Default for SaslOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_mechanisms: Vec::new(),
        }
    }
}

/// TLS parameters passed through to the transport.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub keystore_path: Option<String>,
    pub keystore_password: Option<String>,
    pub truststore_path: Option<String>,
    pub truststore_password: Option<String>,
    pub verify_peer: bool,
    pub server_name: Option<String>,
    pub enabled_protocols: Vec<String>,
    pub enabled_ciphers: Vec<String>,
}

/// Reconnection policy.
#[derive(Debug, Clone, Default)]
pub struct ReconnectOptions {
    pub enabled: bool,
    /// Alternate endpoints tried after the initial host, as (host, port).
    pub hosts: Vec<(String, u16)>,
    /// Attempts across the whole endpoint list before giving up; zero
    /// means a single pass.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

/// Configuration for a single connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub user: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    pub sasl: SaslOptions,
    /// Overrides the client's container-id for this connection.
    pub container_id: Option<String>,
    pub channel_max: u16,
    pub max_frame_size: u32,
    /// Idle timeout advertised to the peer; zero disables heartbeating.
    pub idle_timeout: Duration,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
    pub open_timeout: Duration,
    pub close_timeout: Duration,
    pub request_timeout: Duration,
    pub send_timeout: Duration,
    pub reconnect: ReconnectOptions,
    pub tls: Option<TlsOptions>,
    pub connected_handler: Option<EventHandler>,
    pub failed_handler: Option<EventHandler>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            vhost: None,
            sasl: SaslOptions::default(),
            container_id: None,
            channel_max: u16::MAX,
            max_frame_size: 65536,
            idle_timeout: Duration::ZERO,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Fields::new(),
            open_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
            reconnect: ReconnectOptions::default(),
            tls: None,
            connected_handler: None,
            failed_handler: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("user", &self.user)
            .field("vhost", &self.vhost)
            .field("sasl", &self.sasl)
            .field("container_id", &self.container_id)
            .field("channel_max", &self.channel_max)
            .field("max_frame_size", &self.max_frame_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("open_timeout", &self.open_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Session Options
// ----------------------------------------------------------------------------

/// Per-session overrides; unset timeouts inherit from the connection.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub incoming_window: Option<u32>,
    pub outgoing_window: Option<u32>,
}

// ----------------------------------------------------------------------------
// Link Options
// ----------------------------------------------------------------------------

/// Target configuration for a sender link.
#[derive(Debug, Clone, Default)]
pub struct TargetOptions {
    pub durability: TerminusDurability,
    pub expiry_policy: ExpiryPolicy,
    pub capabilities: Vec<Symbol>,
}

/// Source configuration for a receiver link.
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    pub durability: TerminusDurability,
    pub expiry_policy: ExpiryPolicy,
    /// Overrides the default outcome set (accepted, rejected, released,
    /// modified) when non-empty.
    pub outcomes: Vec<Symbol>,
    pub default_outcome: Option<DeliveryState>,
    pub capabilities: Vec<Symbol>,
}

/// Configuration for a sender link.
#[derive(Debug, Clone)]
pub struct SenderOptions {
    pub delivery_mode: DeliveryMode,
    /// Settle deliveries locally as soon as the remote settles them.
    pub auto_settle: bool,
    pub link_name: Option<String>,
    pub target: TargetOptions,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            auto_settle: true,
            link_name: None,
            target: TargetOptions::default(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Fields::new(),
            open_timeout: None,
            close_timeout: None,
            request_timeout: None,
            send_timeout: None,
        }
    }
}

/// Configuration for a receiver link.
#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// High-water mark for automatic credit replenishment; zero disables
    /// it so credit must be granted via `add_credit`.
    pub credit_window: u32,
    /// Issue an Accepted disposition once the application consumes a
    /// delivery.
    pub auto_accept: bool,
    /// Settle the disposition issued on consumption.
    pub auto_settle: bool,
    pub link_name: Option<String>,
    pub source: SourceOptions,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            credit_window: 10,
            auto_accept: true,
            auto_settle: true,
            link_name: None,
            source: SourceOptions::default(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Fields::new(),
            open_timeout: None,
            close_timeout: None,
            request_timeout: None,
            send_timeout: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let options = ConnectionOptions::default();
        assert!(options.sasl.enabled);
        assert_eq!(options.channel_max, u16::MAX);
        assert_eq!(options.max_frame_size, 65536);
        assert_eq!(options.request_timeout, Duration::from_secs(60));
        assert!(!options.reconnect.enabled);
    }

    #[test]
    fn test_receiver_defaults() {
        let options = ReceiverOptions::default();
        assert_eq!(options.credit_window, 10);
        assert!(options.auto_accept);
        assert!(options.auto_settle);
    }

    #[test]
    fn test_sender_defaults() {
        let options = SenderOptions::default();
        assert_eq!(options.delivery_mode, DeliveryMode::AtLeastOnce);
        assert!(options.auto_settle);
        assert!(options.link_name.is_none());
    }
}
