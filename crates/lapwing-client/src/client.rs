//! The client container
//!
//! A `Client` owns the container-id and every connection created through
//! it. Connections are driven by their own spawned driver tasks; closing
//! the client closes them all.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use lapwing_types::{BincodeFrameCodec, FrameCodec};

use crate::connection::Connection;
use crate::driver::Driver;
use crate::options::ConnectionOptions;
use crate::transport::{Endpoint, Transport};

/// Options for the client container itself.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Container-id used on every connection's Open; generated when
    /// absent.
    pub id: Option<String>,
}

/// Process-level container of connections.
pub struct Client {
    container_id: String,
    connection_counter: AtomicU32,
    connections: Mutex<Vec<Connection>>,
}

impl Client {
    /// A client with a generated container-id.
    pub fn new() -> Self {
        Self::with_options(ClientOptions::default())
    }

    pub fn with_options(options: ClientOptions) -> Self {
        let container_id = options
            .id
            .unwrap_or_else(|| format!("ID:{}", Uuid::new_v4()));
        Self {
            container_id,
            connection_counter: AtomicU32::new(0),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// The container-id stamped on every connection.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Connect to `host:port` over the given transport, using the
    /// length-prefixed test codec.
    ///
    /// Returns immediately; the Open handshake completes on the
    /// connection's driver task and can be awaited via
    /// [`Connection::await_open`].
    pub fn connect<H: Into<String>>(
        &self,
        host: H,
        port: u16,
        transport: Box<dyn Transport>,
        options: ConnectionOptions,
    ) -> Connection {
        self.connect_with_codec(host, port, transport, Box::new(BincodeFrameCodec::new()), options)
    }

    /// Connect with an explicit frame codec.
    pub fn connect_with_codec<H: Into<String>>(
        &self,
        host: H,
        port: u16,
        transport: Box<dyn Transport>,
        codec: Box<dyn FrameCodec>,
        options: ConnectionOptions,
    ) -> Connection {
        let sequence = self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = format!("{}:{}", self.container_id, sequence);
        let container_id = options
            .container_id
            .clone()
            .unwrap_or_else(|| self.container_id.clone());
        let endpoint = Endpoint::new(host, port);

        let (driver, handle) = Driver::new(
            connection_id.clone(),
            container_id,
            options,
            transport,
            codec,
            endpoint,
        );
        tokio::spawn(driver.run());

        let connection = Connection::new(handle, connection_id);
        self.connections
            .lock()
            .expect("connection registry poisoned")
            .push(connection.clone());
        connection
    }

    /// Close every connection this client created.
    pub async fn close(&self) {
        let connections: Vec<Connection> = self
            .connections
            .lock()
            .expect("connection registry poisoned")
            .drain(..)
            .collect();
        for connection in connections {
            let _ = connection.close().await;
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_container_id_has_prefix() {
        let client = Client::new();
        assert!(client.container_id().starts_with("ID:"));
    }

    #[test]
    fn test_explicit_container_id() {
        let client = Client::with_options(ClientOptions {
            id: Some("my-container".to_string()),
        });
        assert_eq!(client.container_id(), "my-container");
    }
}
