//! Connections
//!
//! The application-facing front of one AMQP connection. Every operation
//! enqueues work on the connection's driver and awaits its completion;
//! convenience operations (send, connection-level links) go through the
//! lazily created root session.

use std::time::Duration;

use tokio::sync::oneshot;

use lapwing_types::definitions::Fields;
use lapwing_types::{ErrorCondition, Message, Symbol};

use crate::driver::work::{DriverHandle, Work};
use crate::error::Result;
use crate::options::{ReceiverOptions, SenderOptions, SessionOptions};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::session::Session;
use crate::tracker::Tracker;

/// A single AMQP connection.
#[derive(Clone)]
pub struct Connection {
    driver: DriverHandle,
    id: String,
}

impl Connection {
    pub(crate) fn new(driver: DriverHandle, id: String) -> Self {
        Self { driver, id }
    }

    /// The client-assigned connection identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The container-id sent on the Open.
    pub fn container_id(&self) -> &str {
        &self.driver.shared.container_id
    }

    fn request_timeout(&self) -> Duration {
        self.driver.options.request_timeout
    }

    /// Wait for the remote Open (or the failure that prevented it).
    pub async fn await_open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::AwaitOpen { reply })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "connection open")
            .await
    }

    /// Open a new session with default options.
    pub async fn open_session(&self) -> Result<Session> {
        self.open_session_with(SessionOptions::default()).await
    }

    /// Open a new session.
    pub async fn open_session_with(&self, options: SessionOptions) -> Result<Session> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenSession {
            options: options.clone(),
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "open session")
            .await?;
        Ok(Session::from_seed(self.driver.clone(), seed, options))
    }

    /// The connection's lazily created root session.
    pub async fn default_session(&self) -> Result<Session> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DefaultSession { reply })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "default session")
            .await?;
        Ok(Session::from_seed(
            self.driver.clone(),
            seed,
            SessionOptions::default(),
        ))
    }

    /// Open a sender on the root session with default options.
    pub async fn open_sender<S: Into<String>>(&self, address: S) -> Result<Sender> {
        self.open_sender_with(address, SenderOptions::default())
            .await
    }

    /// Open a sender on the root session.
    pub async fn open_sender_with<S: Into<String>>(
        &self,
        address: S,
        options: SenderOptions,
    ) -> Result<Sender> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenSender {
            channel: None,
            address: Some(address.into()),
            anonymous: false,
            options,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "open sender")
            .await?;
        Ok(Sender::from_seed(self.driver.clone(), seed))
    }

    /// Open an anonymous sender on the root session with default options.
    pub async fn open_anonymous_sender(&self) -> Result<Sender> {
        self.open_anonymous_sender_with(SenderOptions::default())
            .await
    }

    /// Open an anonymous sender on the root session.
    pub async fn open_anonymous_sender_with(&self, options: SenderOptions) -> Result<Sender> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenSender {
            channel: None,
            address: None,
            anonymous: true,
            options,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "open anonymous sender")
            .await?;
        Ok(Sender::from_seed(self.driver.clone(), seed))
    }

    /// Open a receiver on the root session with default options.
    pub async fn open_receiver<S: Into<String>>(&self, address: S) -> Result<Receiver> {
        self.open_receiver_with(address, ReceiverOptions::default())
            .await
    }

    /// Open a receiver on the root session.
    pub async fn open_receiver_with<S: Into<String>>(
        &self,
        address: S,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenReceiver {
            channel: None,
            address: Some(address.into()),
            dynamic: false,
            dynamic_node_properties: Fields::new(),
            options,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "open receiver")
            .await?;
        Ok(Receiver::from_seed(self.driver.clone(), seed))
    }

    /// Open a dynamic receiver on the root session.
    pub async fn open_dynamic_receiver(
        &self,
        dynamic_node_properties: Fields,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenReceiver {
            channel: None,
            address: None,
            dynamic: true,
            dynamic_node_properties,
            options,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.request_timeout(), "open dynamic receiver")
            .await?;
        Ok(Receiver::from_seed(self.driver.clone(), seed))
    }

    /// Send a message through the connection's anonymous sender.
    ///
    /// The sender (and the root session) are created lazily on first use;
    /// the message's `to` property routes it at the peer.
    pub async fn send(&self, message: &Message) -> Result<Tracker> {
        let payload = message.encode().map_err(|error| {
            crate::error::ClientError::io(format!("message encoding failed: {error}"))
        })?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::ConnectionSend {
            payload,
            message_format: 0,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, Duration::ZERO, "send")
            .await?;
        Ok(Tracker::from_seed(self.driver.clone(), seed))
    }

    /// Close the connection. Idempotent: every call completes with the
    /// same terminal outcome.
    pub async fn close(&self) -> Result<()> {
        self.terminate(None).await
    }

    /// Close the connection reporting an error to the peer.
    pub async fn close_with_error(&self, error: ErrorCondition) -> Result<()> {
        self.terminate(Some(error)).await
    }

    async fn terminate(&self, error: Option<ErrorCondition>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .driver
            .submit(Work::Close { error, reply })
            .is_err()
        {
            // Driver already gone; the connection is as closed as it gets.
            return Ok(());
        }
        self.driver
            .await_reply(rx, Duration::ZERO, "connection close")
            .await
    }

    /// Properties carried on the remote Open.
    pub async fn properties(&self) -> Result<Fields> {
        self.await_open().await?;
        Ok(self
            .driver
            .shared
            .remote_open()
            .map(|open| open.properties)
            .unwrap_or_default())
    }

    /// Capabilities the remote offered on its Open.
    pub async fn offered_capabilities(&self) -> Result<Vec<Symbol>> {
        self.await_open().await?;
        Ok(self
            .driver
            .shared
            .remote_open()
            .map(|open| open.offered_capabilities)
            .unwrap_or_default())
    }

    /// Capabilities the remote desires.
    pub async fn desired_capabilities(&self) -> Result<Vec<Symbol>> {
        self.await_open().await?;
        Ok(self
            .driver
            .shared
            .remote_open()
            .map(|open| open.desired_capabilities)
            .unwrap_or_default())
    }

    /// Whether close has begun or the connection failed.
    pub fn is_closed(&self) -> bool {
        self.driver.shared.is_closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("container_id", &self.container_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
