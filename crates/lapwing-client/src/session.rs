//! Sessions
//!
//! A session is a thin coordinator over the connection driver: it opens
//! links on its channel, exposes the transaction controller, and carries
//! per-session timeout overrides.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use lapwing_types::definitions::Fields;
use lapwing_types::{ErrorCondition, Symbol};

use crate::driver::work::{DriverHandle, SessionSeed, SessionShared, Work};
use crate::error::Result;
use crate::options::{ReceiverOptions, SenderOptions, SessionOptions};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// A link multiplex over one channel of the connection.
#[derive(Clone)]
pub struct Session {
    driver: DriverHandle,
    channel: u16,
    id: String,
    shared: Arc<SessionShared>,
    options: SessionOptions,
}

impl Session {
    pub(crate) fn from_seed(
        driver: DriverHandle,
        seed: SessionSeed,
        options: SessionOptions,
    ) -> Self {
        Self {
            driver,
            channel: seed.channel,
            id: seed.id,
            shared: seed.shared,
            options,
        }
    }

    /// The session's identifier, used in default link names.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn request_timeout(&self) -> Duration {
        self.options
            .request_timeout
            .unwrap_or(self.driver.options.request_timeout)
    }

    /// Refuse new work once the session reached a terminal state.
    fn check_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            Err(self
                .shared
                .failure()
                .unwrap_or_else(|| crate::error::ClientError::closed("the session is closed")))
        } else {
            Ok(())
        }
    }

    /// Wait for the remote Begin (or the failure that prevented it).
    pub async fn await_open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::AwaitSessionOpen {
            channel: self.channel,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "session open")
            .await
    }

    /// Open a sender to `address` with default options.
    pub async fn open_sender<S: Into<String>>(&self, address: S) -> Result<Sender> {
        self.open_sender_with(address, SenderOptions::default())
            .await
    }

    /// Open a sender to `address`.
    pub async fn open_sender_with<S: Into<String>>(
        &self,
        address: S,
        options: SenderOptions,
    ) -> Result<Sender> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenSender {
            channel: Some(self.channel),
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

    /// Open an anonymous sender with default options.
    ///
    /// Requires the peer to offer the anonymous relay; when the remote
    /// Open has not arrived yet the attach is held until it does.
    pub async fn open_anonymous_sender(&self) -> Result<Sender> {
        self.open_anonymous_sender_with(SenderOptions::default())
            .await
    }

    /// Open an anonymous sender.
    pub async fn open_anonymous_sender_with(&self, options: SenderOptions) -> Result<Sender> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenSender {
            channel: Some(self.channel),
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

    /// Open a receiver on `address` with default options.
    pub async fn open_receiver<S: Into<String>>(&self, address: S) -> Result<Receiver> {
        self.open_receiver_with(address, ReceiverOptions::default())
            .await
    }

    /// Open a receiver on `address`.
    pub async fn open_receiver_with<S: Into<String>>(
        &self,
        address: S,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenReceiver {
            channel: Some(self.channel),
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

    /// Open a receiver on a dynamically created node.
    pub async fn open_dynamic_receiver(
        &self,
        dynamic_node_properties: Fields,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        self.check_open()?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::OpenReceiver {
            channel: Some(self.channel),
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

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Declare a transaction on this session.
    ///
    /// While the transaction is active every outgoing transfer and
    /// disposition on the session carries its txn-id.
    pub async fn begin_transaction(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::BeginTransaction {
            channel: self.channel,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "begin transaction")
            .await
    }

    /// Commit the active transaction.
    pub async fn commit_transaction(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DischargeTransaction {
            channel: self.channel,
            fail: false,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "commit transaction")
            .await
    }

    /// Roll back the active transaction.
    pub async fn rollback_transaction(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DischargeTransaction {
            channel: self.channel,
            fail: true,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "rollback transaction")
            .await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// End the session. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.terminate(None).await
    }

    /// End the session reporting an error to the peer.
    pub async fn close_with_error(&self, error: ErrorCondition) -> Result<()> {
        self.terminate(Some(error)).await
    }

    async fn terminate(&self, error: Option<ErrorCondition>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::EndSession {
            channel: self.channel,
            error,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "session close")
            .await
    }

    /// Properties carried on the remote Begin, once open.
    pub fn properties(&self) -> Option<Fields> {
        self.shared.remote_begin().map(|begin| begin.properties)
    }

    /// Capabilities the remote offered on its Begin, once open.
    pub fn offered_capabilities(&self) -> Option<Vec<Symbol>> {
        self.shared
            .remote_begin()
            .map(|begin| begin.offered_capabilities)
    }

    /// Capabilities the remote desires, once open.
    pub fn desired_capabilities(&self) -> Option<Vec<Symbol>> {
        self.shared
            .remote_begin()
            .map(|begin| begin.desired_capabilities)
    }

    /// Whether the session has reached a terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}
