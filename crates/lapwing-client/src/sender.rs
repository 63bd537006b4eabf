//! Sender links
//!
//! Senders push messages through the connection driver. `send` blocks
//! while the link is out of credit, up to the resolved send timeout;
//! `try_send` reports absence of credit immediately.

use std::sync::Arc;

use tokio::sync::oneshot;

use lapwing_types::definitions::Fields;
use lapwing_types::{ErrorCondition, Message, Symbol};

use crate::driver::work::{DriverHandle, LinkAddr, LinkSeed, LinkShared, Work};
use crate::error::{ClientError, Result};
use crate::tracker::Tracker;

/// A message-sending link.
pub struct Sender {
    driver: DriverHandle,
    addr: LinkAddr,
    name: String,
    shared: Arc<LinkShared>,
}

impl Sender {
    pub(crate) fn from_seed(driver: DriverHandle, seed: LinkSeed) -> Self {
        Self {
            driver,
            addr: seed.addr,
            name: seed.name,
            shared: seed.shared,
        }
    }

    /// The link name carried on the attach.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the remote attach (or the failure that prevented it).
    pub async fn await_open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver
            .submit(Work::AwaitLinkOpen {
                addr: self.addr,
                reply,
            })?;
        self.driver
            .await_reply(rx, std::time::Duration::ZERO, "sender open")
            .await
    }

    /// The error this link terminated with, once terminal.
    fn terminal_error(&self) -> Option<ClientError> {
        if self.shared.is_closed() {
            Some(
                self.shared
                    .failure()
                    .unwrap_or_else(|| ClientError::closed("the sender is closed")),
            )
        } else {
            None
        }
    }

    /// Send a message, waiting for credit up to the send timeout.
    pub async fn send(&self, message: &Message) -> Result<Tracker> {
        if let Some(error) = self.terminal_error() {
            return Err(error);
        }
        let payload = message
            .encode()
            .map_err(|error| ClientError::io(format!("message encoding failed: {error}")))?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::Send {
            addr: self.addr,
            payload,
            message_format: 0,
            reply,
        })?;
        // The driver owns the send deadline; no outer timeout here.
        let seed = self
            .driver
            .await_reply(rx, std::time::Duration::ZERO, "send")
            .await?;
        Ok(Tracker::from_seed(self.driver.clone(), seed))
    }

    /// Send only if credit is available right now.
    pub async fn try_send(&self, message: &Message) -> Result<Option<Tracker>> {
        if let Some(error) = self.terminal_error() {
            return Err(error);
        }
        let payload = message
            .encode()
            .map_err(|error| ClientError::io(format!("message encoding failed: {error}")))?;
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::TrySend {
            addr: self.addr,
            payload,
            message_format: 0,
            reply,
        })?;
        let seed = self
            .driver
            .await_reply(rx, self.driver.options.request_timeout, "try_send")
            .await?;
        Ok(seed.map(|seed| Tracker::from_seed(self.driver.clone(), seed)))
    }

    /// Close the link (detach with closed=true).
    pub async fn close(&self) -> Result<()> {
        self.terminate(true, None).await
    }

    /// Close the link reporting an error to the peer.
    pub async fn close_with_error(&self, error: ErrorCondition) -> Result<()> {
        self.terminate(true, Some(error)).await
    }

    /// Detach the link without closing it.
    pub async fn detach(&self) -> Result<()> {
        self.terminate(false, None).await
    }

    async fn terminate(&self, closed: bool, error: Option<ErrorCondition>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DetachLink {
            addr: self.addr,
            closed,
            error,
            reply,
        })?;
        self.driver
            .await_reply(rx, std::time::Duration::ZERO, "sender close")
            .await
    }

    /// Properties carried on the remote attach, once attached.
    pub fn properties(&self) -> Option<Fields> {
        self.shared.remote_attach().map(|attach| attach.properties)
    }

    /// Capabilities the remote offered on its attach, once attached.
    pub fn offered_capabilities(&self) -> Option<Vec<Symbol>> {
        self.shared
            .remote_attach()
            .map(|attach| attach.offered_capabilities)
    }

    /// Capabilities the remote desires, once attached.
    pub fn desired_capabilities(&self) -> Option<Vec<Symbol>> {
        self.shared
            .remote_attach()
            .map(|attach| attach.desired_capabilities)
    }

    /// Whether the link has reached a terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
