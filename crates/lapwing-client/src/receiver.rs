//! Receiver links
//!
//! Receivers consume deliveries from a queue the session's dispatch
//! executor feeds in wire order. Consuming a delivery notifies the driver,
//! which applies the auto-accept policy and tops the credit window back up.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use lapwing_types::definitions::Fields;
use lapwing_types::{ErrorCondition, Symbol};

use crate::delivery::Delivery;
use crate::driver::work::{DriverHandle, LinkAddr, LinkSeed, LinkShared, ReceiverEvent, Work};
use crate::error::{ClientError, Result};

/// A message-consuming link.
pub struct Receiver {
    driver: DriverHandle,
    addr: LinkAddr,
    name: String,
    shared: Arc<LinkShared>,
    deliveries: mpsc::UnboundedReceiver<ReceiverEvent>,
    terminal: Option<ClientError>,
}

impl Receiver {
    pub(crate) fn from_seed(driver: DriverHandle, seed: LinkSeed) -> Self {
        Self {
            driver,
            addr: seed.addr,
            name: seed.name,
            shared: seed.shared,
            deliveries: seed.deliveries.expect("receiver seed without delivery queue"),
            terminal: None,
        }
    }

    /// The link name carried on the attach.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the remote attach (or the failure that prevented it).
    pub async fn await_open(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::AwaitLinkOpen {
            addr: self.addr,
            reply,
        })?;
        self.driver
            .await_reply(rx, Duration::ZERO, "receiver open")
            .await
    }

    /// Wait for the next delivery.
    ///
    /// Fails when the link, session or connection closes while waiting.
    pub async fn receive(&mut self) -> Result<Delivery> {
        if let Some(error) = &self.terminal {
            return Err(error.clone());
        }
        match self.deliveries.recv().await {
            Some(ReceiverEvent::Delivery(delivery)) => {
                self.consumed(&delivery);
                Ok(delivery)
            }
            Some(ReceiverEvent::Closed(error)) => {
                self.terminal = Some(error.clone());
                Err(error)
            }
            None => Err(self.driver.shared.closed_error()),
        }
    }

    /// Wait up to `timeout` for a delivery; `None` when it elapses.
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Take a delivery only if one is already queued.
    pub fn try_receive(&mut self) -> Result<Option<Delivery>> {
        if let Some(error) = &self.terminal {
            return Err(error.clone());
        }
        match self.deliveries.try_recv() {
            Ok(ReceiverEvent::Delivery(delivery)) => {
                self.consumed(&delivery);
                Ok(Some(delivery))
            }
            Ok(ReceiverEvent::Closed(error)) => {
                self.terminal = Some(error.clone());
                Err(error)
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.driver.shared.closed_error()),
        }
    }

    fn consumed(&self, delivery: &Delivery) {
        let _ = self.driver.submit(Work::DeliveryConsumed {
            addr: self.addr,
            delivery_id: delivery.delivery_id(),
        });
    }

    /// Grant the sender `credit` more deliveries of credit.
    pub async fn add_credit(&self, credit: u32) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::AddCredit {
            addr: self.addr,
            credit,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "add_credit")
            .await
    }

    /// Ask the sender to use or return all outstanding credit.
    pub async fn drain(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::Drain {
            addr: self.addr,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "drain")
            .await
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
            .await_reply(rx, Duration::ZERO, "receiver close")
            .await
    }

    /// The source address, useful for dynamic receivers where the node
    /// name is generated by the peer.
    pub fn address(&self) -> Option<String> {
        self.shared
            .remote_attach()
            .and_then(|attach| attach.source)
            .and_then(|source| source.address)
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

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
