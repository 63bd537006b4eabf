//! Incoming deliveries
//!
//! A delivery hands the application the accumulated payload of one
//! incoming transfer (or transfer series). The message decodes lazily and
//! is cached; dispositions re-enter the driver, which stamps them with the
//! session's active transaction when one is open.

use bytes::Bytes;
use tokio::sync::oneshot;

use lapwing_types::{DeliveryNumber, DeliveryState, DeliveryTag, Message};

use crate::driver::work::{DriverHandle, LinkAddr, Work};
use crate::error::{ClientError, Result};

/// One received message and its settlement controls.
///
/// A delivery spanning several transfer frames is reassembled inside the
/// driver and surfaces here only once complete, so the payload is always
/// whole.
pub struct Delivery {
    driver: DriverHandle,
    addr: LinkAddr,
    delivery_id: DeliveryNumber,
    tag: Option<DeliveryTag>,
    message_format: u32,
    payload: Bytes,
    remote_settled: bool,
    remote_state: Option<DeliveryState>,
    local_state: Option<DeliveryState>,
    settled: bool,
    decoded: Option<Message>,
}

impl Delivery {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        driver: DriverHandle,
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
        tag: Option<DeliveryTag>,
        message_format: u32,
        payload: Bytes,
        remote_settled: bool,
        remote_state: Option<DeliveryState>,
    ) -> Self {
        Self {
            driver,
            addr,
            delivery_id,
            tag,
            message_format,
            payload,
            remote_settled,
            remote_state,
            local_state: None,
            settled: false,
            decoded: None,
        }
    }

    pub(crate) fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Decode the message from the accumulated payload.
    ///
    /// The decode happens once and is cached. Applications that want the
    /// body bytes without a decode go through [`Self::raw_input_stream`].
    pub fn message(&mut self) -> Result<&Message> {
        if self.decoded.is_none() {
            let message = Message::decode(&self.payload)
                .map_err(|error| ClientError::io(format!("message decoding failed: {error}")))?;
            self.decoded = Some(message);
        }
        Ok(self.decoded.as_ref().expect("decoded message missing"))
    }

    /// The raw payload bytes of the delivery.
    ///
    /// Deliveries surface only once fully reassembled, so this is the
    /// whole payload rather than an incremental stream.
    pub fn raw_input_stream(&self) -> &Bytes {
        &self.payload
    }

    pub fn tag(&self) -> Option<&DeliveryTag> {
        self.tag.as_ref()
    }

    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    pub fn remote_settled(&self) -> bool {
        self.remote_settled
    }

    pub fn remote_state(&self) -> Option<&DeliveryState> {
        self.remote_state.as_ref()
    }

    pub fn state(&self) -> Option<&DeliveryState> {
        self.local_state.as_ref()
    }

    pub fn settled(&self) -> bool {
        self.settled
    }

    /// Accept and settle the delivery.
    pub async fn accept(&mut self) -> Result<()> {
        self.disposition(DeliveryState::Accepted, true).await
    }

    /// Apply a delivery state, optionally settling.
    pub async fn disposition(&mut self, state: DeliveryState, settle: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DisposeIncoming {
            addr: self.addr,
            delivery_id: self.delivery_id,
            state: Some(state.clone()),
            settle,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "disposition")
            .await?;
        self.local_state = Some(state);
        if settle {
            self.settled = true;
        }
        Ok(())
    }

    /// Settle without asserting a state.
    pub async fn settle(&mut self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::DisposeIncoming {
            addr: self.addr,
            delivery_id: self.delivery_id,
            state: None,
            settle: true,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "settle")
            .await?;
        self.settled = true;
        Ok(())
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("remote_settled", &self.remote_settled)
            .finish()
    }
}
