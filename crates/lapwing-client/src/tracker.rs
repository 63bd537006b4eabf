//! Tracker for outgoing deliveries
//!
//! A thin facade over the driver's record of an unsettled outgoing
//! delivery. Observation reads shared cells the driver writes; mutation
//! (disposition, settle) re-enters the driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use lapwing_types::{DeliveryNumber, DeliveryState};

use crate::driver::work::{DriverHandle, LinkAddr, TrackerSeed, TrackerShared, Work};
use crate::error::{ClientError, Result};

/// Tracks one sent delivery through to settlement.
pub struct Tracker {
    driver: DriverHandle,
    addr: LinkAddr,
    delivery_id: DeliveryNumber,
    shared: Arc<TrackerShared>,
    settlement: Option<oneshot::Receiver<Result<()>>>,
    outcome: Option<Result<()>>,
}

impl Tracker {
    pub(crate) fn from_seed(driver: DriverHandle, seed: TrackerSeed) -> Self {
        Self {
            driver,
            addr: seed.addr,
            delivery_id: seed.delivery_id,
            shared: seed.shared,
            settlement: Some(seed.settlement),
            outcome: None,
        }
    }

    /// The delivery tag this send was tagged with.
    pub fn tag(&self) -> &[u8] {
        self.shared.tag.as_slice()
    }

    /// Whether the delivery is settled locally.
    pub fn settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// Whether the remote has settled the delivery.
    pub fn remote_settled(&self) -> bool {
        self.shared.is_remote_settled()
    }

    /// The state most recently asserted by the remote.
    pub fn remote_state(&self) -> Option<DeliveryState> {
        self.shared.remote_state()
    }

    /// The local state most recently applied.
    pub fn state(&self) -> Option<DeliveryState> {
        self.shared.local_state()
    }

    /// Wait for the delivery to settle.
    ///
    /// Completes exactly once: the first await resolves when the remote
    /// reaches a terminal state (or the stack fails), and the outcome is
    /// cached for later calls.
    pub async fn settlement(&mut self) -> Result<()> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.settlement.take() {
            Some(settlement) => match settlement.await {
                Ok(result) => result,
                Err(_) => Err(self.driver.shared.closed_error()),
            },
            None => Ok(()),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Wait for settlement, bounded by `timeout`.
    pub async fn await_settlement(&mut self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.settlement()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::operation_timed_out(format!(
                "delivery was not settled within {timeout:?}"
            ))),
        }
    }

    /// Apply a local delivery state, optionally settling.
    pub async fn disposition(&self, state: DeliveryState, settle: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::SettleOutgoing {
            addr: self.addr,
            delivery_id: self.delivery_id,
            state: Some(state),
            settle,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "disposition")
            .await
    }

    /// Settle the delivery locally.
    pub async fn settle(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.driver.submit(Work::SettleOutgoing {
            addr: self.addr,
            delivery_id: self.delivery_id,
            state: None,
            settle: true,
            reply,
        })?;
        self.driver
            .await_reply(rx, self.driver.options.request_timeout, "settle")
            .await
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("delivery_id", &self.delivery_id)
            .field("tag", &self.tag())
            .field("settled", &self.settled())
            .field("remote_settled", &self.remote_settled())
            .finish()
    }
}
