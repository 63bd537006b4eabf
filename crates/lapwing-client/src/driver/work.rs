//! Work items and handle plumbing
//!
//! Every protocol-affecting call enqueues a [`Work`] item onto the
//! connection driver's FIFO and awaits a oneshot reply. The driver is the
//! only task that ever touches protocol state; the structures here are the
//! messages and shared read-only cells that cross the boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use lapwing_types::definitions::Fields;
use lapwing_types::{
    Attach, Begin, DeliveryNumber, DeliveryState, DeliveryTag, ErrorCondition, Handle, Open,
};

use crate::capabilities::Capabilities;
use crate::error::{ClientError, Result};
use crate::options::{ConnectionOptions, ReceiverOptions, SenderOptions, SessionOptions};

// ----------------------------------------------------------------------------
// Addresses
// ----------------------------------------------------------------------------

/// Stable address of a link inside its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LinkAddr {
    pub channel: u16,
    pub handle: Handle,
}

// ----------------------------------------------------------------------------
// Reply Seeds
// ----------------------------------------------------------------------------

/// Driver-produced material a `Session` handle is built from.
#[derive(Debug)]
pub(crate) struct SessionSeed {
    pub channel: u16,
    pub id: String,
    pub shared: Arc<SessionShared>,
}

/// Driver-produced material a `Sender` or `Receiver` handle is built from.
pub(crate) struct LinkSeed {
    pub addr: LinkAddr,
    pub name: String,
    pub shared: Arc<LinkShared>,
    /// Present for receivers: the queue deliveries arrive on.
    pub deliveries: Option<mpsc::UnboundedReceiver<ReceiverEvent>>,
}

/// Driver-produced material a `Tracker` is built from.
pub(crate) struct TrackerSeed {
    pub addr: LinkAddr,
    pub delivery_id: DeliveryNumber,
    pub shared: Arc<TrackerShared>,
    pub settlement: oneshot::Receiver<Result<()>>,
}

/// Event pushed to a receiver's delivery queue by the dispatch executor.
#[derive(Debug)]
pub(crate) enum ReceiverEvent {
    Delivery(crate::delivery::Delivery),
    Closed(ClientError),
}

// ----------------------------------------------------------------------------
// Work
// ----------------------------------------------------------------------------

/// A unit of protocol-affecting work executed on the driver.
pub(crate) enum Work {
    // Connection level
    AwaitOpen {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenSession {
        options: SessionOptions,
        reply: oneshot::Sender<Result<SessionSeed>>,
    },
    DefaultSession {
        reply: oneshot::Sender<Result<SessionSeed>>,
    },
    /// Send through the lazily created anonymous connection sender.
    ConnectionSend {
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<TrackerSeed>>,
    },

    // Session level
    AwaitSessionOpen {
        channel: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    EndSession {
        channel: u16,
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    },
    OpenSender {
        /// `None` targets the lazily created root session.
        channel: Option<u16>,
        address: Option<String>,
        anonymous: bool,
        options: SenderOptions,
        reply: oneshot::Sender<Result<LinkSeed>>,
    },
    OpenReceiver {
        channel: Option<u16>,
        address: Option<String>,
        dynamic: bool,
        dynamic_node_properties: Fields,
        options: ReceiverOptions,
        reply: oneshot::Sender<Result<LinkSeed>>,
    },
    BeginTransaction {
        channel: u16,
        reply: oneshot::Sender<Result<()>>,
    },
    DischargeTransaction {
        channel: u16,
        /// `true` rolls back, `false` commits.
        fail: bool,
        reply: oneshot::Sender<Result<()>>,
    },

    // Link level
    AwaitLinkOpen {
        addr: LinkAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    DetachLink {
        addr: LinkAddr,
        closed: bool,
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    },
    Send {
        addr: LinkAddr,
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<TrackerSeed>>,
    },
    TrySend {
        addr: LinkAddr,
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<Option<TrackerSeed>>>,
    },
    AddCredit {
        addr: LinkAddr,
        credit: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    Drain {
        addr: LinkAddr,
        reply: oneshot::Sender<Result<()>>,
    },
    /// A receiver's application finished consuming a delivery.
    DeliveryConsumed {
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
    },
    DisposeIncoming {
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
        state: Option<DeliveryState>,
        settle: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SettleOutgoing {
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
        state: Option<DeliveryState>,
        settle: bool,
        reply: oneshot::Sender<Result<()>>,
    },

    // Internal
    Timer {
        id: u64,
        purpose: TimerPurpose,
    },
}

/// What a fired timer means to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerPurpose {
    ConnectionOpen,
    ConnectionClose,
    SessionBegin { channel: u16 },
    SessionEnd { channel: u16 },
    LinkAttach { addr: LinkAddr },
    LinkDetach { addr: LinkAddr },
    SendCredit { addr: LinkAddr, sequence: u64 },
    TransactionRequest { channel: u16 },
    IdleHeartbeat,
}

// ----------------------------------------------------------------------------
// Shared Cells
// ----------------------------------------------------------------------------

/// Facts about the connection the driver publishes for handle threads.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub container_id: String,
    closed: AtomicBool,
    failure: OnceLock<ClientError>,
    // Reset on reconnect, so these are cells rather than write-once slots.
    capabilities: Mutex<Option<Capabilities>>,
    remote_open: Mutex<Option<Open>>,
}

impl ConnectionShared {
    pub fn new(container_id: String) -> Self {
        Self {
            container_id,
            closed: AtomicBool::new(false),
            failure: OnceLock::new(),
            capabilities: Mutex::new(None),
            remote_open: Mutex::new(None),
        }
    }

    /// Flip the closed flag; returns `true` for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the failure cause; the first writer wins.
    pub fn set_failure(&self, error: ClientError) {
        let _ = self.failure.set(error);
    }

    pub fn failure(&self) -> Option<ClientError> {
        self.failure.get().cloned()
    }

    pub fn set_capabilities(&self, capabilities: Option<Capabilities>) {
        *self.capabilities.lock().expect("capabilities cell poisoned") = capabilities;
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        *self.capabilities.lock().expect("capabilities cell poisoned")
    }

    pub fn set_remote_open(&self, open: Open) {
        *self.remote_open.lock().expect("remote open cell poisoned") = Some(open);
    }

    pub fn remote_open(&self) -> Option<Open> {
        self.remote_open
            .lock()
            .expect("remote open cell poisoned")
            .clone()
    }

    /// The error operations on a closed connection fail with.
    pub fn closed_error(&self) -> ClientError {
        match self.failure() {
            Some(cause) => cause,
            None => ClientError::closed("the connection is closed"),
        }
    }
}

/// Facts about a session the driver publishes for handle threads.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    closed: AtomicBool,
    failure: Mutex<Option<ClientError>>,
    remote_begin: Mutex<Option<Begin>>,
}

impl SessionShared {
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the failure cause; the first writer wins.
    pub fn set_failure(&self, error: ClientError) {
        let mut cell = self.failure.lock().expect("session failure cell poisoned");
        if cell.is_none() {
            *cell = Some(error);
        }
    }

    pub fn failure(&self) -> Option<ClientError> {
        self.failure
            .lock()
            .expect("session failure cell poisoned")
            .clone()
    }

    pub fn set_remote_begin(&self, begin: Begin) {
        *self.remote_begin.lock().expect("remote begin cell poisoned") = Some(begin);
    }

    pub fn remote_begin(&self) -> Option<Begin> {
        self.remote_begin
            .lock()
            .expect("remote begin cell poisoned")
            .clone()
    }
}

/// Facts about a link the driver publishes for handle threads.
#[derive(Debug, Default)]
pub(crate) struct LinkShared {
    closed: AtomicBool,
    failure: Mutex<Option<ClientError>>,
    remote_attach: Mutex<Option<Attach>>,
}

impl LinkShared {
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the failure cause; the first writer wins.
    pub fn set_failure(&self, error: ClientError) {
        let mut cell = self.failure.lock().expect("link failure cell poisoned");
        if cell.is_none() {
            *cell = Some(error);
        }
    }

    pub fn failure(&self) -> Option<ClientError> {
        self.failure
            .lock()
            .expect("link failure cell poisoned")
            .clone()
    }

    pub fn set_remote_attach(&self, attach: Attach) {
        *self
            .remote_attach
            .lock()
            .expect("remote attach cell poisoned") = Some(attach);
    }

    pub fn remote_attach(&self) -> Option<Attach> {
        self.remote_attach
            .lock()
            .expect("remote attach cell poisoned")
            .clone()
    }
}

/// Settlement facts about an outgoing delivery, written by the driver.
#[derive(Debug)]
pub(crate) struct TrackerShared {
    pub tag: DeliveryTag,
    settled: AtomicBool,
    remote_settled: AtomicBool,
    remote_state: Mutex<Option<DeliveryState>>,
    local_state: Mutex<Option<DeliveryState>>,
}

impl TrackerShared {
    pub fn new(tag: DeliveryTag) -> Self {
        Self {
            tag,
            settled: AtomicBool::new(false),
            remote_settled: AtomicBool::new(false),
            remote_state: Mutex::new(None),
            local_state: Mutex::new(None),
        }
    }

    pub fn mark_settled(&self) {
        self.settled.store(true, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub fn mark_remote_settled(&self) {
        self.remote_settled.store(true, Ordering::Release);
    }

    pub fn is_remote_settled(&self) -> bool {
        self.remote_settled.load(Ordering::Acquire)
    }

    pub fn set_remote_state(&self, state: DeliveryState) {
        *self.remote_state.lock().expect("remote state poisoned") = Some(state);
    }

    pub fn remote_state(&self) -> Option<DeliveryState> {
        self.remote_state
            .lock()
            .expect("remote state poisoned")
            .clone()
    }

    pub fn set_local_state(&self, state: DeliveryState) {
        *self.local_state.lock().expect("local state poisoned") = Some(state);
    }

    pub fn local_state(&self) -> Option<DeliveryState> {
        self.local_state
            .lock()
            .expect("local state poisoned")
            .clone()
    }
}

// ----------------------------------------------------------------------------
// Driver Handle
// ----------------------------------------------------------------------------

/// Cloneable front every public handle holds onto the driver.
#[derive(Clone)]
pub(crate) struct DriverHandle {
    pub work_tx: mpsc::UnboundedSender<Work>,
    pub shared: Arc<ConnectionShared>,
    pub options: Arc<ConnectionOptions>,
}

impl DriverHandle {
    /// Enqueue work, mapping a dead driver to the connection's failure.
    pub fn submit(&self, work: Work) -> Result<()> {
        self.work_tx
            .send(work)
            .map_err(|_| self.shared.closed_error())
    }

    /// Await a reply with the given timeout; zero disables the timeout.
    pub async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T>>,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        if timeout.is_zero() {
            return self.flatten(reply.await, what);
        }
        match tokio::time::timeout(timeout, reply).await {
            Ok(received) => self.flatten(received, what),
            Err(_) => Err(ClientError::operation_timed_out(format!(
                "{what} timed out after {timeout:?}"
            ))),
        }
    }

    fn flatten<T>(
        &self,
        received: std::result::Result<Result<T>, oneshot::error::RecvError>,
        what: &str,
    ) -> Result<T> {
        match received {
            Ok(result) => result,
            // Driver dropped the reply without answering; surface the
            // connection's terminal state instead of a channel error.
            Err(_) => Err(match self.shared.failure() {
                Some(cause) => cause,
                None => ClientError::closed(format!("{what} abandoned: the connection is closed")),
            }),
        }
    }
}
