//! Link state machines
//!
//! Sender and receiver cores owned by the driver. Senders manage credit,
//! delivery tags, the blocked-send queue and the unsettled-delivery map;
//! receivers manage the credit window, incoming delivery assembly and the
//! queue toward the application.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use lapwing_types::{
    Attach, DeliveryNumber, DeliveryState, DeliveryTag, Frame, Performative, SenderSettleMode,
    Transfer, TxnId,
};

use crate::driver::txn::TxnOp;
use crate::driver::work::{LinkAddr, LinkShared, ReceiverEvent, TrackerSeed, TrackerShared};
use crate::error::{ClientError, Result};

// ----------------------------------------------------------------------------
// Common Link State
// ----------------------------------------------------------------------------

/// Lifecycle of a link endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// Anonymous sender waiting for the remote Open before attaching.
    PendingCapabilities,
    AttachSent,
    Attached,
    DetachSent,
    Closed,
    Failed,
}

/// Timeouts resolved against the session and connection defaults.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkTimeouts {
    pub open: Duration,
    pub close: Duration,
    pub send: Duration,
}

/// Fields shared by both link roles.
pub(crate) struct LinkBase {
    pub name: String,
    pub addr: LinkAddr,
    pub state: LinkState,
    pub shared: Arc<LinkShared>,
    /// The attach this endpoint sends; kept for deferred or replayed emission.
    pub attach: Attach,
    pub timeouts: LinkTimeouts,
    pub open_waiters: Vec<oneshot::Sender<Result<()>>>,
    pub open_timer: Option<u64>,
    pub detach_waiters: Vec<oneshot::Sender<Result<()>>>,
    pub detach_timer: Option<u64>,
    pub failure: Option<ClientError>,
}

impl LinkBase {
    pub fn new(attach: Attach, addr: LinkAddr, state: LinkState, timeouts: LinkTimeouts) -> Self {
        Self {
            name: attach.name.clone(),
            addr,
            state,
            shared: Arc::new(LinkShared::default()),
            attach,
            timeouts,
            open_waiters: Vec::new(),
            open_timer: None,
            detach_waiters: Vec::new(),
            detach_timer: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, LinkState::Closed | LinkState::Failed)
    }

    /// Complete every open waiter with the given result.
    pub fn finish_open_waiters(&mut self, result: &Result<()>) {
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn finish_detach_waiters(&mut self) {
        for waiter in self.detach_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }
}

// ----------------------------------------------------------------------------
// Sender Core
// ----------------------------------------------------------------------------

/// A send parked while the link has no credit.
pub(crate) struct BlockedSend {
    pub sequence: u64,
    pub payload: Bytes,
    pub message_format: u32,
    pub reply: oneshot::Sender<Result<TrackerSeed>>,
    pub timer: Option<u64>,
    pub txn_op: Option<TxnOp>,
}

/// Driver-side record of an unsettled outgoing delivery.
pub(crate) struct TrackerSlot {
    pub shared: Arc<TrackerShared>,
    pub settlement: Option<oneshot::Sender<Result<()>>>,
    pub txn_op: Option<TxnOp>,
}

pub(crate) struct SenderCore {
    pub base: LinkBase,
    pub credit: u32,
    pub delivery_count: u32,
    next_tag: u64,
    next_send_sequence: u64,
    pub settle_mode: SenderSettleMode,
    pub auto_settle: bool,
    pub anonymous: bool,
    pub coordinator: bool,
    pub blocked: VecDeque<BlockedSend>,
    pub unsettled: HashMap<DeliveryNumber, TrackerSlot>,
}

/// What applying a remote disposition to a sender implies for the driver.
pub(crate) enum DispositionEffect {
    /// Application tracker updated, nothing more to do.
    Handled,
    /// A coordinator operation resolved; the transaction machine decides.
    Transaction {
        op: TxnOp,
        state: Option<DeliveryState>,
    },
}

impl SenderCore {
    pub fn new(
        base: LinkBase,
        settle_mode: SenderSettleMode,
        auto_settle: bool,
        anonymous: bool,
        coordinator: bool,
    ) -> Self {
        Self {
            base,
            credit: 0,
            delivery_count: 0,
            next_tag: 0,
            next_send_sequence: 0,
            settle_mode,
            auto_settle,
            anonymous,
            coordinator,
            blocked: VecDeque::new(),
            unsettled: HashMap::new(),
        }
    }

    pub fn next_send_sequence(&mut self) -> u64 {
        let sequence = self.next_send_sequence;
        self.next_send_sequence += 1;
        sequence
    }

    /// Whether a transfer can be emitted right now.
    pub fn sendable(&self) -> bool {
        self.base.state == LinkState::Attached && self.credit > 0
    }

    /// Emit one transfer, consuming one credit and the next delivery tag.
    ///
    /// Callers must have checked [`Self::sendable`]; the payload is the
    /// already-encoded message. When `txn_id` is set the transfer is
    /// stamped with a transactional state carrying it.
    pub fn perform_transfer(
        &mut self,
        next_outgoing_id: &mut DeliveryNumber,
        txn_id: Option<TxnId>,
        payload: Bytes,
        message_format: u32,
        txn_op: Option<TxnOp>,
        out: &mut Vec<Frame>,
    ) -> TrackerSeed {
        debug_assert!(self.credit > 0, "transfer emitted without credit");

        let tag = DeliveryTag::from_counter(self.next_tag);
        self.next_tag += 1;
        let delivery_id = *next_outgoing_id;
        *next_outgoing_id = next_outgoing_id.wrapping_add(1);
        self.credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);

        let settled = self.settle_mode == SenderSettleMode::Settled && !self.coordinator;
        let state = match (&txn_id, self.coordinator) {
            (Some(txn_id), false) => Some(DeliveryState::Transactional {
                txn_id: txn_id.clone(),
                outcome: None,
            }),
            _ => None,
        };

        out.push(Frame::amqp(
            self.base.addr.channel,
            Performative::Transfer(Transfer {
                handle: self.base.addr.handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(tag.clone()),
                message_format: Some(message_format),
                settled: Some(settled),
                more: false,
                state,
                aborted: false,
                payload,
            }),
        ));

        let shared = Arc::new(TrackerShared::new(tag));
        let (settle_tx, settle_rx) = oneshot::channel();

        if settled {
            shared.mark_settled();
            let _ = settle_tx.send(Ok(()));
        } else {
            self.unsettled.insert(
                delivery_id,
                TrackerSlot {
                    shared: Arc::clone(&shared),
                    settlement: Some(settle_tx),
                    txn_op,
                },
            );
        }

        TrackerSeed {
            addr: self.base.addr,
            delivery_id,
            shared,
            settlement: settle_rx,
        }
    }

    /// Apply a link flow from the peer, returning `true` when the peer is
    /// draining and the sender should answer.
    pub fn apply_flow(&mut self, link_credit: u32, delivery_count: Option<u32>, drain: bool) -> bool {
        self.credit = match delivery_count {
            Some(at_peer) => {
                let in_flight = self.delivery_count.wrapping_sub(at_peer);
                link_credit.saturating_sub(in_flight)
            }
            None => link_credit,
        };
        drain
    }

    /// Consume remaining credit in response to a drain request.
    pub fn drain_credit(&mut self) {
        self.delivery_count = self.delivery_count.wrapping_add(self.credit);
        self.credit = 0;
    }

    /// Apply a remote disposition for one of this sender's deliveries.
    pub fn apply_remote_disposition(
        &mut self,
        delivery_id: DeliveryNumber,
        state: Option<&DeliveryState>,
        settled: bool,
    ) -> Option<DispositionEffect> {
        let slot = self.unsettled.get_mut(&delivery_id)?;

        if let Some(op) = slot.txn_op.clone() {
            let terminal = settled || state.is_some_and(|s| s.is_terminal());
            if terminal {
                let slot = self.unsettled.remove(&delivery_id).expect("slot vanished");
                drop(slot);
                return Some(DispositionEffect::Transaction {
                    op,
                    state: state.cloned(),
                });
            }
            return Some(DispositionEffect::Handled);
        }

        if let Some(state) = state {
            slot.shared.set_remote_state(state.clone());
        }
        if settled {
            slot.shared.mark_remote_settled();
        }

        let terminal = state.is_some_and(|s| s.is_terminal());
        if settled || terminal {
            let result = match state.and_then(|s| s.outcome()) {
                Some(DeliveryState::Modified {
                    delivery_failed,
                    undeliverable_here,
                    ..
                }) => Err(ClientError::DeliveryModified {
                    delivery_failed: *delivery_failed,
                    undeliverable_here: *undeliverable_here,
                }),
                _ => Ok(()),
            };
            if let Some(settlement) = slot.settlement.take() {
                let _ = settlement.send(result);
            }
            if settled && self.auto_settle {
                slot.shared.mark_settled();
                self.unsettled.remove(&delivery_id);
            }
        }

        Some(DispositionEffect::Handled)
    }

    /// Fail every parked and unsettled delivery with the given error.
    pub fn fail_pending(&mut self, error: &ClientError) {
        for blocked in self.blocked.drain(..) {
            let _ = blocked.reply.send(Err(error.clone()));
        }
        for (_, mut slot) in self.unsettled.drain() {
            if let Some(settlement) = slot.settlement.take() {
                let _ = settlement.send(Err(error.clone()));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Receiver Core
// ----------------------------------------------------------------------------

/// A multi-frame delivery being reassembled.
pub(crate) struct IncomingAssembly {
    pub delivery_id: DeliveryNumber,
    pub tag: Option<DeliveryTag>,
    pub message_format: u32,
    pub payload: BytesMut,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

/// A fully reassembled incoming delivery.
pub(crate) struct CompletedDelivery {
    pub delivery_id: DeliveryNumber,
    pub tag: Option<DeliveryTag>,
    pub message_format: u32,
    pub payload: Bytes,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

pub(crate) struct ReceiverCore {
    pub base: LinkBase,
    pub credit_window: u32,
    pub credit: u32,
    pub auto_accept: bool,
    pub auto_settle: bool,
    /// Deliveries handed to the application but not yet consumed.
    pub queued: u32,
    pub events: mpsc::UnboundedSender<ReceiverEvent>,
    pub assembly: Option<IncomingAssembly>,
    pub drain_reply: Option<oneshot::Sender<Result<()>>>,
}

impl ReceiverCore {
    pub fn new(
        base: LinkBase,
        credit_window: u32,
        auto_accept: bool,
        auto_settle: bool,
        events: mpsc::UnboundedSender<ReceiverEvent>,
    ) -> Self {
        Self {
            base,
            credit_window,
            credit: 0,
            auto_accept,
            auto_settle,
            queued: 0,
            events,
            assembly: None,
            drain_reply: None,
        }
    }

    /// Ingest one transfer frame; yields the delivery once complete.
    pub fn apply_transfer(&mut self, transfer: Transfer) -> Option<CompletedDelivery> {
        let assembly = match self.assembly.take() {
            Some(mut assembly) => {
                assembly.payload.extend_from_slice(&transfer.payload);
                if transfer.settled.unwrap_or(false) {
                    assembly.settled = true;
                }
                if transfer.state.is_some() {
                    assembly.state = transfer.state;
                }
                assembly
            }
            None => {
                self.credit = self.credit.saturating_sub(1);
                IncomingAssembly {
                    delivery_id: transfer.delivery_id.unwrap_or_default(),
                    tag: transfer.delivery_tag,
                    message_format: transfer.message_format.unwrap_or(0),
                    payload: BytesMut::from(&transfer.payload[..]),
                    settled: transfer.settled.unwrap_or(false),
                    state: transfer.state,
                }
            }
        };

        if transfer.more {
            self.assembly = Some(assembly);
            return None;
        }

        self.queued += 1;
        Some(CompletedDelivery {
            delivery_id: assembly.delivery_id,
            tag: assembly.tag,
            message_format: assembly.message_format,
            payload: assembly.payload.freeze(),
            settled: assembly.settled,
            state: assembly.state,
        })
    }

    /// How much credit to grant to restore the window, if any.
    pub fn replenish_target(&self) -> Option<u32> {
        if self.credit_window == 0 {
            return None;
        }
        let outstanding = self.credit + self.queued;
        if outstanding < self.credit_window {
            Some(self.credit_window - outstanding)
        } else {
            None
        }
    }

    /// Push an event toward the application queue.
    pub fn notify(&self, event: ReceiverEvent) {
        let _ = self.events.send(event);
    }
}

// ----------------------------------------------------------------------------
// Link Sum
// ----------------------------------------------------------------------------

pub(crate) enum LinkCore {
    Sender(SenderCore),
    Receiver(ReceiverCore),
}

impl LinkCore {
    pub fn base(&self) -> &LinkBase {
        match self {
            LinkCore::Sender(sender) => &sender.base,
            LinkCore::Receiver(receiver) => &receiver.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut LinkBase {
        match self {
            LinkCore::Sender(sender) => &mut sender.base,
            LinkCore::Receiver(receiver) => &mut receiver.base,
        }
    }

    pub fn as_sender_mut(&mut self) -> Option<&mut SenderCore> {
        match self {
            LinkCore::Sender(sender) => Some(sender),
            LinkCore::Receiver(_) => None,
        }
    }

    pub fn as_receiver_mut(&mut self) -> Option<&mut ReceiverCore> {
        match self {
            LinkCore::Sender(_) => None,
            LinkCore::Receiver(receiver) => Some(receiver),
        }
    }

    /// Fail the link: waiters, parked sends, trackers and the delivery
    /// queue all observe the same error.
    pub fn fail(&mut self, error: &ClientError) {
        {
            let base = self.base_mut();
            base.state = LinkState::Failed;
            base.failure = Some(error.clone());
            base.shared.set_failure(error.clone());
            base.shared.mark_closed();
            base.finish_open_waiters(&Err(error.clone()));
            base.finish_detach_waiters();
        }
        match self {
            LinkCore::Sender(sender) => sender.fail_pending(error),
            LinkCore::Receiver(receiver) => {
                receiver.notify(ReceiverEvent::Closed(error.clone()));
                if let Some(reply) = receiver.drain_reply.take() {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lapwing_types::{AttachTarget, Role, Target};

    fn test_attach(name: &str) -> Attach {
        Attach {
            name: name.to_string(),
            handle: 0,
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: lapwing_types::ReceiverSettleMode::First,
            source: Some(lapwing_types::Source::default()),
            target: Some(AttachTarget::Node(Target::with_address("q"))),
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Default::default(),
        }
    }

    fn test_sender(settle_mode: SenderSettleMode) -> SenderCore {
        let base = LinkBase::new(
            test_attach("sender-0:1"),
            LinkAddr {
                channel: 0,
                handle: 0,
            },
            LinkState::Attached,
            LinkTimeouts {
                open: Duration::from_secs(1),
                close: Duration::from_secs(1),
                send: Duration::from_secs(1),
            },
        );
        SenderCore::new(base, settle_mode, true, false, false)
    }

    #[test]
    fn test_transfer_consumes_one_credit() {
        let mut sender = test_sender(SenderSettleMode::Unsettled);
        sender.apply_flow(3, Some(0), false);
        assert_eq!(sender.credit, 3);

        let mut next_id = 0;
        let mut out = Vec::new();
        for expected in [2u32, 1, 0] {
            sender.perform_transfer(
                &mut next_id,
                None,
                Bytes::from_static(b"m"),
                0,
                None,
                &mut out,
            );
            assert_eq!(sender.credit, expected);
        }
        assert!(!sender.sendable());
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_delivery_tags_start_at_zero_and_increase() {
        let mut sender = test_sender(SenderSettleMode::Unsettled);
        sender.apply_flow(300, Some(0), false);

        let mut next_id = 0;
        let mut out = Vec::new();
        let mut tags = Vec::new();
        for _ in 0..300 {
            let seed = sender.perform_transfer(
                &mut next_id,
                None,
                Bytes::from_static(b"m"),
                0,
                None,
                &mut out,
            );
            tags.push(seed.shared.tag.clone());
        }
        assert_eq!(tags[0].as_slice(), &[0]);
        assert_eq!(tags[255].as_slice(), &[255]);
        assert_eq!(tags[256].as_slice(), &[1, 0]);
        for pair in tags.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_pre_settled_transfer_completes_immediately() {
        let mut sender = test_sender(SenderSettleMode::Settled);
        sender.apply_flow(1, Some(0), false);

        let mut next_id = 0;
        let mut out = Vec::new();
        let seed = sender.perform_transfer(
            &mut next_id,
            None,
            Bytes::from_static(b"m"),
            0,
            None,
            &mut out,
        );
        assert!(seed.shared.is_settled());
        assert!(sender.unsettled.is_empty());
    }

    #[test]
    fn test_transactional_stamp_on_transfer() {
        let mut sender = test_sender(SenderSettleMode::Unsettled);
        sender.apply_flow(1, Some(0), false);

        let txn_id = TxnId::from_slice(&[0, 1, 2, 3]);
        let mut next_id = 0;
        let mut out = Vec::new();
        sender.perform_transfer(
            &mut next_id,
            Some(txn_id.clone()),
            Bytes::from_static(b"m"),
            0,
            None,
            &mut out,
        );

        match out[0].performative() {
            Some(Performative::Transfer(transfer)) => match &transfer.state {
                Some(DeliveryState::Transactional { txn_id: stamped, .. }) => {
                    assert_eq!(*stamped, txn_id);
                }
                other => panic!("missing transactional stamp: {other:?}"),
            },
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_disposition_accept_settles_with_auto_settle() {
        let mut sender = test_sender(SenderSettleMode::Unsettled);
        sender.apply_flow(1, Some(0), false);

        let mut next_id = 0;
        let mut out = Vec::new();
        let seed = sender.perform_transfer(
            &mut next_id,
            None,
            Bytes::from_static(b"m"),
            0,
            None,
            &mut out,
        );
        assert!(!seed.shared.is_settled());

        sender.apply_remote_disposition(seed.delivery_id, Some(&DeliveryState::Accepted), true);
        assert!(seed.shared.is_remote_settled());
        assert!(seed.shared.is_settled());
        assert_eq!(
            seed.shared.remote_state(),
            Some(DeliveryState::Accepted)
        );
        assert!(sender.unsettled.is_empty());
    }

    #[test]
    fn test_receiver_window_replenish_accounts_for_queue() {
        let (events, _rx) = mpsc::unbounded_channel();
        let base = LinkBase::new(
            test_attach("receiver-0:1"),
            LinkAddr {
                channel: 0,
                handle: 1,
            },
            LinkState::Attached,
            LinkTimeouts {
                open: Duration::from_secs(1),
                close: Duration::from_secs(1),
                send: Duration::from_secs(1),
            },
        );
        let mut receiver = ReceiverCore::new(base, 10, true, true, events);

        assert_eq!(receiver.replenish_target(), Some(10));
        receiver.credit = 10;
        assert_eq!(receiver.replenish_target(), None);

        // A delivery arrives and sits in the application queue.
        let completed = receiver.apply_transfer(Transfer {
            handle: 1,
            delivery_id: Some(0),
            delivery_tag: Some(DeliveryTag::from_counter(0)),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            state: None,
            aborted: false,
            payload: Bytes::from_static(b"m"),
        });
        assert!(completed.is_some());
        assert_eq!(receiver.credit, 9);
        assert_eq!(receiver.queued, 1);
        assert_eq!(receiver.replenish_target(), None);

        // Consuming it opens one slot in the window.
        receiver.queued = 0;
        assert_eq!(receiver.replenish_target(), Some(1));
    }

    #[test]
    fn test_multi_frame_assembly() {
        let (events, _rx) = mpsc::unbounded_channel();
        let base = LinkBase::new(
            test_attach("receiver-0:2"),
            LinkAddr {
                channel: 0,
                handle: 2,
            },
            LinkState::Attached,
            LinkTimeouts {
                open: Duration::from_secs(1),
                close: Duration::from_secs(1),
                send: Duration::from_secs(1),
            },
        );
        let mut receiver = ReceiverCore::new(base, 0, true, true, events);

        let first = Transfer {
            handle: 2,
            delivery_id: Some(7),
            delivery_tag: Some(DeliveryTag::from_counter(7)),
            message_format: Some(0),
            settled: Some(false),
            more: true,
            state: None,
            aborted: false,
            payload: Bytes::from_static(b"hel"),
        };
        assert!(receiver.apply_transfer(first).is_none());

        let second = Transfer {
            handle: 2,
            delivery_id: None,
            delivery_tag: None,
            message_format: None,
            settled: None,
            more: false,
            state: None,
            aborted: false,
            payload: Bytes::from_static(b"lo"),
        };
        let completed = receiver.apply_transfer(second).unwrap();
        assert_eq!(&completed.payload[..], b"hello");
        assert_eq!(completed.delivery_id, 7);
    }
}
