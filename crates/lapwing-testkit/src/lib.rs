//! Test scaffolding for the lapwing client
//!
//! An in-memory duplex transport and a scripted peer that plays the
//! remote side of a connection frame by frame: tests assert what the
//! client emits and script the responses, in the style of protocol test
//! drivers.
//!
//! ```rust,no_run
//! # use lapwing_testkit::memory_pair;
//! # use lapwing_client::{Client, ConnectionOptions};
//! # async fn example() {
//! let (transport, mut peer) = memory_pair();
//! let client = Client::new();
//! let connection = client.connect("test", 5672, Box::new(transport), ConnectionOptions::default());
//!
//! peer.offer_sasl_anonymous().await;
//! peer.expect_open().await;
//! peer.respond_open(&["ANONYMOUS-RELAY"]);
//! connection.await_open().await.unwrap();
//! # }
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use lapwing_client::transport::{
    Endpoint, Transport, TransportError, TransportEvent, TransportEvents,
};
use lapwing_types::{
    Attach, Begin, BincodeFrameCodec, Close, DeliveryState, Detach, Discharge, Disposition, End,
    ErrorCondition, Flow, Frame, FrameCodec, Handle, Message, Open, Performative, Role, SaslBody,
    SaslCode, Source, Symbol, Transfer, TxnId,
};

/// How long an expectation waits before declaring the script broken.
const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

// ----------------------------------------------------------------------------
// In-memory transport
// ----------------------------------------------------------------------------

type WireHalf = (
    mpsc::UnboundedSender<Bytes>,
    Option<TransportEvents>,
);

/// Transport whose wire is a pair of in-process channels.
///
/// Each `connect` consumes the next prepared wire, so reconnect walks can
/// be scripted by preparing several.
pub struct MemoryTransport {
    wires: VecDeque<WireHalf>,
    current: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self, endpoint: &Endpoint) -> Result<TransportEvents, TransportError> {
        match self.wires.pop_front() {
            Some((outbound, Some(events))) => {
                self.current = Some(outbound);
                Ok(events)
            }
            _ => Err(TransportError::ConnectFailed {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: "no scripted peer remaining".to_string(),
            }),
        }
    }

    async fn write_and_flush(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        let current = self.current.as_ref().ok_or(TransportError::WriteFailed {
            reason: "transport not connected".to_string(),
        })?;
        current.send(bytes).map_err(|_| TransportError::Dropped {
            reason: "scripted peer hung up".to_string(),
        })
    }

    async fn close(&mut self) {
        self.current = None;
    }
}

/// One transport and the scripted peer on its far end.
pub fn memory_pair() -> (MemoryTransport, ScriptedPeer) {
    let (transport, mut peers) = memory_pair_series(1);
    (transport, peers.remove(0))
}

/// A transport whose successive `connect` calls reach successive peers,
/// for reconnect scripts.
pub fn memory_pair_series(count: usize) -> (MemoryTransport, Vec<ScriptedPeer>) {
    let mut wires = VecDeque::new();
    let mut peers = Vec::new();
    for _ in 0..count {
        let (to_peer, from_client) = mpsc::unbounded_channel::<Bytes>();
        let (to_client, client_events) = mpsc::unbounded_channel::<TransportEvent>();
        wires.push_back((to_peer, Some(client_events)));
        peers.push(ScriptedPeer {
            from_client,
            to_client,
            codec: BincodeFrameCodec::new(),
        });
    }
    (
        MemoryTransport {
            wires,
            current: None,
        },
        peers,
    )
}

// ----------------------------------------------------------------------------
// Scripted peer
// ----------------------------------------------------------------------------

/// Plays the remote AMQP peer: reads frames the client emitted, asserts
/// their shape, and answers from the test script.
///
/// The peer mirrors the client's channel and handle numbers, which keeps
/// scripts readable without a channel table.
pub struct ScriptedPeer {
    from_client: mpsc::UnboundedReceiver<Bytes>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    codec: BincodeFrameCodec,
}

impl ScriptedPeer {
    // ------------------------------------------------------------------
    // Wire primitives
    // ------------------------------------------------------------------

    /// Read the next non-heartbeat frame from the client.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.codec.next_frame().expect("peer failed to decode frame") {
                if frame == Frame::Empty {
                    continue;
                }
                return frame;
            }
            let bytes = tokio::time::timeout(EXPECT_TIMEOUT, self.from_client.recv())
                .await
                .expect("timed out waiting for a frame from the client")
                .expect("client hung up while the script expected a frame");
            self.codec.ingest(bytes);
        }
    }

    /// Push a frame to the client.
    pub fn send_frame(&mut self, frame: Frame) {
        let encoded = self.codec.encode(&frame).expect("peer failed to encode frame");
        self.to_client
            .send(TransportEvent::Data(encoded))
            .expect("client transport gone");
    }

    /// Drop the transport out from under the client.
    pub fn drop_transport(&mut self) {
        let _ = self.to_client.send(TransportEvent::Closed);
    }

    /// Surface a transport error to the client.
    pub fn fail_transport(&mut self, reason: &str) {
        let _ = self.to_client.send(TransportEvent::Error(TransportError::Dropped {
            reason: reason.to_string(),
        }));
    }

    // ------------------------------------------------------------------
    // SASL
    // ------------------------------------------------------------------

    /// Offer ANONYMOUS, expect the Init, answer ok.
    pub async fn offer_sasl_anonymous(&mut self) {
        self.send_frame(Frame::Sasl(SaslBody::Mechanisms {
            mechanisms: vec![Symbol::from("ANONYMOUS"), Symbol::from("PLAIN")],
        }));
        match self.next_frame().await {
            Frame::Sasl(SaslBody::Init { .. }) => {}
            other => panic!("expected sasl-init, client sent {other:?}"),
        }
        self.send_frame(Frame::Sasl(SaslBody::Outcome {
            code: SaslCode::Ok,
            additional_data: None,
        }));
    }

    /// Offer mechanisms, expect Init, refuse authentication.
    pub async fn refuse_sasl(&mut self) {
        self.send_frame(Frame::Sasl(SaslBody::Mechanisms {
            mechanisms: vec![Symbol::from("PLAIN")],
        }));
        match self.next_frame().await {
            Frame::Sasl(SaslBody::Init { .. }) => {}
            other => panic!("expected sasl-init, client sent {other:?}"),
        }
        self.send_frame(Frame::Sasl(SaslBody::Outcome {
            code: SaslCode::Auth,
            additional_data: None,
        }));
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub async fn expect_open(&mut self) -> Open {
        match self.next_frame().await {
            Frame::Amqp {
                performative: Performative::Open(open),
                ..
            } => open,
            other => panic!("expected open, client sent {other:?}"),
        }
    }

    /// Answer the Open, offering the given capabilities.
    pub fn respond_open(&mut self, offered_capabilities: &[&str]) {
        let open = Open {
            container_id: "scripted-peer".to_string(),
            offered_capabilities: offered_capabilities
                .iter()
                .map(|name| Symbol::from(*name))
                .collect(),
            ..Open::default()
        };
        self.send_frame(Frame::amqp(0, Performative::Open(open)));
    }

    pub async fn expect_close(&mut self) -> Close {
        match self.next_frame().await {
            Frame::Amqp {
                performative: Performative::Close(close),
                ..
            } => close,
            other => panic!("expected close, client sent {other:?}"),
        }
    }

    pub fn respond_close(&mut self) {
        self.send_frame(Frame::amqp(0, Performative::Close(Close::default())));
    }

    /// Close the connection from the peer side.
    pub fn send_close(&mut self, error: Option<ErrorCondition>) {
        self.send_frame(Frame::amqp(0, Performative::Close(Close { error })));
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    pub async fn expect_begin(&mut self) -> (u16, Begin) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Begin(begin),
            } => (channel, begin),
            other => panic!("expected begin, client sent {other:?}"),
        }
    }

    /// Answer a Begin on the mirrored channel.
    pub fn respond_begin(&mut self, client_channel: u16) {
        self.send_frame(Frame::amqp(
            client_channel,
            Performative::Begin(Begin {
                remote_channel: Some(client_channel),
                incoming_window: 2048,
                outgoing_window: 2048,
                handle_max: u32::MAX,
                ..Begin::default()
            }),
        ));
    }

    pub async fn expect_end(&mut self) -> (u16, End) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::End(end),
            } => (channel, end),
            other => panic!("expected end, client sent {other:?}"),
        }
    }

    pub fn respond_end(&mut self, channel: u16) {
        self.send_frame(Frame::amqp(channel, Performative::End(End::default())));
    }

    /// End the session from the peer side.
    pub fn send_end(&mut self, channel: u16, error: Option<ErrorCondition>) {
        self.send_frame(Frame::amqp(channel, Performative::End(End { error })));
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    pub async fn expect_attach(&mut self) -> (u16, Attach) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Attach(attach),
            } => (channel, attach),
            other => panic!("expected attach, client sent {other:?}"),
        }
    }

    /// Answer an Attach by mirroring name and handle with the role
    /// flipped.
    pub fn respond_attach(&mut self, channel: u16, attach: &Attach) {
        let role = match attach.role {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        };
        self.send_frame(Frame::amqp(
            channel,
            Performative::Attach(Attach {
                role,
                initial_delivery_count: match role {
                    Role::Sender => Some(0),
                    Role::Receiver => None,
                },
                ..attach.clone()
            }),
        ));
    }

    /// Answer a dynamic receiver's Attach with a generated node address.
    pub fn respond_attach_dynamic(&mut self, channel: u16, attach: &Attach, address: &str) {
        let source = attach.source.clone().map(|source| Source {
            address: Some(address.to_string()),
            ..source
        });
        self.send_frame(Frame::amqp(
            channel,
            Performative::Attach(Attach {
                role: Role::Sender,
                source,
                initial_delivery_count: Some(0),
                ..attach.clone()
            }),
        ));
    }

    /// Refuse an Attach: answer it, then immediately detach with the
    /// given error.
    pub fn reject_attach(&mut self, channel: u16, attach: &Attach, error: ErrorCondition) {
        self.respond_attach(channel, attach);
        self.send_frame(Frame::amqp(
            channel,
            Performative::Detach(Detach {
                handle: attach.handle,
                closed: true,
                error: Some(error),
            }),
        ));
    }

    pub async fn expect_detach(&mut self) -> (u16, Detach) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Detach(detach),
            } => (channel, detach),
            other => panic!("expected detach, client sent {other:?}"),
        }
    }

    pub fn respond_detach(&mut self, channel: u16, handle: Handle) {
        self.send_frame(Frame::amqp(
            channel,
            Performative::Detach(Detach {
                handle,
                closed: true,
                error: None,
            }),
        ));
    }

    /// Detach a link from the peer side.
    pub fn send_detach(&mut self, channel: u16, handle: Handle, error: Option<ErrorCondition>) {
        self.send_frame(Frame::amqp(
            channel,
            Performative::Detach(Detach {
                handle,
                closed: true,
                error,
            }),
        ));
    }

    // ------------------------------------------------------------------
    // Flow, transfer, disposition
    // ------------------------------------------------------------------

    /// Grant link credit to one of the client's senders.
    pub fn send_flow(&mut self, channel: u16, handle: Handle, credit: u32) {
        self.send_frame(Frame::amqp(
            channel,
            Performative::Flow(Flow {
                incoming_window: 2048,
                outgoing_window: 2048,
                handle: Some(handle),
                delivery_count: Some(0),
                link_credit: Some(credit),
                ..Flow::default()
            }),
        ));
    }

    pub async fn expect_flow(&mut self) -> (u16, Flow) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Flow(flow),
            } => (channel, flow),
            other => panic!("expected flow, client sent {other:?}"),
        }
    }

    pub async fn expect_transfer(&mut self) -> (u16, Transfer) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Transfer(transfer),
            } => (channel, transfer),
            other => panic!("expected transfer, client sent {other:?}"),
        }
    }

    /// Settle a delivery range with a state.
    pub fn send_disposition(
        &mut self,
        channel: u16,
        first: u32,
        settled: bool,
        state: DeliveryState,
    ) {
        self.send_frame(Frame::amqp(
            channel,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first,
                last: None,
                settled,
                state: Some(state),
            }),
        ));
    }

    pub async fn expect_disposition(&mut self) -> (u16, Disposition) {
        match self.next_frame().await {
            Frame::Amqp {
                channel,
                performative: Performative::Disposition(disposition),
            } => (channel, disposition),
            other => panic!("expected disposition, client sent {other:?}"),
        }
    }

    /// Deliver a message to one of the client's receivers.
    pub fn send_transfer(
        &mut self,
        channel: u16,
        handle: Handle,
        delivery_id: u32,
        message: &Message,
    ) {
        let payload = message.encode().expect("peer failed to encode message");
        self.send_frame(Frame::amqp(
            channel,
            Performative::Transfer(Transfer {
                handle,
                delivery_id: Some(delivery_id),
                delivery_tag: Some(lapwing_types::DeliveryTag::from_counter(u64::from(
                    delivery_id,
                ))),
                message_format: Some(0),
                settled: Some(false),
                more: false,
                state: None,
                aborted: false,
                payload,
            }),
        ));
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Expect the coordinator attach and answer it with credit.
    pub async fn expect_coordinator_attach(&mut self) -> (u16, Attach) {
        let (channel, attach) = self.expect_attach().await;
        assert!(
            attach
                .target
                .as_ref()
                .is_some_and(lapwing_types::AttachTarget::is_coordinator),
            "expected a coordinator attach, got {attach:?}"
        );
        self.respond_attach(channel, &attach);
        self.send_flow(channel, attach.handle, 10);
        (channel, attach)
    }

    /// Expect a Declare transfer; returns (channel, delivery-id).
    pub async fn expect_declare(&mut self) -> (u16, u32) {
        let (channel, transfer) = self.expect_transfer().await;
        let message = Message::decode(&transfer.payload).expect("undecodable coordinator message");
        match message.body() {
            lapwing_types::Body::Declare(_) => {}
            other => panic!("expected declare body, got {other:?}"),
        }
        (channel, transfer.delivery_id.expect("declare without delivery-id"))
    }

    /// Accept a Declare with the given txn-id.
    pub fn accept_declare(&mut self, channel: u16, delivery_id: u32, txn_id: &[u8]) {
        self.send_disposition(
            channel,
            delivery_id,
            true,
            DeliveryState::Declared {
                txn_id: TxnId::from_slice(txn_id),
            },
        );
    }

    /// Expect a Discharge transfer; returns (channel, delivery-id,
    /// discharge).
    pub async fn expect_discharge(&mut self) -> (u16, u32, Discharge) {
        let (channel, transfer) = self.expect_transfer().await;
        let message = Message::decode(&transfer.payload).expect("undecodable coordinator message");
        match message.body() {
            lapwing_types::Body::Discharge(discharge) => (
                channel,
                transfer
                    .delivery_id
                    .expect("discharge without delivery-id"),
                discharge.clone(),
            ),
            other => panic!("expected discharge body, got {other:?}"),
        }
    }

    pub fn accept(&mut self, channel: u16, delivery_id: u32) {
        self.send_disposition(channel, delivery_id, true, DeliveryState::Accepted);
    }

    pub fn reject(&mut self, channel: u16, delivery_id: u32, error: ErrorCondition) {
        self.send_disposition(
            channel,
            delivery_id,
            true,
            DeliveryState::Rejected { error: Some(error) },
        );
    }
}
