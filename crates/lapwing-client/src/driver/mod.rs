//! The per-connection protocol driver
//!
//! One dedicated task owns the transport, the frame codec and every piece
//! of protocol state for a connection. It drains a single FIFO of work
//! items interleaved with transport events, so all state mutation is
//! serialized here. Timers are sleep tasks that re-enter the FIFO and are
//! validated against a live set, which makes cancellation a set removal.

pub(crate) mod link;
pub(crate) mod session;
pub(crate) mod txn;
pub(crate) mod work;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use lapwing_types::definitions::{conditions, Fields};
use lapwing_types::{
    Attach, AttachTarget, Begin, Close, Coordinator, DeliveryNumber, DeliveryState, Detach,
    Discharge, Disposition, End, ErrorCondition, Flow, Frame, FrameCodec, Handle, Message, Open,
    Performative, ReceiverSettleMode, Role, SaslBody, SaslCode, SenderSettleMode, Source, Symbol,
    Target, Transfer, TxnId,
};

use crate::capabilities::Capabilities;
use crate::delivery::Delivery;
use crate::error::{ClientError, Result};
use crate::options::{
    ConnectionEvent, ConnectionOptions, DeliveryMode, ReceiverOptions, SenderOptions,
    SessionOptions,
};
use crate::sasl::{SaslCredentials, SaslMechanismSelector};
use crate::transport::{Endpoint, Transport, TransportEvent, TransportEvents};

use link::{
    BlockedSend, CompletedDelivery, DispositionEffect, LinkBase, LinkCore, LinkState, LinkTimeouts,
    ReceiverCore, SenderCore,
};
use session::{DispatchHandle, DispatchJob, SessionCore, SessionState};
use txn::{TxnOp, TxnState};
use work::{
    ConnectionShared, DriverHandle, LinkAddr, LinkSeed, ReceiverEvent, SessionSeed, TimerPurpose,
    TrackerSeed, Work,
};

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

/// Scheduled-delay facility: each timer is a sleep task that re-enters the
/// work FIFO; a fired timer only acts if its id is still in the live set.
struct Timers {
    next_id: u64,
    live: HashSet<u64>,
    work_tx: mpsc::UnboundedSender<Work>,
}

impl Timers {
    fn new(work_tx: mpsc::UnboundedSender<Work>) -> Self {
        Self {
            next_id: 0,
            live: HashSet::new(),
            work_tx,
        }
    }

    fn schedule(&mut self, delay: Duration, purpose: TimerPurpose) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        let work_tx = self.work_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = work_tx.send(Work::Timer { id, purpose });
        });
        id
    }

    fn cancel(&mut self, id: Option<u64>) {
        if let Some(id) = id {
            self.live.remove(&id);
        }
    }

    /// Claim a fired timer; `false` means it was cancelled.
    fn take(&mut self, id: u64) -> bool {
        self.live.remove(&id)
    }

    fn clear(&mut self) {
        self.live.clear();
    }
}

// ----------------------------------------------------------------------------
// Driver
// ----------------------------------------------------------------------------

/// Connection lifecycle as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    OpenSent,
    Open,
    CloseSent,
    Closed,
    Failed,
}

pub(crate) struct Driver {
    connection_id: String,
    options: Arc<ConnectionOptions>,
    shared: Arc<ConnectionShared>,
    work_tx: mpsc::UnboundedSender<Work>,
    work_rx: mpsc::UnboundedReceiver<Work>,
    transport: Box<dyn Transport>,
    transport_events: Option<TransportEvents>,
    codec: Box<dyn FrameCodec>,
    endpoints: Vec<Endpoint>,
    endpoint_cursor: usize,
    state: ConnState,
    open_waiters: Vec<oneshot::Sender<Result<()>>>,
    open_timer: Option<u64>,
    close_requested: bool,
    close_done: bool,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    close_timer: Option<u64>,
    sessions: HashMap<u16, SessionCore>,
    /// Peer channel number to our channel number.
    remote_channels: HashMap<u16, u16>,
    next_channel: u16,
    session_counter: u32,
    root_channel: Option<u16>,
    connection_sender: Option<LinkAddr>,
    timers: Timers,
    events_dispatch: Option<DispatchHandle>,
    heartbeat: Option<Duration>,
    outbox: Vec<Frame>,
    done: bool,
}

impl Driver {
    /// Build the driver and the handle front that talks to it.
    pub fn new(
        connection_id: String,
        container_id: String,
        options: ConnectionOptions,
        transport: Box<dyn Transport>,
        codec: Box<dyn FrameCodec>,
        endpoint: Endpoint,
    ) -> (Self, DriverHandle) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let options = Arc::new(options);
        let shared = Arc::new(ConnectionShared::new(container_id));

        let mut endpoints = vec![endpoint];
        endpoints.extend(
            options
                .reconnect
                .hosts
                .iter()
                .map(|(host, port)| Endpoint::new(host.clone(), *port)),
        );

        let handle = DriverHandle {
            work_tx: work_tx.clone(),
            shared: Arc::clone(&shared),
            options: Arc::clone(&options),
        };

        let driver = Self {
            connection_id,
            options,
            shared,
            work_tx: work_tx.clone(),
            work_rx,
            transport,
            transport_events: None,
            codec,
            endpoints,
            endpoint_cursor: 0,
            state: ConnState::OpenSent,
            open_waiters: Vec::new(),
            open_timer: None,
            close_requested: false,
            close_done: false,
            close_waiters: Vec::new(),
            close_timer: None,
            sessions: HashMap::new(),
            remote_channels: HashMap::new(),
            next_channel: 0,
            session_counter: 0,
            root_channel: None,
            connection_sender: None,
            timers: Timers::new(work_tx),
            events_dispatch: None,
            heartbeat: None,
            outbox: Vec::new(),
            done: false,
        };

        (driver, handle)
    }

    /// A handle front equivalent to the one given to the application.
    fn handle_front(&self) -> DriverHandle {
        DriverHandle {
            work_tx: self.work_tx.clone(),
            shared: Arc::clone(&self.shared),
            options: Arc::clone(&self.options),
        }
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    pub async fn run(mut self) {
        if let Err(error) = self.establish_initial().await {
            self.fail_connection(error);
            let _ = self.flush().await;
            return;
        }

        while !self.done {
            let mut events = self
                .transport_events
                .take()
                .expect("transport events missing");
            tokio::select! {
                maybe_work = self.work_rx.recv() => {
                    self.transport_events = Some(events);
                    match maybe_work {
                        Some(item) => self.handle_work(item),
                        None => {
                            // Every handle is gone; nothing can reach this
                            // connection again.
                            debug!(connection = %self.connection_id, "all handles dropped, shutting down");
                            self.begin_close(None);
                            self.finish_close();
                        }
                    }
                }
                maybe_event = events.recv() => {
                    self.transport_events = Some(events);
                    match maybe_event {
                        Some(event) => self.handle_transport_event(event).await,
                        None => self.handle_transport_loss().await,
                    }
                }
            }
            if !self.flush().await {
                self.handle_transport_loss().await;
                let _ = self.flush().await;
            }
        }

        let _ = self.flush().await;
        self.transport.close().await;
    }

    /// Emit every queued frame; `false` means the transport dropped
    /// mid-write and the caller must run the transport-loss path.
    async fn flush(&mut self) -> bool {
        let frames = std::mem::take(&mut self.outbox);
        for frame in frames {
            if let Some(performative) = frame.performative() {
                trace!(connection = %self.connection_id, frame = %performative, "emitting frame");
            }
            let encoded = match self.codec.encode(&frame) {
                Ok(encoded) => encoded,
                Err(error) => {
                    self.fail_connection(ClientError::io(format!("frame encoding failed: {error}")));
                    return true;
                }
            };
            if let Err(error) = self.transport.write_and_flush(encoded).await {
                warn!(connection = %self.connection_id, %error, "transport write failed");
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Establishment, SASL and reconnect
    // ------------------------------------------------------------------

    async fn establish_initial(&mut self) -> Result<()> {
        if self.options.reconnect.enabled {
            if self.walk_endpoints().await {
                return Ok(());
            }
            return Err(ClientError::io("no endpoint could be reached"));
        }
        let endpoint = self.endpoints[0].clone();
        self.endpoint_cursor = 1;
        self.establish_transport(&endpoint).await
    }

    /// Connect, run SASL when enabled, and issue Open.
    async fn establish_transport(&mut self, endpoint: &Endpoint) -> Result<()> {
        debug!(connection = %self.connection_id, host = %endpoint.host, port = endpoint.port, "connecting");
        let events = self
            .transport
            .connect(endpoint)
            .await
            .map_err(|error| ClientError::io(error.to_string()))?;
        self.transport_events = Some(events);

        if self.options.sasl.enabled {
            self.sasl_exchange().await?;
        }

        self.outbox.push(Frame::amqp(
            0,
            Performative::Open(Open {
                container_id: self.shared.container_id.clone(),
                hostname: Some(endpoint.host.clone()),
                max_frame_size: self.options.max_frame_size,
                channel_max: self.options.channel_max,
                idle_timeout: match self.options.idle_timeout.is_zero() {
                    true => None,
                    false => Some(self.options.idle_timeout.as_millis() as u32),
                },
                offered_capabilities: self.options.offered_capabilities.clone(),
                desired_capabilities: self.options.desired_capabilities.clone(),
                properties: self.options.properties.clone(),
            }),
        ));
        self.state = ConnState::OpenSent;

        if !self.options.open_timeout.is_zero() {
            self.open_timer = Some(
                self.timers
                    .schedule(self.options.open_timeout, TimerPurpose::ConnectionOpen),
            );
        }
        if !self.flush().await {
            return Err(ClientError::io("transport dropped during establishment"));
        }
        Ok(())
    }

    async fn sasl_exchange(&mut self) -> Result<()> {
        let selector = SaslMechanismSelector::from_options(&self.options);
        let credentials = SaslCredentials::from_options(&self.options);

        let offered = match self.read_frame().await? {
            Frame::Sasl(SaslBody::Mechanisms { mechanisms }) => mechanisms,
            other => {
                return Err(ClientError::io(format!(
                    "expected sasl-mechanisms, received {other:?}"
                )))
            }
        };

        let mechanism = selector.select(&offered)?;
        debug!(connection = %self.connection_id, mechanism = mechanism.name(), "starting SASL exchange");
        self.outbox.push(Frame::Sasl(SaslBody::Init {
            mechanism: Symbol::from(mechanism.name()),
            initial_response: mechanism.initial_response(&credentials),
            hostname: credentials.vhost.clone(),
        }));
        if !self.flush().await {
            return Err(ClientError::io("transport dropped during SASL exchange"));
        }

        match self.read_frame().await? {
            Frame::Sasl(SaslBody::Outcome { code, .. }) => match code {
                SaslCode::Ok => Ok(()),
                other => Err(ClientError::io(format!(
                    "SASL authentication failed with code {other:?}"
                ))),
            },
            other => Err(ClientError::io(format!(
                "expected sasl-outcome, received {other:?}"
            ))),
        }
    }

    /// Read one frame inline; only used during establishment.
    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.codec.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(error) => return Err(ClientError::io(error.to_string())),
            }
            let events = self
                .transport_events
                .as_mut()
                .expect("transport events missing");
            match events.recv().await {
                Some(TransportEvent::Data(bytes)) => self.codec.ingest(bytes),
                Some(TransportEvent::Closed) | None => {
                    return Err(ClientError::connection_remotely_closed(None))
                }
                Some(TransportEvent::Error(error)) => {
                    return Err(ClientError::io(error.to_string()))
                }
            }
        }
    }

    /// Walk the endpoint list once per allowed attempt.
    async fn walk_endpoints(&mut self) -> bool {
        let passes = self.options.reconnect.max_attempts.max(1);
        let mut first = true;
        for _pass in 0..passes {
            for _ in 0..self.endpoints.len() {
                let endpoint = self.endpoints[self.endpoint_cursor % self.endpoints.len()].clone();
                self.endpoint_cursor += 1;
                if !first && !self.options.reconnect.delay.is_zero() {
                    tokio::time::sleep(self.options.reconnect.delay).await;
                }
                first = false;
                match self.establish_transport(&endpoint).await {
                    Ok(()) => return true,
                    Err(error) => {
                        warn!(connection = %self.connection_id, host = %endpoint.host, %error, "endpoint unreachable");
                    }
                }
            }
        }
        false
    }

    /// Transport dropped: reconnect when allowed, otherwise fail.
    async fn handle_transport_loss(&mut self) {
        if self.done {
            return;
        }
        if self.close_requested {
            self.finish_close();
            return;
        }
        let drop_error = ClientError::connection_remotely_closed(None);
        if !self.options.reconnect.enabled {
            self.fail_connection(drop_error);
            return;
        }

        debug!(connection = %self.connection_id, "transport lost, reconnecting");
        self.prepare_reconnect(&drop_error);
        if self.walk_endpoints().await {
            self.replay_after_reconnect();
        } else {
            self.fail_connection(drop_error);
        }
    }

    /// Reset per-transport state, keeping sessions and not-yet-attached
    /// links so their opens can be replayed.
    fn prepare_reconnect(&mut self, drop_error: &ClientError) {
        self.timers.clear();
        self.open_timer = None;
        self.shared.set_capabilities(None);
        self.remote_channels.clear();
        self.heartbeat = None;
        self.state = ConnState::OpenSent;

        for session in self.sessions.values_mut() {
            session.state = SessionState::BeginSent;
            session.remote_channel = None;
            session.remote_handles.clear();
            session.incoming.clear();
            session.outgoing.clear();
            session.coordinator_handle = None;

            match std::mem::take(&mut session.txn) {
                TxnState::Declaring { reply, .. } | TxnState::Discharging { reply, .. } => {
                    let _ = reply.send(Err(drop_error.clone()));
                }
                _ => {}
            }

            let doomed: Vec<Handle> = session
                .links
                .iter()
                .filter(|(_, link)| {
                    !matches!(
                        link.base().state,
                        LinkState::AttachSent | LinkState::PendingCapabilities
                    )
                })
                .map(|(handle, _)| *handle)
                .collect();
            for handle in doomed {
                if let Some(mut link) = session.links.remove(&handle) {
                    link.fail(drop_error);
                }
            }
        }

        if let Some(addr) = self.connection_sender {
            if !self.link_exists(addr) {
                self.connection_sender = None;
            }
        }
    }

    fn link_exists(&self, addr: LinkAddr) -> bool {
        self.sessions
            .get(&addr.channel)
            .is_some_and(|session| session.links.contains_key(&addr.handle))
    }

    /// Re-issue Begin for every surviving session and Attach for every
    /// surviving link open.
    fn replay_after_reconnect(&mut self) {
        let Driver {
            sessions, outbox, ..
        } = self;
        let mut channels: Vec<u16> = sessions.keys().copied().collect();
        channels.sort_unstable();
        for channel in channels {
            let session = sessions.get_mut(&channel).expect("session vanished");
            outbox.push(begin_frame(session));
            for link in session.links.values() {
                let base = link.base();
                if base.state == LinkState::AttachSent {
                    outbox.push(Frame::amqp(
                        channel,
                        Performative::Attach(base.attach.clone()),
                    ));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transport ingestion
    // ------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => {
                self.codec.ingest(bytes);
                loop {
                    match self.codec.next_frame() {
                        Ok(Some(frame)) => self.handle_frame(frame),
                        Ok(None) => break,
                        Err(error) => {
                            self.fail_connection(ClientError::io(format!(
                                "frame decoding failed: {error}"
                            )));
                            break;
                        }
                    }
                }
            }
            TransportEvent::Closed => self.handle_transport_loss().await,
            TransportEvent::Error(error) => {
                warn!(connection = %self.connection_id, %error, "transport error");
                self.handle_transport_loss().await;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Empty => {}
            Frame::Sasl(_) => {
                self.fail_connection(ClientError::io("SASL frame received after negotiation"));
            }
            Frame::Amqp {
                channel,
                performative,
            } => {
                trace!(connection = %self.connection_id, channel, frame = %performative, "frame received");
                match performative {
                    Performative::Open(open) => self.on_remote_open(open),
                    Performative::Close(close) => self.on_remote_close(close),
                    Performative::Begin(begin) => self.on_remote_begin(channel, begin),
                    Performative::Attach(attach) => self.on_remote_attach(channel, attach),
                    Performative::Flow(flow) => self.on_remote_flow(channel, flow),
                    Performative::Transfer(transfer) => self.on_remote_transfer(channel, transfer),
                    Performative::Disposition(disposition) => {
                        self.on_remote_disposition(channel, disposition)
                    }
                    Performative::Detach(detach) => self.on_remote_detach(channel, detach),
                    Performative::End(end) => self.on_remote_end(channel, end),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection frames
    // ------------------------------------------------------------------

    fn on_remote_open(&mut self, open: Open) {
        debug!(connection = %self.connection_id, container = %open.container_id, "remote open received");
        let capabilities = Capabilities::from_remote_open(&open);
        self.shared.set_capabilities(Some(capabilities));

        if let Some(idle) = open.idle_timeout.filter(|ms| *ms > 0) {
            let interval = Duration::from_millis(u64::from(idle) / 2).max(Duration::from_millis(1));
            self.heartbeat = Some(interval);
            self.timers.schedule(interval, TimerPurpose::IdleHeartbeat);
        }

        self.shared.set_remote_open(open);
        self.state = ConnState::Open;
        let open_timer = self.open_timer.take();
        self.timers.cancel(open_timer);
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.resolve_pending_anonymous_senders(capabilities);

        if let Some(handler) = self.options.connected_handler.clone() {
            let host = self.endpoints
                [(self.endpoint_cursor.max(1) - 1) % self.endpoints.len()]
            .host
            .clone();
            self.events_dispatch()
                .submit(DispatchJob::Callback(Box::new(move || {
                    handler(ConnectionEvent::Connected { host });
                })));
        }
    }

    /// Attach or fail every sender parked until capabilities were known.
    fn resolve_pending_anonymous_senders(&mut self, capabilities: Capabilities) {
        let Driver {
            sessions,
            timers,
            outbox,
            ..
        } = self;
        for (channel, session) in sessions.iter_mut() {
            let pending: Vec<Handle> = session
                .links
                .iter()
                .filter(|(_, link)| link.base().state == LinkState::PendingCapabilities)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in pending {
                if capabilities.anonymous_relay {
                    let link = session.links.get_mut(&handle).expect("link vanished");
                    let base = link.base_mut();
                    base.state = LinkState::AttachSent;
                    outbox.push(Frame::amqp(
                        *channel,
                        Performative::Attach(base.attach.clone()),
                    ));
                    if !base.timeouts.open.is_zero() {
                        base.open_timer = Some(timers.schedule(
                            base.timeouts.open,
                            TimerPurpose::LinkAttach {
                                addr: LinkAddr {
                                    channel: *channel,
                                    handle,
                                },
                            },
                        ));
                    }
                } else {
                    let mut link = session.links.remove(&handle).expect("link vanished");
                    link.fail(&ClientError::unsupported_operation(
                        "anonymous relay support not available from this connection",
                    ));
                }
            }
        }
    }

    fn on_remote_close(&mut self, close: Close) {
        if self.close_requested {
            self.finish_close();
            return;
        }
        // Close is idempotent; answer in kind, then fail everything with
        // the remote cause.
        self.outbox
            .push(Frame::amqp(0, Performative::Close(Close::default())));
        let error = ClientError::connection_remotely_closed(close.error);
        self.fail_connection(error);
    }

    // ------------------------------------------------------------------
    // Session frames
    // ------------------------------------------------------------------

    fn on_remote_begin(&mut self, remote_channel: u16, begin: Begin) {
        let Driver {
            connection_id,
            sessions,
            remote_channels,
            timers,
            ..
        } = self;
        let Some(local_channel) = begin.remote_channel else {
            warn!(connection = %connection_id, "begin without remote-channel ignored");
            return;
        };
        let Some(session) = sessions.get_mut(&local_channel) else {
            warn!(connection = %connection_id, local_channel, "begin for unknown session");
            return;
        };
        debug!(connection = %connection_id, session = %session.id, "session open");
        remote_channels.insert(remote_channel, local_channel);
        session.remote_channel = Some(remote_channel);
        session.state = SessionState::Open;
        session.shared.set_remote_begin(begin);
        timers.cancel(session.open_timer.take());
        session.finish_open_waiters(&Ok(()));
    }

    fn on_remote_end(&mut self, remote_channel: u16, end: End) {
        let Some(local_channel) = self.remote_channels.remove(&remote_channel) else {
            return;
        };
        let Some(mut session) = self.sessions.remove(&local_channel) else {
            return;
        };

        if session.state == SessionState::EndSent {
            // Our End round-tripped.
            let end_timer = session.end_timer.take();
            self.timers.cancel(end_timer);
            session.fail(&ClientError::closed("the session is closed"));
        } else {
            let error = ClientError::session_remotely_closed(end.error);
            debug!(connection = %self.connection_id, session = %session.id, %error, "session remotely ended");
            session.fail(&error);
            self.outbox
                .push(Frame::amqp(local_channel, Performative::End(End::default())));
        }
        self.forget_root_session(local_channel);
    }

    fn forget_root_session(&mut self, channel: u16) {
        if self.root_channel == Some(channel) {
            self.root_channel = None;
            self.connection_sender = None;
        }
    }

    // ------------------------------------------------------------------
    // Link frames
    // ------------------------------------------------------------------

    fn on_remote_attach(&mut self, remote_channel: u16, attach: Attach) {
        let Driver {
            connection_id,
            sessions,
            remote_channels,
            timers,
            outbox,
            ..
        } = self;
        let Some(&local_channel) = remote_channels.get(&remote_channel) else {
            return;
        };
        let Some(session) = sessions.get_mut(&local_channel) else {
            return;
        };
        // The response names the link; correlate by name, then record the
        // peer's handle.
        let Some(local_handle) = session
            .links
            .iter()
            .find(|(_, link)| link.base().name == attach.name)
            .map(|(handle, _)| *handle)
        else {
            warn!(connection = %connection_id, link = %attach.name, "attach for unknown link");
            return;
        };
        session.remote_handles.insert(attach.handle, local_handle);

        let flow_seed = (
            session.channel,
            session.next_incoming_id,
            session.incoming_window,
            session.next_outgoing_id,
            session.outgoing_window,
        );
        let link = session.links.get_mut(&local_handle).expect("link vanished");
        let base = link.base_mut();
        base.state = LinkState::Attached;
        base.shared.set_remote_attach(attach);
        timers.cancel(base.open_timer.take());
        base.finish_open_waiters(&Ok(()));
        debug!(connection = %connection_id, link = %base.name, "link attached");

        // Receivers prime their credit window as soon as the link is up.
        if let Some(receiver) = link.as_receiver_mut() {
            if let Some(grant) = receiver.replenish_target() {
                receiver.credit += grant;
                outbox.push(flow_frame(flow_seed, local_handle, receiver.credit, false));
            }
        }
    }

    fn on_remote_detach(&mut self, remote_channel: u16, detach: Detach) {
        let Driver {
            connection_id,
            sessions,
            remote_channels,
            timers,
            outbox,
            connection_sender,
            ..
        } = self;
        let Some(&local_channel) = remote_channels.get(&remote_channel) else {
            return;
        };
        let Some(session) = sessions.get_mut(&local_channel) else {
            return;
        };
        let Some(local_handle) = session.resolve_remote_handle(detach.handle) else {
            // Detach may race our own attach timeout; nothing to do.
            return;
        };
        session.remote_handles.remove(&detach.handle);

        let coordinator = session.coordinator_handle == Some(local_handle);
        let Some(mut link) = session.links.remove(&local_handle) else {
            return;
        };
        {
            let base = link.base_mut();
            timers.cancel(base.open_timer.take());
            timers.cancel(base.detach_timer.take());
        }

        if coordinator {
            session.coordinator_handle = None;
            let condition = detach.error.clone();
            debug!(connection = %connection_id, session = %session.id, "coordinator link detached by peer");
            match std::mem::take(&mut session.txn) {
                TxnState::Declaring { reply, timer } => {
                    timers.cancel(timer);
                    let _ = reply.send(Err(ClientError::transaction_declaration_failed(condition)));
                }
                TxnState::Discharging { reply, timer, .. } => {
                    timers.cancel(timer);
                    let _ = reply.send(Err(ClientError::transaction_rolled_back(condition)));
                }
                TxnState::Active { txn_id, .. } => {
                    session.txn = TxnState::Active {
                        txn_id,
                        coordinator_lost: true,
                    };
                }
                TxnState::Idle => {}
            }
            link.base_mut().shared.mark_closed();
            return;
        }

        if link.base().state == LinkState::DetachSent {
            // Our detach round-tripped; a clean close.
            let base = link.base_mut();
            base.state = LinkState::Closed;
            base.shared.mark_closed();
            base.finish_detach_waiters();
            if let LinkCore::Receiver(receiver) = &link {
                receiver.notify(ReceiverEvent::Closed(ClientError::closed(
                    "the receiver is closed",
                )));
            }
        } else {
            let error = ClientError::link_remotely_closed(detach.error);
            debug!(connection = %connection_id, link = %link.base().name, %error, "link remotely detached");
            link.fail(&error);
            outbox.push(Frame::amqp(
                local_channel,
                Performative::Detach(Detach {
                    handle: local_handle,
                    closed: true,
                    error: None,
                }),
            ));
        }

        let addr = LinkAddr {
            channel: local_channel,
            handle: local_handle,
        };
        if *connection_sender == Some(addr) {
            // The lazily built connection sender is gone; the next send
            // builds a fresh one.
            *connection_sender = None;
        }
    }

    fn on_remote_flow(&mut self, remote_channel: u16, flow: Flow) {
        let Driver {
            connection_id,
            sessions,
            remote_channels,
            timers,
            outbox,
            ..
        } = self;
        let Some(&local_channel) = remote_channels.get(&remote_channel) else {
            return;
        };
        let Some(session) = sessions.get_mut(&local_channel) else {
            return;
        };
        let Some(remote_handle) = flow.handle else {
            return; // Session-window-only flow.
        };
        let Some(local_handle) = session.resolve_remote_handle(remote_handle) else {
            return;
        };

        let SessionCore {
            links,
            next_outgoing_id,
            outgoing,
            txn,
            ..
        } = session;
        let Some(link) = links.get_mut(&local_handle) else {
            return;
        };

        match link {
            LinkCore::Sender(sender) => {
                let drain = sender.apply_flow(
                    flow.link_credit.unwrap_or(0),
                    flow.delivery_count,
                    flow.drain,
                );
                trace!(connection = %connection_id, link = %sender.base.name, credit = sender.credit, "sender credit updated");

                // Credit arrived; drain parked sends in order.
                while sender.sendable() && !sender.blocked.is_empty() {
                    let blocked = sender.blocked.pop_front().expect("blocked send vanished");
                    timers.cancel(blocked.timer);
                    let txn_id = match blocked.txn_op.is_some() {
                        true => None,
                        false => txn.active_txn_id(),
                    };
                    let seed = sender.perform_transfer(
                        next_outgoing_id,
                        txn_id,
                        blocked.payload,
                        blocked.message_format,
                        blocked.txn_op,
                        outbox,
                    );
                    outgoing.insert(seed.delivery_id, local_handle);
                    let _ = blocked.reply.send(Ok(seed));
                }

                if drain && sender.credit > 0 {
                    sender.drain_credit();
                    outbox.push(drain_response_frame(
                        local_channel,
                        local_handle,
                        sender.delivery_count,
                    ));
                }
            }
            LinkCore::Receiver(receiver) => {
                if flow.drain {
                    // The sender consumed or returned our drained credit.
                    receiver.credit = 0;
                    if let Some(reply) = receiver.drain_reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        }
    }

    fn on_remote_transfer(&mut self, remote_channel: u16, transfer: Transfer) {
        let front = self.handle_front();
        let Driver {
            connection_id,
            sessions,
            remote_channels,
            ..
        } = self;
        let Some(&local_channel) = remote_channels.get(&remote_channel) else {
            return;
        };
        let Some(session) = sessions.get_mut(&local_channel) else {
            return;
        };
        session.next_incoming_id = session.next_incoming_id.wrapping_add(1);

        let Some(local_handle) = session.resolve_remote_handle(transfer.handle) else {
            warn!(connection = %connection_id, "transfer for unknown link");
            return;
        };
        let Some(receiver) = session
            .links
            .get_mut(&local_handle)
            .and_then(LinkCore::as_receiver_mut)
        else {
            warn!(connection = %connection_id, "transfer for non-receiver link");
            return;
        };

        let Some(completed) = receiver.apply_transfer(transfer) else {
            return; // more frames to come
        };
        let events = receiver.events.clone();
        if !completed.settled {
            session.incoming.insert(completed.delivery_id, local_handle);
        }
        let delivery = build_delivery(
            front,
            LinkAddr {
                channel: local_channel,
                handle: local_handle,
            },
            completed,
        );
        session.dispatch_event(events, ReceiverEvent::Delivery(delivery));
    }

    fn on_remote_disposition(&mut self, remote_channel: u16, disposition: Disposition) {
        if disposition.role != Role::Receiver {
            // A sender-side state change for our incoming deliveries; the
            // application observes it through the delivery it already holds.
            debug!(connection = %self.connection_id, "ignoring sender-role disposition");
            return;
        }
        let Some(&local_channel) = self.remote_channels.get(&remote_channel) else {
            return;
        };

        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        let mut txn_effects: Vec<(TxnOp, Option<DeliveryState>)> = Vec::new();

        {
            let Some(session) = self.sessions.get_mut(&local_channel) else {
                return;
            };
            for delivery_id in first..=last {
                let Some(&handle) = session.outgoing.get(&delivery_id) else {
                    continue;
                };
                let Some(sender) = session
                    .links
                    .get_mut(&handle)
                    .and_then(LinkCore::as_sender_mut)
                else {
                    continue;
                };
                match sender.apply_remote_disposition(
                    delivery_id,
                    disposition.state.as_ref(),
                    disposition.settled,
                ) {
                    Some(DispositionEffect::Transaction { op, state }) => {
                        session.outgoing.remove(&delivery_id);
                        txn_effects.push((op, state));
                    }
                    Some(DispositionEffect::Handled) => {
                        if !sender.unsettled.contains_key(&delivery_id) {
                            session.outgoing.remove(&delivery_id);
                        }
                    }
                    None => {}
                }
            }
        }

        for (op, state) in txn_effects {
            self.handle_txn_outcome(local_channel, op, state);
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn handle_begin_transaction(&mut self, channel: u16, reply: oneshot::Sender<Result<()>>) {
        let request_timeout = self.options.request_timeout;
        {
            let Some(session) = self.sessions.get_mut(&channel) else {
                let _ = reply.send(Err(ClientError::closed("the session is closed")));
                return;
            };
            if session.txn.in_flight() || session.txn.active_txn_id().is_some() {
                let _ = reply.send(Err(ClientError::illegal_state(
                    "a transaction is already active on this session",
                )));
                return;
            }
            if session.coordinator_handle.is_none() {
                drop(session);
                self.attach_coordinator(channel);
            }
        }

        let payload = match Message::declare().encode() {
            Ok(payload) => payload,
            Err(error) => {
                let _ = reply.send(Err(ClientError::io(error.to_string())));
                return;
            }
        };
        self.send_coordinator_request(channel, payload, TxnOp::Declare);

        let timer = match request_timeout.is_zero() {
            true => None,
            false => Some(self.timers.schedule(
                request_timeout,
                TimerPurpose::TransactionRequest { channel },
            )),
        };
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.txn = TxnState::Declaring { reply, timer };
        }
    }

    fn handle_discharge_transaction(
        &mut self,
        channel: u16,
        fail: bool,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let request_timeout = self.options.request_timeout;
        enum Disposition {
            Discharge(TxnId),
            CoordinatorLost,
            NotActive,
            InFlight,
        }
        let disposition = {
            let Some(session) = self.sessions.get_mut(&channel) else {
                let _ = reply.send(Err(ClientError::closed("the session is closed")));
                return;
            };
            match &session.txn {
                TxnState::Active {
                    txn_id,
                    coordinator_lost: false,
                } => Disposition::Discharge(txn_id.clone()),
                TxnState::Active {
                    coordinator_lost: true,
                    ..
                } => Disposition::CoordinatorLost,
                TxnState::Idle => Disposition::NotActive,
                TxnState::Declaring { .. } | TxnState::Discharging { .. } => Disposition::InFlight,
            }
        };
        let txn_id = match disposition {
            Disposition::Discharge(txn_id) => txn_id,
            Disposition::CoordinatorLost => {
                if let Some(session) = self.sessions.get_mut(&channel) {
                    session.txn = TxnState::Idle;
                }
                let _ = reply.send(Err(ClientError::transaction_rolled_back(Some(
                    ErrorCondition::new(
                        conditions::TRANSACTION_ROLLBACK,
                        "the coordinator link was lost while the transaction was active",
                    ),
                ))));
                return;
            }
            Disposition::NotActive => {
                let _ = reply.send(Err(ClientError::TransactionNotActive));
                return;
            }
            Disposition::InFlight => {
                let _ = reply.send(Err(ClientError::illegal_state(
                    "a transaction operation is already in flight",
                )));
                return;
            }
        };

        let payload = match Message::discharge(Discharge { txn_id, fail }).encode() {
            Ok(payload) => payload,
            Err(error) => {
                let _ = reply.send(Err(ClientError::io(error.to_string())));
                return;
            }
        };
        self.send_coordinator_request(channel, payload, TxnOp::Discharge { fail });

        let timer = match request_timeout.is_zero() {
            true => None,
            false => Some(self.timers.schedule(
                request_timeout,
                TimerPurpose::TransactionRequest { channel },
            )),
        };
        if let Some(session) = self.sessions.get_mut(&channel) {
            session.txn = TxnState::Discharging { reply, timer, fail };
        }
    }

    /// Attach the coordinator sender link for a session.
    fn attach_coordinator(&mut self, channel: u16) {
        let timeouts = self.default_link_timeouts(None);
        let Driver {
            connection_id,
            sessions,
            outbox,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&channel) else {
            return;
        };
        let handle = session.alloc_handle();
        let name = format!("txn-controller-{}:{}", session.id, handle);

        let attach = Attach {
            name,
            handle,
            role: Role::Sender,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                outcomes: default_outcomes(),
                ..Source::default()
            }),
            target: Some(AttachTarget::Coordinator(Coordinator {
                capabilities: vec![Symbol::from(
                    lapwing_types::transaction::TXN_LOCAL_TRANSACTIONS,
                )],
            })),
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Fields::new(),
        };

        let base = LinkBase::new(
            attach.clone(),
            LinkAddr { channel, handle },
            LinkState::AttachSent,
            timeouts,
        );
        let sender = SenderCore::new(base, SenderSettleMode::Unsettled, true, false, true);
        session.links.insert(handle, LinkCore::Sender(sender));
        session.coordinator_handle = Some(handle);
        outbox.push(Frame::amqp(channel, Performative::Attach(attach)));
        debug!(connection = %connection_id, channel, "coordinator attach sent");
    }

    /// Send a Declare or Discharge over the coordinator link, parking it
    /// until credit arrives when necessary.
    fn send_coordinator_request(&mut self, channel: u16, payload: Bytes, op: TxnOp) {
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&channel) else {
            return;
        };
        let Some(coordinator) = session.coordinator_handle else {
            return;
        };
        let SessionCore {
            links,
            next_outgoing_id,
            outgoing,
            ..
        } = session;
        let Some(sender) = links
            .get_mut(&coordinator)
            .and_then(LinkCore::as_sender_mut)
        else {
            return;
        };

        if sender.sendable() {
            let seed =
                sender.perform_transfer(next_outgoing_id, None, payload, 0, Some(op), outbox);
            outgoing.insert(seed.delivery_id, coordinator);
        } else {
            let (reply, _discard) = oneshot::channel();
            let sequence = sender.next_send_sequence();
            sender.blocked.push_back(BlockedSend {
                sequence,
                payload,
                message_format: 0,
                reply,
                timer: None,
                txn_op: Some(op),
            });
        }
    }

    fn handle_txn_outcome(&mut self, channel: u16, op: TxnOp, state: Option<DeliveryState>) {
        let mut protocol_violation: Option<ErrorCondition> = None;
        {
            let Driver {
                connection_id,
                sessions,
                timers,
                ..
            } = self;
            let Some(session) = sessions.get_mut(&channel) else {
                return;
            };
            let outcome = state.as_ref().and_then(DeliveryState::outcome).cloned();

            match op {
                TxnOp::Declare => match outcome {
                    Some(DeliveryState::Declared { txn_id }) => {
                        match std::mem::take(&mut session.txn) {
                            TxnState::Declaring { reply, timer } => {
                                timers.cancel(timer);
                                debug!(connection = %connection_id, %txn_id, "transaction declared");
                                session.txn = TxnState::Active {
                                    txn_id,
                                    coordinator_lost: false,
                                };
                                let _ = reply.send(Ok(()));
                            }
                            other => {
                                // A declare that outlived its timeout; the
                                // client-side transaction never began.
                                debug!(connection = %connection_id, %txn_id, "late declare outcome ignored");
                                session.txn = other;
                            }
                        }
                    }
                    Some(DeliveryState::Rejected { error }) => {
                        if let TxnState::Declaring { reply, timer } =
                            std::mem::take(&mut session.txn)
                        {
                            timers.cancel(timer);
                            let _ =
                                reply.send(Err(ClientError::transaction_declaration_failed(error)));
                        }
                    }
                    other => {
                        // A coordinator answering Declare without a txn-id
                        // is a protocol violation.
                        warn!(connection = %connection_id, ?other, "declare resolved without declared outcome");
                        protocol_violation = Some(ErrorCondition::new(
                            conditions::DECODE_ERROR,
                            "coordinator resolved declare without a declared outcome",
                        ));
                    }
                },
                TxnOp::Discharge { .. } => match outcome {
                    Some(DeliveryState::Accepted) => {
                        if let TxnState::Discharging { reply, timer, .. } =
                            std::mem::take(&mut session.txn)
                        {
                            timers.cancel(timer);
                            let _ = reply.send(Ok(()));
                        }
                    }
                    other => {
                        let condition = match other {
                            Some(DeliveryState::Rejected { error }) => error,
                            _ => None,
                        };
                        if let TxnState::Discharging { reply, timer, .. } =
                            std::mem::take(&mut session.txn)
                        {
                            timers.cancel(timer);
                            let _ =
                                reply.send(Err(ClientError::transaction_rolled_back(condition)));
                        }
                    }
                },
            }
        }

        if let Some(condition) = protocol_violation {
            self.close_with_protocol_error(condition);
        }
    }

    fn close_with_protocol_error(&mut self, condition: ErrorCondition) {
        self.outbox.push(Frame::amqp(
            0,
            Performative::Close(Close {
                error: Some(condition.clone()),
            }),
        ));
        self.fail_connection(ClientError::io(format!("protocol violation: {condition}")));
    }

    // ------------------------------------------------------------------
    // Work handling
    // ------------------------------------------------------------------

    fn handle_work(&mut self, item: Work) {
        match item {
            Work::AwaitOpen { reply } => match self.state {
                ConnState::Open => {
                    let _ = reply.send(Ok(()));
                }
                ConnState::Failed | ConnState::Closed => {
                    let _ = reply.send(Err(self.shared.closed_error()));
                }
                _ => self.open_waiters.push(reply),
            },
            Work::Close { error, reply } => {
                if self.close_done {
                    let _ = reply.send(Ok(()));
                } else {
                    self.close_waiters.push(reply);
                    self.begin_close(error);
                }
            }
            Work::OpenSession { options, reply } => {
                if let Some(error) = self.closed_for_new_work() {
                    let _ = reply.send(Err(error));
                    return;
                }
                let channel = self.create_session(options);
                let _ = reply.send(Ok(self.session_seed(channel)));
            }
            Work::DefaultSession { reply } => {
                if let Some(error) = self.closed_for_new_work() {
                    let _ = reply.send(Err(error));
                    return;
                }
                let channel = self.ensure_root_session();
                let _ = reply.send(Ok(self.session_seed(channel)));
            }
            Work::ConnectionSend {
                payload,
                message_format,
                reply,
            } => self.handle_connection_send(payload, message_format, reply),
            Work::AwaitSessionOpen { channel, reply } => {
                let Some(session) = self.sessions.get_mut(&channel) else {
                    let _ = reply.send(Err(self.shared.closed_error()));
                    return;
                };
                match session.state {
                    SessionState::Open => {
                        let _ = reply.send(Ok(()));
                    }
                    SessionState::BeginSent => session.open_waiters.push(reply),
                    _ => {
                        let _ = reply.send(Err(session
                            .failure
                            .clone()
                            .unwrap_or_else(|| ClientError::closed("the session is closed"))));
                    }
                }
            }
            Work::EndSession {
                channel,
                error,
                reply,
            } => self.handle_end_session(channel, error, reply),
            Work::OpenSender {
                channel,
                address,
                anonymous,
                options,
                reply,
            } => self.handle_open_sender(channel, address, anonymous, options, reply),
            Work::OpenReceiver {
                channel,
                address,
                dynamic,
                dynamic_node_properties,
                options,
                reply,
            } => self.handle_open_receiver(
                channel,
                address,
                dynamic,
                dynamic_node_properties,
                options,
                reply,
            ),
            Work::BeginTransaction { channel, reply } => {
                self.handle_begin_transaction(channel, reply)
            }
            Work::DischargeTransaction {
                channel,
                fail,
                reply,
            } => self.handle_discharge_transaction(channel, fail, reply),
            Work::AwaitLinkOpen { addr, reply } => {
                let closed_error = self.shared.closed_error();
                let Some(link) = self.link_mut(addr) else {
                    let _ = reply.send(Err(closed_error));
                    return;
                };
                let base = link.base_mut();
                match base.state {
                    LinkState::Attached => {
                        let _ = reply.send(Ok(()));
                    }
                    LinkState::AttachSent | LinkState::PendingCapabilities => {
                        base.open_waiters.push(reply);
                    }
                    _ => {
                        let _ = reply.send(Err(base
                            .failure
                            .clone()
                            .unwrap_or_else(|| ClientError::closed("the link is closed"))));
                    }
                }
            }
            Work::DetachLink {
                addr,
                closed,
                error,
                reply,
            } => self.handle_detach_link(addr, closed, error, reply),
            Work::Send {
                addr,
                payload,
                message_format,
                reply,
            } => self.handle_send(addr, payload, message_format, reply),
            Work::TrySend {
                addr,
                payload,
                message_format,
                reply,
            } => self.handle_try_send(addr, payload, message_format, reply),
            Work::AddCredit {
                addr,
                credit,
                reply,
            } => self.handle_add_credit(addr, credit, reply),
            Work::Drain { addr, reply } => self.handle_drain(addr, reply),
            Work::DeliveryConsumed { addr, delivery_id } => {
                self.handle_delivery_consumed(addr, delivery_id)
            }
            Work::DisposeIncoming {
                addr,
                delivery_id,
                state,
                settle,
                reply,
            } => self.handle_dispose_incoming(addr, delivery_id, state, settle, reply),
            Work::SettleOutgoing {
                addr,
                delivery_id,
                state,
                settle,
                reply,
            } => self.handle_settle_outgoing(addr, delivery_id, state, settle, reply),
            Work::Timer { id, purpose } => self.handle_timer(id, purpose),
        }
    }

    /// The error new work is refused with once close began, if any.
    fn closed_for_new_work(&self) -> Option<ClientError> {
        if matches!(self.state, ConnState::Failed | ConnState::Closed) || self.close_requested {
            Some(self.shared.closed_error())
        } else {
            None
        }
    }

    fn session_seed(&self, channel: u16) -> SessionSeed {
        let session = self.sessions.get(&channel).expect("session vanished");
        SessionSeed {
            channel,
            id: session.id.clone(),
            shared: Arc::clone(&session.shared),
        }
    }

    fn link_mut(&mut self, addr: LinkAddr) -> Option<&mut LinkCore> {
        self.sessions
            .get_mut(&addr.channel)?
            .links
            .get_mut(&addr.handle)
    }

    // ------------------------------------------------------------------
    // Session and link creation
    // ------------------------------------------------------------------

    fn create_session(&mut self, options: SessionOptions) -> u16 {
        let channel = self.next_channel;
        self.next_channel += 1;
        self.session_counter += 1;
        let id = format!("{}:{}", self.connection_id, self.session_counter);

        let mut session = SessionCore::new(id, channel, options);
        self.outbox.push(begin_frame(&session));

        let open_timeout = session
            .options
            .open_timeout
            .unwrap_or(self.options.open_timeout);
        if !open_timeout.is_zero() {
            session.open_timer = Some(
                self.timers
                    .schedule(open_timeout, TimerPurpose::SessionBegin { channel }),
            );
        }
        debug!(connection = %self.connection_id, session = %session.id, channel, "session begin sent");
        self.sessions.insert(channel, session);
        channel
    }

    fn ensure_root_session(&mut self) -> u16 {
        match self.root_channel {
            Some(channel) if self.sessions.contains_key(&channel) => channel,
            _ => {
                let channel = self.create_session(SessionOptions::default());
                self.root_channel = Some(channel);
                channel
            }
        }
    }

    fn default_link_timeouts(&self, session_options: Option<&SessionOptions>) -> LinkTimeouts {
        let open = session_options
            .and_then(|options| options.open_timeout)
            .unwrap_or(self.options.open_timeout);
        let close = session_options
            .and_then(|options| options.close_timeout)
            .unwrap_or(self.options.close_timeout);
        let send = session_options
            .and_then(|options| options.send_timeout)
            .unwrap_or(self.options.send_timeout);
        LinkTimeouts { open, close, send }
    }

    fn handle_open_sender(
        &mut self,
        channel: Option<u16>,
        address: Option<String>,
        anonymous: bool,
        options: SenderOptions,
        reply: oneshot::Sender<Result<LinkSeed>>,
    ) {
        if let Some(error) = self.closed_for_new_work() {
            let _ = reply.send(Err(error));
            return;
        }
        if anonymous {
            if let Some(capabilities) = self.shared.capabilities() {
                if !capabilities.anonymous_relay {
                    let _ = reply.send(Err(ClientError::unsupported_operation(
                        "anonymous relay support not available from this connection",
                    )));
                    return;
                }
            }
        }

        let channel = channel.unwrap_or_else(|| self.ensure_root_session());
        let _ = reply.send(self.create_sender(channel, address, anonymous, options));
    }

    fn create_sender(
        &mut self,
        channel: u16,
        address: Option<String>,
        anonymous: bool,
        options: SenderOptions,
    ) -> Result<LinkSeed> {
        let capabilities_known = self.shared.capabilities().is_some();
        let connection_timeouts = self.default_link_timeouts(None);
        let Driver {
            connection_id,
            sessions,
            timers,
            outbox,
            ..
        } = self;
        let session = sessions
            .get_mut(&channel)
            .ok_or_else(|| ClientError::closed("the session is closed"))?;
        if session.is_terminal() {
            return Err(session
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::closed("the session is closed")));
        }

        let handle = session.alloc_handle();
        let name = options
            .link_name
            .clone()
            .unwrap_or_else(|| session.next_link_name(Role::Sender));
        let settle_mode = match options.delivery_mode {
            DeliveryMode::AtMostOnce => SenderSettleMode::Settled,
            DeliveryMode::AtLeastOnce => SenderSettleMode::Unsettled,
        };
        let target = Target {
            address,
            durable: options.target.durability,
            expiry_policy: options.target.expiry_policy,
            capabilities: options.target.capabilities.clone(),
            ..Target::default()
        };
        let attach = Attach {
            name: name.clone(),
            handle,
            role: Role::Sender,
            snd_settle_mode: settle_mode,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                outcomes: default_outcomes(),
                default_outcome: Some(DeliveryState::modified_failed()),
                ..Source::default()
            }),
            target: Some(AttachTarget::Node(target)),
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: options.offered_capabilities.clone(),
            desired_capabilities: options.desired_capabilities.clone(),
            properties: options.properties.clone(),
        };

        let timeouts = LinkTimeouts {
            open: options.open_timeout.unwrap_or(connection_timeouts.open),
            close: options.close_timeout.unwrap_or(connection_timeouts.close),
            send: options.send_timeout.unwrap_or(connection_timeouts.send),
        };

        // Anonymous senders attach only once capabilities are known.
        let state = match anonymous && !capabilities_known {
            true => LinkState::PendingCapabilities,
            false => LinkState::AttachSent,
        };
        let addr = LinkAddr { channel, handle };
        let mut base = LinkBase::new(attach.clone(), addr, state, timeouts);

        if state == LinkState::AttachSent {
            outbox.push(Frame::amqp(channel, Performative::Attach(attach)));
            if !timeouts.open.is_zero() {
                base.open_timer =
                    Some(timers.schedule(timeouts.open, TimerPurpose::LinkAttach { addr }));
            }
        }

        let shared = Arc::clone(&base.shared);
        let sender = SenderCore::new(base, settle_mode, options.auto_settle, anonymous, false);
        session.links.insert(handle, LinkCore::Sender(sender));
        debug!(connection = %connection_id, link = %name, anonymous, "sender created");

        Ok(LinkSeed {
            addr,
            name,
            shared,
            deliveries: None,
        })
    }

    fn handle_open_receiver(
        &mut self,
        channel: Option<u16>,
        address: Option<String>,
        dynamic: bool,
        dynamic_node_properties: Fields,
        options: ReceiverOptions,
        reply: oneshot::Sender<Result<LinkSeed>>,
    ) {
        if let Some(error) = self.closed_for_new_work() {
            let _ = reply.send(Err(error));
            return;
        }
        let connection_timeouts = self.default_link_timeouts(None);
        let channel = channel.unwrap_or_else(|| self.ensure_root_session());

        let Driver {
            connection_id,
            sessions,
            timers,
            outbox,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&channel) else {
            let _ = reply.send(Err(ClientError::closed("the session is closed")));
            return;
        };
        if session.is_terminal() {
            let _ = reply.send(Err(session
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::closed("the session is closed"))));
            return;
        }

        let handle = session.alloc_handle();
        let name = options
            .link_name
            .clone()
            .unwrap_or_else(|| session.next_link_name(Role::Receiver));
        let outcomes = match options.source.outcomes.is_empty() {
            true => default_outcomes(),
            false => options.source.outcomes.clone(),
        };
        let default_outcome = options
            .source
            .default_outcome
            .clone()
            .unwrap_or_else(DeliveryState::modified_failed);
        let attach = Attach {
            name: name.clone(),
            handle,
            role: Role::Receiver,
            snd_settle_mode: SenderSettleMode::Unsettled,
            rcv_settle_mode: ReceiverSettleMode::First,
            source: Some(Source {
                address,
                durable: options.source.durability,
                expiry_policy: options.source.expiry_policy,
                dynamic,
                dynamic_node_properties,
                outcomes,
                default_outcome: Some(default_outcome),
                capabilities: options.source.capabilities.clone(),
            }),
            target: Some(AttachTarget::Node(Target::default())),
            initial_delivery_count: None,
            max_message_size: None,
            offered_capabilities: options.offered_capabilities.clone(),
            desired_capabilities: options.desired_capabilities.clone(),
            properties: options.properties.clone(),
        };

        let timeouts = LinkTimeouts {
            open: options.open_timeout.unwrap_or(connection_timeouts.open),
            close: options.close_timeout.unwrap_or(connection_timeouts.close),
            send: options.send_timeout.unwrap_or(connection_timeouts.send),
        };
        let addr = LinkAddr { channel, handle };
        let mut base = LinkBase::new(attach.clone(), addr, LinkState::AttachSent, timeouts);
        outbox.push(Frame::amqp(channel, Performative::Attach(attach)));
        if !timeouts.open.is_zero() {
            base.open_timer =
                Some(timers.schedule(timeouts.open, TimerPurpose::LinkAttach { addr }));
        }

        let shared = Arc::clone(&base.shared);
        let (events, deliveries) = mpsc::unbounded_channel();
        let receiver = ReceiverCore::new(
            base,
            options.credit_window,
            options.auto_accept,
            options.auto_settle,
            events,
        );
        session.links.insert(handle, LinkCore::Receiver(receiver));
        debug!(connection = %connection_id, link = %name, dynamic, "receiver created");

        let _ = reply.send(Ok(LinkSeed {
            addr,
            name,
            shared,
            deliveries: Some(deliveries),
        }));
    }

    // ------------------------------------------------------------------
    // Send paths
    // ------------------------------------------------------------------

    fn handle_send(
        &mut self,
        addr: LinkAddr,
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<TrackerSeed>>,
    ) {
        if let Some(error) = self.closed_for_new_work() {
            let _ = reply.send(Err(error));
            return;
        }
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions,
            timers,
            outbox,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        let SessionCore {
            links,
            next_outgoing_id,
            outgoing,
            txn,
            ..
        } = session;
        let Some(sender) = links.get_mut(&addr.handle).and_then(LinkCore::as_sender_mut) else {
            let _ = reply.send(Err(ClientError::closed("the sender is closed")));
            return;
        };
        if sender.base.is_terminal() {
            let _ = reply.send(Err(sender
                .base
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::closed("the sender is closed"))));
            return;
        }

        if sender.sendable() {
            let seed = sender.perform_transfer(
                next_outgoing_id,
                txn.active_txn_id(),
                payload,
                message_format,
                None,
                outbox,
            );
            outgoing.insert(seed.delivery_id, addr.handle);
            let _ = reply.send(Ok(seed));
            return;
        }

        // No credit: park the send until a flow arrives or the deadline
        // fires.
        let sequence = sender.next_send_sequence();
        let timer = match sender.base.timeouts.send.is_zero() {
            true => None,
            false => Some(timers.schedule(
                sender.base.timeouts.send,
                TimerPurpose::SendCredit { addr, sequence },
            )),
        };
        sender.blocked.push_back(BlockedSend {
            sequence,
            payload,
            message_format,
            reply,
            timer,
            txn_op: None,
        });
    }

    fn handle_try_send(
        &mut self,
        addr: LinkAddr,
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<Option<TrackerSeed>>>,
    ) {
        if let Some(error) = self.closed_for_new_work() {
            let _ = reply.send(Err(error));
            return;
        }
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        let SessionCore {
            links,
            next_outgoing_id,
            outgoing,
            txn,
            ..
        } = session;
        let Some(sender) = links.get_mut(&addr.handle).and_then(LinkCore::as_sender_mut) else {
            let _ = reply.send(Err(ClientError::closed("the sender is closed")));
            return;
        };
        if sender.base.is_terminal() {
            let _ = reply.send(Err(sender
                .base
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::closed("the sender is closed"))));
            return;
        }

        if sender.sendable() {
            let seed = sender.perform_transfer(
                next_outgoing_id,
                txn.active_txn_id(),
                payload,
                message_format,
                None,
                outbox,
            );
            outgoing.insert(seed.delivery_id, addr.handle);
            let _ = reply.send(Ok(Some(seed)));
        } else {
            let _ = reply.send(Ok(None));
        }
    }

    fn handle_connection_send(
        &mut self,
        payload: Bytes,
        message_format: u32,
        reply: oneshot::Sender<Result<TrackerSeed>>,
    ) {
        if let Some(error) = self.closed_for_new_work() {
            let _ = reply.send(Err(error));
            return;
        }
        let addr = match self.connection_sender {
            Some(addr) if self.link_exists(addr) => addr,
            _ => {
                if let Some(capabilities) = self.shared.capabilities() {
                    if !capabilities.anonymous_relay {
                        let _ = reply.send(Err(ClientError::unsupported_operation(
                            "anonymous relay support not available from this connection",
                        )));
                        return;
                    }
                }
                let channel = self.ensure_root_session();
                match self.create_sender(channel, None, true, SenderOptions::default()) {
                    Ok(seed) => {
                        self.connection_sender = Some(seed.addr);
                        seed.addr
                    }
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return;
                    }
                }
            }
        };
        self.handle_send(addr, payload, message_format, reply);
    }

    // ------------------------------------------------------------------
    // Receiver-side work
    // ------------------------------------------------------------------

    fn handle_add_credit(
        &mut self,
        addr: LinkAddr,
        credit: u32,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        let flow_seed = session_flow_seed(session);
        let Some(receiver) = session
            .links
            .get_mut(&addr.handle)
            .and_then(LinkCore::as_receiver_mut)
        else {
            let _ = reply.send(Err(ClientError::closed("the receiver is closed")));
            return;
        };
        if receiver.base.is_terminal() {
            let _ = reply.send(Err(receiver
                .base
                .failure
                .clone()
                .unwrap_or_else(|| ClientError::closed("the receiver is closed"))));
            return;
        }
        receiver.credit += credit;
        outbox.push(flow_frame(flow_seed, addr.handle, receiver.credit, false));
        let _ = reply.send(Ok(()));
    }

    fn handle_drain(&mut self, addr: LinkAddr, reply: oneshot::Sender<Result<()>>) {
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        let flow_seed = session_flow_seed(session);
        let Some(receiver) = session
            .links
            .get_mut(&addr.handle)
            .and_then(LinkCore::as_receiver_mut)
        else {
            let _ = reply.send(Err(ClientError::closed("the receiver is closed")));
            return;
        };
        if receiver.credit == 0 {
            let _ = reply.send(Ok(()));
            return;
        }
        receiver.drain_reply = Some(reply);
        outbox.push(flow_frame(flow_seed, addr.handle, receiver.credit, true));
    }

    fn handle_delivery_consumed(&mut self, addr: LinkAddr, delivery_id: DeliveryNumber) {
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            return;
        };
        let txn_id = session.txn.active_txn_id();
        let flow_seed = session_flow_seed(session);

        let Some(receiver) = session
            .links
            .get_mut(&addr.handle)
            .and_then(LinkCore::as_receiver_mut)
        else {
            return;
        };
        receiver.queued = receiver.queued.saturating_sub(1);
        let auto_accept = receiver.auto_accept;
        let auto_settle = receiver.auto_settle;

        if auto_accept && session.incoming.contains_key(&delivery_id) {
            let state = wrap_in_txn(Some(DeliveryState::Accepted), txn_id);
            outbox.push(Frame::amqp(
                addr.channel,
                Performative::Disposition(Disposition {
                    role: Role::Receiver,
                    first: delivery_id,
                    last: None,
                    settled: auto_settle,
                    state,
                }),
            ));
            if auto_settle {
                session.incoming.remove(&delivery_id);
            }
        }

        let Some(receiver) = session
            .links
            .get_mut(&addr.handle)
            .and_then(LinkCore::as_receiver_mut)
        else {
            return;
        };
        if let Some(grant) = receiver.replenish_target() {
            receiver.credit += grant;
            let credit = receiver.credit;
            outbox.push(flow_frame(flow_seed, addr.handle, credit, false));
        }
    }

    fn handle_dispose_incoming(
        &mut self,
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
        state: Option<DeliveryState>,
        settle: bool,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        if !session.incoming.contains_key(&delivery_id) {
            // Already settled; disposition is idempotent from the
            // application's point of view.
            let _ = reply.send(Ok(()));
            return;
        }
        let state = wrap_in_txn(state, session.txn.active_txn_id());
        outbox.push(Frame::amqp(
            addr.channel,
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled: settle,
                state,
            }),
        ));
        if settle {
            session.incoming.remove(&delivery_id);
        }
        let _ = reply.send(Ok(()));
    }

    fn handle_settle_outgoing(
        &mut self,
        addr: LinkAddr,
        delivery_id: DeliveryNumber,
        state: Option<DeliveryState>,
        settle: bool,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let closed_error = self.shared.closed_error();
        let Driver {
            sessions, outbox, ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Err(closed_error));
            return;
        };
        let txn_id = session.txn.active_txn_id();
        let SessionCore {
            links, outgoing, ..
        } = session;
        let Some(sender) = links.get_mut(&addr.handle).and_then(LinkCore::as_sender_mut) else {
            let _ = reply.send(Err(ClientError::closed("the sender is closed")));
            return;
        };
        let Some(slot) = sender.unsettled.get_mut(&delivery_id) else {
            let _ = reply.send(Ok(()));
            return;
        };

        let stamped = wrap_in_txn(state, txn_id);
        if let Some(state) = &stamped {
            slot.shared.set_local_state(state.clone());
        }
        if settle {
            slot.shared.mark_settled();
            if let Some(settlement) = slot.settlement.take() {
                let _ = settlement.send(Ok(()));
            }
        }
        outbox.push(Frame::amqp(
            addr.channel,
            Performative::Disposition(Disposition {
                role: Role::Sender,
                first: delivery_id,
                last: None,
                settled: settle,
                state: stamped,
            }),
        ));
        if settle {
            sender.unsettled.remove(&delivery_id);
            outgoing.remove(&delivery_id);
        }
        let _ = reply.send(Ok(()));
    }

    // ------------------------------------------------------------------
    // Close paths
    // ------------------------------------------------------------------

    fn begin_close(&mut self, error: Option<ErrorCondition>) {
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.shared.mark_closed();
        debug!(connection = %self.connection_id, "closing connection");

        // Nothing pending can complete once the close goes out.
        let closed = ClientError::closed("the connection is closed");
        for session in self.sessions.values_mut() {
            for link in session.links.values_mut() {
                link.base_mut().finish_open_waiters(&Err(closed.clone()));
                if let Some(sender) = link.as_sender_mut() {
                    sender.fail_pending(&closed);
                }
            }
        }

        self.outbox
            .push(Frame::amqp(0, Performative::Close(Close { error })));
        self.state = ConnState::CloseSent;
        if !self.options.close_timeout.is_zero() {
            self.close_timer = Some(
                self.timers
                    .schedule(self.options.close_timeout, TimerPurpose::ConnectionClose),
            );
        }
    }

    /// Complete the close: the transport is shut and every waiter hears
    /// the same terminal outcome.
    fn finish_close(&mut self) {
        if self.close_done {
            return;
        }
        self.close_done = true;
        self.state = ConnState::Closed;
        let close_timer = self.close_timer.take();
        self.timers.cancel(close_timer);
        self.timers.clear();

        let closed = ClientError::closed("the connection is closed");
        let channels: Vec<u16> = self.sessions.keys().copied().collect();
        for channel in channels {
            if let Some(mut session) = self.sessions.remove(&channel) {
                session.fail(&closed);
            }
        }
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(closed.clone()));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.done = true;
        debug!(connection = %self.connection_id, "connection closed");
    }

    /// Fatal path: record the cause once, fail everything, complete close.
    fn fail_connection(&mut self, error: ClientError) {
        if self.state == ConnState::Failed {
            return;
        }
        warn!(connection = %self.connection_id, %error, "connection failed");
        self.shared.set_failure(error.clone());
        self.shared.mark_closed();
        self.state = ConnState::Failed;
        self.timers.clear();

        let channels: Vec<u16> = self.sessions.keys().copied().collect();
        for channel in channels {
            if let Some(mut session) = self.sessions.remove(&channel) {
                session.fail(&error);
            }
        }
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.close_done = true;

        if let Some(handler) = self.options.failed_handler.clone() {
            let failure = error.clone();
            self.events_dispatch()
                .submit(DispatchJob::Callback(Box::new(move || {
                    handler(ConnectionEvent::Failed { error: failure });
                })));
        }
        self.done = true;
    }

    fn events_dispatch(&mut self) -> DispatchHandle {
        if let Some(dispatch) = &self.events_dispatch {
            return dispatch.clone();
        }
        let dispatch = DispatchHandle::spawn(format!(
            "connection[{}] event dispatcher",
            self.connection_id
        ));
        self.events_dispatch = Some(dispatch.clone());
        dispatch
    }

    fn handle_end_session(
        &mut self,
        channel: u16,
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let close_timeout = self.options.close_timeout;
        let Driver {
            sessions,
            timers,
            outbox,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&channel) else {
            let _ = reply.send(Ok(()));
            return;
        };
        if session.is_terminal() {
            let _ = reply.send(Ok(()));
            return;
        }
        session.end_waiters.push(reply);
        if session.state == SessionState::EndSent {
            return;
        }
        session.state = SessionState::EndSent;
        session.shared.mark_closed();

        let closed = ClientError::closed("the session is closed");
        for link in session.links.values_mut() {
            link.base_mut().finish_open_waiters(&Err(closed.clone()));
            if let Some(sender) = link.as_sender_mut() {
                sender.fail_pending(&closed);
            }
        }

        outbox.push(Frame::amqp(channel, Performative::End(End { error })));
        let timeout = session.options.close_timeout.unwrap_or(close_timeout);
        if !timeout.is_zero() {
            session.end_timer =
                Some(timers.schedule(timeout, TimerPurpose::SessionEnd { channel }));
        }
    }

    fn handle_detach_link(
        &mut self,
        addr: LinkAddr,
        closed: bool,
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let Driver {
            sessions,
            timers,
            outbox,
            ..
        } = self;
        let Some(session) = sessions.get_mut(&addr.channel) else {
            let _ = reply.send(Ok(()));
            return;
        };
        let Some(link) = session.links.get_mut(&addr.handle) else {
            let _ = reply.send(Ok(()));
            return;
        };
        if link.base().is_terminal() {
            let _ = reply.send(Ok(()));
            return;
        }
        {
            let base = link.base_mut();
            base.detach_waiters.push(reply);
            if base.state == LinkState::DetachSent {
                return;
            }
            base.state = LinkState::DetachSent;
        }

        let closed_error = ClientError::closed("the link is closed");
        if let Some(sender) = link.as_sender_mut() {
            sender.fail_pending(&closed_error);
        }
        let base = link.base_mut();
        base.finish_open_waiters(&Err(closed_error));

        outbox.push(Frame::amqp(
            addr.channel,
            Performative::Detach(Detach {
                handle: addr.handle,
                closed,
                error,
            }),
        ));
        if !base.timeouts.close.is_zero() {
            base.detach_timer =
                Some(timers.schedule(base.timeouts.close, TimerPurpose::LinkDetach { addr }));
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn handle_timer(&mut self, id: u64, purpose: TimerPurpose) {
        if !self.timers.take(id) {
            return; // cancelled
        }
        match purpose {
            TimerPurpose::ConnectionOpen => {
                if self.state == ConnState::OpenSent {
                    self.fail_connection(ClientError::operation_timed_out(
                        "connection open timed out waiting for the remote to open",
                    ));
                }
            }
            TimerPurpose::ConnectionClose => {
                debug!(connection = %self.connection_id, "close timed out, forcing transport shutdown");
                self.finish_close();
            }
            TimerPurpose::SessionBegin { channel } => {
                if let Some(mut session) = self.sessions.remove(&channel) {
                    if session.state == SessionState::BeginSent {
                        session.fail(&ClientError::operation_timed_out(
                            "session begin timed out waiting for the remote to respond",
                        ));
                        self.forget_root_session(channel);
                    } else {
                        self.sessions.insert(channel, session);
                    }
                }
            }
            TimerPurpose::SessionEnd { channel } => {
                if let Some(mut session) = self.sessions.remove(&channel) {
                    session.fail(&ClientError::closed("the session is closed"));
                    self.forget_root_session(channel);
                }
            }
            TimerPurpose::LinkAttach { addr } => {
                if let Some(session) = self.sessions.get_mut(&addr.channel) {
                    let timed_out = session
                        .links
                        .get(&addr.handle)
                        .is_some_and(|link| link.base().state == LinkState::AttachSent);
                    if timed_out {
                        let mut link = session.links.remove(&addr.handle).expect("link vanished");
                        link.fail(&ClientError::operation_timed_out(
                            "link attach timed out waiting for the remote to respond",
                        ));
                    }
                }
            }
            TimerPurpose::LinkDetach { addr } => {
                if let Some(session) = self.sessions.get_mut(&addr.channel) {
                    if let Some(mut link) = session.links.remove(&addr.handle) {
                        let base = link.base_mut();
                        base.state = LinkState::Closed;
                        base.shared.mark_closed();
                        base.finish_detach_waiters();
                        if let LinkCore::Receiver(receiver) = &link {
                            receiver.notify(ReceiverEvent::Closed(ClientError::closed(
                                "the receiver is closed",
                            )));
                        }
                    }
                }
            }
            TimerPurpose::SendCredit { addr, sequence } => {
                if let Some(sender) = self.link_mut(addr).and_then(LinkCore::as_sender_mut) {
                    if let Some(position) = sender
                        .blocked
                        .iter()
                        .position(|blocked| blocked.sequence == sequence)
                    {
                        let blocked = sender
                            .blocked
                            .remove(position)
                            .expect("blocked send vanished");
                        let _ = blocked.reply.send(Err(ClientError::send_timed_out(
                            "send timed out waiting for credit",
                        )));
                    }
                }
            }
            TimerPurpose::TransactionRequest { channel } => {
                if let Some(session) = self.sessions.get_mut(&channel) {
                    match std::mem::take(&mut session.txn) {
                        TxnState::Declaring { reply, .. } => {
                            // The transaction is treated as never-begun; a
                            // late declared outcome is ignored.
                            let _ = reply.send(Err(ClientError::operation_timed_out(
                                "transaction declare timed out",
                            )));
                        }
                        TxnState::Discharging { reply, .. } => {
                            let _ = reply.send(Err(ClientError::operation_timed_out(
                                "transaction discharge timed out",
                            )));
                        }
                        other => session.txn = other,
                    }
                }
            }
            TimerPurpose::IdleHeartbeat => {
                if self.state == ConnState::Open {
                    self.outbox.push(Frame::Empty);
                    if let Some(interval) = self.heartbeat {
                        self.timers.schedule(interval, TimerPurpose::IdleHeartbeat);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Frame helpers
// ----------------------------------------------------------------------------

fn default_outcomes() -> Vec<Symbol> {
    vec![
        Symbol::from("amqp:accepted:list"),
        Symbol::from("amqp:rejected:list"),
        Symbol::from("amqp:released:list"),
        Symbol::from("amqp:modified:list"),
    ]
}

fn begin_frame(session: &SessionCore) -> Frame {
    Frame::amqp(
        session.channel,
        Performative::Begin(Begin {
            remote_channel: None,
            next_outgoing_id: session.next_outgoing_id,
            incoming_window: session.incoming_window,
            outgoing_window: session.outgoing_window,
            handle_max: u32::MAX,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: Fields::new(),
        }),
    )
}

/// (channel, next-incoming-id, incoming-window, next-outgoing-id,
/// outgoing-window) snapshot used to build link flows.
type FlowSeed = (u16, u32, u32, u32, u32);

fn session_flow_seed(session: &SessionCore) -> FlowSeed {
    (
        session.channel,
        session.next_incoming_id,
        session.incoming_window,
        session.next_outgoing_id,
        session.outgoing_window,
    )
}

fn flow_frame(seed: FlowSeed, handle: Handle, credit: u32, drain: bool) -> Frame {
    let (channel, next_incoming_id, incoming_window, next_outgoing_id, outgoing_window) = seed;
    Frame::amqp(
        channel,
        Performative::Flow(Flow {
            next_incoming_id: Some(next_incoming_id),
            incoming_window,
            next_outgoing_id,
            outgoing_window,
            handle: Some(handle),
            delivery_count: None,
            link_credit: Some(credit),
            available: None,
            drain,
            echo: false,
        }),
    )
}

fn drain_response_frame(channel: u16, handle: Handle, delivery_count: u32) -> Frame {
    Frame::amqp(
        channel,
        Performative::Flow(Flow {
            handle: Some(handle),
            delivery_count: Some(delivery_count),
            link_credit: Some(0),
            drain: true,
            ..Flow::default()
        }),
    )
}

fn wrap_in_txn(state: Option<DeliveryState>, txn_id: Option<TxnId>) -> Option<DeliveryState> {
    match txn_id {
        Some(txn_id) => Some(DeliveryState::transactional(txn_id, state)),
        None => state,
    }
}

fn build_delivery(front: DriverHandle, addr: LinkAddr, completed: CompletedDelivery) -> Delivery {
    Delivery::new(
        front,
        addr,
        completed.delivery_id,
        completed.tag,
        completed.message_format,
        completed.payload,
        completed.settled,
        completed.state,
    )
}
