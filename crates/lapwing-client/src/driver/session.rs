//! Session state and the delivery-dispatch executor
//!
//! A session multiplexes links over one channel, carries the flow windows,
//! and lazily owns the single-worker dispatch task that runs everything
//! application-visible: delivery hand-off and lifecycle callbacks. User
//! code never runs on the protocol loop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use lapwing_types::{DeliveryNumber, Handle, Role};

use crate::driver::link::{LinkCore, LinkState};
use crate::driver::txn::TxnState;
use crate::driver::work::{ReceiverEvent, SessionShared};
use crate::error::{ClientError, Result};
use crate::options::SessionOptions;

// ----------------------------------------------------------------------------
// Dispatch Executor
// ----------------------------------------------------------------------------

/// Work run on a dispatch executor, off the protocol loop.
pub(crate) enum DispatchJob {
    /// Forward an event to a receiver's application queue.
    Forward {
        queue: mpsc::UnboundedSender<ReceiverEvent>,
        event: ReceiverEvent,
    },
    /// Run an application callback.
    Callback(Box<dyn FnOnce() + Send>),
}

/// Handle to a lazily spawned single-worker dispatch task.
///
/// Submissions after shutdown are silently dropped, matching the discard
/// behavior expected of the delivery dispatcher once its session closes.
#[derive(Clone)]
pub(crate) struct DispatchHandle {
    jobs: mpsc::UnboundedSender<DispatchJob>,
}

impl DispatchHandle {
    pub fn spawn(label: String) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<DispatchJob>();
        tokio::spawn(async move {
            tracing::trace!(dispatcher = %label, "dispatch executor started");
            while let Some(job) = rx.recv().await {
                match job {
                    DispatchJob::Forward { queue, event } => {
                        let _ = queue.send(event);
                    }
                    DispatchJob::Callback(callback) => callback(),
                }
            }
            tracing::trace!(dispatcher = %label, "dispatch executor stopped");
        });
        Self { jobs }
    }

    pub fn submit(&self, job: DispatchJob) {
        let _ = self.jobs.send(job);
    }
}

// ----------------------------------------------------------------------------
// Session Core
// ----------------------------------------------------------------------------

/// Lifecycle of a session endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    BeginSent,
    Open,
    EndSent,
    Closed,
    Failed,
}

pub(crate) struct SessionCore {
    pub id: String,
    pub channel: u16,
    pub remote_channel: Option<u16>,
    pub state: SessionState,
    pub options: SessionOptions,
    pub shared: Arc<SessionShared>,
    pub links: HashMap<Handle, LinkCore>,
    /// Peer link handle to our link handle.
    pub remote_handles: HashMap<Handle, Handle>,
    next_handle: Handle,
    link_counter: u32,
    pub next_outgoing_id: DeliveryNumber,
    pub next_incoming_id: DeliveryNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub open_waiters: Vec<oneshot::Sender<Result<()>>>,
    pub open_timer: Option<u64>,
    pub end_waiters: Vec<oneshot::Sender<Result<()>>>,
    pub end_timer: Option<u64>,
    pub failure: Option<ClientError>,
    dispatch: Option<DispatchHandle>,
    pub txn: TxnState,
    pub coordinator_handle: Option<Handle>,
    /// Unsettled incoming deliveries and the link that owns each.
    pub incoming: HashMap<DeliveryNumber, Handle>,
    /// Unsettled outgoing deliveries and the link that owns each.
    pub outgoing: HashMap<DeliveryNumber, Handle>,
}

impl SessionCore {
    pub fn new(id: String, channel: u16, options: SessionOptions) -> Self {
        let incoming_window = options.incoming_window.unwrap_or(2048);
        let outgoing_window = options.outgoing_window.unwrap_or(2048);
        Self {
            id,
            channel,
            remote_channel: None,
            state: SessionState::BeginSent,
            options,
            shared: Arc::new(SessionShared::default()),
            links: HashMap::new(),
            remote_handles: HashMap::new(),
            next_handle: 0,
            link_counter: 0,
            next_outgoing_id: 0,
            next_incoming_id: 0,
            incoming_window,
            outgoing_window,
            open_waiters: Vec::new(),
            open_timer: None,
            end_waiters: Vec::new(),
            end_timer: None,
            failure: None,
            dispatch: None,
            txn: TxnState::Idle,
            coordinator_handle: None,
            incoming: HashMap::new(),
            outgoing: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SessionState::Closed | SessionState::Failed)
    }

    pub fn alloc_handle(&mut self) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Default link name: `"{role}-{session-id}:{counter}"`.
    pub fn next_link_name(&mut self, role: Role) -> String {
        self.link_counter += 1;
        format!("{}-{}:{}", role, self.id, self.link_counter)
    }

    /// Resolve our link handle from the peer's.
    pub fn resolve_remote_handle(&self, remote: Handle) -> Option<Handle> {
        self.remote_handles.get(&remote).copied()
    }

    /// The dispatch executor, created on first use.
    ///
    /// Nothing is dispatched after the session reaches a terminal state;
    /// callers check that before submitting.
    pub fn dispatch(&mut self) -> DispatchHandle {
        if let Some(dispatch) = &self.dispatch {
            return dispatch.clone();
        }
        let dispatch = DispatchHandle::spawn(format!("session[{}] delivery dispatcher", self.id));
        self.dispatch = Some(dispatch.clone());
        dispatch
    }

    /// Forward a receiver event through the dispatch executor, preserving
    /// per-receiver order.
    pub fn dispatch_event(&mut self, queue: mpsc::UnboundedSender<ReceiverEvent>, event: ReceiverEvent) {
        if self.is_terminal() {
            return;
        }
        self.dispatch()
            .submit(DispatchJob::Forward { queue, event });
    }

    pub fn finish_open_waiters(&mut self, result: &Result<()>) {
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    pub fn finish_end_waiters(&mut self) {
        for waiter in self.end_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail the session and every link in it with the given error.
    ///
    /// Pending opens, parked sends, trackers and receiver queues all see
    /// the same cause; the registry is emptied since every child is now
    /// terminal.
    pub fn fail(&mut self, error: &ClientError) {
        self.state = SessionState::Failed;
        self.failure = Some(error.clone());
        self.shared.set_failure(error.clone());
        self.shared.mark_closed();
        self.finish_open_waiters(&Err(error.clone()));
        self.finish_end_waiters();

        for (_, mut link) in self.links.drain() {
            // A link whose open was still in flight sees its parent's
            // closure rather than its own.
            if matches!(
                link.base().state,
                LinkState::AttachSent | LinkState::PendingCapabilities
            ) {
                link.fail(&ClientError::resource_remotely_closed(
                    error.remote_condition().cloned(),
                ));
            } else {
                link.fail(error);
            }
        }
        self.remote_handles.clear();
        self.incoming.clear();
        self.outgoing.clear();

        match std::mem::take(&mut self.txn) {
            TxnState::Declaring { reply, .. } => {
                let _ = reply.send(Err(error.clone()));
            }
            TxnState::Discharging { reply, .. } => {
                let _ = reply.send(Err(error.clone()));
            }
            _ => {}
        }
        self.coordinator_handle = None;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_names_follow_role_and_counter() {
        let mut session = SessionCore::new("conn-1:1".to_string(), 0, SessionOptions::default());
        assert_eq!(session.next_link_name(Role::Sender), "sender-conn-1:1:1");
        assert_eq!(session.next_link_name(Role::Receiver), "receiver-conn-1:1:2");
    }

    #[test]
    fn test_handle_allocation_is_sequential() {
        let mut session = SessionCore::new("conn-1:1".to_string(), 0, SessionOptions::default());
        assert_eq!(session.alloc_handle(), 0);
        assert_eq!(session.alloc_handle(), 1);
        assert_eq!(session.alloc_handle(), 2);
    }

    #[test]
    fn test_fail_resolves_txn_waiters() {
        let mut session = SessionCore::new("conn-1:1".to_string(), 0, SessionOptions::default());
        let (reply, mut rx) = oneshot::channel();
        session.txn = TxnState::Declaring { reply, timer: None };

        session.fail(&ClientError::connection_remotely_closed(None));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ClientError::ConnectionRemotelyClosed { .. })
        ));
        assert!(session.is_terminal());
    }
}
