//! Transaction controller state
//!
//! One state machine per session: idle until a Declare is in flight, active
//! while the coordinator holds a transaction open, discharging while a
//! commit or rollback awaits its outcome. The driver owns the transitions;
//! this module owns the state and the coordinator-operation markers.

use tokio::sync::oneshot;

use lapwing_types::TxnId;

use crate::error::Result;

/// Marker attached to coordinator-link deliveries so their dispositions
/// route to the transaction machine instead of an application tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxnOp {
    Declare,
    Discharge { fail: bool },
}

/// Per-session transaction state.
#[derive(Debug, Default)]
pub(crate) enum TxnState {
    #[default]
    Idle,
    Declaring {
        reply: oneshot::Sender<Result<()>>,
        timer: Option<u64>,
    },
    Active {
        txn_id: TxnId,
        /// The coordinator link dropped while the transaction was open;
        /// the next commit or rollback reports a rollback.
        coordinator_lost: bool,
    },
    Discharging {
        reply: oneshot::Sender<Result<()>>,
        timer: Option<u64>,
        fail: bool,
    },
}

impl TxnState {
    /// The txn-id outgoing transfers and dispositions must be stamped
    /// with, when a transaction is active.
    pub fn active_txn_id(&self) -> Option<TxnId> {
        match self {
            TxnState::Active { txn_id, .. } => Some(txn_id.clone()),
            _ => None,
        }
    }

    /// Whether a Declare or Discharge is currently in flight.
    pub fn in_flight(&self) -> bool {
        matches!(self, TxnState::Declaring { .. } | TxnState::Discharging { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_has_no_txn_id() {
        assert_eq!(TxnState::Idle.active_txn_id(), None);
        assert!(!TxnState::Idle.in_flight());
    }

    #[test]
    fn test_active_exposes_txn_id() {
        let state = TxnState::Active {
            txn_id: TxnId::from_slice(&[0, 1, 2, 3]),
            coordinator_lost: false,
        };
        assert_eq!(state.active_txn_id(), Some(TxnId::from_slice(&[0, 1, 2, 3])));
    }
}
