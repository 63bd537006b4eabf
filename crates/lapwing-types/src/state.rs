//! Delivery states and outcomes
//!
//! The states a peer can assert for a delivery via Transfer and Disposition,
//! including the transactional wrappers from the transaction extension.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definitions::{ErrorCondition, Fields};
use crate::transaction::TxnId;

// ----------------------------------------------------------------------------
// Delivery State
// ----------------------------------------------------------------------------

/// State asserted for a delivery by either peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// The delivery was accepted and fulfills the sender's obligations.
    Accepted,
    /// The delivery was rejected as unprocessable.
    Rejected { error: Option<ErrorCondition> },
    /// The delivery was not and will not be acted upon.
    Released,
    /// The delivery was modified but not processed.
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Fields,
    },
    /// Coordinator outcome carrying the identifier of a declared transaction.
    Declared { txn_id: TxnId },
    /// A state wrapped in an active transaction.
    Transactional {
        txn_id: TxnId,
        outcome: Option<Box<DeliveryState>>,
    },
}

/// Discriminant of a [`DeliveryState`], convenient for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStateType {
    Accepted,
    Rejected,
    Released,
    Modified,
    Declared,
    Transactional,
}

impl DeliveryState {
    /// The default outcome applied to abandoned deliveries.
    pub fn modified_failed() -> Self {
        DeliveryState::Modified {
            delivery_failed: true,
            undeliverable_here: false,
            message_annotations: Fields::new(),
        }
    }

    pub fn rejected(error: Option<ErrorCondition>) -> Self {
        DeliveryState::Rejected { error }
    }

    /// Wrap a state in the given transaction.
    pub fn transactional(txn_id: TxnId, outcome: Option<DeliveryState>) -> Self {
        DeliveryState::Transactional {
            txn_id,
            outcome: outcome.map(Box::new),
        }
    }

    pub fn state_type(&self) -> DeliveryStateType {
        match self {
            DeliveryState::Accepted => DeliveryStateType::Accepted,
            DeliveryState::Rejected { .. } => DeliveryStateType::Rejected,
            DeliveryState::Released => DeliveryStateType::Released,
            DeliveryState::Modified { .. } => DeliveryStateType::Modified,
            DeliveryState::Declared { .. } => DeliveryStateType::Declared,
            DeliveryState::Transactional { .. } => DeliveryStateType::Transactional,
        }
    }

    /// Whether this state ends the delivery's lifecycle.
    ///
    /// A transactional wrapper is terminal once it carries a terminal inner
    /// outcome.
    pub fn is_terminal(&self) -> bool {
        match self {
            DeliveryState::Accepted
            | DeliveryState::Rejected { .. }
            | DeliveryState::Released
            | DeliveryState::Modified { .. }
            | DeliveryState::Declared { .. } => true,
            DeliveryState::Transactional { outcome, .. } => {
                outcome.as_ref().is_some_and(|inner| inner.is_terminal())
            }
        }
    }

    /// The innermost outcome, unwrapping transactional layers.
    pub fn outcome(&self) -> Option<&DeliveryState> {
        match self {
            DeliveryState::Transactional { outcome, .. } => {
                outcome.as_deref().and_then(|inner| inner.outcome())
            }
            other => Some(other),
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryState::Accepted => write!(f, "accepted"),
            DeliveryState::Rejected { error: Some(e) } => write!(f, "rejected({})", e),
            DeliveryState::Rejected { error: None } => write!(f, "rejected"),
            DeliveryState::Released => write!(f, "released"),
            DeliveryState::Modified { delivery_failed, .. } => {
                write!(f, "modified(failed={})", delivery_failed)
            }
            DeliveryState::Declared { txn_id } => write!(f, "declared({})", txn_id),
            DeliveryState::Transactional { txn_id, outcome } => match outcome {
                Some(inner) => write!(f, "transactional({}, {})", txn_id, inner),
                None => write!(f, "transactional({})", txn_id),
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(DeliveryState::Accepted.is_terminal());
        assert!(DeliveryState::Released.is_terminal());
        assert!(DeliveryState::modified_failed().is_terminal());
        assert!(DeliveryState::rejected(None).is_terminal());
    }

    #[test]
    fn test_transactional_terminal_follows_inner() {
        let txn_id = TxnId::from_slice(&[0, 1, 2, 3]);
        let bare = DeliveryState::transactional(txn_id.clone(), None);
        assert!(!bare.is_terminal());

        let wrapped = DeliveryState::transactional(txn_id, Some(DeliveryState::Accepted));
        assert!(wrapped.is_terminal());
        assert_eq!(wrapped.state_type(), DeliveryStateType::Transactional);
        assert_eq!(wrapped.outcome(), Some(&DeliveryState::Accepted));
    }

    #[test]
    fn test_modified_failed_shape() {
        match DeliveryState::modified_failed() {
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                ..
            } => {
                assert!(delivery_failed);
                assert!(!undeliverable_here);
            }
            other => panic!("unexpected state {other}"),
        }
    }
}
