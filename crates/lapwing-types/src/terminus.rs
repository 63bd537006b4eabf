//! Terminus descriptions
//!
//! Source and Target records exchanged at attach, plus the Coordinator
//! target used by the transaction controller.

use serde::{Deserialize, Serialize};

use crate::definitions::{Fields, Symbol};
use crate::state::DeliveryState;

// ----------------------------------------------------------------------------
// Durability and Expiry
// ----------------------------------------------------------------------------

/// What terminus state the node retains durably.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminusDurability {
    #[default]
    None,
    Configuration,
    UnsettledState,
}

/// When the node may discard the terminus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryPolicy {
    LinkDetach,
    #[default]
    SessionEnd,
    ConnectionClose,
    Never,
}

// ----------------------------------------------------------------------------
// Source
// ----------------------------------------------------------------------------

/// Where messages originate for a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Node address; `None` on anonymous or dynamic sources.
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: ExpiryPolicy,
    /// Request that the node create the source on attach.
    pub dynamic: bool,
    pub dynamic_node_properties: Fields,
    /// Outcomes this endpoint can accept for deliveries from this source.
    pub outcomes: Vec<Symbol>,
    /// Outcome applied when a delivery is abandoned without one.
    pub default_outcome: Option<DeliveryState>,
    pub capabilities: Vec<Symbol>,
}

impl Source {
    pub fn with_address<S: Into<String>>(address: S) -> Self {
        Source {
            address: Some(address.into()),
            ..Source::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Target
// ----------------------------------------------------------------------------

/// Where messages go for a link.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Node address; `None` makes the target anonymous.
    pub address: Option<String>,
    pub durable: TerminusDurability,
    pub expiry_policy: ExpiryPolicy,
    pub dynamic: bool,
    pub dynamic_node_properties: Fields,
    pub capabilities: Vec<Symbol>,
}

impl Target {
    pub fn with_address<S: Into<String>>(address: S) -> Self {
        Target {
            address: Some(address.into()),
            ..Target::default()
        }
    }

    /// An anonymous target, used by senders that route per-message.
    pub fn anonymous() -> Self {
        Target::default()
    }
}

/// Transaction coordinator target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinator {
    pub capabilities: Vec<Symbol>,
}

/// The target slot of an Attach: a plain node or the transaction coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttachTarget {
    Node(Target),
    Coordinator(Coordinator),
}

impl AttachTarget {
    pub fn as_node(&self) -> Option<&Target> {
        match self {
            AttachTarget::Node(target) => Some(target),
            AttachTarget::Coordinator(_) => None,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, AttachTarget::Coordinator(_))
    }
}

impl From<Target> for AttachTarget {
    fn from(target: Target) -> Self {
        AttachTarget::Node(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_target_has_no_address() {
        assert_eq!(Target::anonymous().address, None);
    }

    #[test]
    fn test_attach_target_coordinator() {
        let target = AttachTarget::Coordinator(Coordinator::default());
        assert!(target.is_coordinator());
        assert!(target.as_node().is_none());
    }

    #[test]
    fn test_source_with_address() {
        let source = Source::with_address("test-queue");
        assert_eq!(source.address.as_deref(), Some("test-queue"));
        assert!(!source.dynamic);
    }
}
