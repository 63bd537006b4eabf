//! Core protocol definitions
//!
//! Symbols, roles, settle modes, error conditions and the small value type
//! used in capability and property maps.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Link handle as carried in Attach, Flow, Transfer and Detach.
pub type Handle = u32;

/// Session-scoped delivery number assigned to each transfer.
pub type DeliveryNumber = u32;

// ----------------------------------------------------------------------------
// Symbol
// ----------------------------------------------------------------------------

/// An AMQP symbolic constant (capability names, error conditions, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Symbol(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol(value.to_string())
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol(value)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability offered by peers that support the anonymous relay.
pub const ANONYMOUS_RELAY: &str = "ANONYMOUS-RELAY";

/// Well-known error condition symbols used by the client core.
pub mod conditions {
    pub const INTERNAL_ERROR: &str = "amqp:internal-error";
    pub const NOT_FOUND: &str = "amqp:not-found";
    pub const NOT_IMPLEMENTED: &str = "amqp:not-implemented";
    pub const DECODE_ERROR: &str = "amqp:decode-error";
    pub const RESOURCE_LIMIT_EXCEEDED: &str = "amqp:resource-limit-exceeded";
    pub const CONNECTION_FORCED: &str = "amqp:connection:forced";
    pub const TRANSACTION_ROLLBACK: &str = "amqp:transaction:rollback";
    pub const TRANSACTION_UNKNOWN_ID: &str = "amqp:transaction:unknown-id";
}

// ----------------------------------------------------------------------------
// Roles and Settle Modes
// ----------------------------------------------------------------------------

/// The role a link endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// Sender settlement discipline negotiated at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderSettleMode {
    /// Sender leaves deliveries unsettled until the receiver settles.
    Unsettled,
    /// Sender settles every delivery before it is sent.
    Settled,
    /// Sender may settle or not on a per-delivery basis.
    Mixed,
}

/// Receiver settlement discipline negotiated at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverSettleMode {
    /// Receiver settles as soon as it applies a state (the common case).
    First,
    /// Receiver waits for the sender to settle first.
    Second,
}

// ----------------------------------------------------------------------------
// Error Condition
// ----------------------------------------------------------------------------

/// A structured error carried on Close, End and Detach performatives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// Symbolic condition, e.g. `amqp:not-implemented`.
    pub condition: Symbol,
    /// Free-form description supplied by the peer.
    pub description: Option<String>,
}

impl ErrorCondition {
    pub fn new<C: Into<Symbol>, D: Into<String>>(condition: C, description: D) -> Self {
        Self {
            condition: condition.into(),
            description: Some(description.into()),
        }
    }

    pub fn bare<C: Into<Symbol>>(condition: C) -> Self {
        Self {
            condition: condition.into(),
            description: None,
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}

// ----------------------------------------------------------------------------
// Delivery Tag
// ----------------------------------------------------------------------------

/// Per-link unique tag identifying a delivery.
///
/// Senders issue tags as a strictly monotonic counter rendered in the
/// smallest big-endian form, so the first 256 deliveries carry single-byte
/// tags `[0]`, `[1]`, ... `[255]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub Bytes);

impl DeliveryTag {
    /// Render a counter value as a minimal-width big-endian tag.
    pub fn from_counter(value: u64) -> Self {
        let all = value.to_be_bytes();
        let skip = all.iter().take_while(|b| **b == 0).count().min(7);
        DeliveryTag(Bytes::copy_from_slice(&all[skip..]))
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        DeliveryTag(Bytes::copy_from_slice(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Value
// ----------------------------------------------------------------------------

/// Minimal dynamic value used in property and annotation maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    String(String),
    Symbol(Symbol),
    Binary(Bytes),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::UInt(value)
    }
}

/// Property / annotation map keyed by symbols.
pub type Fields = BTreeMap<Symbol, Value>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_tag_single_byte_range() {
        assert_eq!(DeliveryTag::from_counter(0).as_slice(), &[0]);
        assert_eq!(DeliveryTag::from_counter(1).as_slice(), &[1]);
        assert_eq!(DeliveryTag::from_counter(255).as_slice(), &[255]);
    }

    #[test]
    fn test_delivery_tag_grows_past_single_byte() {
        assert_eq!(DeliveryTag::from_counter(256).as_slice(), &[1, 0]);
        assert_eq!(DeliveryTag::from_counter(0x01_02_03).as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_delivery_tag_monotonic_ordering() {
        let mut previous = DeliveryTag::from_counter(0);
        for n in 1..600 {
            let next = DeliveryTag::from_counter(n);
            assert_ne!(previous, next);
            previous = next;
        }
    }

    #[test]
    fn test_error_condition_display() {
        let condition = ErrorCondition::new(conditions::NOT_IMPLEMENTED, "no relay");
        assert_eq!(format!("{}", condition), "amqp:not-implemented: no relay");
    }

    #[test]
    fn test_symbol_from_str() {
        let symbol: Symbol = ANONYMOUS_RELAY.into();
        assert_eq!(symbol.as_str(), "ANONYMOUS-RELAY");
    }
}
