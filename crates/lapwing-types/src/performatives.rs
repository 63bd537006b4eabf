//! AMQP 1.0 performatives and the frame model
//!
//! One struct per performative, a `Performative` sum over them, and the
//! `Frame` type that couples a performative with its channel. The SASL
//! frame family lives here as well since the connection driver speaks it
//! during connection establishment.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::definitions::{
    DeliveryNumber, DeliveryTag, ErrorCondition, Fields, Handle, ReceiverSettleMode, Role,
    SenderSettleMode, Symbol,
};
use crate::state::DeliveryState;
use crate::terminus::{AttachTarget, Source};

// ----------------------------------------------------------------------------
// Connection Performatives
// ----------------------------------------------------------------------------

/// Opens a connection and negotiates its limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Open {
    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    /// Idle timeout in milliseconds; zero disables heartbeating.
    pub idle_timeout: Option<u32>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
}

/// Closes the connection, optionally reporting an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Close {
    pub error: Option<ErrorCondition>,
}

// ----------------------------------------------------------------------------
// Session Performatives
// ----------------------------------------------------------------------------

/// Begins a session on a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Begin {
    /// Set by the responder to the initiator's channel.
    pub remote_channel: Option<u16>,
    pub next_outgoing_id: u32,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Handle,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
}

/// Ends a session, optionally reporting an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct End {
    pub error: Option<ErrorCondition>,
}

// ----------------------------------------------------------------------------
// Link Performatives
// ----------------------------------------------------------------------------

/// Attaches a link endpoint to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attach {
    pub name: String,
    pub handle: Handle,
    pub role: Role,
    pub snd_settle_mode: SenderSettleMode,
    pub rcv_settle_mode: ReceiverSettleMode,
    pub source: Option<Source>,
    pub target: Option<AttachTarget>,
    /// Sender's delivery-count at attach; `None` from receivers.
    pub initial_delivery_count: Option<u32>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<Symbol>,
    pub desired_capabilities: Vec<Symbol>,
    pub properties: Fields,
}

/// Detaches a link; `closed` distinguishes close from suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detach {
    pub handle: Handle,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

/// Updates session windows and link credit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub next_incoming_id: Option<u32>,
    pub incoming_window: u32,
    pub next_outgoing_id: u32,
    pub outgoing_window: u32,
    /// Link-level fields are absent on session-only flows.
    pub handle: Option<Handle>,
    pub delivery_count: Option<u32>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
}

/// Carries (part of) a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub handle: Handle,
    pub delivery_id: Option<DeliveryNumber>,
    pub delivery_tag: Option<DeliveryTag>,
    pub message_format: Option<u32>,
    pub settled: Option<bool>,
    /// More transfer frames follow for this delivery.
    pub more: bool,
    pub state: Option<DeliveryState>,
    pub aborted: bool,
    /// Encoded message section carried by this frame.
    pub payload: Bytes,
}

/// Communicates delivery state changes for a contiguous range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    pub role: Role,
    pub first: DeliveryNumber,
    pub last: Option<DeliveryNumber>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

// ----------------------------------------------------------------------------
// Performative Sum
// ----------------------------------------------------------------------------

/// Every AMQP performative the client core emits or ingests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Performative {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
}

impl Performative {
    pub fn name(&self) -> &'static str {
        match self {
            Performative::Open(_) => "open",
            Performative::Begin(_) => "begin",
            Performative::Attach(_) => "attach",
            Performative::Flow(_) => "flow",
            Performative::Transfer(_) => "transfer",
            Performative::Disposition(_) => "disposition",
            Performative::Detach(_) => "detach",
            Performative::End(_) => "end",
            Performative::Close(_) => "close",
        }
    }
}

impl fmt::Display for Performative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ----------------------------------------------------------------------------
// SASL Frames
// ----------------------------------------------------------------------------

/// Result code of the SASL exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslCode {
    Ok,
    Auth,
    Sys,
    SysPerm,
    SysTemp,
}

/// Bodies of the SASL frame family exchanged before the AMQP header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SaslBody {
    Mechanisms {
        mechanisms: Vec<Symbol>,
    },
    Init {
        mechanism: Symbol,
        initial_response: Option<Bytes>,
        hostname: Option<String>,
    },
    Challenge {
        challenge: Bytes,
    },
    Response {
        response: Bytes,
    },
    Outcome {
        code: SaslCode,
        additional_data: Option<Bytes>,
    },
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// A single unit of wire traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// AMQP performative on a channel.
    Amqp {
        channel: u16,
        performative: Performative,
    },
    /// SASL negotiation frame (always channel 0).
    Sasl(SaslBody),
    /// Empty frame used as an idle-timeout heartbeat.
    Empty,
}

impl Frame {
    pub fn amqp(channel: u16, performative: Performative) -> Self {
        Frame::Amqp {
            channel,
            performative,
        }
    }

    pub fn performative(&self) -> Option<&Performative> {
        match self {
            Frame::Amqp { performative, .. } => Some(performative),
            _ => None,
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
    fn test_performative_names() {
        assert_eq!(Performative::Open(Open::default()).name(), "open");
        assert_eq!(Performative::Close(Close::default()).name(), "close");
        assert_eq!(
            Performative::Disposition(Disposition {
                role: Role::Receiver,
                first: 0,
                last: None,
                settled: true,
                state: Some(DeliveryState::Accepted),
            })
            .name(),
            "disposition"
        );
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::amqp(
            3,
            Performative::Flow(Flow {
                handle: Some(0),
                link_credit: Some(10),
                ..Flow::default()
            }),
        );
        let encoded = bincode::serialize(&frame).unwrap();
        let decoded: Frame = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_transfer_roundtrip_preserves_payload() {
        let frame = Frame::amqp(
            0,
            Performative::Transfer(Transfer {
                handle: 1,
                delivery_id: Some(0),
                delivery_tag: Some(DeliveryTag::from_counter(0)),
                message_format: Some(0),
                settled: Some(false),
                more: false,
                state: None,
                aborted: false,
                payload: Bytes::from_static(b"hello"),
            }),
        );
        let encoded = bincode::serialize(&frame).unwrap();
        let decoded: Frame = bincode::deserialize(&encoded).unwrap();
        match decoded.performative() {
            Some(Performative::Transfer(transfer)) => {
                assert_eq!(&transfer.payload[..], b"hello");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
