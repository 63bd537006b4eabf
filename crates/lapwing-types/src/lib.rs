//! AMQP 1.0 data model for the lapwing client
//!
//! This crate defines the protocol vocabulary the client core speaks:
//! performatives, terminus descriptions, delivery states, the transactional
//! extension, and the message model. It deliberately stops above the
//! byte-level AMQP type system — the [`codec::FrameCodec`] trait is the seam
//! through which a real wire codec is plugged in, and the crate ships a
//! length-prefixed bincode codec that the in-repo test peer speaks.
//!
//! ## Module Organization
//!
//! - [`definitions`]: symbols, roles, settle modes, error conditions
//! - [`performatives`]: the frame bodies (Open through Close, SASL family)
//! - [`terminus`]: Source, Target and Coordinator descriptions
//! - [`state`]: delivery states and terminal outcomes
//! - [`transaction`]: Declare / Discharge requests and txn-ids
//! - [`message`]: the bare message model (header, properties, body)
//! - [`codec`]: the frame codec contract and the bincode test codec

pub mod codec;
pub mod definitions;
pub mod message;
pub mod performatives;
pub mod state;
pub mod terminus;
pub mod transaction;

pub use codec::{BincodeFrameCodec, CodecError, FrameCodec};
pub use definitions::{
    DeliveryNumber, DeliveryTag, ErrorCondition, Fields, Handle, ReceiverSettleMode, Role,
    SenderSettleMode, Symbol, Value,
};
pub use message::{Body, Header, Message, Properties};
pub use performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Frame, Open, Performative, SaslBody,
    SaslCode, Transfer,
};
pub use state::{DeliveryState, DeliveryStateType};
pub use terminus::{AttachTarget, Coordinator, ExpiryPolicy, Source, Target, TerminusDurability};
pub use transaction::{Declare, Discharge, TxnId};
