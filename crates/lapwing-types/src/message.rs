//! The bare message model
//!
//! Header, properties and body sections the client exposes to applications.
//! Encoding to and from transfer payload bytes goes through the same
//! serialization the frame codec uses; a real AMQP type codec can replace it
//! behind the [`crate::codec::FrameCodec`] seam.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::CodecError;
use crate::definitions::Value;
use crate::transaction::{Declare, Discharge};

// ----------------------------------------------------------------------------
// Sections
// ----------------------------------------------------------------------------

/// Transport-level delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    /// Time to live in milliseconds.
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            durable: false,
            priority: 4,
            ttl: None,
            first_acquirer: false,
            delivery_count: 0,
        }
    }
}

/// Immutable application-level properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    pub message_id: Option<String>,
    pub user_id: Option<Bytes>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub group_id: Option<String>,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Empty,
    /// Opaque binary section.
    Data(Bytes),
    /// Single text value.
    Text(String),
    /// Sequence of values.
    Sequence(Vec<Value>),
    /// Coordinator request: declare a transaction.
    Declare(Declare),
    /// Coordinator request: discharge a transaction.
    Discharge(Discharge),
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// A message as sent by a [`Sender`] or consumed from a `Delivery`.
///
/// [`Sender`]: https://docs.rs/lapwing-client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Option<Header>,
    pub delivery_annotations: BTreeMap<String, Value>,
    pub properties: Option<Properties>,
    pub application_properties: BTreeMap<String, Value>,
    pub body: MessageBody,
}

/// Body wrapper so a default message is representable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody(pub Body);

impl Default for MessageBody {
    fn default() -> Self {
        MessageBody(Body::Empty)
    }
}

impl Message {
    /// A message with a text body.
    pub fn text<S: Into<String>>(text: S) -> Self {
        Message {
            body: MessageBody(Body::Text(text.into())),
            ..Message::default()
        }
    }

    /// A message with an opaque binary body.
    pub fn data<B: Into<Bytes>>(data: B) -> Self {
        Message {
            body: MessageBody(Body::Data(data.into())),
            ..Message::default()
        }
    }

    pub(crate) fn coordinator(body: Body) -> Self {
        Message {
            body: MessageBody(body),
            ..Message::default()
        }
    }

    /// A coordinator Declare request message.
    pub fn declare() -> Self {
        Message::coordinator(Body::Declare(Declare::default()))
    }

    /// A coordinator Discharge request message.
    pub fn discharge(discharge: Discharge) -> Self {
        Message::coordinator(Body::Discharge(discharge))
    }

    pub fn body(&self) -> &Body {
        &self.body.0
    }

    /// The text body, if the body is text.
    pub fn body_text(&self) -> Option<&str> {
        match self.body() {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn with_to<S: Into<String>>(mut self, to: S) -> Self {
        self.properties.get_or_insert_with(Properties::default).to = Some(to.into());
        self
    }

    pub fn with_subject<S: Into<String>>(mut self, subject: S) -> Self {
        self.properties
            .get_or_insert_with(Properties::default)
            .subject = Some(subject.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.header.get_or_insert_with(Header::default).durable = durable;
        self
    }

    pub fn with_application_property<K: Into<String>, V: Into<Value>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Encode into transfer payload bytes.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let encoded = bincode::serialize(self)?;
        Ok(Bytes::from(encoded))
    }

    /// Decode from accumulated transfer payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Message, CodecError> {
        Ok(bincode::deserialize(payload)?)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
