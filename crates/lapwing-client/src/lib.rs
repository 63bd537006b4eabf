//! Lapwing: an imperative AMQP 1.0 client
//!
//! One connection per driver task, sessions multiplexing credit-flow
//! links, tracked deliveries, and a per-session transaction controller.
//!
//! ## Architecture Overview
//!
//! Every [`Connection`] owns a dedicated driver task that serializes all
//! protocol work: frame ingestion and emission, timers, and every state
//! mutation. Public handles ([`Session`], [`Sender`], [`Receiver`],
//! [`Tracker`], [`Delivery`]) enqueue work onto that task and await
//! completions, so applications never contend on protocol state.
//! Application-visible callbacks and delivery hand-off run on a separate
//! per-session dispatch task, keeping slow consumers out of the protocol
//! loop.
//!
//! The byte-level AMQP codec and the concrete transport are both
//! pluggable: the driver speaks [`lapwing_types::FrameCodec`] and
//! [`transport::Transport`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use lapwing_client::{Client, ConnectionOptions};
//! use lapwing_types::Message;
//!
//! # async fn example(transport: Box<dyn lapwing_client::transport::Transport>) -> lapwing_client::Result<()> {
//! let client = Client::new();
//! let connection = client.connect("broker.example", 5672, transport, ConnectionOptions::default());
//!
//! let session = connection.open_session().await?;
//! let sender = session.open_sender("jobs").await?;
//! sender.await_open().await?;
//!
//! let mut tracker = sender.send(&Message::text("hello")).await?;
//! tracker.settlement().await?;
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod client;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod options;
pub mod receiver;
pub mod sasl;
pub mod sender;
pub mod session;
pub mod tracker;
pub mod transport;

pub(crate) mod driver;

pub use capabilities::Capabilities;
pub use client::{Client, ClientOptions};
pub use connection::Connection;
pub use delivery::Delivery;
pub use error::{ClientError, Result};
pub use options::{
    ConnectionEvent, ConnectionOptions, DeliveryMode, ReceiverOptions, ReconnectOptions,
    SaslOptions, SenderOptions, SessionOptions, SourceOptions, TargetOptions, TlsOptions,
};
pub use receiver::Receiver;
pub use sender::Sender;
pub use session::Session;
pub use tracker::Tracker;
