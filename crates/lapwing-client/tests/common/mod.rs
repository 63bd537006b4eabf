//! Shared setup for the scripted-peer integration tests.
#![allow(dead_code)]

use std::time::Duration;

use lapwing_client::{Client, Connection, ConnectionOptions, SaslOptions, Session};
use lapwing_testkit::{memory_pair, ScriptedPeer};

/// Options used by most tests: SASL off, tight open deadline so broken
/// scripts fail fast.
pub fn options() -> ConnectionOptions {
    ConnectionOptions {
        sasl: SaslOptions {
            enabled: false,
            allowed_mechanisms: Vec::new(),
        },
        open_timeout: Duration::from_secs(5),
        ..ConnectionOptions::default()
    }
}

/// A connected client with the Open round-trip already scripted.
pub async fn connected(
    options: ConnectionOptions,
    offered_capabilities: &[&str],
) -> (Client, Connection, ScriptedPeer) {
    let (transport, mut peer) = memory_pair();
    let client = Client::new();
    let connection = client.connect("test-host", 5672, Box::new(transport), options);

    peer.expect_open().await;
    peer.respond_open(offered_capabilities);
    connection.await_open().await.expect("connection open failed");

    (client, connection, peer)
}

/// A connection plus an open session on it.
pub async fn connected_with_session(
    options: ConnectionOptions,
    offered_capabilities: &[&str],
) -> (Client, Connection, Session, ScriptedPeer, u16) {
    let (client, connection, mut peer) = connected(options, offered_capabilities).await;

    let session = connection.open_session().await.expect("open session failed");
    let (channel, _begin) = peer.expect_begin().await;
    peer.respond_begin(channel);
    session.await_open().await.expect("session open failed");

    (client, connection, session, peer, channel)
}
